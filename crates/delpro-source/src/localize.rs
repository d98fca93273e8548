//! Breed display names.

/// DelPro breed lookup values and their French display names.
const BREED_NAMES: [(&str, &str); 5] = [
    ("Holstein Friesian", "Holstein"),
    ("Montbeliard", "Montbéliarde"),
    ("Swedish Red-and-White", "Rouge Suédoise"),
    ("Cross Breed", "Croisée"),
    ("Unknown Breed", "Race Inconnue"),
];

/// Returns the French display name of a breed, or the input when unknown.
#[must_use]
pub fn localize_breed(breed: &str) -> &str {
    BREED_NAMES
        .iter()
        .find(|(english, _)| *english == breed)
        .map_or(breed, |(_, french)| *french)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Holstein Friesian", "Holstein")]
    #[test_case("Montbeliard", "Montbéliarde")]
    #[test_case("Swedish Red-and-White", "Rouge Suédoise")]
    #[test_case("Cross Breed", "Croisée")]
    #[test_case("Unknown Breed", "Race Inconnue")]
    #[test_case("Jersey", "Jersey" ; "unmapped passes through")]
    #[test_case("12", "12" ; "raw breed id passes through")]
    fn breed_names(input: &str, expected: &str) {
        assert_eq!(localize_breed(input), expected);
    }
}
