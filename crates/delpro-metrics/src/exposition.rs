//! Text exposition helpers.
//!
//! Live scrapes use [`MetricSet::encode`] as is. Historical output re-encodes
//! a set and suffixes every sample line with an explicit millisecond
//! timestamp, as accepted by time-series import endpoints:
//!
//! ```text
//! delpro_milk_sessions_total{animal_number="42",...} 3 1740812400000
//! ```

use std::io::Write;

use crate::error::Result;
use crate::registry::MetricSet;

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Iterates over the sample lines of encoded output, skipping comments.
pub fn sample_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Writes every sample line of `text` suffixed with `timestamp_ms`.
///
/// Families keep their encoding order. Within a family, series are ordered
/// by their labels, so equal sets always produce identical output. Histogram
/// lines of one series stay together in bucket order.
///
/// # Errors
///
/// Returns an error if the underlying writer fails.
pub fn write_timestamped_lines<W: Write + ?Sized>(
    out: &mut W,
    text: &str,
    timestamp_ms: i64,
) -> std::io::Result<()> {
    let mut family = 0_usize;
    let mut samples = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if line.starts_with("# HELP ") {
            family += 1;
        } else if !line.is_empty() && !line.starts_with('#') {
            samples.push((family, series_labels(line), line));
        }
    }
    samples.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    for (_, _, line) in samples {
        writeln!(out, "{line} {timestamp_ms}")?;
    }
    Ok(())
}

/// Label block of a sample line, without the `le` label of a bucket.
fn series_labels(line: &str) -> &str {
    let (Some(open), Some(close)) = (line.find('{'), line.rfind('}')) else {
        return "";
    };
    let labels = &line[open + 1..close];
    if !line[..open].ends_with("_bucket") {
        return labels;
    }
    match labels.rfind("le=\"") {
        Some(0) => "",
        Some(at) => labels[..at].trim_end_matches(','),
        None => labels,
    }
}

/// Encodes `set` and writes its samples at `timestamp_ms`.
///
/// # Errors
///
/// Returns an error if encoding or the writer fails.
pub fn write_timestamped<W: Write + ?Sized>(
    set: &MetricSet,
    out: &mut W,
    timestamp_ms: i64,
) -> Result<()> {
    let mut text = String::new();
    set.encode_to(&mut text)?;
    write_timestamped_lines(out, &text, timestamp_ms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metric;
    use crate::registry::SeriesKey;

    #[test]
    fn sample_lines_skip_comments_and_blanks() {
        let text = "# HELP a A.\n# TYPE a gauge\na 1.0\n\nb{x=\"1\"} 2\n# EOF\n";
        let lines: Vec<_> = sample_lines(text).collect();
        assert_eq!(lines, ["a 1.0", "b{x=\"1\"} 2"]);
    }

    #[test]
    fn timestamp_is_appended_to_every_sample() {
        let mut out = Vec::new();
        write_timestamped_lines(&mut out, "# TYPE up gauge\nup 1\nup{a=\"b\"} 0\n", 1_700_000_000_000)
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "up 1 1700000000000\nup{a=\"b\"} 0 1700000000000\n");
    }

    #[test]
    fn series_are_ordered_within_their_family() {
        let text = "# HELP b B.\nb{t=\"RR\"} 1\nb{t=\"LF\"} 2\n# HELP a A.\na{t=\"z\"} 3\na{t=\"y\"} 4\n";
        let mut out = Vec::new();
        write_timestamped_lines(&mut out, text, 7).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "b{t=\"LF\"} 2 7",
                "b{t=\"RR\"} 1 7",
                "a{t=\"y\"} 4 7",
                "a{t=\"z\"} 3 7",
            ]
        );
    }

    #[test]
    fn histogram_series_keep_bucket_order() {
        let text = "# HELP h H.\n\
            h_sum{a=\"2\"} 5.0\n\
            h_count{a=\"2\"} 1\n\
            h_bucket{a=\"2\",le=\"60.0\"} 0\n\
            h_bucket{a=\"2\",le=\"+Inf\"} 1\n\
            h_sum{a=\"1\"} 0.0\n\
            h_count{a=\"1\"} 0\n\
            h_bucket{a=\"1\",le=\"60.0\"} 0\n\
            h_bucket{a=\"1\",le=\"+Inf\"} 0\n";
        let mut out = Vec::new();
        write_timestamped_lines(&mut out, text, 1).unwrap();

        let text = String::from_utf8(out).unwrap();
        let names: Vec<_> = text
            .lines()
            .map(|line| line.split_once(' ').unwrap().0)
            .collect();
        assert_eq!(
            names,
            [
                "h_sum{a=\"1\"}",
                "h_count{a=\"1\"}",
                "h_bucket{a=\"1\",le=\"60.0\"}",
                "h_bucket{a=\"1\",le=\"+Inf\"}",
                "h_sum{a=\"2\"}",
                "h_count{a=\"2\"}",
                "h_bucket{a=\"2\",le=\"60.0\"}",
                "h_bucket{a=\"2\",le=\"+Inf\"}",
            ]
        );
    }

    #[test]
    fn bucket_labels_drop_le() {
        assert_eq!(series_labels(r#"h_bucket{a="1",le="60.0"} 0"#), r#"a="1""#);
        assert_eq!(series_labels(r#"h_bucket{le="+Inf"} 0"#), "");
        assert_eq!(series_labels(r#"g{le="1"} 0"#), r#"le="1""#);
        assert_eq!(series_labels("up 1"), "");
    }

    #[test]
    fn empty_set_writes_nothing() {
        let mut out = Vec::new();
        write_timestamped(&MetricSet::new(), &mut out, 1).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn set_samples_carry_the_timestamp() {
        let set = MetricSet::new();
        let labels = vec![("animal_number".to_string(), "1".to_string())];
        set.inc_counter(&SeriesKey::new(Metric::MilkSessions, labels.clone()))
            .unwrap();
        set.set_gauge(&SeriesKey::new(Metric::LastYield, labels), 9.0)
            .unwrap();

        let mut out = Vec::new();
        write_timestamped(&set, &mut out, 42).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|line| line.ends_with(" 42")));
        assert!(text.contains("delpro_milk_sessions_total{animal_number=\"1\"} 1 42\n"));
        assert!(!text.contains('#'));
    }
}
