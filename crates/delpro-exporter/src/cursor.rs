//! Persistent cursor over processed OIDs.
//!
//! The live loop only asks the source for OIDs above the cursor, so a record
//! is counted once per process lifetime. The cursor is checkpointed to a
//! plain-text file holding the decimal OID so a restart does not count the
//! last day of sessions a second time.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ExporterError, ExporterResult};

/// Highest processed OID, checkpointed to a file.
///
/// The cursor never moves backwards.
#[derive(Debug, Clone)]
pub struct OidCursor {
    path: PathBuf,
    last_oid: i64,
}

impl OidCursor {
    /// Loads the cursor from `path`.
    ///
    /// A missing or unreadable file starts the cursor at zero.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_oid = match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<i64>() {
                Ok(oid) if oid >= 0 => {
                    info!(oid, path = %path.display(), "loaded last processed OID");
                    oid
                }
                _ => {
                    warn!(path = %path.display(), "ignoring malformed OID checkpoint");
                    0
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no OID checkpoint, starting from 0");
                0
            }
        };
        Self { path, last_oid }
    }

    /// Returns the highest processed OID.
    #[must_use]
    pub const fn last_oid(&self) -> i64 {
        self.last_oid
    }

    /// Returns the checkpoint file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raises the cursor to an operator-supplied floor.
    ///
    /// Values not larger than the current cursor are ignored. Returns true if
    /// the cursor moved.
    pub fn apply_floor(&mut self, floor: i64) -> bool {
        if floor > self.last_oid {
            info!(from = self.last_oid, to = floor, "overriding last processed OID");
            self.set(floor);
            true
        } else {
            if floor > 0 {
                info!(
                    floor,
                    current = self.last_oid,
                    "specified OID is not larger than current OID, ignoring"
                );
            }
            false
        }
    }

    /// Moves the cursor to `oid` if it is larger and checkpoints it.
    ///
    /// A failed checkpoint is logged; the in-memory cursor still advances.
    /// Returns true if the cursor moved.
    pub fn advance(&mut self, oid: i64) -> bool {
        if oid <= self.last_oid {
            return false;
        }
        self.set(oid);
        true
    }

    fn set(&mut self, oid: i64) {
        self.last_oid = oid;
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to save last processed OID");
        }
    }

    /// Writes the current cursor to the checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns `ExporterError::Checkpoint` if the file cannot be written.
    pub fn save(&self) -> ExporterResult<()> {
        fs::write(&self.path, self.last_oid.to_string()).map_err(|source| {
            ExporterError::Checkpoint {
                path: self.path.display().to_string(),
                source,
            }
        })
    }
}
