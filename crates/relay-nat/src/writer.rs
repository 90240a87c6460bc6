//! Ruleset file output.
//!
//! The NAT subsystem loads the file written here; a half-written file must
//! never be visible, so contents go to a sibling temp file that is renamed
//! into place.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Writes generated rulesets to a fixed path.
#[derive(Debug, Clone)]
pub struct RulesetWriter {
    path: PathBuf,
}

impl RulesetWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the ruleset file with `contents` unless it already matches.
    ///
    /// Returns true if the file changed.
    pub fn write_if_changed(&self, contents: &str) -> io::Result<bool> {
        match std::fs::read_to_string(&self.path) {
            Ok(existing) if existing == contents => {
                debug!(path = ?self.path, "ruleset unchanged");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;

        info!(path = ?self.path, bytes = contents.len(), "ruleset written");
        Ok(true)
    }
}
