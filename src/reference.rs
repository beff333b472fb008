//! Static SQL reference documentation injected into generation prompts.

use std::path::Path;
use tracing::{info, warn};

pub const MAX_REFERENCE_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDocs {
    text: String,
}

impl ReferenceDocs {
    /// Collapse whitespace and cap the length.
    pub fn from_text(raw: &str) -> Option<Self> {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return None;
        }
        let text: String = collapsed.chars().take(MAX_REFERENCE_CHARS).collect();
        Some(Self { text })
    }

    /// Read once at startup. A missing or unreadable file only costs the
    /// prompt its reference section.
    pub fn load(path: &Path) -> Option<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let docs = Self::from_text(&raw);
                match &docs {
                    Some(d) => info!("Loaded {} chars of reference docs from {}", d.text.chars().count(), path.display()),
                    None => warn!("Reference docs at {} are empty; continuing without them", path.display()),
                }
                docs
            }
            Err(e) => {
                warn!("Could not read reference docs {}: {}; continuing without them", path.display(), e);
                None
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_collapsed_and_truncated() {
        let raw = format!("SELECT\n\n   list   {}", "x".repeat(5000));
        let docs = ReferenceDocs::from_text(&raw).unwrap();
        assert!(docs.as_str().starts_with("SELECT list x"));
        assert_eq!(docs.as_str().chars().count(), MAX_REFERENCE_CHARS);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        assert!(ReferenceDocs::load(Path::new("/definitely/not/here.txt")).is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bigquery.txt");
        std::fs::write(&path, "  Query syntax\tin GoogleSQL  ").unwrap();
        assert_eq!(ReferenceDocs::load(&path).unwrap().as_str(), "Query syntax in GoogleSQL");
    }
}
