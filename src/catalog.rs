//! Schema Catalog
//!
//! Table descriptors loaded once per process and rendered into the schema
//! text that is echoed verbatim into prompts.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub columns: Vec<ColumnDescriptor>,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        self.columns.push(ColumnDescriptor {
            name: name.into(),
            data_type: data_type.into(),
        });
        self
    }

    /// Render as a `Table:` block.
    pub fn to_text(&self) -> String {
        let mut lines = Vec::with_capacity(self.columns.len() + 3);
        lines.push(format!("Table: {}", self.name));
        lines.push(format!("Description: {}", self.description));
        lines.push("Columns:".to_string());
        for column in &self.columns {
            lines.push(format!("- {}: {}", column.name, column.data_type));
        }
        lines.join("\n")
    }
}

/// Read-only collection of table descriptors keyed by table name.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    // BTreeMap keeps iteration sorted by table name
    tables: BTreeMap<String, SchemaDescriptor>,
}

impl SchemaCatalog {
    pub fn from_descriptors(descriptors: Vec<SchemaDescriptor>) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for descriptor in descriptors {
            let name = descriptor.name.trim().to_string();
            if name.is_empty() {
                return Err(PipelineError::CatalogUnavailable(
                    "table descriptor without a name".to_string(),
                ));
            }
            if tables.insert(name.clone(), descriptor).is_some() {
                return Err(PipelineError::CatalogUnavailable(format!(
                    "table '{}' is described more than once",
                    name
                )));
            }
        }
        Ok(Self { tables })
    }

    /// Load every `*.txt` and `*.json` descriptor file in `path` (or the single
    /// file `path` points at). Any unreadable or malformed file fails the whole
    /// load; a partial catalog is never returned.
    pub fn load(path: &Path) -> Result<Self> {
        let files = if path.is_dir() {
            let mut files: Vec<_> = fs::read_dir(path)
                .map_err(|e| {
                    PipelineError::CatalogUnavailable(format!("cannot read {}: {}", path.display(), e))
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("txt") | Some("json")))
                .collect();
            files.sort();
            files
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            return Err(PipelineError::CatalogUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        };

        let mut descriptors = Vec::new();
        for file in &files {
            let content = fs::read_to_string(file).map_err(|e| {
                PipelineError::CatalogUnavailable(format!("cannot read {}: {}", file.display(), e))
            })?;
            let parsed = match file.extension().and_then(|e| e.to_str()) {
                Some("json") => serde_json::from_str::<Vec<SchemaDescriptor>>(&content).map_err(|e| {
                    PipelineError::CatalogUnavailable(format!("malformed {}: {}", file.display(), e))
                })?,
                _ => parse_descriptor_text(&content).map_err(|e| {
                    PipelineError::CatalogUnavailable(format!("malformed {}: {}", file.display(), e))
                })?,
            };
            debug!("Loaded {} table descriptor(s) from {}", parsed.len(), file.display());
            descriptors.extend(parsed);
        }

        if descriptors.is_empty() {
            return Err(PipelineError::CatalogUnavailable(format!(
                "no table descriptors found in {}",
                path.display()
            )));
        }

        let catalog = Self::from_descriptors(descriptors)?;
        info!("Schema catalog loaded: {} tables", catalog.len());
        Ok(catalog)
    }

    /// All descriptors, sorted by table name, separated by a blank line.
    /// Byte-identical across calls.
    pub fn describe(&self) -> String {
        self.tables
            .values()
            .map(SchemaDescriptor::to_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Only the named tables, in the order given. Unknown names are skipped.
    pub fn describe_tables<S: AsRef<str>>(&self, names: &[S]) -> String {
        names
            .iter()
            .filter_map(|n| self.tables.get(n.as_ref()))
            .map(SchemaDescriptor::to_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&SchemaDescriptor> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Parse the plain-text descriptor format:
///
/// ```text
/// Table: mock_users
/// Description: user profiles
/// Columns:
/// - id: INT64
/// - name: STRING
/// ```
///
/// Several tables may appear in one file. Column lines may carry a trailing
/// free-text note (`- id: Unique identifier (INT64)`); the type is then taken
/// from the parenthesised suffix.
pub fn parse_descriptor_text(text: &str) -> std::result::Result<Vec<SchemaDescriptor>, String> {
    let mut descriptors: Vec<SchemaDescriptor> = Vec::new();
    let mut in_columns = false;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix("Table:") {
            descriptors.push(SchemaDescriptor::new(name.trim(), ""));
            in_columns = false;
            continue;
        }

        let current = descriptors
            .last_mut()
            .ok_or_else(|| format!("line {}: content before the first 'Table:' line", idx + 1))?;

        if let Some(description) = line.strip_prefix("Description:") {
            current.description = description.trim().to_string();
        } else if line == "Columns:" {
            in_columns = true;
        } else if let Some(column) = line.strip_prefix("- ") {
            if !in_columns {
                return Err(format!("line {}: column entry outside a 'Columns:' block", idx + 1));
            }
            let (name, rest) = column
                .split_once(':')
                .ok_or_else(|| format!("line {}: expected '- name: TYPE'", idx + 1))?;
            current.columns.push(ColumnDescriptor {
                name: name.trim().to_string(),
                data_type: column_type(rest.trim()),
            });
        } else if !in_columns {
            // Continuation of a multi-line description
            if !current.description.is_empty() {
                current.description.push(' ');
            }
            current.description.push_str(line);
        } else {
            return Err(format!("line {}: unexpected content '{}'", idx + 1, line));
        }
    }

    Ok(descriptors)
}

fn column_type(rest: &str) -> String {
    if rest.ends_with(')') {
        if let Some(open) = rest.rfind('(') {
            let inner = rest[open + 1..rest.len() - 1].trim();
            if !inner.is_empty() && !inner.contains(' ') {
                return inner.to_string();
            }
        }
    }
    rest.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::from_descriptors(vec![
            SchemaDescriptor::new("mock_users", "User profiles")
                .with_column("id", "INT64")
                .with_column("name", "STRING")
                .with_column("email", "STRING")
                .with_column("birthday", "DATE"),
            SchemaDescriptor::new("mock_answers", "Answers to questions")
                .with_column("id", "INT64")
                .with_column("question_id", "INT64"),
        ])
        .unwrap()
    }

    #[test]
    fn test_describe_is_sorted_and_stable() {
        let catalog = catalog();
        let first = catalog.describe();
        assert_eq!(first, catalog.describe());
        let answers = first.find("Table: mock_answers").unwrap();
        let users = first.find("Table: mock_users").unwrap();
        assert!(answers < users);
        assert!(first.contains("- birthday: DATE"));
    }

    #[test]
    fn test_describe_tables_preserves_requested_order() {
        let catalog = catalog();
        let text = catalog.describe_tables(&["mock_users", "missing", "mock_answers"]);
        assert!(text.starts_with("Table: mock_users"));
        assert!(text.contains("Table: mock_answers"));
        assert!(!text.contains("missing"));
    }

    #[test]
    fn test_duplicate_table_is_rejected() {
        let err = SchemaCatalog::from_descriptors(vec![
            SchemaDescriptor::new("t", ""),
            SchemaDescriptor::new("t", ""),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::CatalogUnavailable(_)));
    }

    #[test]
    fn test_parse_descriptor_text_with_notes() {
        let text = "Table: mock_user_sessions\nDescription: Tracks user sessions.\nColumns:\n- session_id: Unique identifier for a user session (STRING)\n- user_id: INT64\n\nTable: mock_users\nDescription: Users\nColumns:\n- id: INT64\n";
        let parsed = parse_descriptor_text(text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].columns[0].data_type, "STRING");
        assert_eq!(parsed[0].columns[1].data_type, "INT64");
        assert_eq!(parsed[1].name, "mock_users");
    }

    #[test]
    fn test_parse_rejects_orphan_content() {
        assert!(parse_descriptor_text("- id: INT64").is_err());
    }

    #[test]
    fn test_load_missing_directory_is_catalog_unavailable() {
        let err = SchemaCatalog::load(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, PipelineError::CatalogUnavailable(_)));
    }

    #[test]
    fn test_load_directory_of_text_and_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("users.txt"),
            "Table: mock_users\nDescription: Users\nColumns:\n- id: INT64\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("sessions.json"),
            r#"[{"name": "mock_user_sessions", "description": "Sessions", "columns": [{"name": "user_id", "data_type": "INT64"}]}]"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let catalog = SchemaCatalog::load(dir.path()).unwrap();
        assert_eq!(catalog.table_names(), vec!["mock_user_sessions", "mock_users"]);
    }

    #[test]
    fn test_load_malformed_file_fails_whole_catalog() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "Table: ok\nColumns:\n- id: INT64\n").unwrap();
        fs::write(dir.path().join("b.json"), "{not json").unwrap();
        assert!(matches!(
            SchemaCatalog::load(dir.path()),
            Err(PipelineError::CatalogUnavailable(_))
        ));
    }
}
