//! Loading suites from YAML and JSON documents on disk.

use crate::model::{Relation, RunConfig, TestSuite, TestUnit};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One file's worth of declarations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuiteDocument {
    /// File stem, used as the document identifier.
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub units: Vec<TestUnit>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub config: Option<RunConfig>,
}

/// Collects documents from files and directories into one suite.
#[derive(Debug, Default)]
pub struct SuiteLoader {
    pub paths: Vec<PathBuf>,
}

impl SuiteLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single `.yaml`, `.yml` or `.json` document.
    pub fn load_document<P: AsRef<Path>>(&self, path: P) -> Result<SuiteDocument> {
        let path = path.as_ref();
        info!("Loading suite document from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read suite file: {}", path.display()))?;

        let mut document: SuiteDocument = if is_json(path) {
            serde_json::from_str(&content)
                .context(format!("Failed to parse JSON from {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .context(format!("Failed to parse YAML from {}", path.display()))?
        };

        document.id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        for unit in &mut document.units {
            unit.document.get_or_insert_with(|| document.id.clone());
        }

        debug!(
            document = %document.id,
            units = document.units.len(),
            relations = document.relations.len(),
            "loaded suite document"
        );
        Ok(document)
    }

    /// Every document in `dir`, sorted by file name.
    pub fn load_documents_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<SuiteDocument>> {
        let dir = dir.as_ref();
        info!("Loading suite documents from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_suite_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let documents = paths
            .iter()
            .map(|path| self.load_document(path))
            .collect::<Result<Vec<_>>>()?;
        info!("Loaded {} documents from {}", documents.len(), dir.display());
        Ok(documents)
    }

    /// Documents at `path`, which may be a file or a directory.
    pub fn load_path<P: AsRef<Path>>(&self, path: P) -> Result<Vec<SuiteDocument>> {
        let path = path.as_ref();
        if path.is_dir() {
            self.load_documents_from_dir(path)
        } else {
            Ok(vec![self.load_document(path)?])
        }
    }

    /// Merge every configured path into a single suite.
    pub fn load_suite(&self) -> Result<TestSuite> {
        let mut documents = Vec::new();
        for path in &self.paths {
            if !path.exists() {
                bail!("Suite path does not exist: {}", path.display());
            }
            documents.extend(self.load_path(path)?);
        }
        merge(documents)
    }
}

/// Combine documents in order. The first declared name and config win;
/// unit identifiers must be unique across documents.
pub fn merge(documents: Vec<SuiteDocument>) -> Result<TestSuite> {
    let mut suite = TestSuite::default();
    let mut config: Option<RunConfig> = None;
    let mut seen = HashSet::new();

    for document in documents {
        if suite.name.is_empty() {
            suite.name = document.name.clone().unwrap_or_else(|| document.id.clone());
        }
        if let Some(declared) = document.config {
            if config.is_some() {
                warn!(document = %document.id, "run config already declared, ignoring this one");
            } else {
                config = Some(declared);
            }
        }
        for unit in document.units {
            if !seen.insert(unit.id.clone()) {
                bail!(
                    "Duplicate unit id '{}' in document '{}'",
                    unit.id,
                    document.id
                );
            }
            suite.units.push(unit);
        }
        suite.relations.extend(document.relations);
    }

    suite.config = config.unwrap_or_default();
    info!(
        "Loaded suite '{}' with {} units and {} relations",
        suite.name,
        suite.units.len(),
        suite.relations.len()
    );
    Ok(suite)
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Return `true` for `.yaml`, `.yml` and `.json` files.
fn is_suite_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_suite_file_detection() {
        assert!(is_suite_file(Path::new("mail.yaml")));
        assert!(is_suite_file(Path::new("dir/nested/mail.yml")));
        assert!(is_suite_file(Path::new("relations.json")));
        assert!(!is_suite_file(Path::new("readme.md")));
        assert!(!is_suite_file(Path::new("no_ext")));
    }

    #[test]
    fn test_load_dir_sorted_with_document_ids() {
        let dir = tempdir_with_files(&[
            (
                "b_reply.yaml",
                "units:\n  - id: mail_reply\n    request:\n      method: POST\n      url: /mail/reply\n",
            ),
            (
                "a_create.json",
                r#"{"name": "mail", "units": [{"id": "mail_create", "request": {"method": "POST", "url": "/mail"}}],
                   "config": {"base_url": "http://localhost:9000", "timeout": 5}}"#,
            ),
            (
                "c_relations.yml",
                "relations:\n  - source: create\n    target: reply\n    bindings:\n      - source_field: id\n        target_field: parent_id\n",
            ),
            ("notes.md", "# ignored\n"),
        ]);

        let mut loader = SuiteLoader::new();
        loader.add_path(dir.path());
        let suite = loader.load_suite().unwrap();

        assert_eq!(suite.name, "mail");
        let ids: Vec<&str> = suite.units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["mail_create", "mail_reply"]);
        assert_eq!(suite.units[0].document.as_deref(), Some("a_create"));
        assert_eq!(suite.units[1].document.as_deref(), Some("b_reply"));
        assert_eq!(suite.relations.len(), 1);
        assert_eq!(suite.config.timeout, 5);
        assert_eq!(suite.config.base_url.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_duplicate_unit_ids_rejected() {
        let unit = "units:\n  - id: dup\n    request:\n      method: GET\n      url: /x\n";
        let dir = tempdir_with_files(&[("a.yaml", unit), ("b.yaml", unit)]);

        let mut loader = SuiteLoader::new();
        loader.add_path(dir.path());
        let err = loader.load_suite().unwrap_err();
        assert!(err.to_string().contains("Duplicate unit id 'dup'"));
    }

    #[test]
    fn test_single_file_and_missing_path() {
        let dir = tempdir_with_files(&[(
            "solo.yaml",
            "units:\n  - id: ping\n    request:\n      method: GET\n      url: /ping\n",
        )]);

        let mut loader = SuiteLoader::new();
        loader.add_path(dir.path().join("solo.yaml"));
        let suite = loader.load_suite().unwrap();
        assert_eq!(suite.name, "solo");
        assert_eq!(suite.config.timeout, 30);

        let mut missing = SuiteLoader::new();
        missing.add_path(dir.path().join("absent.yaml"));
        assert!(missing.load_suite().is_err());
    }

    #[test]
    fn test_invalid_document_reports_path() {
        let dir = tempdir_with_files(&[("broken.yaml", "units: [")]);
        let loader = SuiteLoader::new();
        let err = loader
            .load_document(dir.path().join("broken.yaml"))
            .unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    fn tempdir_with_files(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }
}
