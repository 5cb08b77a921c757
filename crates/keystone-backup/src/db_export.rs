//! Database Exporter: stream-dumps a logical database into a portable
//! archive, falling back to a per-document export when the native dump
//! utility is unavailable.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Metadata recorded for a single exported database, independent of which
/// method produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbExportRecord {
    /// `db-native` or `db-fallback`.
    pub kind: String,
    /// The logical database name.
    pub label: String,
    /// Path of the produced artifact on disk.
    pub artifact_path: PathBuf,
    /// Size in bytes of the artifact.
    pub byte_size: u64,
    /// `"native-dump"` or `"javascript-export"`.
    pub method: String,
    /// Collection names included, when the fallback method was used.
    pub collections_included: Option<Vec<String>>,
}

/// One collection's documents, or the error encountered enumerating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum CollectionDump {
    Ok {
        count: usize,
        documents: Vec<Value>,
    },
    Err {
        error: String,
        count: usize,
    },
}

/// Severity of a single corruption-detection finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Worth recording but not disqualifying.
    Warning,
    /// The collection is unusable until repaired.
    Critical,
}

/// One finding from running a store's native validate command on a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Collection the issue was found in.
    pub collection: String,
    /// Short machine-checkable type, e.g. `"index-corruption"`.
    pub issue_type: String,
    /// Human-readable detail.
    pub message: String,
    /// How serious the finding is.
    pub severity: IssueSeverity,
}

/// A connection to a logical document-store database, abstracted so the
/// exporter (and the Recovery Engine) can be tested without a real database.
#[async_trait]
pub trait DatabaseSource: Send + Sync {
    /// List the collections/tables in this database.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Stream every document in `collection` as JSON values.
    async fn documents(&self, collection: &str) -> Result<Vec<Value>>;

    /// Run the store's native validate command on `collection`. The default
    /// implementation reports no issues; real backends override this.
    async fn validate_collection(&self, _collection: &str) -> Result<Vec<ValidationIssue>> {
        Ok(Vec::new())
    }

    /// Replace the contents of `collection` with `documents`, used by
    /// restore-from-backup to replay an exported dump. Sources that cannot
    /// write (e.g. a read-only mirror) should leave the default, which
    /// refuses with [`crate::error::BackupError::State`].
    async fn replace_documents(&self, collection: &str, _documents: Vec<Value>) -> Result<()> {
        Err(crate::error::BackupError::State(format!(
            "database source does not support replaying documents into {collection}"
        )))
    }

    /// Quiesce active connections ahead of a repair or restore step. The
    /// default is a no-op for sources with nothing to quiesce.
    async fn quiesce(&self) -> Result<()> {
        Ok(())
    }

    /// Resume normal connection handling after a repair or restore step.
    async fn resume(&self) -> Result<()> {
        Ok(())
    }
}

/// A [`DatabaseSource`] backed by a directory of `<collection>.json` files,
/// each holding a JSON array of documents.
///
/// This is the concrete source `keystone-cli` wires up at its composition
/// root: `MONGODB_URI`/`LICENSE_DB_URI` name a connection string out of
/// band, but the document store itself is an external collaborator (§1)
/// reached through this trait, not a driver this workspace vendors.
/// Deployments that do talk to a real document store provide their own
/// `DatabaseSource` impl and hand it to [`crate::engine::BackupEngine`] in
/// its place.
pub struct FileDatabaseSource {
    root: PathBuf,
}

impl FileDatabaseSource {
    /// Use `root` as the database: every `*.json` file directly under it is
    /// one collection, named after its file stem.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }
}

#[async_trait]
impl DatabaseSource for FileDatabaseSource {
    async fn list_collections(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn documents(&self, collection: &str) -> Result<Vec<Value>> {
        let path = self.collection_path(collection);
        let bytes = tokio::fs::read(&path).await?;
        let documents: Vec<Value> = serde_json::from_slice(&bytes)?;
        Ok(documents)
    }

    async fn replace_documents(&self, collection: &str, documents: Vec<Value>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let bytes = serde_json::to_vec_pretty(&documents)?;
        tokio::fs::write(self.collection_path(collection), bytes).await?;
        Ok(())
    }
}

/// Export `database_name` into `output_dir`, trying the native dump utility
/// first and falling back to a per-collection document export.
///
/// `dump_command` is the external dump utility invocation (e.g.
/// `["mongodump", "--db", "<name>", "--archive", "--gzip"]`-shaped); when
/// `None` or when the subprocess fails to spawn or exits non-zero, the
/// fallback path runs instead. `source` is only consulted for the fallback.
pub async fn export_database(
    database_name: &str,
    output_dir: &Path,
    dump_command: Option<&[String]>,
    source: &dyn DatabaseSource,
) -> Result<DbExportRecord> {
    std::fs::create_dir_all(output_dir)?;

    if let Some(command) = dump_command {
        if let Some(record) = try_native_dump(database_name, output_dir, command).await? {
            return Ok(record);
        }
    }

    export_fallback(database_name, output_dir, source).await
}

async fn try_native_dump(
    database_name: &str,
    output_dir: &Path,
    command: &[String],
) -> Result<Option<DbExportRecord>> {
    let Some((program, args)) = command.split_first() else {
        return Ok(None);
    };

    let artifact_path = output_dir.join(format!("{database_name}.archive.gz"));

    let output = tokio::process::Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    let Ok(output) = output else {
        tracing::warn!(database_name, "native dump utility not available, falling back");
        return Ok(None);
    };
    if !output.status.success() {
        tracing::warn!(database_name, "native dump utility exited non-zero, falling back");
        return Ok(None);
    }

    tokio::fs::write(&artifact_path, &output.stdout).await?;
    let byte_size = tokio::fs::metadata(&artifact_path).await?.len();

    Ok(Some(DbExportRecord {
        kind: "db-native".to_string(),
        label: database_name.to_string(),
        artifact_path,
        byte_size,
        method: "native-dump".to_string(),
        collections_included: None,
    }))
}

async fn export_fallback(
    database_name: &str,
    output_dir: &Path,
    source: &dyn DatabaseSource,
) -> Result<DbExportRecord> {
    let collections = source.list_collections().await?;

    let mut dump = serde_json::Map::new();
    dump.insert("database".to_string(), Value::String(database_name.to_string()));
    dump.insert(
        "timestamp".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );

    let mut collections_map = serde_json::Map::new();
    let mut included = Vec::new();
    for collection in &collections {
        match source.documents(collection).await {
            Ok(documents) => {
                let count = documents.len();
                collections_map.insert(
                    collection.clone(),
                    serde_json::json!({ "count": count, "documents": documents }),
                );
                included.push(collection.clone());
            }
            Err(e) => {
                tracing::warn!(database_name, collection, error = %e, "collection export failed");
                collections_map.insert(
                    collection.clone(),
                    serde_json::json!({ "error": e.to_string(), "count": 0 }),
                );
            }
        }
    }
    dump.insert("collections".to_string(), Value::Object(collections_map));

    let artifact_path = output_dir.join(format!("{database_name}.json"));
    let bytes = serde_json::to_vec_pretty(&Value::Object(dump))?;
    tokio::fs::write(&artifact_path, &bytes).await?;

    Ok(DbExportRecord {
        kind: "db-fallback".to_string(),
        label: database_name.to_string(),
        artifact_path,
        byte_size: bytes.len() as u64,
        method: "javascript-export".to_string(),
        collections_included: Some(included),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        collections: Vec<String>,
        fail: Vec<String>,
    }

    #[async_trait]
    impl DatabaseSource for FakeSource {
        async fn list_collections(&self) -> Result<Vec<String>> {
            Ok(self.collections.clone())
        }

        async fn documents(&self, collection: &str) -> Result<Vec<Value>> {
            if self.fail.contains(&collection.to_string()) {
                return Err(crate::error::BackupError::Remote("connection reset".to_string()));
            }
            Ok(vec![serde_json::json!({ "_id": 1, "name": collection })])
        }
    }

    #[tokio::test]
    async fn falls_back_when_no_dump_command() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource {
            collections: vec!["users".to_string(), "orders".to_string()],
            fail: vec![],
        };

        let record = export_database("app", dir.path(), None, &source).await.unwrap();
        assert_eq!(record.method, "javascript-export");
        assert_eq!(record.kind, "db-fallback");
        let collections = record.collections_included.unwrap();
        assert_eq!(collections.len(), 2);

        let contents: Value =
            serde_json::from_slice(&std::fs::read(&record.artifact_path).unwrap()).unwrap();
        assert_eq!(contents["collections"]["users"]["count"], 1);
    }

    #[tokio::test]
    async fn per_collection_failure_does_not_abort_export() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource {
            collections: vec!["users".to_string(), "broken".to_string()],
            fail: vec!["broken".to_string()],
        };

        let record = export_database("app", dir.path(), None, &source).await.unwrap();
        let contents: Value =
            serde_json::from_slice(&std::fs::read(&record.artifact_path).unwrap()).unwrap();
        assert_eq!(contents["collections"]["broken"]["count"], 0);
        assert!(contents["collections"]["broken"]["error"].is_string());
        assert_eq!(contents["collections"]["users"]["count"], 1);
    }

    #[tokio::test]
    async fn falls_back_when_dump_command_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource {
            collections: vec!["users".to_string()],
            fail: vec![],
        };
        let command = vec!["definitely-not-a-real-binary-xyz".to_string()];

        let record = export_database("app", dir.path(), Some(&command), &source)
            .await
            .unwrap();
        assert_eq!(record.method, "javascript-export");
    }

    #[tokio::test]
    async fn file_database_source_lists_and_reads_collections() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("users.json"), br#"[{"_id": 1}]"#)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("orders.json"), br#"[{"_id": 1}, {"_id": 2}]"#)
            .await
            .unwrap();

        let source = FileDatabaseSource::new(dir.path().to_path_buf());
        let mut collections = source.list_collections().await.unwrap();
        collections.sort();
        assert_eq!(collections, vec!["orders".to_string(), "users".to_string()]);
        assert_eq!(source.documents("orders").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_database_source_replace_documents_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileDatabaseSource::new(dir.path().to_path_buf());
        source
            .replace_documents("users", vec![serde_json::json!({"_id": 1})])
            .await
            .unwrap();
        assert_eq!(source.documents("users").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_database_source_missing_root_has_no_collections() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileDatabaseSource::new(dir.path().join("does-not-exist"));
        assert!(source.list_collections().await.unwrap().is_empty());
    }
}
