//! JSON-lines document store.
//!
//! Each collection lives in `{dir}/{collection}.jsonl`, an append-only log
//! of `put` and `delete` entries replayed on open. A mutation appends one
//! line and is applied in memory only after the line is on disk, so a
//! failed write leaves the store as it was.
//!
//! Collections are locked independently: appends to a busy collection
//! (the activity log) never hold up reads of another (plugin records).
//! A log is rewritten as a snapshot once it carries more than
//! [`COMPACT_SLACK`] superseded lines, and by `delete_many`.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::document::{
    DocumentStore, Documents, count_by_in, count_in, find_in, merge_patch, require_object,
    validate_collection, validate_id,
};
use crate::error::{StorageError, StorageResult};
use crate::query::{Filter, Query};

/// Superseded lines a log may carry before it is compacted.
const COMPACT_SLACK: usize = 256;

const LOG_EXTENSION: &str = "jsonl";

/// One line of a collection log, as written.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry<'a> {
    Put { id: &'a str, doc: &'a Value },
    Delete { id: &'a str },
}

/// One line of a collection log, as read back.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ReplayEntry {
    Put { id: String, doc: Value },
    Delete { id: String },
}

#[derive(Debug, Default)]
struct Collection {
    docs: Documents,
    /// Lines in the log file.
    lines: usize,
}

impl Collection {
    fn needs_compaction(&self) -> bool {
        self.lines.saturating_sub(self.docs.len()) > COMPACT_SLACK
    }
}

/// Document store persisted as one JSON-lines log per collection.
#[derive(Debug)]
pub struct FileDocumentStore {
    dir: PathBuf,
    collections: DashMap<String, Arc<Mutex<Collection>>>,
}

impl FileDocumentStore {
    /// Open (or create) a store rooted at `dir`, replaying existing logs.
    ///
    /// Files that cannot be read are skipped with a warning rather than
    /// failing the whole store, as are malformed lines (a torn final line
    /// after a crash, typically).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let collections = DashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_collection(name).is_err() {
                continue;
            }
            match replay(&path) {
                Ok(collection) => {
                    debug!(
                        collection = name,
                        documents = collection.docs.len(),
                        lines = collection.lines,
                        "Loaded collection"
                    );
                    collections.insert(name.to_string(), Arc::new(Mutex::new(collection)));
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable collection log");
                },
            }
        }

        Ok(Self { dir, collections })
    }

    /// The directory holding the collection logs.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.{LOG_EXTENSION}"))
    }

    fn collection(&self, name: &str) -> StorageResult<Arc<Mutex<Collection>>> {
        validate_collection(name)?;
        Ok(Arc::clone(
            self.collections.entry(name.to_string()).or_default().value(),
        ))
    }

    /// Append one entry to the collection's log.
    async fn append(
        &self,
        collection: &str,
        state: &mut Collection,
        entry: &LogEntry<'_>,
    ) -> StorageResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let path = self.log_path(collection);
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(|e| StorageError::Internal(format!("append task failed: {e}")))??;
        state.lines = state.lines.saturating_add(1);
        Ok(())
    }

    /// Replace the collection's log with a snapshot of `docs`.
    async fn rewrite(&self, collection: &str, docs: Documents) -> StorageResult<Documents> {
        let path = self.log_path(collection);
        tokio::task::spawn_blocking(move || write_snapshot(&path, &docs).map(|()| docs))
            .await
            .map_err(|e| StorageError::Internal(format!("compaction task failed: {e}")))?
    }

    /// Compact after a successful append. A failure only leaves the log
    /// longer than it needs to be.
    async fn compact_if_needed(&self, collection: &str, state: &mut Collection) {
        if !state.needs_compaction() {
            return;
        }
        match self.rewrite(collection, state.docs.clone()).await {
            Ok(_) => {
                debug!(
                    collection,
                    superseded = state.lines.saturating_sub(state.docs.len()),
                    "Compacted collection log"
                );
                state.lines = state.docs.len();
            },
            Err(e) => warn!(collection, error = %e, "Collection compaction failed"),
        }
    }

    async fn put(
        &self,
        collection: &str,
        state: &mut Collection,
        id: &str,
        document: Value,
    ) -> StorageResult<()> {
        self.append(collection, state, &LogEntry::Put { id, doc: &document })
            .await?;
        state.docs.insert(id.to_string(), document);
        self.compact_if_needed(collection, state).await;
        Ok(())
    }
}

fn replay(path: &Path) -> StorageResult<Collection> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut collection = Collection::default();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        collection.lines = collection.lines.saturating_add(1);
        match serde_json::from_str::<ReplayEntry>(&line) {
            Ok(ReplayEntry::Put { id, doc }) => {
                collection.docs.insert(id, doc);
            },
            Ok(ReplayEntry::Delete { id }) => {
                collection.docs.remove(&id);
            },
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = number.saturating_add(1),
                    error = %e,
                    "Skipping malformed log line"
                );
            },
        }
    }
    Ok(collection)
}

fn append_line(path: &Path, line: &[u8]) -> StorageResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line)?;
    file.sync_data()?;
    Ok(())
}

fn write_snapshot(path: &Path, docs: &Documents) -> StorageResult<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    {
        let mut out = std::io::BufWriter::new(tmp.as_file_mut());
        for (id, doc) in docs {
            serde_json::to_writer(&mut out, &LogEntry::Put { id, doc })?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Value>> {
        validate_id(id)?;
        let handle = self.collection(collection)?;
        let state = handle.lock().await;
        Ok(state.docs.get(id).cloned())
    }

    async fn insert(&self, collection: &str, id: &str, document: Value) -> StorageResult<bool> {
        validate_id(id)?;
        require_object(&document)?;
        let handle = self.collection(collection)?;
        let mut state = handle.lock().await;
        if state.docs.contains_key(id) {
            return Ok(false);
        }
        self.put(collection, &mut state, id, document).await?;
        Ok(true)
    }

    async fn upsert(&self, collection: &str, id: &str, document: Value) -> StorageResult<()> {
        validate_id(id)?;
        require_object(&document)?;
        let handle = self.collection(collection)?;
        let mut state = handle.lock().await;
        self.put(collection, &mut state, id, document).await
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> StorageResult<bool> {
        validate_id(id)?;
        let handle = self.collection(collection)?;
        let mut state = handle.lock().await;
        let Some(existing) = state.docs.get(id) else {
            return Ok(false);
        };
        let merged = merge_patch(existing, patch)?;
        self.put(collection, &mut state, id, merged).await?;
        Ok(true)
    }

    async fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
        validate_id(id)?;
        let handle = self.collection(collection)?;
        let mut state = handle.lock().await;
        if !state.docs.contains_key(id) {
            return Ok(false);
        }
        self.append(collection, &mut state, &LogEntry::Delete { id })
            .await?;
        state.docs.remove(id);
        self.compact_if_needed(collection, &mut state).await;
        Ok(true)
    }

    async fn find(&self, collection: &str, query: &Query) -> StorageResult<Vec<Value>> {
        let handle = self.collection(collection)?;
        let state = handle.lock().await;
        Ok(find_in(&state.docs, query))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StorageResult<u64> {
        let handle = self.collection(collection)?;
        let state = handle.lock().await;
        Ok(count_in(&state.docs, filter))
    }

    async fn count_by(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> StorageResult<BTreeMap<String, u64>> {
        let handle = self.collection(collection)?;
        let state = handle.lock().await;
        Ok(count_by_in(&state.docs, field, filter))
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StorageResult<u64> {
        let handle = self.collection(collection)?;
        let mut state = handle.lock().await;
        let remaining: Documents = state
            .docs
            .iter()
            .filter(|(_, d)| !filter.matches(d))
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect();
        let removed = state.docs.len().saturating_sub(remaining.len());
        if removed == 0 {
            return Ok(0);
        }

        state.docs = self.rewrite(collection, remaining).await?;
        state.lines = state.docs.len();
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn log_lines(dir: &Path, collection: &str) -> usize {
        std::fs::read_to_string(dir.join(format!("{collection}.jsonl")))
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileDocumentStore::open(dir.path()).unwrap();
            store.upsert("plugins", "billing", json!({"state": "disabled"})).await.unwrap();
            store.update("plugins", "billing", json!({"state": "active"})).await.unwrap();
            store.upsert("plugins", "licensing", json!({"state": "disabled"})).await.unwrap();
            store.delete("plugins", "licensing").await.unwrap();
        }
        assert_eq!(log_lines(dir.path(), "plugins"), 4);

        let reopened = FileDocumentStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("plugins", "billing").await.unwrap(),
            Some(json!({"state": "active"}))
        );
        assert_eq!(reopened.get("plugins", "licensing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn skips_unreadable_files_and_torn_lines() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("plugins.jsonl"),
            "{\"op\":\"put\",\"id\":\"seo\",\"doc\":{\"v\":1}}\n{\"op\":\"put\",\"id\":",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = FileDocumentStore::open(dir.path()).unwrap();
        assert_eq!(store.count("plugins", &Filter::all()).await.unwrap(), 1);
        assert_eq!(store.get("plugins", "seo").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn duplicate_insert_appends_nothing() {
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(dir.path()).unwrap();
        assert!(store.insert("plugins", "a", json!({"v": 1})).await.unwrap());
        assert!(!store.insert("plugins", "a", json!({"v": 2})).await.unwrap());

        assert_eq!(log_lines(dir.path(), "plugins"), 1);
        assert_eq!(store.get("plugins", "a").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn failed_write_leaves_documents_unchanged() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        let store = FileDocumentStore::open(&root).unwrap();
        store.upsert("plugins", "billing", json!({"state": "disabled"})).await.unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        assert!(store.upsert("plugins", "billing", json!({"state": "active"})).await.is_err());
        assert!(store.update("plugins", "billing", json!({"state": "active"})).await.is_err());
        assert!(store.insert("plugins", "seo", json!({"state": "active"})).await.is_err());
        assert!(store.delete("plugins", "billing").await.is_err());

        assert_eq!(
            store.get("plugins", "billing").await.unwrap(),
            Some(json!({"state": "disabled"}))
        );
        assert_eq!(store.get("plugins", "seo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn superseded_lines_are_compacted() {
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(dir.path()).unwrap();
        let writes = COMPACT_SLACK.saturating_add(10);
        for n in 0..writes {
            store.upsert("plugins", "billing", json!({"n": n})).await.unwrap();
        }

        assert!(log_lines(dir.path(), "plugins") < writes);
        let reopened = FileDocumentStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("plugins", "billing").await.unwrap(),
            Some(json!({"n": writes.saturating_sub(1)}))
        );
    }

    #[tokio::test]
    async fn delete_many_rewrites_the_log() {
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(dir.path()).unwrap();
        for (id, ts) in [("1", 10), ("2", 20), ("3", 30)] {
            store.upsert("activity", id, json!({"ts": ts})).await.unwrap();
        }

        let removed = store
            .delete_many("activity", &Filter::all().lt("ts", 25))
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(log_lines(dir.path(), "activity"), 1);
        let reopened = FileDocumentStore::open(dir.path()).unwrap();
        assert_eq!(reopened.count("activity", &Filter::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn busy_collection_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(dir.path()).unwrap();
        store.upsert("plugins", "billing", json!({"state": "active"})).await.unwrap();

        let activity = store.collection("activity").unwrap();
        let _held = activity.lock().await;

        let read =
            tokio::time::timeout(Duration::from_secs(1), store.get("plugins", "billing")).await;
        assert_eq!(read.unwrap().unwrap(), Some(json!({"state": "active"})));
        let write = tokio::time::timeout(
            Duration::from_secs(1),
            store.upsert("plugins", "seo", json!({"state": "disabled"})),
        )
        .await;
        assert!(write.unwrap().is_ok());
    }
}
