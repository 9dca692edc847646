//! Document store trait and the in-memory implementation.
//!
//! The [`DocumentStore`] trait stores JSON object documents in named
//! collections, keyed by a string id that is unique within its collection.
//! Implementations:
//!
//! - **In-memory** ([`MemoryDocumentStore`]): for tests and ephemeral runs
//! - **JSON lines** ([`FileDocumentStore`](crate::FileDocumentStore)): one
//!   append-only log per collection, compacted from time to time

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::query::{Filter, Query, field};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate that a collection name is safe to use as a file stem.
///
/// Collection names must be non-empty and contain only ASCII alphanumerics,
/// underscores and hyphens.
pub(crate) fn validate_collection(collection: &str) -> StorageResult<()> {
    if collection.is_empty() {
        return Err(StorageError::InvalidKey(
            "collection name must not be empty".into(),
        ));
    }
    if !collection
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(StorageError::InvalidKey(format!(
            "collection name may only contain alphanumerics, '_' and '-', got: {collection}"
        )));
    }
    Ok(())
}

/// Validate that a document id is non-empty and free of null bytes.
pub(crate) fn validate_id(id: &str) -> StorageResult<()> {
    if id.is_empty() {
        return Err(StorageError::InvalidKey("document id must not be empty".into()));
    }
    if id.contains('\0') {
        return Err(StorageError::InvalidKey(
            "document id must not contain null bytes".into(),
        ));
    }
    Ok(())
}

pub(crate) fn require_object(document: &Value) -> StorageResult<()> {
    if document.is_object() {
        Ok(())
    } else {
        Err(StorageError::Serialization(
            "documents must be JSON objects".into(),
        ))
    }
}

/// Render a grouping key for [`DocumentStore::count_by`].
fn group_key(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Single-collection operations
// ---------------------------------------------------------------------------

/// Documents of one collection, keyed by id.
pub(crate) type Documents = BTreeMap<String, Value>;

/// `existing` with the top-level fields of `patch` written over it.
pub(crate) fn merge_patch(existing: &Value, patch: Value) -> StorageResult<Value> {
    let Value::Object(patch) = patch else {
        return Err(StorageError::Serialization("patch must be a JSON object".into()));
    };
    let mut merged = existing.clone();
    if let Value::Object(fields) = &mut merged {
        fields.extend(patch);
    }
    Ok(merged)
}

pub(crate) fn find_in(docs: &Documents, query: &Query) -> Vec<Value> {
    query.apply(docs.values())
}

pub(crate) fn count_in(docs: &Documents, filter: &Filter) -> u64 {
    let count = docs.values().filter(|d| filter.matches(d)).count();
    u64::try_from(count).unwrap_or(u64::MAX)
}

pub(crate) fn count_by_in(docs: &Documents, group_field: &str, filter: &Filter) -> BTreeMap<String, u64> {
    let mut groups: BTreeMap<String, u64> = BTreeMap::new();
    for doc in docs.values().filter(|d| filter.matches(d)) {
        let slot = groups.entry(group_key(field(doc, group_field))).or_insert(0);
        *slot = slot.saturating_add(1);
    }
    groups
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Document-collection store.
///
/// Ids are unique per collection, which is what gives the plugin registry
/// its unique index on plugin names.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by id.
    async fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Value>>;

    /// Insert a document only if no document with this id exists.
    ///
    /// Returns `false` (and leaves the stored document untouched) when the
    /// id is already taken.
    async fn insert(&self, collection: &str, id: &str, document: Value) -> StorageResult<bool>;

    /// Insert or replace a document.
    async fn upsert(&self, collection: &str, id: &str, document: Value) -> StorageResult<()>;

    /// Merge the top-level fields of `patch` into an existing document.
    ///
    /// Returns `false` if the document does not exist.
    async fn update(&self, collection: &str, id: &str, patch: Value) -> StorageResult<bool>;

    /// Delete a document. Returns `true` if it existed.
    async fn delete(&self, collection: &str, id: &str) -> StorageResult<bool>;

    /// Run a query against a collection. Missing collections yield no rows.
    async fn find(&self, collection: &str, query: &Query) -> StorageResult<Vec<Value>>;

    /// Count documents matching a filter.
    async fn count(&self, collection: &str, filter: &Filter) -> StorageResult<u64>;

    /// Group matching documents by the value at `field` and count each group.
    async fn count_by(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> StorageResult<BTreeMap<String, u64>>;

    /// Delete every document matching a filter. Returns how many were removed.
    async fn delete_many(&self, collection: &str, filter: &Filter) -> StorageResult<u64>;
}

// ---------------------------------------------------------------------------
// Shared collection state
// ---------------------------------------------------------------------------

/// All collections held by a store, keyed by name then by id.
///
/// The working set of [`MemoryDocumentStore`].
#[derive(Debug, Default, Clone)]
pub(crate) struct CollectionSet {
    pub(crate) collections: HashMap<String, Documents>,
}

impl CollectionSet {
    pub(crate) fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Value>> {
        validate_collection(collection)?;
        validate_id(id)?;
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    pub(crate) fn insert(&mut self, collection: &str, id: &str, document: Value) -> StorageResult<bool> {
        validate_collection(collection)?;
        validate_id(id)?;
        require_object(&document)?;
        let docs = self.collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Ok(false);
        }
        docs.insert(id.to_string(), document);
        Ok(true)
    }

    pub(crate) fn upsert(&mut self, collection: &str, id: &str, document: Value) -> StorageResult<()> {
        validate_collection(collection)?;
        validate_id(id)?;
        require_object(&document)?;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        Ok(())
    }

    pub(crate) fn update(&mut self, collection: &str, id: &str, patch: Value) -> StorageResult<bool> {
        validate_collection(collection)?;
        validate_id(id)?;
        let Some(existing) = self
            .collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
        else {
            return Ok(false);
        };
        *existing = merge_patch(existing, patch)?;
        Ok(true)
    }

    pub(crate) fn delete(&mut self, collection: &str, id: &str) -> StorageResult<bool> {
        validate_collection(collection)?;
        validate_id(id)?;
        Ok(self
            .collections
            .get_mut(collection)
            .is_some_and(|c| c.remove(id).is_some()))
    }

    pub(crate) fn find(&self, collection: &str, query: &Query) -> StorageResult<Vec<Value>> {
        validate_collection(collection)?;
        Ok(self
            .collections
            .get(collection)
            .map(|c| find_in(c, query))
            .unwrap_or_default())
    }

    pub(crate) fn count(&self, collection: &str, filter: &Filter) -> StorageResult<u64> {
        validate_collection(collection)?;
        Ok(self
            .collections
            .get(collection)
            .map_or(0, |c| count_in(c, filter)))
    }

    pub(crate) fn count_by(
        &self,
        collection: &str,
        group_field: &str,
        filter: &Filter,
    ) -> StorageResult<BTreeMap<String, u64>> {
        validate_collection(collection)?;
        Ok(self
            .collections
            .get(collection)
            .map(|c| count_by_in(c, group_field, filter))
            .unwrap_or_default())
    }

    pub(crate) fn delete_many(&mut self, collection: &str, filter: &Filter) -> StorageResult<u64> {
        validate_collection(collection)?;
        let Some(docs) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, d| !filter.matches(d));
        let removed = before.saturating_sub(docs.len());
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory document store for tests and ephemeral data.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    data: std::sync::RwLock<CollectionSet>,
}

impl MemoryDocumentStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, CollectionSet>> {
        self.data
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, CollectionSet>> {
        self.data
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Value>> {
        self.read()?.get(collection, id)
    }

    async fn insert(&self, collection: &str, id: &str, document: Value) -> StorageResult<bool> {
        self.write()?.insert(collection, id, document)
    }

    async fn upsert(&self, collection: &str, id: &str, document: Value) -> StorageResult<()> {
        self.write()?.upsert(collection, id, document)
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> StorageResult<bool> {
        self.write()?.update(collection, id, patch)
    }

    async fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
        self.write()?.delete(collection, id)
    }

    async fn find(&self, collection: &str, query: &Query) -> StorageResult<Vec<Value>> {
        self.read()?.find(collection, query)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StorageResult<u64> {
        self.read()?.count(collection, filter)
    }

    async fn count_by(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> StorageResult<BTreeMap<String, u64>> {
        self.read()?.count_by(collection, field, filter)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StorageResult<u64> {
        self.write()?.delete_many(collection, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortOrder;
    use serde_json::json;

    #[tokio::test]
    async fn insert_is_unique_per_id() {
        let store = MemoryDocumentStore::new();
        assert!(store.insert("plugins", "a", json!({"v": 1})).await.unwrap());
        assert!(!store.insert("plugins", "a", json!({"v": 2})).await.unwrap());
        assert_eq!(store.get("plugins", "a").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn update_merges_top_level_fields() {
        let store = MemoryDocumentStore::new();
        store
            .upsert("plugins", "a", json!({"state": "disabled", "enabled": true}))
            .await
            .unwrap();
        assert!(store.update("plugins", "a", json!({"state": "active"})).await.unwrap());
        assert!(!store.update("plugins", "missing", json!({"state": "active"})).await.unwrap());
        assert_eq!(
            store.get("plugins", "a").await.unwrap(),
            Some(json!({"state": "active", "enabled": true}))
        );
    }

    #[tokio::test]
    async fn rejects_non_object_documents_and_bad_names() {
        let store = MemoryDocumentStore::new();
        assert!(store.upsert("plugins", "a", json!([1, 2])).await.is_err());
        assert!(store.upsert("", "a", json!({})).await.is_err());
        assert!(store.upsert("../etc", "a", json!({})).await.is_err());
        assert!(store.upsert("plugins", "", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn find_count_and_group() {
        let store = MemoryDocumentStore::new();
        for (id, kind, ts) in [("1", "loaded", 10), ("2", "failed", 20), ("3", "loaded", 30)] {
            store
                .upsert("activity", id, json!({"kind": kind, "ts": ts}))
                .await
                .unwrap();
        }

        let newest = store
            .find(
                "activity",
                &Query::new(Filter::all().eq("kind", "loaded")).sort_by("ts", SortOrder::Descending),
            )
            .await
            .unwrap();
        assert_eq!(newest[0]["ts"], 30);

        assert_eq!(store.count("activity", &Filter::all().gte("ts", 20)).await.unwrap(), 2);

        let groups = store.count_by("activity", "kind", &Filter::all()).await.unwrap();
        assert_eq!(groups.get("loaded"), Some(&2));
        assert_eq!(groups.get("failed"), Some(&1));

        assert!(store.find("missing", &Query::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_many_by_filter() {
        let store = MemoryDocumentStore::new();
        for (id, exp) in [("1", 5), ("2", 15), ("3", 25)] {
            store
                .upsert("activity", id, json!({"expires_at": exp}))
                .await
                .unwrap();
        }
        let removed = store
            .delete_many("activity", &Filter::all().lt("expires_at", 20))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count("activity", &Filter::all()).await.unwrap(), 1);
        assert!(!store.delete("activity", "1").await.unwrap());
        assert!(store.delete("activity", "3").await.unwrap());
    }
}
