//! Plexus Storage - document-collection persistence for the plugin runtime.
//!
//! The runtime persists two kinds of rows: plugin records (one per installed
//! plugin, unique by name) and activity records (append-only, expiring).
//! Both go through the [`DocumentStore`] trait, which offers CRUD plus the
//! small set of query and aggregate operations the runtime needs.
//!
//! # Backends
//!
//! - [`MemoryDocumentStore`]: always available, used by tests
//! - [`FileDocumentStore`]: one append-only JSON-lines log per collection
//!
//! # Example
//!
//! ```rust
//! use plexus_storage::{DocumentStore, Filter, MemoryDocumentStore, Query};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), plexus_storage::StorageError> {
//! let store = MemoryDocumentStore::new();
//! store.upsert("plugins", "billing", json!({"enabled": true})).await?;
//!
//! let enabled = store
//!     .find("plugins", &Query::new(Filter::all().eq("enabled", true)))
//!     .await?;
//! assert_eq!(enabled.len(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod document;
mod error;
mod file;
mod query;

pub use document::{DocumentStore, MemoryDocumentStore};
pub use error::{StorageError, StorageResult};
pub use file::FileDocumentStore;
pub use query::{Comparison, Condition, Filter, Query, SortKey, SortOrder, field};
