//! SDK for Plexus subprocess plugins.
//!
//! A worker is an executable the runtime spawns with its plugin directory
//! as working directory. It implements [`WorkerPlugin`] and hands itself to
//! [`serve`], which speaks the `plexus-protocol` line protocol on stdin and
//! stdout until the runtime asks it to clean up.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use plexus_sdk::{Registration, WorkerPlugin, serve};
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl WorkerPlugin for Hello {
//!     async fn register(&mut self, reg: &mut Registration<'_>) -> Result<(), String> {
//!         reg.route("GET", "/hello").await.map_err(|e| e.to_string())
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), plexus_sdk::SdkError> {
//!     serve(Hello).await
//! }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod serve;
mod worker;

pub use error::{SdkError, SdkResult};
pub use plexus_protocol::{Access, Hook, LogLevel, NetworkChannel, UiSlot};
pub use serve::{serve, serve_io};
pub use worker::{Registration, WorkerInfo, WorkerPlugin};
