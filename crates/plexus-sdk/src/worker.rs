//! The plugin-side trait and the registration handle.

use std::path::PathBuf;

use async_trait::async_trait;
use plexus_protocol::{Access, Hook, HostMessage, LogLevel, NetworkChannel, UiSlot, WorkerMessage};
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::error::{SdkError, SdkResult};
use crate::serve::Connection;

/// What the runtime told the worker in its handshake.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Plugin name as known to the registry.
    pub plugin: String,
    /// Absolute plugin directory.
    pub plugin_dir: PathBuf,
    /// The manifest's `[config]` table.
    pub config: serde_json::Value,
}

/// A subprocess plugin.
///
/// Hook failures are reported to the runtime as strings; they never end
/// the worker loop.
#[async_trait]
pub trait WorkerPlugin: Send {
    /// Hooks besides `register` this worker implements.
    fn hooks(&self) -> Vec<Hook> {
        Vec::new()
    }

    /// Accept or refuse the connection. A refusal reason ends the worker.
    async fn accept(&mut self, _info: &WorkerInfo) -> Result<(), String> {
        Ok(())
    }

    /// Register routes and UI extensions.
    async fn register(&mut self, registration: &mut Registration<'_>) -> Result<(), String>;

    /// Liveness probe.
    async fn health_check(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Release resources before exit.
    async fn cleanup(&mut self) {}
}

/// Object-safe view of a connection used during registration.
#[async_trait]
pub(crate) trait Channel: Send {
    async fn send(&mut self, message: &WorkerMessage) -> SdkResult<()>;
    async fn recv(&mut self) -> SdkResult<Option<HostMessage>>;
}

#[async_trait]
impl<R, W> Channel for Connection<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: &WorkerMessage) -> SdkResult<()> {
        Connection::send(self, message).await
    }

    async fn recv(&mut self) -> SdkResult<Option<HostMessage>> {
        Connection::recv(self).await
    }
}

/// Handle passed to [`WorkerPlugin::register`].
pub struct Registration<'a> {
    channel: &'a mut dyn Channel,
    info: &'a WorkerInfo,
    next_request: u64,
}

impl std::fmt::Debug for Registration<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("plugin", &self.info.plugin)
            .finish_non_exhaustive()
    }
}

impl<'a> Registration<'a> {
    pub(crate) fn new(channel: &'a mut dyn Channel, info: &'a WorkerInfo) -> Self {
        Self {
            channel,
            info,
            next_request: 1,
        }
    }

    /// The handshake information.
    #[must_use]
    pub fn info(&self) -> &WorkerInfo {
        self.info
    }

    /// Register an HTTP route. The runtime checks permissions; a refused
    /// route is logged there and does not fail registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe fails.
    pub async fn route(&mut self, method: &str, path: &str) -> SdkResult<()> {
        self.channel
            .send(&WorkerMessage::RegisterRoute {
                method: method.to_owned(),
                path: path.to_owned(),
            })
            .await
    }

    /// Register a UI extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe fails.
    pub async fn ui(&mut self, slot: UiSlot, id: &str) -> SdkResult<()> {
        self.channel
            .send(&WorkerMessage::RegisterUi {
                slot,
                id: id.to_owned(),
            })
            .await
    }

    /// Forward a log line to the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe fails.
    pub async fn log(&mut self, level: LogLevel, message: impl Into<String>) -> SdkResult<()> {
        self.channel
            .send(&WorkerMessage::Log {
                level,
                message: message.into(),
            })
            .await
    }

    /// Ask the runtime's sandbox whether an access is permitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe fails or the runtime answers with
    /// anything but the matching decision.
    pub async fn request_access(&mut self, access: Access) -> SdkResult<bool> {
        let request_id = self.next_request;
        self.next_request = self.next_request.saturating_add(1);
        self.channel
            .send(&WorkerMessage::AccessRequest { request_id, access })
            .await?;
        match self.channel.recv().await? {
            Some(HostMessage::AccessDecision {
                request_id: id,
                allowed,
            }) if id == request_id => Ok(allowed),
            Some(other) => Err(SdkError::Unexpected(format!("{other:?}"))),
            None => Err(SdkError::Closed),
        }
    }

    /// Shorthand for a file access check.
    ///
    /// # Errors
    ///
    /// See [`request_access`](Self::request_access).
    pub async fn can_access_file(&mut self, path: &str, write: bool) -> SdkResult<bool> {
        self.request_access(Access::File {
            path: path.to_owned(),
            write,
        })
        .await
    }

    /// Shorthand for an outbound request check.
    ///
    /// # Errors
    ///
    /// See [`request_access`](Self::request_access).
    pub async fn can_reach(&mut self, url: &str, channel: NetworkChannel) -> SdkResult<bool> {
        self.request_access(Access::Network {
            url: url.to_owned(),
            channel,
        })
        .await
    }
}
