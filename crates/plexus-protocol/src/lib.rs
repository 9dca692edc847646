//! Plexus Protocol - the stable IPC contract for subprocess plugins.
//!
//! A subprocess plugin is a separately built executable. The runtime starts
//! it with piped stdin/stdout and the two sides exchange one JSON object per
//! line: [`HostMessage`] from runtime to worker and [`WorkerMessage`] back.
//! Worker stderr is not part of the protocol.
//!
//! # Exchange
//!
//! ```text
//! host → handshake            worker → handshake_ack (hooks it implements)
//! host → register             worker → register_route / register_ui /
//!                                      access_request (host answers with
//!                                      access_decision) / log ...
//!                             worker → registered
//! host → health_check         worker → health
//! host → cleanup              worker → cleaned_up, then exits
//! ```
//!
//! Requests carry a `request_id` chosen by the sender; the matching reply
//! echoes it.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors from encoding or decoding protocol lines.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// A line was not a valid message.
    #[error("invalid message: {0}")]
    Decode(String),

    /// The peer speaks a protocol version this side does not.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this side speaks.
        expected: u32,
        /// Version the peer announced.
        actual: u32,
    },
}

/// Optional hooks a worker can implement. `register` is mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    /// Registration against the host. Older workers call it `load_plugin`.
    #[serde(alias = "load_plugin")]
    Register,
    /// Called on unload.
    Cleanup,
    /// Liveness probe used for response-time sampling.
    HealthCheck,
}

/// Outbound channel kinds a worker may ask to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkChannel {
    /// Plain HTTP(S) requests.
    Http,
    /// Websocket connections.
    Websocket,
    /// Outgoing email.
    Email,
}

/// UI extension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiSlot {
    /// A page in the administration panel.
    AdminPanel,
    /// An overlay rendered on user-facing pages.
    UserOverlay,
}

/// A resource access the worker wants mediated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum Access {
    /// Filesystem path, relative paths resolve against the plugin directory.
    File {
        /// Path to read or write.
        path: String,
        /// Whether the access writes.
        write: bool,
    },
    /// Data-store collection.
    Collection {
        /// Collection name.
        name: String,
        /// Whether the access writes.
        write: bool,
    },
    /// Outbound network request.
    Network {
        /// Target URL.
        url: String,
        /// Channel kind.
        channel: NetworkChannel,
    },
}

/// Severity attached to [`WorkerMessage::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Debug detail.
    Debug,
    /// Informational.
    Info,
    /// Something looks wrong.
    Warn,
    /// An operation failed.
    Error,
}

/// Messages sent by the runtime to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostMessage {
    /// First message on a fresh connection.
    Handshake {
        /// Version the runtime speaks.
        protocol_version: u32,
        /// Plugin name as known to the registry.
        plugin: String,
        /// Absolute plugin directory.
        plugin_dir: String,
        /// The `[config]` table from the plugin manifest.
        #[serde(default)]
        config: serde_json::Value,
    },
    /// Run the registration hook.
    Register {
        /// Correlates the `registered` reply.
        request_id: u64,
    },
    /// Run the health check hook.
    HealthCheck {
        /// Correlates the `health` reply.
        request_id: u64,
    },
    /// Answer to an [`WorkerMessage::AccessRequest`].
    AccessDecision {
        /// The worker's request id.
        request_id: u64,
        /// Whether the sandbox allowed the access.
        allowed: bool,
    },
    /// Run the cleanup hook and exit.
    Cleanup {
        /// Correlates the `cleaned_up` reply.
        request_id: u64,
    },
}

/// Messages sent by a worker to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Reply to [`HostMessage::Handshake`].
    HandshakeAck {
        /// Version the worker speaks.
        protocol_version: u32,
        /// Whether the worker accepts the connection.
        accepted: bool,
        /// Why the worker refused, if it did.
        #[serde(default)]
        reason: Option<String>,
        /// Hooks the worker implements.
        #[serde(default)]
        hooks: Vec<Hook>,
    },
    /// Register an HTTP route on the host during registration.
    RegisterRoute {
        /// HTTP method.
        method: String,
        /// Route path.
        path: String,
    },
    /// Register a UI extension on the host during registration.
    RegisterUi {
        /// Extension point.
        slot: UiSlot,
        /// Worker-chosen extension id.
        id: String,
    },
    /// Ask the runtime whether an access is permitted.
    AccessRequest {
        /// Correlates the `access_decision` reply.
        request_id: u64,
        /// The access in question.
        access: Access,
    },
    /// Reply to [`HostMessage::Register`].
    Registered {
        /// The host's request id.
        request_id: u64,
        /// Whether registration succeeded.
        ok: bool,
        /// Failure reason.
        #[serde(default)]
        error: Option<String>,
    },
    /// Reply to [`HostMessage::HealthCheck`].
    Health {
        /// The host's request id.
        request_id: u64,
        /// Whether the worker considers itself healthy.
        ok: bool,
        /// Failure reason.
        #[serde(default)]
        error: Option<String>,
    },
    /// Reply to [`HostMessage::Cleanup`].
    CleanedUp {
        /// The host's request id.
        request_id: u64,
    },
    /// A log line to forward into the runtime's tracing output.
    Log {
        /// Severity.
        level: LogLevel,
        /// Message text.
        message: String,
    },
}

/// Encode a message as a single JSON line (without the trailing newline).
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode one line into a message. Surrounding whitespace is ignored.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] if the line is not a valid message.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Check a peer's announced version against [`PROTOCOL_VERSION`].
///
/// # Errors
///
/// Returns [`ProtocolError::VersionMismatch`] when they differ.
pub fn check_version(actual: u32) -> Result<(), ProtocolError> {
    if actual == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_messages_are_tagged_snake_case() {
        let line = encode(&HostMessage::HealthCheck { request_id: 7 }).unwrap();
        assert_eq!(line, r#"{"kind":"health_check","request_id":7}"#);
    }

    #[test]
    fn handshake_ack_tolerates_missing_optional_fields() {
        let ack: WorkerMessage =
            decode(r#"{"kind":"handshake_ack","protocol_version":1,"accepted":true}"#).unwrap();
        assert_eq!(
            ack,
            WorkerMessage::HandshakeAck {
                protocol_version: 1,
                accepted: true,
                reason: None,
                hooks: Vec::new(),
            }
        );
    }

    #[test]
    fn legacy_load_plugin_hook_maps_to_register() {
        let ack: WorkerMessage = decode(
            r#"{"kind":"handshake_ack","protocol_version":1,"accepted":true,"hooks":["load_plugin","health_check"]}"#,
        )
        .unwrap();
        let WorkerMessage::HandshakeAck { hooks, .. } = ack else {
            panic!("expected handshake_ack");
        };
        assert_eq!(hooks, vec![Hook::Register, Hook::HealthCheck]);
    }

    #[test]
    fn access_request_nests_resource_tag() {
        let msg = WorkerMessage::AccessRequest {
            request_id: 1,
            access: Access::File {
                path: "data/cache.json".into(),
                write: true,
            },
        };
        let line = encode(&msg).unwrap();
        assert!(line.contains(r#""resource":"file""#));
        assert_eq!(decode::<WorkerMessage>(&line).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_garbage_and_unknown_kinds() {
        assert!(decode::<WorkerMessage>("hello").is_err());
        assert!(decode::<WorkerMessage>(r#"{"kind":"launch_missiles"}"#).is_err());
    }

    #[test]
    fn version_check() {
        assert!(check_version(PROTOCOL_VERSION).is_ok());
        assert!(matches!(
            check_version(99),
            Err(ProtocolError::VersionMismatch { actual: 99, .. })
        ));
    }
}
