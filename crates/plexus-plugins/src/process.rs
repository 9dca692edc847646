//! Subprocess-backed plugins.
//!
//! [`ProcessPlugin`] runs a plugin backend as a child process and talks to
//! it over newline-delimited JSON on stdin/stdout (see `plexus-protocol`).
//! The child is spawned on `register` and stopped on `cleanup`, so a hot
//! reload always starts a fresh process and picks up edited code.
//!
//! The worker never touches host state directly. Route and UI
//! registrations are forwarded to the [`PluginHost`], and resource
//! accesses are answered by the plugin's [`PluginSandbox`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use plexus_protocol::{
    Access, HostMessage, Hook, LogLevel, PROTOCOL_VERSION, WorkerMessage, check_version, decode,
    encode,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;
use crate::name::PluginName;
use crate::plugin::{Plugin, PluginContext};
use crate::sandbox::{AccessMode, PluginSandbox};

/// A live connection to a worker process.
struct WorkerSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    hooks: Vec<Hook>,
}

/// A plugin whose backend runs as a child process.
pub struct ProcessPlugin {
    name: PluginName,
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    plugin_dir: PathBuf,
    config: serde_json::Value,
    call_timeout: Duration,
    sandbox: Mutex<Option<PluginSandbox>>,
    session: tokio::sync::Mutex<Option<WorkerSession>>,
    next_request: AtomicU64,
    /// 0 when no worker is running.
    pid: AtomicU32,
    health_hook: AtomicBool,
}

impl std::fmt::Debug for ProcessPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPlugin")
            .field("name", &self.name)
            .field("program", &self.program)
            .field("pid", &self.process_id())
            .finish_non_exhaustive()
    }
}

impl ProcessPlugin {
    /// Create an unstarted worker plugin.
    #[must_use]
    pub fn new(ctx: &PluginContext, program: PathBuf, args: Vec<String>, env: Vec<(String, String)>) -> Self {
        Self {
            name: ctx.name.clone(),
            program,
            args,
            env,
            plugin_dir: ctx.plugin_dir.clone(),
            config: ctx.config.clone(),
            call_timeout: ctx.call_timeout,
            sandbox: Mutex::new(None),
            session: tokio::sync::Mutex::new(None),
            next_request: AtomicU64::new(1),
            pid: AtomicU32::new(0),
            health_hook: AtomicBool::new(false),
        }
    }

    /// The worker executable.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    fn protocol_error(&self, message: impl Into<String>) -> PluginError {
        PluginError::Protocol {
            plugin: self.name.to_string(),
            message: message.into(),
        }
    }

    fn current_sandbox(&self) -> Option<PluginSandbox> {
        self.sandbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -----------------------------------------------------------------------
    // Wire helpers
    // -----------------------------------------------------------------------

    async fn send(&self, session: &mut WorkerSession, message: &HostMessage) -> PluginResult<()> {
        let mut line = encode(message).map_err(|e| self.protocol_error(e.to_string()))?;
        line.push('\n');
        session.stdin.write_all(line.as_bytes()).await?;
        session.stdin.flush().await?;
        Ok(())
    }

    /// Read the next message that needs the caller's attention.
    ///
    /// Log lines and access requests are handled here. Registrations are
    /// forwarded to `host` when one is given; outside registration they
    /// are ignored with a warning. A registration the host refuses for any
    /// reason other than a permission denial is stored in `fatal`.
    async fn next_reply(
        &self,
        session: &mut WorkerSession,
        host: Option<&PluginHost>,
        fatal: &mut Option<PluginError>,
    ) -> PluginResult<WorkerMessage> {
        loop {
            let Some(line) = session.stdout.next_line().await? else {
                return Err(self.protocol_error("worker closed its output"));
            };
            if line.trim().is_empty() {
                continue;
            }
            let message: WorkerMessage =
                decode(&line).map_err(|e| self.protocol_error(e.to_string()))?;

            match message {
                WorkerMessage::Log { level, message } => self.forward_log(level, &message),
                WorkerMessage::AccessRequest { request_id, access } => {
                    let allowed = self.decide_access(&access).await;
                    self.send(
                        session,
                        &HostMessage::AccessDecision {
                            request_id,
                            allowed,
                        },
                    )
                    .await?;
                },
                WorkerMessage::RegisterRoute { method, path } => match host {
                    Some(host) => match host.register_route(&method, &path).await {
                        Ok(()) => {},
                        Err(e @ PluginError::PermissionDenied { .. }) => {
                            warn!(plugin = %self.name, error = %e, "Worker route refused");
                        },
                        Err(e) => {
                            fatal.get_or_insert(e);
                        },
                    },
                    None => {
                        warn!(plugin = %self.name, %method, %path, "Route registration outside register ignored");
                    },
                },
                WorkerMessage::RegisterUi { slot, id } => match host {
                    Some(host) => match host.register_ui(slot, &id).await {
                        Ok(()) => {},
                        Err(e @ PluginError::PermissionDenied { .. }) => {
                            warn!(plugin = %self.name, error = %e, "Worker UI extension refused");
                        },
                        Err(e) => {
                            fatal.get_or_insert(e);
                        },
                    },
                    None => {
                        warn!(plugin = %self.name, %id, "UI registration outside register ignored");
                    },
                },
                other => return Ok(other),
            }
        }
    }

    async fn decide_access(&self, access: &Access) -> bool {
        let Some(sandbox) = self.current_sandbox() else {
            warn!(plugin = %self.name, "Access request with no sandbox attached, denying");
            return false;
        };
        match access {
            Access::File { path, write } => {
                sandbox
                    .check_file(Path::new(path), AccessMode::from_write(*write))
                    .await
            },
            Access::Collection { name, write } => {
                sandbox
                    .check_collection(name, AccessMode::from_write(*write))
                    .await
            },
            Access::Network { url, channel } => sandbox.check_network(url, *channel).await,
        }
    }

    fn forward_log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(plugin = %self.name, "{message}"),
            LogLevel::Info => info!(plugin = %self.name, "{message}"),
            LogLevel::Warn => warn!(plugin = %self.name, "{message}"),
            LogLevel::Error => error!(plugin = %self.name, "{message}"),
        }
    }

    // -----------------------------------------------------------------------
    // Process lifecycle
    // -----------------------------------------------------------------------

    async fn start(&self) -> PluginResult<WorkerSession> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.plugin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PluginError::EntryPointFailed {
            plugin: self.name.to_string(),
            message: format!("failed to spawn {}: {e}", self.program.display()),
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.protocol_error("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.protocol_error("worker stdout unavailable"))?;

        let mut session = WorkerSession {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            hooks: Vec::new(),
        };

        self.send(
            &mut session,
            &HostMessage::Handshake {
                protocol_version: PROTOCOL_VERSION,
                plugin: self.name.to_string(),
                plugin_dir: self.plugin_dir.display().to_string(),
                config: self.config.clone(),
            },
        )
        .await?;

        let mut fatal = None;
        match self.next_reply(&mut session, None, &mut fatal).await? {
            WorkerMessage::HandshakeAck {
                protocol_version,
                accepted,
                reason,
                hooks,
            } => {
                check_version(protocol_version).map_err(|e| self.protocol_error(e.to_string()))?;
                if !accepted {
                    return Err(PluginError::EntryPointFailed {
                        plugin: self.name.to_string(),
                        message: reason.unwrap_or_else(|| "worker refused the handshake".into()),
                    });
                }
                if !hooks.contains(&Hook::Register) {
                    return Err(self.protocol_error("worker does not implement register"));
                }
                session.hooks = hooks;
            },
            other => {
                return Err(self.protocol_error(format!("expected handshake_ack, got {other:?}")));
            },
        }

        let pid = session.child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::Relaxed);
        self.health_hook
            .store(session.hooks.contains(&Hook::HealthCheck), Ordering::Relaxed);
        info!(plugin = %self.name, pid, hooks = ?session.hooks, "Worker started");
        Ok(session)
    }

    async fn stop(&self, mut session: WorkerSession) {
        if let Err(e) = session.child.kill().await {
            debug!(plugin = %self.name, error = %e, "Worker already exited");
        }
        self.pid.store(0, Ordering::Relaxed);
        self.health_hook.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    fn name(&self) -> &PluginName {
        &self.name
    }

    async fn register(&self, host: &PluginHost) -> PluginResult<()> {
        let mut guard = self.session.lock().await;
        let mut session = match guard.take() {
            Some(session) => session,
            None => self.start().await?,
        };

        let request_id = self.request_id();
        let mut fatal = None;
        let result = async {
            self.send(&mut session, &HostMessage::Register { request_id })
                .await?;
            loop {
                match self.next_reply(&mut session, Some(host), &mut fatal).await? {
                    WorkerMessage::Registered {
                        request_id: id,
                        ok,
                        error,
                    } if id == request_id => {
                        if ok {
                            return Ok(());
                        }
                        return Err(PluginError::EntryPointFailed {
                            plugin: self.name.to_string(),
                            message: error.unwrap_or_else(|| "registration failed".into()),
                        });
                    },
                    other => debug!(plugin = %self.name, message = ?other, "Unexpected worker message"),
                }
            }
        }
        .await;

        match result.and_then(|()| fatal.map_or(Ok(()), Err)) {
            Ok(()) => {
                *guard = Some(session);
                Ok(())
            },
            Err(e) => {
                self.stop(session).await;
                Err(e)
            },
        }
    }

    async fn cleanup(&self) -> PluginResult<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };

        if session.hooks.contains(&Hook::Cleanup) {
            let request_id = self.request_id();
            let polite = async {
                self.send(&mut session, &HostMessage::Cleanup { request_id })
                    .await?;
                let mut fatal = None;
                loop {
                    if let WorkerMessage::CleanedUp { request_id: id } =
                        self.next_reply(&mut session, None, &mut fatal).await?
                        && id == request_id
                    {
                        return Ok::<(), PluginError>(());
                    }
                }
            };
            match tokio::time::timeout(self.call_timeout, polite).await {
                Ok(Ok(())) => debug!(plugin = %self.name, "Worker cleanup acknowledged"),
                Ok(Err(e)) => warn!(plugin = %self.name, error = %e, "Worker cleanup failed"),
                Err(_) => warn!(plugin = %self.name, "Worker cleanup timed out"),
            }
        }

        self.stop(session).await;
        info!(plugin = %self.name, "Worker stopped");
        Ok(())
    }

    fn supports_health_check(&self) -> bool {
        self.health_hook.load(Ordering::Relaxed)
    }

    async fn health_check(&self) -> PluginResult<()> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(PluginError::HealthCheckFailed {
                plugin: self.name.to_string(),
                message: "worker is not running".into(),
            });
        };

        let request_id = self.request_id();
        self.send(session, &HostMessage::HealthCheck { request_id })
            .await?;
        let mut fatal = None;
        loop {
            if let WorkerMessage::Health {
                request_id: id,
                ok,
                error,
            } = self.next_reply(session, None, &mut fatal).await?
                && id == request_id
            {
                if ok {
                    return Ok(());
                }
                return Err(PluginError::HealthCheckFailed {
                    plugin: self.name.to_string(),
                    message: error.unwrap_or_else(|| "worker reported unhealthy".into()),
                });
            }
        }
    }

    fn attach_sandbox(&self, sandbox: PluginSandbox) {
        *self.sandbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(sandbox);
    }

    fn process_id(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }
}
