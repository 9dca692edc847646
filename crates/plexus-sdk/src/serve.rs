//! The worker loop.

use plexus_protocol::{
    Hook, HostMessage, PROTOCOL_VERSION, WorkerMessage, check_version, decode, encode,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::error::{SdkError, SdkResult};
use crate::worker::{Registration, WorkerInfo, WorkerPlugin};

/// One end of the line protocol.
pub(crate) struct Connection<R, W> {
    lines: Lines<R>,
    writer: W,
}

impl<R, W> Connection<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn new(reader: R, writer: W) -> Self {
        Self {
            lines: reader.lines(),
            writer,
        }
    }

    pub(crate) async fn send(&mut self, message: &WorkerMessage) -> SdkResult<()> {
        let mut line = encode(message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn recv(&mut self) -> SdkResult<Option<HostMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(decode(&line)?));
        }
        Ok(None)
    }
}

/// Serve `plugin` over the process's stdin and stdout.
///
/// Stdout carries the protocol; write diagnostics to stderr or through
/// [`Registration::log`].
///
/// # Errors
///
/// Returns an error if the pipe fails or the runtime violates the protocol.
pub async fn serve<P: WorkerPlugin>(plugin: P) -> SdkResult<()> {
    serve_io(plugin, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// Serve `plugin` over arbitrary streams.
///
/// Returns after a `cleanup` request, a refused handshake, or when the
/// runtime closes the input.
///
/// # Errors
///
/// Returns an error if the pipe fails or the runtime violates the protocol.
pub async fn serve_io<P, R, W>(mut plugin: P, reader: R, writer: W) -> SdkResult<()>
where
    P: WorkerPlugin,
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut conn = Connection::new(reader, writer);

    let info = match conn.recv().await? {
        Some(HostMessage::Handshake {
            protocol_version,
            plugin: name,
            plugin_dir,
            config,
        }) => {
            if let Err(e) = check_version(protocol_version) {
                refuse(&mut conn, e.to_string()).await?;
                return Ok(());
            }
            WorkerInfo {
                plugin: name,
                plugin_dir: plugin_dir.into(),
                config,
            }
        },
        Some(other) => return Err(SdkError::Unexpected(format!("{other:?}"))),
        None => return Ok(()),
    };

    if let Err(reason) = plugin.accept(&info).await {
        refuse(&mut conn, reason).await?;
        return Ok(());
    }

    let mut hooks = vec![Hook::Register];
    hooks.extend(plugin.hooks().into_iter().filter(|h| *h != Hook::Register));
    conn.send(&WorkerMessage::HandshakeAck {
        protocol_version: PROTOCOL_VERSION,
        accepted: true,
        reason: None,
        hooks,
    })
    .await?;

    while let Some(message) = conn.recv().await? {
        match message {
            HostMessage::Register { request_id } => {
                let outcome = {
                    let mut registration = Registration::new(&mut conn, &info);
                    plugin.register(&mut registration).await
                };
                conn.send(&WorkerMessage::Registered {
                    request_id,
                    ok: outcome.is_ok(),
                    error: outcome.err(),
                })
                .await?;
            },
            HostMessage::HealthCheck { request_id } => {
                let outcome = plugin.health_check().await;
                conn.send(&WorkerMessage::Health {
                    request_id,
                    ok: outcome.is_ok(),
                    error: outcome.err(),
                })
                .await?;
            },
            HostMessage::Cleanup { request_id } => {
                plugin.cleanup().await;
                conn.send(&WorkerMessage::CleanedUp { request_id }).await?;
                return Ok(());
            },
            other @ (HostMessage::Handshake { .. } | HostMessage::AccessDecision { .. }) => {
                return Err(SdkError::Unexpected(format!("{other:?}")));
            },
        }
    }
    Ok(())
}

async fn refuse<R, W>(conn: &mut Connection<R, W>, reason: String) -> SdkResult<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    conn.send(&WorkerMessage::HandshakeAck {
        protocol_version: PROTOCOL_VERSION,
        accepted: false,
        reason: Some(reason),
        hooks: Vec::new(),
    })
    .await
}
