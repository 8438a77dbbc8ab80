//! The engine supervisor: one event loop accepting typed requests from
//! the admin socket, one spawned task per request, and one long-lived WAL
//! streaming task per configured server.
//!
//! The admin channel speaks length-prefixed JSON over a unix socket; the
//! framing here is a thin adapter, requests arrive as typed
//! [`Operation`] values.

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::client::{PgClient, ReplicationMode};
use crate::conf::{EngineState, ServerConf};
use crate::error::{Error, ErrorKind, Result};
use crate::restore::RestorePosition;
use crate::wal_archive::wal_streaming_task;
use crate::workflow::{self, backup::mark_backup_failed, Operation, WorkflowContext};

pub const CONTROL_SOCKET_NAME: &str = ".s.pgmoneta";
/// Requests larger than this are rejected outright.
const MAX_REQUEST_LEN: u32 = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(flatten)]
    pub output: serde_json::Map<String, serde_json::Value>,
}

impl Response {
    fn ok(output: serde_json::Map<String, serde_json::Value>) -> Response {
        Response {
            status: "ok".to_string(),
            error: None,
            code: None,
            output,
        }
    }

    fn failure(kind: ErrorKind, message: String) -> Response {
        Response {
            status: "error".to_string(),
            error: Some(message),
            code: Some(kind.code()),
            output: serde_json::Map::new(),
        }
    }
}

/// Read one length-prefixed JSON request.
pub async fn read_request(stream: &mut UnixStream) -> Result<Operation> {
    let len = stream.read_u32().await.map_err(Error::from)?;
    if len > MAX_REQUEST_LEN {
        return Err(Error::new(
            ErrorKind::ProtocolViolation,
            format!("oversized control request ({len} bytes)"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await.map_err(Error::from)?;
    serde_json::from_slice(&buf).map_err(|e| {
        Error::with_source(ErrorKind::ProtocolViolation, "malformed control request", e)
    })
}

pub async fn write_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let body = serde_json::to_vec(response)
        .map_err(|e| Error::with_source(ErrorKind::Internal, "response serialization", e))?;
    stream.write_u32(body.len() as u32).await.map_err(Error::from)?;
    stream.write_all(&body).await.map_err(Error::from)?;
    stream.flush().await.map_err(Error::from)?;
    Ok(())
}

pub struct Supervisor {
    state: Arc<EngineState>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(state: Arc<EngineState>) -> Supervisor {
        Supervisor {
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn socket_path(&self) -> Utf8PathBuf {
        self.state.conf.base_dir.join(CONTROL_SOCKET_NAME)
    }

    /// Run until cancelled: start per-server WAL streaming, then serve
    /// admin requests.
    pub async fn run(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state.conf.base_dir).map_err(Error::from)?;
        let socket_path = self.socket_path();
        // A stale socket from a previous run blocks the bind.
        std::fs::remove_file(&socket_path).ok();
        let listener = UnixListener::bind(&socket_path).map_err(Error::from)?;
        info!("control socket listening at {socket_path}");

        let mut streamers = Vec::new();
        for server in self.state.conf.servers.clone() {
            streamers.push(tokio::spawn(probe_and_stream(
                self.state.clone(),
                server,
                self.cancel.clone(),
            )));
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let state = self.state.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                handle_connection(state, stream, cancel).await;
                            });
                        }
                        Err(e) => warn!("control socket accept failed: {e}"),
                    }
                }
            }
        }

        info!("supervisor shutting down");
        for handle in streamers {
            handle.await.ok();
        }
        std::fs::remove_file(&socket_path).ok();
        Ok(())
    }
}

/// Probe the server's version (with retry), then stream WAL until
/// cancelled.
async fn probe_and_stream(
    state: Arc<EngineState>,
    server: ServerConf,
    cancel: CancellationToken,
) {
    let version = loop {
        if cancel.is_cancelled() {
            return;
        }
        let attempt = async {
            let mut client = PgClient::connect(
                &server,
                ReplicationMode::None,
                state.conf.authentication_timeout,
                state.conf.blocking_timeout,
            )
            .await?;
            let version = client.probe_version().await?;
            client.terminate().await;
            Ok::<_, Error>(version)
        }
        .await;
        match attempt {
            Ok(version) => break version,
            Err(e) => {
                warn!("cannot probe {} yet: {e}", server.name);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    };
    info!(
        "server {} is PostgreSQL {} (wal segment {} bytes)",
        server.name,
        version.major,
        version.wal_segment_size
    );
    wal_streaming_task(state, server, version, cancel).await;
}

async fn handle_connection(
    state: Arc<EngineState>,
    mut stream: UnixStream,
    cancel: CancellationToken,
) {
    let operation = match read_request(&mut stream).await {
        Ok(operation) => operation,
        Err(e) => {
            let _ = write_response(&mut stream, &Response::failure(e.kind, e.to_string())).await;
            return;
        }
    };
    info!("request: {}", operation.name());

    let response = match execute_operation(state, &operation, cancel)
        .instrument(info_span!("operation", op = operation.name()))
        .await
    {
        Ok(output) => Response::ok(output),
        Err((kind, message)) => Response::failure(kind, message),
    };
    if let Err(e) = write_response(&mut stream, &response).await {
        warn!("could not send control response: {e}");
    }
}

/// Materialize and drive the workflow chain for one request.
pub async fn execute_operation(
    state: Arc<EngineState>,
    operation: &Operation,
    cancel: CancellationToken,
) -> std::result::Result<serde_json::Map<String, serde_json::Value>, (ErrorKind, String)> {
    // Retention without a server fans out over all of them.
    if let Operation::Retention { server: None } = operation {
        let mut output = serde_json::Map::new();
        for server in &state.conf.servers {
            let scoped = Operation::Retention {
                server: Some(server.name.clone()),
            };
            let result =
                Box::pin(execute_operation(state.clone(), &scoped, cancel.clone())).await?;
            output.insert(server.name.clone(), serde_json::Value::Object(result));
        }
        return Ok(output);
    }

    let server_name = operation
        .server()
        .ok_or((ErrorKind::ConfigInvalid, "request names no server".to_string()))?;
    let server = state
        .conf
        .server(server_name)
        .cloned()
        .ok_or_else(|| {
            (
                ErrorKind::NotFound,
                format!("server {server_name:?} is not configured"),
            )
        })?;

    let mut ctx = WorkflowContext::new(state.clone(), server, cancel)
        .map_err(|e| (e.kind, e.to_string()))?;
    apply_operation_parameters(&mut ctx, operation);

    let chain = workflow::compose(operation, &state);
    let result = workflow::run_chain(&chain, &mut ctx).await;

    match result {
        Ok(()) => Ok(ctx.output),
        Err(stage_error) => {
            if matches!(
                operation,
                Operation::Backup { .. } | Operation::IncrementalBackup { .. }
            ) {
                mark_backup_failed(&mut ctx).await;
            }
            error!(
                "{} failed in stage {}: {}",
                operation.name(),
                stage_error.stage,
                stage_error.error
            );
            Err((
                stage_error.kind(),
                format!("stage {}: {}", stage_error.stage, stage_error.error),
            ))
        }
    }
}

fn apply_operation_parameters(ctx: &mut WorkflowContext, operation: &Operation) {
    match operation {
        Operation::Backup { .. } | Operation::Retention { .. } | Operation::List { .. } => {}
        Operation::IncrementalBackup { base, .. } => {
            ctx.identifier = base.clone().unwrap_or_default();
        }
        Operation::Restore {
            identifier,
            position,
            destination,
            ..
        } => {
            ctx.identifier = identifier.clone();
            ctx.position = position
                .as_deref()
                .map(RestorePosition::parse)
                .unwrap_or(RestorePosition::Current);
            ctx.destination = Some(Utf8PathBuf::from(destination));
        }
        Operation::Archive {
            identifier,
            destination,
            ..
        } => {
            ctx.identifier = identifier.clone();
            ctx.destination = Some(Utf8PathBuf::from(destination));
        }
        Operation::Delete {
            identifier, force, ..
        } => {
            ctx.identifier = identifier.clone();
            ctx.force = *force;
        }
        Operation::Verify { identifier, .. } => {
            ctx.identifier = identifier.clone();
        }
        Operation::Annotate {
            identifier,
            key,
            value,
            ..
        } => {
            ctx.identifier = identifier.clone();
            ctx.annotation = Some((key.clone(), value.clone()));
        }
    }
}
