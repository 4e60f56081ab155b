//! Stdin/stdout JSON bridge for the host command channel.
//!
//! Reads newline-delimited `CommandEnvelope`s from stdin and writes
//! `ResponseEnvelope`s and `EventEnvelope`s as newline-delimited JSON to
//! stdout. Stdout carries only the protocol; diagnostics go to stderr.

use crate::error::{RefreshError, Result};
use crate::host::bridge_tabs::HostTabDirectory;
use crate::host::channel::{HostCommandClient, command_channel};
use crate::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use crate::service::RefreshService;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};

/// Run the bridge over the process stdin/stdout until stdin closes or
/// `HOST_SHUTDOWN` arrives.
pub async fn run_stdio_bridge(
    service: RefreshService,
    tabs: Arc<HostTabDirectory>,
    event_tx: broadcast::Sender<EventEnvelope>,
) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    run_bridge(stdin, stdout, service, tabs, event_tx).await
}

/// Run the bridge over arbitrary line-oriented I/O.
///
/// Three concurrent pieces: the reader (current task) dispatching commands,
/// a forwarder writing broadcast events, and the router task.
pub async fn run_bridge<R, W>(
    input: R,
    output: W,
    service: RefreshService,
    tabs: Arc<HostTabDirectory>,
    event_tx: broadcast::Sender<EventEnvelope>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let request_capacity = service.config().request_capacity;
    let (client, server) = command_channel(request_capacity, event_tx, service, tabs);
    let writer = Arc::new(Mutex::new(output));

    let server_handle = tokio::spawn(server.run());

    let event_writer = Arc::clone(&writer);
    let mut event_rx = client.subscribe_events();
    let event_handle = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(envelope) => match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        let mut w = event_writer.lock().await;
                        if let Err(e) = write_line(&mut *w, &json).await {
                            warn!(error = %e, "failed to write event envelope; stopping event forwarder");
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "failed to serialize event envelope; skipping"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "event forwarder lagged; some events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("event broadcast channel closed; stopping event forwarder");
                    break;
                }
            }
        }
    });

    let reader_result = run_reader(input, client, Arc::clone(&writer)).await;

    // The reader dropped the client, so the router drains and exits.
    let _ = server_handle.await;
    event_handle.abort();
    let _ = event_handle.await;

    reader_result
}

async fn run_reader<R, W>(
    mut input: R,
    client: HostCommandClient,
    writer: Arc<Mutex<W>>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = input
            .read_line(&mut line)
            .await
            .map_err(|e| RefreshError::Channel(format!("failed to read command stream: {e}")))?;
        if bytes_read == 0 {
            info!("command stream closed (EOF); shutting down bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                let response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                write_response(&writer, &response).await?;
                continue;
            }
        };

        let is_shutdown = envelope.command == CommandName::HostShutdown;
        let request_id = envelope.request_id.clone();
        let response = match client.send(envelope).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(error = %e, "host command dispatch failed");
                ResponseEnvelope::error(request_id, format!("dispatch failed: {e}"))
            }
        };
        write_response(&writer, &response).await?;

        if is_shutdown {
            info!("HOST_SHUTDOWN received; shutting down bridge");
            break;
        }
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &Mutex<W>,
    response: &ResponseEnvelope,
) -> Result<()> {
    let json = serde_json::to_string(response)
        .map_err(|e| RefreshError::Contract(format!("failed to serialize response: {e}")))?;
    let mut w = writer.lock().await;
    write_line(&mut *w, &json).await
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| RefreshError::Channel(format!("failed to write output: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| RefreshError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| RefreshError::Channel(format!("failed to flush output: {e}")))?;
    Ok(())
}
