//! Host command channel and router onto [`RefreshService`].

use crate::error::{RefreshError, Result};
use crate::host::bridge_tabs::{HostTabDirectory, TabCallReply};
use crate::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use crate::scheduler::tasks::TabId;
use crate::service::{RefreshEvent, RefreshService, StartRequest, TaskStatus};
use crate::tabs::{LoadStatus, TabChange, TabEvent};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

struct HostCommandRequest {
    envelope: CommandEnvelope,
    response_tx: oneshot::Sender<ResponseEnvelope>,
}

/// Sending half held by the transport.
#[derive(Clone)]
pub struct HostCommandClient {
    request_tx: mpsc::Sender<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl HostCommandClient {
    /// Dispatch one command and wait for its response.
    ///
    /// Command failures come back as error envelopes; `Err` means the
    /// envelope was malformed or the router is gone.
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<ResponseEnvelope> {
        envelope.validate().map_err(|e| {
            RefreshError::Contract(format!(
                "invalid host command envelope {}: {e}",
                envelope.request_id
            ))
        })?;

        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(HostCommandRequest {
                envelope,
                response_tx,
            })
            .await
            .map_err(|e| RefreshError::Channel(format!("failed to send host command request: {e}")))?;

        response_rx
            .await
            .map_err(|e| RefreshError::Channel(format!("host command response dropped: {e}")))
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }
}

/// Router side: owns the service handle and the bridged tab directory.
pub struct HostCommandServer {
    request_rx: mpsc::Receiver<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
    service: RefreshService,
    tabs: Arc<HostTabDirectory>,
}

/// Create a client/server pair sharing `event_tx` with the tab directory,
/// so `tab.call` events and lifecycle events reach the host on one stream.
#[must_use]
pub fn command_channel(
    request_capacity: usize,
    event_tx: broadcast::Sender<EventEnvelope>,
    service: RefreshService,
    tabs: Arc<HostTabDirectory>,
) -> (HostCommandClient, HostCommandServer) {
    let (request_tx, request_rx) = mpsc::channel(request_capacity.max(1));
    (
        HostCommandClient {
            request_tx,
            event_tx: event_tx.clone(),
        },
        HostCommandServer {
            request_rx,
            event_tx,
            service,
            tabs,
        },
    )
}

impl HostCommandServer {
    /// Serve requests until every client is dropped.
    pub async fn run(mut self) {
        let forwarder = spawn_event_forwarder(self.service.subscribe(), self.event_tx.clone());
        while let Some(request) = self.request_rx.recv().await {
            let response = match self.route(&request.envelope).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        request_id = %request.envelope.request_id,
                        command = request.envelope.command.as_str(),
                        error = %e,
                        "host command failed"
                    );
                    ResponseEnvelope::error(request.envelope.request_id.clone(), e.to_string())
                }
            };
            let _ = request.response_tx.send(response);
        }
        forwarder.abort();
        let _ = forwarder.await;
    }

    /// Route a command envelope to the appropriate handler.
    pub async fn route(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let id = envelope.request_id.clone();
        let payload = &envelope.payload;
        match envelope.command {
            CommandName::StartRefresh => self.handle_start(id, payload).await,
            CommandName::StopRefresh => self.handle_stop(id, payload),
            CommandName::GetStatus => self.handle_get_status(id, payload),
            CommandName::GetAllRefreshers => Ok(ResponseEnvelope::ok(
                id,
                serde_json::json!({
                    "tasks": self
                        .service
                        .query_all()
                        .iter()
                        .map(TaskView::from)
                        .collect::<Vec<_>>()
                }),
            )),
            CommandName::UpdateReopenSetting => self.handle_update_reopen(id, payload).await,
            CommandName::GetReopenSetting => Ok(ResponseEnvelope::ok(
                id,
                serde_json::json!({"reopenSetting": self.service.global_reopen()}),
            )),
            CommandName::GetIntervalPrefs => {
                let tab_id = parse_tab_id(payload, envelope.command)?;
                let (min, max) = self.service.interval_prefs(tab_id).await?;
                Ok(ResponseEnvelope::ok(
                    id,
                    serde_json::json!({"minInterval": min, "maxInterval": max}),
                ))
            }
            CommandName::TabUpdated => {
                let tab_id = parse_tab_id(payload, envelope.command)?;
                let change = parse_tab_change(payload)?;
                self.service
                    .handle_tab_event(TabEvent::Updated { tab_id, change });
                Ok(ResponseEnvelope::ok(id, serde_json::json!({"accepted": true})))
            }
            CommandName::TabRemoved => {
                let tab_id = parse_tab_id(payload, envelope.command)?;
                self.service.handle_tab_event(TabEvent::Removed { tab_id });
                Ok(ResponseEnvelope::ok(id, serde_json::json!({"accepted": true})))
            }
            CommandName::TabCallResult => {
                let reply: TabCallReply = serde_json::from_value(payload.clone()).map_err(|e| {
                    RefreshError::Contract(format!("TAB_CALL_RESULT payload is invalid: {e}"))
                })?;
                let accepted = self.tabs.resolve(reply);
                Ok(ResponseEnvelope::ok(id, serde_json::json!({"accepted": accepted})))
            }
            CommandName::HostPing => Ok(ResponseEnvelope::ok(id, serde_json::json!({"pong": true}))),
            CommandName::HostVersion => Ok(ResponseEnvelope::ok(
                id,
                serde_json::json!({
                    "contract_version": crate::host::contract::EVENT_VERSION,
                    "channel": "tab_refresh_v1",
                    "crate_version": env!("CARGO_PKG_VERSION"),
                }),
            )),
            CommandName::HostShutdown => {
                Ok(ResponseEnvelope::ok(id, serde_json::json!({"shutting_down": true})))
            }
        }
    }

    async fn handle_start(&self, id: String, payload: &serde_json::Value) -> Result<ResponseEnvelope> {
        let command = CommandName::StartRefresh;
        let request = StartRequest {
            tab_id: parse_tab_id(payload, command)?,
            min_interval_secs: parse_u64_field(payload, "minInterval", command)?,
            max_interval_secs: parse_u64_field(payload, "maxInterval", command)?,
            title: parse_optional_string(payload, "tabTitle"),
            url: parse_optional_string(payload, "tabUrl"),
        };
        let tab_id = request.tab_id;
        let armed = self.service.start(request).await?;
        Ok(ResponseEnvelope::ok(
            id,
            serde_json::json!({
                "success": true,
                "message": format!(
                    "Refresh started for tab {tab_id}; next reload in {}s.",
                    armed.delay_ms.div_ceil(1000)
                ),
            }),
        ))
    }

    fn handle_stop(&self, id: String, payload: &serde_json::Value) -> Result<ResponseEnvelope> {
        let tab_id = parse_tab_id(payload, CommandName::StopRefresh)?;
        let message = if self.service.stop(tab_id) {
            format!("Refresh stopped for tab {tab_id}.")
        } else {
            format!("Tab {tab_id} was not being refreshed.")
        };
        Ok(ResponseEnvelope::ok(
            id,
            serde_json::json!({"success": true, "message": message}),
        ))
    }

    fn handle_get_status(&self, id: String, payload: &serde_json::Value) -> Result<ResponseEnvelope> {
        let tab_id = parse_tab_id(payload, CommandName::GetStatus)?;
        let body = match self.service.query_one(tab_id) {
            Some(status) => {
                let mut body = serde_json::to_value(TaskView::from(&status)).map_err(|e| {
                    RefreshError::Contract(format!("cannot serialize status: {e}"))
                })?;
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("isRefreshing".to_owned(), serde_json::Value::Bool(true));
                }
                body
            }
            None => serde_json::json!({"isRefreshing": false}),
        };
        Ok(ResponseEnvelope::ok(id, body))
    }

    async fn handle_update_reopen(
        &self,
        id: String,
        payload: &serde_json::Value,
    ) -> Result<ResponseEnvelope> {
        let Some(reopen) = payload.get("reopen").and_then(serde_json::Value::as_bool) else {
            debug!(payload = %payload, "non-boolean reopen setting rejected");
            return Ok(ResponseEnvelope::ok(
                id,
                serde_json::json!({"success": false, "message": "Invalid setting value."}),
            ));
        };

        if let Err(e) = self.service.set_global_reopen(reopen).await {
            error!(error = %e, "failed to persist reopen-closed-tabs setting");
            return Ok(ResponseEnvelope::ok(
                id,
                serde_json::json!({
                    "success": false,
                    "newSetting": reopen,
                    "message": format!("Setting applied but not saved: {e}"),
                }),
            ));
        }
        Ok(ResponseEnvelope::ok(
            id,
            serde_json::json!({"success": true, "newSetting": reopen}),
        ))
    }
}

/// Wire view of a task (intervals in seconds).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskView {
    tab_id: TabId,
    title: String,
    url: String,
    min_interval: u64,
    max_interval: u64,
    time_left_ms: u64,
    closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_note: Option<String>,
}

impl From<&TaskStatus> for TaskView {
    fn from(status: &TaskStatus) -> Self {
        Self {
            tab_id: status.tab_id,
            title: status.title.clone(),
            url: status.url.clone(),
            min_interval: status.min_interval_secs,
            max_interval: status.max_interval_secs,
            time_left_ms: status.time_left_ms,
            closed: status.closed,
            status_note: status.status_note.clone(),
        }
    }
}

/// Map a service notification onto its event name and payload.
#[must_use]
pub fn refresh_event_envelope(event: &RefreshEvent) -> EventEnvelope {
    let (name, payload) = match event {
        RefreshEvent::Started {
            tab_id,
            interval,
            next_fire_at_ms,
        } => (
            "refresh.started",
            serde_json::json!({
                "tabId": tab_id,
                "minInterval": interval.min_secs(),
                "maxInterval": interval.max_secs(),
                "nextFireAtMs": next_fire_at_ms,
            }),
        ),
        RefreshEvent::Stopped { tab_id } => {
            ("refresh.stopped", serde_json::json!({"tabId": tab_id}))
        }
        RefreshEvent::Reloaded {
            tab_id,
            next_fire_at_ms,
        } => (
            "refresh.reloaded",
            serde_json::json!({"tabId": tab_id, "nextFireAtMs": next_fire_at_ms}),
        ),
        RefreshEvent::Deleted { tab_id, reason } => (
            "refresh.deleted",
            serde_json::json!({"tabId": tab_id, "reason": reason.as_str()}),
        ),
        RefreshEvent::Reopened {
            old_tab_id,
            new_tab_id,
            url,
        } => (
            "refresh.reopened",
            serde_json::json!({"oldTabId": old_tab_id, "newTabId": new_tab_id, "url": url}),
        ),
        RefreshEvent::ReopenFailed { tab_id, url, error } => (
            "refresh.reopen_failed",
            serde_json::json!({"tabId": tab_id, "url": url, "error": error}),
        ),
        RefreshEvent::ReopenSettingChanged { reopen } => (
            "settings.reopen_changed",
            serde_json::json!({"reopenSetting": reopen}),
        ),
    };
    EventEnvelope::fresh(name, payload)
}

fn spawn_event_forwarder(
    mut service_rx: broadcast::Receiver<RefreshEvent>,
    event_tx: broadcast::Sender<EventEnvelope>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match service_rx.recv().await {
                Ok(event) => {
                    let _ = event_tx.send(refresh_event_envelope(&event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "refresh event forwarder lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn parse_tab_id(payload: &serde_json::Value, command: CommandName) -> Result<TabId> {
    parse_u64_field(payload, "tabId", command).map(TabId)
}

/// Accepts a non-negative integer or a numeric string.
fn parse_u64_field(payload: &serde_json::Value, field: &str, command: CommandName) -> Result<u64> {
    let value = payload.get(field).ok_or_else(|| {
        RefreshError::Contract(format!("{} requires payload.{field}", command.as_str()))
    })?;
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        RefreshError::Contract(format!(
            "{} payload.{field} must be a non-negative integer, got {value}",
            command.as_str()
        ))
    })
}

fn parse_optional_string(payload: &serde_json::Value, field: &str) -> String {
    payload
        .get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_owned()
}

fn parse_tab_change(payload: &serde_json::Value) -> Result<TabChange> {
    let status = match payload.get("status") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(raw)) => match raw.as_str() {
            "loading" => Some(LoadStatus::Loading),
            "complete" => Some(LoadStatus::Complete),
            other => {
                return Err(RefreshError::Contract(format!(
                    "TAB_UPDATED payload.status `{other}` is not loading/complete"
                )));
            }
        },
        Some(other) => {
            return Err(RefreshError::Contract(format!(
                "TAB_UPDATED payload.status must be a string, got {other}"
            )));
        }
    };
    Ok(TabChange {
        title: payload
            .get("title")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned),
        url: payload
            .get("url")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned),
        status,
    })
}
