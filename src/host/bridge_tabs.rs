//! [`TabDirectory`] served by the host over the command channel.
//!
//! Each call is published as a `tab.call` event carrying a fresh `callId`;
//! the host performs it and answers with a `TAB_CALL_RESULT` command, which
//! the router hands to [`HostTabDirectory::resolve`].

use crate::error::{RefreshError, Result};
use crate::host::contract::EventEnvelope;
use crate::scheduler::tasks::TabId;
use crate::tabs::{TabDirectory, TabInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Event name of an outgoing tab call.
pub const TAB_CALL_EVENT: &str = "tab.call";

/// How long a call waits for `TAB_CALL_RESULT` unless configured otherwise.
pub const DEFAULT_TAB_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Host's answer to one tab call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabCallReply {
    pub call_id: String,
    pub ok: bool,
    #[serde(default)]
    pub tab: Option<TabInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TabMethod {
    Get,
    Reload,
    Create,
}

impl TabMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Reload => "reload",
            Self::Create => "create",
        }
    }
}

/// Tab directory whose calls round-trip through the host.
pub struct HostTabDirectory {
    event_tx: broadcast::Sender<EventEnvelope>,
    pending: Mutex<HashMap<String, oneshot::Sender<TabCallReply>>>,
    reply_timeout: Duration,
}

impl HostTabDirectory {
    #[must_use]
    pub fn new(event_tx: broadcast::Sender<EventEnvelope>) -> Self {
        Self::with_timeout(event_tx, DEFAULT_TAB_CALL_TIMEOUT)
    }

    /// A call that gets no reply within `reply_timeout` fails as a tab error,
    /// so the task sees the tab as gone instead of stalling.
    #[must_use]
    pub fn with_timeout(
        event_tx: broadcast::Sender<EventEnvelope>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            event_tx,
            pending: Mutex::new(HashMap::new()),
            reply_timeout,
        }
    }

    /// Complete a pending call. Returns `false` for unknown or stale ids.
    pub fn resolve(&self, reply: TabCallReply) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&reply.call_id);
        match waiter {
            Some(tx) => {
                let call_id = reply.call_id.clone();
                if tx.send(reply).is_err() {
                    debug!(call_id = %call_id, "tab call caller went away before the reply");
                }
                true
            }
            None => {
                warn!(call_id = %reply.call_id, "tab call result for unknown call id");
                false
            }
        }
    }

    /// Number of calls awaiting a host reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn call(&self, method: TabMethod, mut args: serde_json::Value) -> Result<TabCallReply> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(call_id.clone(), tx);

        if let Some(obj) = args.as_object_mut() {
            obj.insert("callId".to_owned(), serde_json::Value::from(call_id.clone()));
            obj.insert("method".to_owned(), serde_json::Value::from(method.as_str()));
        }
        let envelope = EventEnvelope::fresh(TAB_CALL_EVENT, args);
        if self.event_tx.send(envelope).is_err() {
            self.forget(&call_id);
            return Err(RefreshError::Channel(format!(
                "no host listening for tab.{}",
                method.as_str()
            )));
        }

        let reply = match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(RefreshError::Channel(format!(
                    "tab.{} call {call_id} abandoned",
                    method.as_str()
                )));
            }
            Err(_) => {
                self.forget(&call_id);
                warn!(
                    call_id = %call_id,
                    method = method.as_str(),
                    timeout_ms = self.reply_timeout.as_millis() as u64,
                    "tab call timed out waiting for the host"
                );
                return Err(RefreshError::Tab(format!(
                    "tab.{} call {call_id} timed out",
                    method.as_str()
                )));
            }
        };
        if reply.ok {
            Ok(reply)
        } else {
            Err(RefreshError::Tab(
                reply
                    .error
                    .unwrap_or_else(|| format!("tab.{} failed", method.as_str())),
            ))
        }
    }

    fn forget(&self, call_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(call_id);
    }
}

fn expect_tab(method: TabMethod, reply: TabCallReply) -> Result<TabInfo> {
    reply.tab.ok_or_else(|| {
        RefreshError::Tab(format!("tab.{} reply carried no tab", method.as_str()))
    })
}

#[async_trait]
impl TabDirectory for HostTabDirectory {
    async fn get(&self, tab_id: TabId) -> Result<TabInfo> {
        let reply = self
            .call(TabMethod::Get, serde_json::json!({ "tabId": tab_id }))
            .await?;
        expect_tab(TabMethod::Get, reply)
    }

    async fn reload(&self, tab_id: TabId) -> Result<()> {
        self.call(TabMethod::Reload, serde_json::json!({ "tabId": tab_id }))
            .await
            .map(|_| ())
    }

    async fn create(&self, url: &str, active: bool) -> Result<TabInfo> {
        let reply = self
            .call(
                TabMethod::Create,
                serde_json::json!({ "url": url, "active": active }),
            )
            .await?;
        expect_tab(TabMethod::Create, reply)
    }
}
