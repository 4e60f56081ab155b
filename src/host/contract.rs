//! Versioned command/response/event envelopes exchanged with the host shell.

use serde::{Deserialize, Serialize};

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Control-surface command set, addressed by its wire `command` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "START_REFRESH")]
    StartRefresh,
    #[serde(rename = "STOP_REFRESH")]
    StopRefresh,
    #[serde(rename = "GET_STATUS")]
    GetStatus,
    #[serde(rename = "GET_ALL_REFRESHERS")]
    GetAllRefreshers,
    #[serde(rename = "UPDATE_REOPEN_SETTING")]
    UpdateReopenSetting,
    #[serde(rename = "GET_REOPEN_SETTING")]
    GetReopenSetting,
    #[serde(rename = "GET_INTERVAL_PREFS")]
    GetIntervalPrefs,
    #[serde(rename = "TAB_UPDATED")]
    TabUpdated,
    #[serde(rename = "TAB_REMOVED")]
    TabRemoved,
    #[serde(rename = "TAB_CALL_RESULT")]
    TabCallResult,
    #[serde(rename = "HOST_PING")]
    HostPing,
    #[serde(rename = "HOST_VERSION")]
    HostVersion,
    #[serde(rename = "HOST_SHUTDOWN")]
    HostShutdown,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartRefresh => "START_REFRESH",
            Self::StopRefresh => "STOP_REFRESH",
            Self::GetStatus => "GET_STATUS",
            Self::GetAllRefreshers => "GET_ALL_REFRESHERS",
            Self::UpdateReopenSetting => "UPDATE_REOPEN_SETTING",
            Self::GetReopenSetting => "GET_REOPEN_SETTING",
            Self::GetIntervalPrefs => "GET_INTERVAL_PREFS",
            Self::TabUpdated => "TAB_UPDATED",
            Self::TabRemoved => "TAB_REMOVED",
            Self::TabCallResult => "TAB_CALL_RESULT",
            Self::HostPing => "HOST_PING",
            Self::HostVersion => "HOST_VERSION",
            Self::HostShutdown => "HOST_SHUTDOWN",
        }
    }

    /// Parse a command name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.as_str() == raw)
    }

    /// Every command the router accepts.
    pub const ALL: [Self; 13] = [
        Self::StartRefresh,
        Self::StopRefresh,
        Self::GetStatus,
        Self::GetAllRefreshers,
        Self::UpdateReopenSetting,
        Self::GetReopenSetting,
        Self::GetIntervalPrefs,
        Self::TabUpdated,
        Self::TabRemoved,
        Self::TabCallResult,
        Self::HostPing,
        Self::HostVersion,
        Self::HostShutdown,
    ];
}

/// Reply to one [`CommandEnvelope`], matched to it by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    /// Result body; `null` on failure.
    pub payload: serde_json::Value,
    /// Failure message; `None` on success.
    pub error: Option<String>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::from_outcome(request_id.into(), Ok(payload))
    }

    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_outcome(request_id.into(), Err(message.into()))
    }

    fn from_outcome(request_id: String, outcome: Result<serde_json::Value, String>) -> Self {
        let (payload, error) = match outcome {
            Ok(payload) => (payload, None),
            Err(message) => (serde_json::Value::Null, Some(message)),
        };
        Self {
            v: EVENT_VERSION,
            request_id,
            ok: error.is_none(),
            payload,
            error,
        }
    }
}

/// Host-to-scheduler request. A missing `payload` reads as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Reject envelopes from another contract version or without a request id.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::unsupported_version(self.v));
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::invalid("request_id cannot be empty"));
        }
        Ok(())
    }
}

/// Scheduler-to-host notification; `event` names the kind, e.g. `refresh.reloaded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: event_id.into(),
            event: event.into(),
            payload,
        }
    }

    /// Event with a freshly minted random id.
    #[must_use]
    pub fn fresh(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), event, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
}

/// Envelope rejected before routing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    fn unsupported_version(v: u32) -> Self {
        Self {
            kind: ContractErrorKind::UnsupportedVersion,
            message: format!("unsupported contract version {v}; expected {EVENT_VERSION}"),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            kind: ContractErrorKind::InvalidEnvelope,
            message: message.into(),
        }
    }
}
