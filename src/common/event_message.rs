//! Messages carried between clients and the authority.
//!
//! Every frame is a JSON object `{ "event": "<name>", "payload": { ... } }`.
//! [`ClientEvent`] covers what a client may send, [`ServerEvent`] what the
//! authority sends back or broadcasts.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{
    box_error::BoxError,
    timing::{Meter, TimingState},
};

/// Identifies one live transport connection.  Not a stable user identity.
pub type ConnectionId = u64;

/// A participant of a session, as shown to every member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub connection_id: ConnectionId,
    pub name: String,
    pub is_host: bool,
    pub joined_at: i64,
}

/// Full view of a session handed to a connection when it creates or joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub code: String,
    pub id: String,
    pub is_host: bool,
    pub members: Vec<Member>,
    pub timing: TimingState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    CreateSession {
        name: String,
    },
    JoinSession {
        code: String,
        name: String,
    },
    LeaveSession,
    StartTiming,
    StopTiming,
    SetTempo {
        bpm: i64,
    },
    SetMeter {
        meter: String,
    },
    #[serde(rename_all = "camelCase")]
    SyncRequest {
        client_time: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    SessionCreated(SessionSnapshot),
    SessionJoined(SessionSnapshot),
    MemberJoined {
        member: Member,
    },
    SessionLeft {},
    #[serde(rename_all = "camelCase")]
    MemberLeft {
        connection_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    TimingStarted {
        epoch_start: i64,
        bpm: u32,
        meter: Meter,
    },
    TimingStopped {},
    TimingUpdated(TimingState),
    #[serde(rename_all = "camelCase")]
    SyncResponse {
        client_time: i64,
        authority_time: i64,
    },
    SessionError {
        message: String,
    },
}

impl ClientEvent {
    pub fn from_string(data: &str) -> Result<ClientEvent, BoxError> {
        Ok(serde_json::from_str(data)?)
    }
    pub fn as_json(&self) -> serde_json::Value {
        // a derived Serialize with string keys cannot fail
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::CreateSession { .. } => "create-session",
            ClientEvent::JoinSession { .. } => "join-session",
            ClientEvent::LeaveSession => "leave-session",
            ClientEvent::StartTiming => "start-timing",
            ClientEvent::StopTiming => "stop-timing",
            ClientEvent::SetTempo { .. } => "set-tempo",
            ClientEvent::SetMeter { .. } => "set-meter",
            ClientEvent::SyncRequest { .. } => "sync-request",
        }
    }
}

impl ServerEvent {
    pub fn from_string(data: &str) -> Result<ServerEvent, BoxError> {
        Ok(serde_json::from_str(data)?)
    }
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SessionCreated(_) => "session-created",
            ServerEvent::SessionJoined(_) => "session-joined",
            ServerEvent::MemberJoined { .. } => "member-joined",
            ServerEvent::SessionLeft {} => "session-left",
            ServerEvent::MemberLeft { .. } => "member-left",
            ServerEvent::TimingStarted { .. } => "timing-started",
            ServerEvent::TimingStopped {} => "timing-stopped",
            ServerEvent::TimingUpdated(_) => "timing-updated",
            ServerEvent::SyncResponse { .. } => "sync-response",
            ServerEvent::SessionError { .. } => "session-error",
        }
    }
    pub fn error(message: impl fmt::Display) -> ServerEvent {
        ServerEvent::SessionError {
            message: message.to_string(),
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_json())
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_json())
    }
}
