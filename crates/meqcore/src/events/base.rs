use crate::{BreakpointMask, ControlStatus, NodeIndex, RequestId, ResultRef, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Events posted by a forest and its nodes to the control layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ForestEvent {
    Message {
        session: SessionId,
        level: MessageLevel,
        node: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Event {
        session: SessionId,
        node: Option<String>,
        kind: String,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
    NodeResult {
        session: SessionId,
        node: String,
        request_id: RequestId,
        result: ResultRef,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        session: SessionId,
        node: String,
        index: NodeIndex,
        old: ControlStatus,
        new: ControlStatus,
        timestamp: DateTime<Utc>,
    },
    BreakpointHit {
        session: SessionId,
        node: String,
        index: NodeIndex,
        mask: BreakpointMask,
        global: bool,
        timestamp: DateTime<Utc>,
    },
}

impl ForestEvent {
    pub fn node(&self) -> Option<&str> {
        match self {
            ForestEvent::Message { node, .. } | ForestEvent::Event { node, .. } => node.as_deref(),
            ForestEvent::NodeResult { node, .. }
            | ForestEvent::StatusChanged { node, .. }
            | ForestEvent::BreakpointHit { node, .. } => Some(node),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ForestEvent::Message {
                level: MessageLevel::Error,
                ..
            }
        )
    }
}

/// Event emitter bound to one node, for kernels to send messages
#[derive(Clone)]
pub struct EventEmitter {
    session: SessionId,
    node: String,
    sender: broadcast::Sender<ForestEvent>,
}

impl EventEmitter {
    pub fn new(session: SessionId, node: impl Into<String>, sender: broadcast::Sender<ForestEvent>) -> Self {
        Self {
            session,
            node: node.into(),
            sender,
        }
    }

    fn message(&self, level: MessageLevel, message: String) {
        let _ = self.sender.send(ForestEvent::Message {
            session: self.session,
            level,
            node: Some(self.node.clone()),
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.message(MessageLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.message(MessageLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.message(MessageLevel::Error, message.into());
    }

    pub fn event(&self, kind: impl Into<String>, payload: Value) {
        let _ = self.sender.send(ForestEvent::Event {
            session: self.session,
            node: Some(self.node.clone()),
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        });
    }
}

/// Forest-wide event bus
pub struct EventBus {
    session: SessionId,
    sender: broadcast::Sender<ForestEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            session: Uuid::new_v4(),
            sender,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForestEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ForestEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, node: impl Into<String>) -> EventEmitter {
        EventEmitter::new(self.session, node, self.sender.clone())
    }
}
