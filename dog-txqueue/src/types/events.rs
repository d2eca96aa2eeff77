use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, QueueId};

/// Minimal stable event protocol for structured observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageEvent {
    Sent {
        queue_id: QueueId,
        message_id: MessageId,
        queue: String,
        at: DateTime<Utc>,
    },

    Claimed {
        queue_id: QueueId,
        message_id: MessageId,
        at: DateTime<Utc>,
    },

    Committed {
        queue_id: QueueId,
        at: DateTime<Utc>,
    },

    RolledBack {
        queue_id: QueueId,
        visible_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },

    /// Moved to the error table
    Poisoned {
        queue_id: QueueId,
        exception_type: String,
        at: DateTime<Utc>,
    },

    /// Deleted by the expiration sweeper before anyone claimed it
    Expired {
        queue_id: QueueId,
        at: DateTime<Utc>,
    },

    /// Released by the heartbeat monitor after its worker went quiet
    HeartbeatReset {
        queue_id: QueueId,
        at: DateTime<Utc>,
    },
}

impl MessageEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Claimed { .. } => "claimed",
            Self::Committed { .. } => "committed",
            Self::RolledBack { .. } => "rolled_back",
            Self::Poisoned { .. } => "poisoned",
            Self::Expired { .. } => "expired",
            Self::HeartbeatReset { .. } => "heartbeat_reset",
        }
    }

    pub fn queue_id(&self) -> QueueId {
        match self {
            Self::Sent { queue_id, .. }
            | Self::Claimed { queue_id, .. }
            | Self::Committed { queue_id, .. }
            | Self::RolledBack { queue_id, .. }
            | Self::Poisoned { queue_id, .. }
            | Self::Expired { queue_id, .. }
            | Self::HeartbeatReset { queue_id, .. } => *queue_id,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Sent { at, .. }
            | Self::Claimed { at, .. }
            | Self::Committed { at, .. }
            | Self::RolledBack { at, .. }
            | Self::Poisoned { at, .. }
            | Self::Expired { at, .. }
            | Self::HeartbeatReset { at, .. } => at,
        }
    }
}
