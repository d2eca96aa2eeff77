pub mod ids;
pub mod ctx;
pub mod headers;
pub mod message;
pub mod record;
pub mod priority;
pub mod options;
pub mod events;

pub use ids::{CorrelationId, LeaseToken, MessageId, QueueId};
pub use ctx::MessageContext;
pub use headers::{HeaderKey, Headers};
pub use message::{ColumnValue, OutboundMessage, ReceiveRequest, ReceivedMessage, SendOptions, SendResult};
pub use record::{
    ErrorRecord, FailureDetails, MessageRecord, MessageState, MessageStatus, QueueCreationResult,
    QueueCreationStatus, QueueRemoveResult, QueueRemoveStatus, ResetOutcome,
};
pub use priority::Priority;
pub use options::{
    ColumnDefinition, ColumnType, ConfigurationValidation, ConstraintDefinition, ConstraintKind,
    HeartbeatOptions, TransportOptions,
};
pub use events::MessageEvent;
