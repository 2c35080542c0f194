//! Outgoing message pipeline: optimistic insert, durable write, reconciliation.

mod pipeline;
mod queue;

pub use pipeline::{Draft, SendPipeline};
pub use queue::{ParkedSend, RetryQueue};

use crate::gateway::GatewayError;
use chrono::{DateTime, Utc};
use mercato_messaging::{DeliveryStatus, LocalEchoId, MessageId};

/// Errors that can occur in the send pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid message: {0}")]
    Validation(String),
    #[error("delivery of {local_echo_id} failed: {source}")]
    Delivery {
        local_echo_id: LocalEchoId,
        #[source]
        source: GatewayError,
    },
    #[error("no failed message with echo id {0}")]
    UnknownMessage(LocalEchoId),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Status change of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub local_echo_id: LocalEchoId,
    pub status: DeliveryStatus,
    pub message_id: Option<MessageId>,
    pub at: DateTime<Utc>,
}

impl DeliveryUpdate {
    pub fn new(local_echo_id: LocalEchoId, status: DeliveryStatus, message_id: Option<MessageId>) -> Self {
        Self {
            local_echo_id,
            status,
            message_id,
            at: Utc::now(),
        }
    }
}
