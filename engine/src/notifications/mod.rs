//! Unread counters and notification read state.
//!
//! Counters are only ever replaced wholesale with a server count or mutated by
//! a local read transition; pushed events never do counter arithmetic. Every
//! write to a counter takes a ticket, and a server response is applied only if
//! no newer write landed while it was in flight.

mod center;
mod poller;

pub use center::{CounterSnapshot, NotificationCenter, DEFAULT_POLL_INTERVAL};

use crate::gateway::GatewayError;
use crate::transport::TransportError;
use mercato_messaging::NotificationId;

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("unknown notification {0}")]
    UnknownNotification(NotificationId),
}

pub type NotificationResult<T> = Result<T, NotificationError>;
