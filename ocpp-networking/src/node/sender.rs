//! Outbound sender
//!
//! Fire-and-report: every send attempt yields a `SentMessageResult`, whatever
//! happened on the wire. Nothing here retries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::ocpp::OcppMessage;
use crate::transport::{Connection, ConnectionInfo};

/// Delivery outcome of one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Success,
    TransmissionFailed(String),
    Cancelled,
}

impl SendResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SendResult::Success)
    }
}

impl std::fmt::Display for SendResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendResult::Success => write!(f, "delivered"),
            SendResult::TransmissionFailed(reason) => write!(f, "transmission failed: {}", reason),
            SendResult::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentMessageResult {
    pub connection: ConnectionInfo,
    pub result: SendResult,
    pub timestamp: DateTime<Utc>,
}

/// Serialize and push a frame onto `connection`
pub async fn send_message(
    connection: &Arc<dyn Connection>,
    message: &OcppMessage,
    cancel: &CancellationToken,
) -> SentMessageResult {
    let info = connection.info().clone();

    let result = match message.to_text() {
        Err(e) => {
            error!("Failed to serialize message {}: {}", message.message_id(), e);
            SendResult::TransmissionFailed(e.to_string())
        }
        Ok(text) => {
            debug!("Sending to {}: {}", info.remote_node, text);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => SendResult::Cancelled,
                sent = connection.send_text(text) => match sent {
                    Ok(()) => SendResult::Success,
                    Err(e) => {
                        error!("Failed to send to {}: {}", info.remote_node, e);
                        SendResult::TransmissionFailed(e.to_string())
                    }
                },
            }
        }
    };

    SentMessageResult {
        connection: info,
        result,
        timestamp: Utc::now(),
    }
}
