//! OCPP actions
//!
//! An action binds a wire name to its request and response payload types.
//! The router instantiates one generic pipeline per registered action, so
//! adding an action means implementing `Action` and registering it.

use std::fmt::Debug;

use chrono::Utc;
use serde::de::DeserializeOwned;

use super::custom::ToJson;
use super::types::*;

/// Payload of a request
pub trait RequestPayload:
    ToJson + DeserializeOwned + Clone + Debug + PartialEq + Send + Sync
{
}

impl<T> RequestPayload for T where
    T: ToJson + DeserializeOwned + Clone + Debug + PartialEq + Send + Sync
{
}

/// Payload of a response
pub trait ResponsePayload:
    ToJson + DeserializeOwned + Clone + Debug + PartialEq + Send + Sync
{
    /// Structurally valid payload put on the wire when no handler produced one
    fn fallback() -> Self;
}

/// A named OCPP request/response pair
pub trait Action: Debug + Clone + Copy + PartialEq + Send + Sync + 'static {
    /// Wire name, e.g. `"BootNotification"`
    const NAME: &'static str;

    type Request: RequestPayload;
    type Response: ResponsePayload;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootNotification;

impl Action for BootNotification {
    const NAME: &'static str = "BootNotification";
    type Request = BootNotificationRequest;
    type Response = BootNotificationResponse;
}

impl ResponsePayload for BootNotificationResponse {
    fn fallback() -> Self {
        Self {
            current_time: Utc::now(),
            interval: 0,
            status: RegistrationStatus::Rejected,
            status_info: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat;

impl Action for Heartbeat {
    const NAME: &'static str = "Heartbeat";
    type Request = HeartbeatRequest;
    type Response = HeartbeatResponse;
}

impl ResponsePayload for HeartbeatResponse {
    fn fallback() -> Self {
        Self {
            current_time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusNotification;

impl Action for StatusNotification {
    const NAME: &'static str = "StatusNotification";
    type Request = StatusNotificationRequest;
    type Response = StatusNotificationResponse;
}

impl ResponsePayload for StatusNotificationResponse {
    fn fallback() -> Self {
        Self {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reset;

impl Action for Reset {
    const NAME: &'static str = "Reset";
    type Request = ResetRequest;
    type Response = ResetResponse;
}

impl ResponsePayload for ResetResponse {
    fn fallback() -> Self {
        Self {
            status: ResetStatus::Rejected,
            status_info: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestStartTransaction;

impl Action for RequestStartTransaction {
    const NAME: &'static str = "RequestStartTransaction";
    type Request = RequestStartTransactionRequest;
    type Response = RequestStartTransactionResponse;
}

impl ResponsePayload for RequestStartTransactionResponse {
    fn fallback() -> Self {
        Self {
            status: RequestStartStopStatus::Rejected,
            transaction_id: None,
            status_info: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestStopTransaction;

impl Action for RequestStopTransaction {
    const NAME: &'static str = "RequestStopTransaction";
    type Request = RequestStopTransactionRequest;
    type Response = RequestStopTransactionResponse;
}

impl ResponsePayload for RequestStopTransactionResponse {
    fn fallback() -> Self {
        Self {
            status: RequestStartStopStatus::Rejected,
            status_info: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTransfer;

impl Action for DataTransfer {
    const NAME: &'static str = "DataTransfer";
    type Request = DataTransferRequest;
    type Response = DataTransferResponse;
}

impl ResponsePayload for DataTransferResponse {
    fn fallback() -> Self {
        Self {
            status: DataTransferStatus::Rejected,
            data: None,
            status_info: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetCompositeSchedule;

impl Action for GetCompositeSchedule {
    const NAME: &'static str = "GetCompositeSchedule";
    type Request = GetCompositeScheduleRequest;
    type Response = GetCompositeScheduleResponse;
}

impl ResponsePayload for GetCompositeScheduleResponse {
    fn fallback() -> Self {
        Self {
            status: GenericStatus::Rejected,
            schedule: None,
            status_info: None,
        }
    }
}
