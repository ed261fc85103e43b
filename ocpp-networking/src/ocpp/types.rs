//! OCPP 2.0.1/2.1 message types
//!
//! Data types and payloads for the representative actions routed by the
//! networking node:
//! - BootNotification / Heartbeat / StatusNotification
//! - Reset
//! - RequestStartTransaction / RequestStopTransaction
//! - DataTransfer
//! - GetCompositeSchedule
//!
//! `signatures` and `customData` are lifted onto the request/response envelope
//! and therefore do not appear in the payload structs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::custom::{put_nested, put_nested_list, put_nested_opt, CustomSerializers, ToJson};

// ============================================================================
// Enumerations
// ============================================================================

/// Connector status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

/// Charging rate unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingRateUnit {
    W,
    A,
}

/// Generic OCPP status for responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum GenericStatus {
    Accepted,
    Rejected,
}

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Boot reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

/// Reset type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    Immediate,
    OnIdle,
    /// OCPP 2.1
    ImmediateAndResume,
}

/// Reset status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetStatus {
    Accepted,
    Rejected,
    Scheduled,
}

/// Status of RequestStartTransaction / RequestStopTransaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStartStopStatus {
    Accepted,
    Rejected,
}

/// DataTransfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

// ============================================================================
// Complex Types
// ============================================================================

/// Vendor specific extension data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomData {
    pub vendor_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CustomData {
    pub fn new(vendor_id: impl Into<String>) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            extra: Map::new(),
        }
    }
}

impl ToJson for CustomData {}

/// Cryptographic signature attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub key_id: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Signature {
    pub fn new(key_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            value: value.into(),
            signing_method: None,
            encoding_method: None,
            name: None,
            description: None,
            timestamp: None,
        }
    }
}

impl ToJson for Signature {}

/// Status info for responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

impl StatusInfo {
    pub fn new(reason_code: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            additional_info: None,
        }
    }
}

impl ToJson for StatusInfo {}

/// Additional identification attached to an IdToken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalInfo {
    pub additional_id_token: String,
    #[serde(rename = "type")]
    pub info_type: String,
}

impl ToJson for AdditionalInfo {}

/// Token for identification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdToken {
    pub id_token: String,
    #[serde(rename = "type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_info: Vec<AdditionalInfo>,
}

impl IdToken {
    pub fn new(id_token: impl Into<String>, token_type: impl Into<String>) -> Self {
        Self {
            id_token: id_token.into(),
            token_type: token_type.into(),
            additional_info: Vec::new(),
        }
    }
}

impl ToJson for IdToken {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        if !self.additional_info.is_empty() {
            put_nested_list(&mut json, "additionalInfo", &self.additional_info, custom);
        }
        custom.apply(self, json)
    }
}

/// Charging station description for BootNotification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStation {
    pub model: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

impl ToJson for ChargingStation {}

/// Charging schedule period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    pub start_period: i32,
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_to_use: Option<i32>,
}

impl ToJson for ChargingSchedulePeriod {}

/// Composite schedule calculated by a charging station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSchedule {
    pub evse_id: i32,
    pub duration: i32,
    pub schedule_start: DateTime<Utc>,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
}

impl ToJson for CompositeSchedule {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        put_nested_list(
            &mut json,
            "chargingSchedulePeriod",
            &self.charging_schedule_period,
            custom,
        );
        custom.apply(self, json)
    }
}

// ============================================================================
// Request Messages
// ============================================================================

/// BootNotification request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charging_station: ChargingStation,
    pub reason: BootReason,
}

impl ToJson for BootNotificationRequest {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        put_nested(&mut json, "chargingStation", &self.charging_station, custom);
        custom.apply(self, json)
    }
}

/// Heartbeat request (CS -> CSMS)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

impl ToJson for HeartbeatRequest {}

/// StatusNotification request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub timestamp: DateTime<Utc>,
    pub connector_status: ConnectorStatus,
    pub evse_id: i32,
    pub connector_id: i32,
}

impl ToJson for StatusNotificationRequest {}

/// Reset request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub reset_type: ResetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<i32>,
}

impl ToJson for ResetRequest {}

/// RequestStartTransaction request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStartTransactionRequest {
    pub id_token: IdToken,
    pub remote_start_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id_token: Option<IdToken>,
}

impl ToJson for RequestStartTransactionRequest {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        put_nested(&mut json, "idToken", &self.id_token, custom);
        put_nested_opt(&mut json, "groupIdToken", self.group_id_token.as_ref(), custom);
        custom.apply(self, json)
    }
}

/// RequestStopTransaction request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStopTransactionRequest {
    pub transaction_id: String,
}

impl ToJson for RequestStopTransactionRequest {}

/// DataTransfer request (bidirectional)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToJson for DataTransferRequest {}

/// GetCompositeSchedule request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCompositeScheduleRequest {
    pub duration: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_rate_unit: Option<ChargingRateUnit>,
    pub evse_id: i32,
}

impl ToJson for GetCompositeScheduleRequest {}

// ============================================================================
// Response Messages
// ============================================================================

/// BootNotification response (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl ToJson for BootNotificationResponse {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        put_nested_opt(&mut json, "statusInfo", self.status_info.as_ref(), custom);
        custom.apply(self, json)
    }
}

/// Heartbeat response (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

impl ToJson for HeartbeatResponse {}

/// StatusNotification response (CSMS -> CS)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

impl ToJson for StatusNotificationResponse {}

/// Reset response (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub status: ResetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl ToJson for ResetResponse {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        put_nested_opt(&mut json, "statusInfo", self.status_info.as_ref(), custom);
        custom.apply(self, json)
    }
}

/// RequestStartTransaction response (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStartTransactionResponse {
    pub status: RequestStartStopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl ToJson for RequestStartTransactionResponse {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        put_nested_opt(&mut json, "statusInfo", self.status_info.as_ref(), custom);
        custom.apply(self, json)
    }
}

/// RequestStopTransaction response (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStopTransactionResponse {
    pub status: RequestStartStopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl ToJson for RequestStopTransactionResponse {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        put_nested_opt(&mut json, "statusInfo", self.status_info.as_ref(), custom);
        custom.apply(self, json)
    }
}

/// DataTransfer response (bidirectional)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl ToJson for DataTransferResponse {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        put_nested_opt(&mut json, "statusInfo", self.status_info.as_ref(), custom);
        custom.apply(self, json)
    }
}

/// GetCompositeSchedule response (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCompositeScheduleResponse {
    pub status: GenericStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<CompositeSchedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl ToJson for GetCompositeScheduleResponse {
    fn to_json(&self, custom: &CustomSerializers) -> Value {
        let mut json = serde_json::to_value(self).unwrap_or_default();
        put_nested_opt(&mut json, "schedule", self.schedule.as_ref(), custom);
        put_nested_opt(&mut json, "statusInfo", self.status_info.as_ref(), custom);
        custom.apply(self, json)
    }
}
