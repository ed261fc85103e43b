//! OCPP 2.0.1 / 2.1 protocol layer
//!
//! Wire framing, routing primitives, typed payloads and the request/response
//! envelopes the networking node pipeline works with.

pub mod actions;
pub mod custom;
pub mod messages;
pub mod request;
pub mod response;
pub mod routing;
pub mod types;

pub use actions::{Action, RequestPayload, ResponsePayload};
pub use custom::{CustomParser, CustomParsers, CustomSerializer, CustomSerializers, ToJson};
pub use messages::{
    Call, CallError, CallResult, ErrorCode, FrameError, MessageType, NetworkingMode, OcppError,
    OcppMessage, Routing,
};
pub use request::{OcppRequest, RequestHeader};
pub use response::{
    runtime, OcppResponse, Origin, RequestErrorMessage, ResponseErrorMessage, ResponseHeader,
    ResponseResult,
};
pub use routing::{EventTrackingId, NetworkPath, NodeId, RequestId, SourceRouting};
