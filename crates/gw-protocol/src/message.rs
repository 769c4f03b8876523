//! Message envelope for the gateway/server link.
//!
//! Serializes with a `message_type` tag:
//!
//! ```json
//! { "message_type": "device_accept_request", "id": "…", "device_id": "…" }
//! ```
//!
//! Three subfamilies exist: requests (expect a response), responses (carry a
//! status, some expect a confirming ack) and acks.  `sensor_data_export` and
//! `sensor_data_confirm` sit outside the request/response tree; the confirm
//! references the export by `id`.

use crate::data::SensorData;
use crate::device::{DeviceID, DevicePrefix, ModuleID};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Response status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Accepted,
    Success,
    Failed,
}

impl ResponseStatus {
    /// Final statuses terminate the request; ACCEPTED is provisional.
    pub fn is_final(self) -> bool {
        matches!(self, ResponseStatus::Success | ResponseStatus::Failed)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseStatus::Accepted => "ACCEPTED",
            ResponseStatus::Success => "SUCCESS",
            ResponseStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Message classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Ack,
    Other,
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAcceptRequest {
    pub id: Uuid,
    pub device_id: DeviceID,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListRequest {
    pub id: Uuid,
    pub device_prefix: DevicePrefix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastValueRequest {
    pub id: Uuid,
    pub device_id: DeviceID,
    pub module_id: ModuleID,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenRequest {
    pub id: Uuid,
    /// Discovery window in seconds.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeviceRequest {
    pub id: Uuid,
    pub device_id: DeviceID,
    pub product_name: String,
    pub vendor: String,
    /// Seconds between periodic reports; absent for event-driven devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetValueRequest {
    pub id: Uuid,
    pub device_id: DeviceID,
    pub module_id: ModuleID,
    pub value: f64,
    /// Seconds the gateway may spend applying the value.
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpairRequest {
    pub id: Uuid,
    pub device_id: DeviceID,
}

// ---------------------------------------------------------------------------
// Response / ack payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericResponse {
    pub id: Uuid,
    pub status: ResponseStatus,
}

/// A response the server must confirm with a `generic_ack` of equal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseWithAck {
    pub id: Uuid,
    pub status: ResponseStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub id: Uuid,
    pub status: ResponseStatus,
    #[serde(default)]
    pub devices: Vec<DeviceID>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastValueResponse {
    pub id: Uuid,
    pub status: ResponseStatus,
    /// Absent when the server has no valid value for the module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpairResponse {
    pub id: Uuid,
    pub status: ResponseStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericAck {
    pub id: Uuid,
    pub status: ResponseStatus,
}

// ---------------------------------------------------------------------------
// Export payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDataExport {
    pub id: Uuid,
    pub data: Vec<SensorData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDataConfirm {
    pub id: Uuid,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
#[serde(rename_all = "snake_case")]
pub enum GWMessage {
    DeviceAcceptRequest(DeviceAcceptRequest),
    DeviceListRequest(DeviceListRequest),
    LastValueRequest(LastValueRequest),
    ListenRequest(ListenRequest),
    NewDeviceRequest(NewDeviceRequest),
    SetValueRequest(SetValueRequest),
    UnpairRequest(UnpairRequest),
    GenericResponse(GenericResponse),
    ResponseWithAck(ResponseWithAck),
    DeviceListResponse(DeviceListResponse),
    LastValueResponse(LastValueResponse),
    UnpairResponse(UnpairResponse),
    GenericAck(GenericAck),
    SensorDataExport(SensorDataExport),
    SensorDataConfirm(SensorDataConfirm),
}

impl GWMessage {
    /// Correlation ID of this message instance.
    pub fn id(&self) -> Uuid {
        match self {
            GWMessage::DeviceAcceptRequest(m) => m.id,
            GWMessage::DeviceListRequest(m) => m.id,
            GWMessage::LastValueRequest(m) => m.id,
            GWMessage::ListenRequest(m) => m.id,
            GWMessage::NewDeviceRequest(m) => m.id,
            GWMessage::SetValueRequest(m) => m.id,
            GWMessage::UnpairRequest(m) => m.id,
            GWMessage::GenericResponse(m) => m.id,
            GWMessage::ResponseWithAck(m) => m.id,
            GWMessage::DeviceListResponse(m) => m.id,
            GWMessage::LastValueResponse(m) => m.id,
            GWMessage::UnpairResponse(m) => m.id,
            GWMessage::GenericAck(m) => m.id,
            GWMessage::SensorDataExport(m) => m.id,
            GWMessage::SensorDataConfirm(m) => m.id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            GWMessage::DeviceAcceptRequest(_)
            | GWMessage::DeviceListRequest(_)
            | GWMessage::LastValueRequest(_)
            | GWMessage::ListenRequest(_)
            | GWMessage::NewDeviceRequest(_)
            | GWMessage::SetValueRequest(_)
            | GWMessage::UnpairRequest(_) => MessageKind::Request,
            GWMessage::GenericResponse(_)
            | GWMessage::ResponseWithAck(_)
            | GWMessage::DeviceListResponse(_)
            | GWMessage::LastValueResponse(_)
            | GWMessage::UnpairResponse(_) => MessageKind::Response,
            GWMessage::GenericAck(_) => MessageKind::Ack,
            GWMessage::SensorDataExport(_) | GWMessage::SensorDataConfirm(_) => MessageKind::Other,
        }
    }

    /// Status carried by responses and acks.
    pub fn status(&self) -> Option<ResponseStatus> {
        match self {
            GWMessage::GenericResponse(m) => Some(m.status),
            GWMessage::ResponseWithAck(m) => Some(m.status),
            GWMessage::DeviceListResponse(m) => Some(m.status),
            GWMessage::LastValueResponse(m) => Some(m.status),
            GWMessage::UnpairResponse(m) => Some(m.status),
            GWMessage::GenericAck(m) => Some(m.status),
            _ => None,
        }
    }

    /// True for responses that must be confirmed by a `generic_ack`.
    pub fn ack_expected(&self) -> bool {
        matches!(
            self,
            GWMessage::ResponseWithAck(_) | GWMessage::UnpairResponse(_)
        )
    }

    /// Build the confirming ack for a response, keeping id and status.
    pub fn to_ack(&self) -> Option<GWMessage> {
        match self.kind() {
            MessageKind::Response => Some(GWMessage::GenericAck(GenericAck {
                id: self.id(),
                status: self.status()?,
            })),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            GWMessage::DeviceAcceptRequest(_) => "device_accept_request",
            GWMessage::DeviceListRequest(_) => "device_list_request",
            GWMessage::LastValueRequest(_) => "last_value_request",
            GWMessage::ListenRequest(_) => "listen_request",
            GWMessage::NewDeviceRequest(_) => "new_device_request",
            GWMessage::SetValueRequest(_) => "set_value_request",
            GWMessage::UnpairRequest(_) => "unpair_request",
            GWMessage::GenericResponse(_) => "generic_response",
            GWMessage::ResponseWithAck(_) => "response_with_ack",
            GWMessage::DeviceListResponse(_) => "device_list_response",
            GWMessage::LastValueResponse(_) => "last_value_response",
            GWMessage::UnpairResponse(_) => "unpair_response",
            GWMessage::GenericAck(_) => "generic_ack",
            GWMessage::SensorDataExport(_) => "sensor_data_export",
            GWMessage::SensorDataConfirm(_) => "sensor_data_confirm",
        }
    }

    /// Short `type@id` form for log lines.
    pub fn brief(&self) -> String {
        format!("{}@{}", self.type_name(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_message_type_tag() {
        let msg = GWMessage::UnpairRequest(UnpairRequest {
            id: Uuid::nil(),
            device_id: DeviceID::from_raw(0xa600_0000_0000_0001),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.starts_with("{\"message_type\":\"unpair_request\""));
        let back: GWMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn classification_matches_subfamilies() {
        let req = GWMessage::ListenRequest(ListenRequest {
            id: Uuid::nil(),
            duration: 60,
        });
        assert_eq!(req.kind(), MessageKind::Request);
        assert!(req.status().is_none());

        let resp = GWMessage::ResponseWithAck(ResponseWithAck {
            id: Uuid::nil(),
            status: ResponseStatus::Accepted,
        });
        assert_eq!(resp.kind(), MessageKind::Response);
        assert!(resp.ack_expected());

        let confirm = GWMessage::SensorDataConfirm(SensorDataConfirm { id: Uuid::nil() });
        assert_eq!(confirm.kind(), MessageKind::Other);
    }

    #[test]
    fn ack_for_response_copies_id_and_status() {
        let resp = GWMessage::ResponseWithAck(ResponseWithAck {
            id: Uuid::from_u128(7),
            status: ResponseStatus::Success,
        });
        let ack = resp.to_ack().unwrap();
        assert_eq!(ack.id(), Uuid::from_u128(7));
        assert_eq!(ack.status(), Some(ResponseStatus::Success));
        assert_eq!(ack.kind(), MessageKind::Ack);
    }

    #[test]
    fn requests_have_no_ack() {
        let req = GWMessage::DeviceAcceptRequest(DeviceAcceptRequest {
            id: Uuid::nil(),
            device_id: DeviceID::from_raw(1),
        });
        assert!(req.to_ack().is_none());
    }
}
