// gw-protocol: Gateway/server data model and message envelope.
//
// All messages exchanged with the remote server are JSON objects with a
// top-level `message_type` discriminator and a UUID `id` used to correlate
// request/response/ack/confirm pairs across the network.

pub mod data;
pub mod device;
pub mod message;

pub use data::{SensorData, SensorValue};
pub use device::{DeviceID, DevicePrefix, ModuleID};
pub use message::{GWMessage, MessageKind, ResponseStatus};
