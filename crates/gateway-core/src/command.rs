//! Commands routed through the dispatcher.
//!
//! A command is a plain value; the optional sending-handler back-reference
//! keeps a component that both dispatches and handles commands from feeding
//! itself.

use crate::dispatch::CommandHandler;
use gw_protocol::{DeviceID, DevicePrefix, ModuleID};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Command kinds
// ---------------------------------------------------------------------------

/// Description of a newly discovered device to announce to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeviceDescription {
    pub device_id: DeviceID,
    pub product_name: String,
    pub vendor: String,
    pub refresh_time: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// Announce a freshly discovered device.
    NewDevice(NewDeviceDescription),
    /// Ask the server for the paired devices of a technology.
    ServerDeviceList { prefix: DevicePrefix },
    /// Ask the server for the most recent value of a module.
    ServerLastValue {
        device_id: DeviceID,
        module_id: ModuleID,
    },
    /// Accept a pairing the server approved.
    DeviceAccept { device_id: DeviceID },
    /// Remove a device from the gateway.
    DeviceUnpair { device_id: DeviceID },
    /// Apply a value to an actuator module.
    DeviceSetValue {
        device_id: DeviceID,
        module_id: ModuleID,
        value: f64,
        timeout: Duration,
    },
    /// Open a discovery window for new devices.
    GatewayListen { duration: Duration },
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

pub struct Command {
    kind: CommandKind,
    sending_handler: Option<Weak<dyn CommandHandler>>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Command {
        Command {
            kind,
            sending_handler: None,
        }
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// The handler that initiated this command, when the sender is also a
    /// handler; the dispatcher skips it to avoid self-feedback.
    pub fn sending_handler(&self) -> Option<Arc<dyn CommandHandler>> {
        self.sending_handler.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_sending_handler(&mut self, handler: Weak<dyn CommandHandler>) {
        self.sending_handler = Some(handler);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("kind", &self.kind).finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CommandKind::NewDevice(desc) => write!(f, "new-device {}", desc.device_id),
            CommandKind::ServerDeviceList { prefix } => {
                write!(f, "server-device-list {prefix}")
            }
            CommandKind::ServerLastValue {
                device_id,
                module_id,
            } => write!(f, "server-last-value {device_id}:{module_id}"),
            CommandKind::DeviceAccept { device_id } => write!(f, "device-accept {device_id}"),
            CommandKind::DeviceUnpair { device_id } => write!(f, "device-unpair {device_id}"),
            CommandKind::DeviceSetValue {
                device_id,
                module_id,
                value,
                ..
            } => write!(f, "device-set-value {device_id}:{module_id} = {value}"),
            CommandKind::GatewayListen { duration } => {
                write!(f, "gateway-listen {}s", duration.as_secs())
            }
        }
    }
}
