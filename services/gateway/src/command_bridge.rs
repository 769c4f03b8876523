//! Glue between the command fabric and the server link.
//!
//! Two directions:
//! - [`GwsCommandHandler`] executes gateway-originated commands (announce a
//!   new device, fetch the paired-device list, fetch a last value) by
//!   sending the matching request to the server and completing the bound
//!   result from the correlated response.
//! - [`GwsCommandSender`] turns requests received from the server
//!   (accept, listen, set-value, unpair) into dispatched commands, replies
//!   ACCEPTED right away, and reports the final status with a response
//!   expecting an ack once the answer settles.

use crate::connector::{GwsConnector, GwsListener};
use gateway_core::answer::{Answer, AnswerContext, CommandResult, ResultStatus};
use gateway_core::answer_queue::WaitTimeout;
use gateway_core::command::{Command, CommandError, CommandKind, NewDeviceDescription};
use gateway_core::dispatch::{CommandDispatcher, CommandHandler, CommandSender};
use gateway_core::sync::StopControl;
use gw_protocol::message::{
    DeviceAcceptRequest, DeviceListRequest, GenericResponse, LastValueRequest, ListenRequest,
    NewDeviceRequest, ResponseWithAck, SetValueRequest, UnpairRequest, UnpairResponse,
};
use gw_protocol::{GWMessage, ResponseStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// GwsCommandHandler: local commands -> server requests
// ---------------------------------------------------------------------------

pub struct GwsCommandHandler {
    connector: Arc<dyn GwsConnector>,
    pending: Mutex<HashMap<Uuid, CommandResult>>,
}

impl GwsCommandHandler {
    pub fn new(connector: Arc<dyn GwsConnector>) -> GwsCommandHandler {
        GwsCommandHandler {
            connector,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn send_request(&self, request: GWMessage, result: CommandResult) {
        debug!(request = %request.brief(), "sending request");

        let id = request.id();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.contains_key(&id) {
                warn!(request = %request.brief(), "duplicate request ID");
                let _ = result.set_status(ResultStatus::Failed);
                return;
            }
            pending.insert(id, result.clone());
        }

        if let Err(e) = self.connector.send(request) {
            warn!(error = %e, "cannot send request");
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            let _ = result.set_status(ResultStatus::Failed);
        }
    }

    fn build_request(kind: &CommandKind) -> Option<GWMessage> {
        let id = Uuid::new_v4();
        match kind {
            CommandKind::NewDevice(NewDeviceDescription {
                device_id,
                product_name,
                vendor,
                refresh_time,
            }) => Some(GWMessage::NewDeviceRequest(NewDeviceRequest {
                id,
                device_id: *device_id,
                product_name: product_name.clone(),
                vendor: vendor.clone(),
                refresh_time: refresh_time.map(|t| t.as_secs()),
            })),
            CommandKind::ServerDeviceList { prefix } => {
                Some(GWMessage::DeviceListRequest(DeviceListRequest {
                    id,
                    device_prefix: *prefix,
                }))
            }
            CommandKind::ServerLastValue {
                device_id,
                module_id,
            } => Some(GWMessage::LastValueRequest(LastValueRequest {
                id,
                device_id: *device_id,
                module_id: *module_id,
            })),
            _ => None,
        }
    }

    /// Complete the result from a successful response's payload.
    fn apply_response(response: &GWMessage, result: &CommandResult) -> Result<(), CommandError> {
        match response {
            GWMessage::DeviceListResponse(r) => {
                result.set_device_list(r.devices.clone());
                Ok(())
            }
            GWMessage::LastValueResponse(r) => {
                result.set_last_value(r.value);
                Ok(())
            }
            GWMessage::GenericResponse(_) => Ok(()),
            other => Err(CommandError::IllegalState(format!(
                "unrecognized response: {}",
                other.brief()
            ))),
        }
    }
}

impl CommandHandler for GwsCommandHandler {
    fn name(&self) -> &str {
        "server-link"
    }

    fn accept(&self, cmd: &Command) -> bool {
        matches!(
            cmd.kind(),
            CommandKind::NewDevice(_)
                | CommandKind::ServerDeviceList { .. }
                | CommandKind::ServerLastValue { .. }
        )
    }

    fn handle(&self, cmd: &Command, answer: &Arc<Answer>) -> Result<(), CommandError> {
        let result = CommandResult::new(&answer);

        let Some(request) = Self::build_request(cmd.kind()) else {
            let _ = result.set_status(ResultStatus::Failed);
            return Err(CommandError::IllegalState(format!(
                "command {cmd} cannot be handled"
            )));
        };

        self.send_request(request, result);
        Ok(())
    }
}

impl GwsListener for GwsCommandHandler {
    fn on_response(&self, response: &GWMessage) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());

        let id = response.id();
        if !pending.contains_key(&id) {
            debug!(response = %response.brief(), "received spurious response");
            return;
        }

        match response.status() {
            Some(ResponseStatus::Accepted) => {
                // the final status arrives later; keep the result pending
                debug!(response = %response.brief(), "request was accepted");
                return;
            }
            Some(ResponseStatus::Failed) => {
                let result = pending.remove(&id).unwrap_or_else(|| unreachable!());
                info!(response = %response.brief(), "request is considered as failed");
                let _ = result.set_status(ResultStatus::Failed);
            }
            Some(ResponseStatus::Success) => {
                let result = pending.remove(&id).unwrap_or_else(|| unreachable!());
                match Self::apply_response(response, &result) {
                    Ok(()) => {
                        let _ = result.set_status(ResultStatus::Success);
                    }
                    Err(e) => {
                        warn!(response = %response.brief(), error = %e, "bad response payload");
                        let _ = result.set_status(ResultStatus::Failed);
                    }
                }
            }
            None => warn!(response = %response.brief(), "response without a status"),
        }
    }
}

// ---------------------------------------------------------------------------
// GwsCommandSender: server requests -> dispatched commands
// ---------------------------------------------------------------------------

pub struct GwsCommandSender {
    connector: Arc<dyn GwsConnector>,
    sender: CommandSender,
    stop: StopControl,
}

impl GwsCommandSender {
    pub fn new(
        connector: Arc<dyn GwsConnector>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> GwsCommandSender {
        GwsCommandSender {
            connector,
            sender: CommandSender::new(dispatcher),
            stop: StopControl::new(),
        }
    }

    /// Answer-processing loop: report settled answers back to the server.
    pub fn run(&self) {
        info!("starting server command processing");

        while !self.stop.should_stop() {
            let mut dirty = Vec::new();
            self.sender.answer_queue().wait(
                WaitTimeout::Bounded(Duration::from_millis(500)),
                &mut dirty,
            );

            for answer in dirty {
                if answer.is_pending() {
                    continue;
                }
                self.sender.answer_queue().remove(&answer);
                self.respond(&answer);
            }
        }

        info!("server command processing has stopped");
    }

    pub fn spawn(self: Arc<Self>) -> thread::JoinHandle<()> {
        let this = self;
        thread::Builder::new()
            .name("command-sender".into())
            .spawn(move || this.run())
            .expect("cannot spawn command sender thread")
    }

    pub fn stop(&self) {
        self.stop.request_stop();
        self.sender.answer_queue().dispose();
    }

    fn dispatch(&self, kind: CommandKind, request: &Arc<GWMessage>) {
        // tell the server we took the command over
        let accepted = GWMessage::GenericResponse(GenericResponse {
            id: request.id(),
            status: ResponseStatus::Accepted,
        });
        if let Err(e) = self.connector.send(accepted) {
            warn!(error = %e, "cannot acknowledge request");
        }

        if let Err(e) = self
            .sender
            .dispatch_new(kind, AnswerContext::ServerRequest(Arc::clone(request)))
        {
            warn!(request = %request.brief(), error = %e, "cannot dispatch server command");
        }
    }

    fn respond(&self, answer: &Arc<Answer>) {
        let Some(request) = answer.server_request() else {
            warn!("settled answer carries no originating request");
            return;
        };

        let statuses = answer.statuses();
        let success = !statuses.is_empty() && statuses.iter().all(|s| *s == ResultStatus::Success);
        let status = if success {
            ResponseStatus::Success
        } else {
            ResponseStatus::Failed
        };

        let response = match request.as_ref() {
            GWMessage::UnpairRequest(r) => GWMessage::UnpairResponse(UnpairResponse {
                id: r.id,
                status,
            }),
            other => GWMessage::ResponseWithAck(ResponseWithAck {
                id: other.id(),
                status,
            }),
        };

        debug!(response = %response.brief(), "reporting command outcome");
        if let Err(e) = self.connector.send(response) {
            warn!(error = %e, "cannot send command outcome");
        }
    }
}

impl GwsListener for GwsCommandSender {
    fn on_request(&self, request: &GWMessage) {
        let kind = match request {
            GWMessage::DeviceAcceptRequest(DeviceAcceptRequest { device_id, .. }) => {
                CommandKind::DeviceAccept {
                    device_id: *device_id,
                }
            }
            GWMessage::ListenRequest(ListenRequest { duration, .. }) => {
                CommandKind::GatewayListen {
                    duration: Duration::from_secs(*duration),
                }
            }
            GWMessage::SetValueRequest(SetValueRequest {
                device_id,
                module_id,
                value,
                timeout,
                ..
            }) => CommandKind::DeviceSetValue {
                device_id: *device_id,
                module_id: *module_id,
                value: *value,
                timeout: Duration::from_secs(*timeout),
            },
            GWMessage::UnpairRequest(UnpairRequest { device_id, .. }) => {
                CommandKind::DeviceUnpair {
                    device_id: *device_id,
                }
            }
            other => {
                debug!(request = %other.brief(), "ignoring request kind");
                return;
            }
        };

        self.dispatch(kind, &Arc::new(request.clone()));
    }
}
