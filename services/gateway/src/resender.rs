//! Retransmission of messages until their correlated reply arrives.
//!
//! Resendable messages are exactly: requests, responses expecting an ack,
//! and sensor-data exports.  Each successfully sent instance is (re-)
//! scheduled `resend_timeout` after its send; the entry is dropped when a
//! final response, a status-matching ack or an export confirmation shows
//! up.  Resending goes through the connector again, which re-enters this
//! listener and schedules the next round.

use crate::connector::{GwsConnector, GwsListener};
use gateway_core::sync::{Event, StopControl};
use gw_protocol::{GWMessage, MessageKind};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn resendable(message: &GWMessage) -> bool {
    match message.kind() {
        MessageKind::Request => true,
        MessageKind::Response => message.ack_expected(),
        _ => matches!(message, GWMessage::SensorDataExport(_)),
    }
}

type ScheduleKey = (Instant, u64);

#[derive(Default)]
struct ResenderState {
    /// Deadline-ordered messages awaiting their reply.
    waiting: BTreeMap<ScheduleKey, Arc<GWMessage>>,
    /// Message id to its schedule entry.
    refs: HashMap<Uuid, ScheduleKey>,
    /// Ids handed to the network but not yet confirmed as written.
    pending: HashSet<Uuid>,
    seq: u64,
}

pub struct Resender {
    connector: Arc<dyn GwsConnector>,
    resend_timeout: Duration,
    state: Mutex<ResenderState>,
    event: Event,
    stop: StopControl,
}

impl Resender {
    /// `resend_timeout` must be positive.
    pub fn new(connector: Arc<dyn GwsConnector>, resend_timeout: Duration) -> Resender {
        Resender {
            connector,
            resend_timeout: resend_timeout.max(Duration::from_millis(1)),
            state: Mutex::new(ResenderState::default()),
            event: Event::new(),
            stop: StopControl::new(),
        }
    }

    /// Scheduler loop; call from a dedicated thread.
    pub fn run(&self) {
        info!("starting resender");

        while !self.stop.should_stop() {
            // the state lock is released before sending: the connector
            // re-enters this listener from its own events
            let due = {
                let mut state = self.lock();
                match state.waiting.keys().next().copied() {
                    None => None,
                    Some((deadline, _)) if deadline <= Instant::now() => {
                        let entry = state.waiting.pop_first();
                        if let Some((_, ref message)) = entry {
                            state.refs.remove(&message.id());
                        }
                        entry.map(|(_, message)| message)
                    }
                    Some((deadline, _)) => {
                        drop(state);
                        let delay = deadline
                            .saturating_duration_since(Instant::now())
                            .max(Duration::from_millis(1));
                        self.event.try_wait(delay);
                        continue;
                    }
                }
            };

            match due {
                Some(message) => {
                    debug!(message = %message.brief(), "resending message");
                    if let Err(e) = self.connector.send(message.as_ref().clone()) {
                        warn!(message = %message.brief(), error = %e, "resend failed");
                    }
                }
                None => self.event.wait(),
            }
        }

        info!("resender has stopped");
    }

    pub fn spawn(self: Arc<Self>) -> thread::JoinHandle<()> {
        let this = self;
        thread::Builder::new()
            .name("resender".into())
            .spawn(move || this.run())
            .expect("cannot spawn resender thread")
    }

    pub fn stop(&self) {
        self.stop.request_stop();
        self.event.set();
    }

    /// Deadlines currently scheduled; for tests and diagnostics.
    pub fn scheduled_count(&self) -> usize {
        self.lock().waiting.len()
    }

    fn find_and_drop(&self, id: Uuid) {
        let mut state = self.lock();
        state.pending.remove(&id);
        if let Some(key) = state.refs.remove(&id) {
            state.waiting.remove(&key);
            debug!(%id, "message delivered, resend cancelled");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResenderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GwsListener for Resender {
    fn on_try_send(&self, message: &GWMessage) {
        self.lock().pending.insert(message.id());
    }

    fn on_sent(&self, message: &GWMessage) {
        if !resendable(message) {
            return;
        }

        let mut state = self.lock();
        if !state.pending.contains(&message.id()) {
            return;
        }

        if let Some(key) = state.refs.get(&message.id()).copied() {
            // an entry for this id already exists: replace the message but
            // keep its deadline.  A final response may only be overwritten
            // by the same status; a late ACCEPTED never downgrades it.
            if let Some(existing) = state.waiting.get(&key) {
                let stored_status = existing.status();
                let is_final = stored_status.is_some_and(|s| s.is_final());
                if is_final && message.status() != stored_status {
                    warn!(
                        message = %message.brief(),
                        "attempt to override a final response, ignoring"
                    );
                    return;
                }
            }
            state.waiting.insert(key, Arc::new(message.clone()));
            debug!(message = %message.brief(), "updated scheduled resend");
            return;
        }

        let key = (Instant::now() + self.resend_timeout, state.seq);
        state.seq += 1;
        state.waiting.insert(key, Arc::new(message.clone()));
        state.refs.insert(message.id(), key);
        debug!(
            message = %message.brief(),
            timeout_ms = self.resend_timeout.as_millis() as u64,
            "scheduled resend"
        );
        drop(state);
        self.event.set();
    }

    fn on_response(&self, response: &GWMessage) {
        // only a final status terminates the correlated request
        if response.status().is_some_and(|s| s.is_final()) {
            self.find_and_drop(response.id());
        }
    }

    fn on_ack(&self, ack: &GWMessage) {
        let mut state = self.lock();
        state.pending.remove(&ack.id());

        let Some(key) = state.refs.get(&ack.id()).copied() else {
            return;
        };
        let Some(stored) = state.waiting.get(&key) else {
            return;
        };

        if stored.kind() != MessageKind::Response {
            warn!(message = %stored.brief(), "attempt to ack a non-response, ignoring");
            return;
        }

        if stored.status() != ack.status() {
            // an ack for an out-of-date status, e.g. ACCEPTED after SUCCESS
            debug!(
                message = %stored.brief(),
                "out-of-date ack status, keeping the resend scheduled"
            );
            return;
        }

        debug!(message = %stored.brief(), "response was acked");
        state.waiting.remove(&key);
        state.refs.remove(&ack.id());
    }

    fn on_other(&self, message: &GWMessage) {
        if matches!(message, GWMessage::SensorDataConfirm(_)) {
            self.find_and_drop(message.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorError;
    use gw_protocol::ResponseStatus;
    use gw_protocol::message::{
        GenericAck, GenericResponse, ListenRequest, ResponseWithAck, SensorDataConfirm,
        SensorDataExport,
    };

    #[derive(Default)]
    struct RecordingConnector {
        sent: Mutex<Vec<GWMessage>>,
    }

    impl GwsConnector for RecordingConnector {
        fn send(&self, message: GWMessage) -> Result<(), ConnectorError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn add_listener(&self, _listener: Arc<dyn GwsListener>) {}
    }

    fn request(id: Uuid) -> GWMessage {
        GWMessage::ListenRequest(ListenRequest { id, duration: 60 })
    }

    fn response_with_ack(id: Uuid, status: ResponseStatus) -> GWMessage {
        GWMessage::ResponseWithAck(ResponseWithAck { id, status })
    }

    fn resender_with(timeout: Duration) -> (Arc<Resender>, Arc<RecordingConnector>) {
        let connector = Arc::new(RecordingConnector::default());
        let resender = Arc::new(Resender::new(connector.clone(), timeout));
        (resender, connector)
    }

    fn mark_sent(resender: &Resender, message: &GWMessage) {
        resender.on_try_send(message);
        resender.on_sent(message);
    }

    #[test]
    fn only_the_three_resendable_kinds_are_scheduled() {
        let (resender, _) = resender_with(Duration::from_secs(30));

        mark_sent(&resender, &request(Uuid::new_v4()));
        assert_eq!(resender.scheduled_count(), 1);

        mark_sent(
            &resender,
            &response_with_ack(Uuid::new_v4(), ResponseStatus::Accepted),
        );
        assert_eq!(resender.scheduled_count(), 2);

        mark_sent(
            &resender,
            &GWMessage::SensorDataExport(SensorDataExport {
                id: Uuid::new_v4(),
                data: vec![],
            }),
        );
        assert_eq!(resender.scheduled_count(), 3);

        // a plain response expects no ack: not scheduled
        mark_sent(
            &resender,
            &GWMessage::GenericResponse(GenericResponse {
                id: Uuid::new_v4(),
                status: ResponseStatus::Success,
            }),
        );
        assert_eq!(resender.scheduled_count(), 3);
    }

    #[test]
    fn unconfirmed_request_is_resent_at_the_deadline() {
        let (resender, connector) = resender_with(Duration::from_millis(50));
        let worker = resender.clone().spawn();

        let id = Uuid::new_v4();
        mark_sent(&resender, &request(id));

        std::thread::sleep(Duration::from_millis(20));
        assert!(connector.sent.lock().unwrap().is_empty(), "too early");

        std::thread::sleep(Duration::from_millis(60));
        {
            let sent = connector.sent.lock().unwrap();
            assert_eq!(sent.len(), 1, "one resend after the timeout");
            assert_eq!(sent[0].id(), id);
        }

        resender.stop();
        worker.join().unwrap();
    }

    #[test]
    fn final_response_cancels_further_resends() {
        let (resender, connector) = resender_with(Duration::from_millis(40));
        let worker = resender.clone().spawn();

        let id = Uuid::new_v4();
        mark_sent(&resender, &request(id));
        resender.on_response(&GWMessage::GenericResponse(GenericResponse {
            id,
            status: ResponseStatus::Success,
        }));

        std::thread::sleep(Duration::from_millis(80));
        assert!(connector.sent.lock().unwrap().is_empty());
        assert_eq!(resender.scheduled_count(), 0);

        resender.stop();
        worker.join().unwrap();
    }

    #[test]
    fn accepted_response_does_not_cancel_the_resend() {
        let (resender, _) = resender_with(Duration::from_secs(30));
        let id = Uuid::new_v4();
        mark_sent(&resender, &request(id));

        resender.on_response(&GWMessage::GenericResponse(GenericResponse {
            id,
            status: ResponseStatus::Accepted,
        }));
        assert_eq!(resender.scheduled_count(), 1);
    }

    #[test]
    fn repeated_on_sent_collapses_to_a_single_entry() {
        let (resender, _) = resender_with(Duration::from_secs(30));
        let message = request(Uuid::new_v4());

        mark_sent(&resender, &message);
        mark_sent(&resender, &message);
        mark_sent(&resender, &message);

        assert_eq!(resender.scheduled_count(), 1);
    }

    #[test]
    fn matching_ack_drops_the_response_entry() {
        let (resender, _) = resender_with(Duration::from_secs(30));
        let id = Uuid::new_v4();
        let response = response_with_ack(id, ResponseStatus::Success);
        mark_sent(&resender, &response);

        resender.on_ack(&response.to_ack().unwrap());
        assert_eq!(resender.scheduled_count(), 0);
    }

    #[test]
    fn out_of_date_ack_is_ignored() {
        let (resender, _) = resender_with(Duration::from_secs(30));
        let id = Uuid::new_v4();
        mark_sent(&resender, &response_with_ack(id, ResponseStatus::Success));

        // an ack for the stale ACCEPTED state must not cancel the resend
        resender.on_ack(&GWMessage::GenericAck(GenericAck {
            id,
            status: ResponseStatus::Accepted,
        }));
        assert_eq!(resender.scheduled_count(), 1);
    }

    #[test]
    fn accepted_update_never_downgrades_a_final_response() {
        let (resender, _) = resender_with(Duration::from_secs(30));
        let id = Uuid::new_v4();
        mark_sent(&resender, &response_with_ack(id, ResponseStatus::Success));

        // a stale ACCEPTED re-send of the same id is ignored
        mark_sent(&resender, &response_with_ack(id, ResponseStatus::Accepted));

        let state = resender.lock();
        let stored = state.waiting.values().next().unwrap();
        assert_eq!(stored.status(), Some(ResponseStatus::Success));
    }

    #[test]
    fn export_confirm_cancels_the_export_resend() {
        let (resender, _) = resender_with(Duration::from_secs(30));
        let id = Uuid::new_v4();
        mark_sent(
            &resender,
            &GWMessage::SensorDataExport(SensorDataExport { id, data: vec![] }),
        );

        resender.on_other(&GWMessage::SensorDataConfirm(SensorDataConfirm { id }));
        assert_eq!(resender.scheduled_count(), 0);
    }

    #[test]
    fn resend_reschedules_through_the_connector_events() {
        let (resender, connector) = resender_with(Duration::from_millis(30));
        let worker = resender.clone().spawn();

        let id = Uuid::new_v4();
        mark_sent(&resender, &request(id));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(connector.sent.lock().unwrap().len(), 1);

        // emulate the connector completing the resend
        mark_sent(&resender, &request(id));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(connector.sent.lock().unwrap().len(), 2);

        resender.stop();
        worker.join().unwrap();
    }
}
