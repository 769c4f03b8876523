//! Export/confirm round trip over a mock server link.
//!
//! Ships a reading through the persistent queue, observes the outgoing
//! export, confirms it, and verifies that the persisted queue shrinks and
//! no resend happens.

use gateway::connector::{ConnectorError, GwsConnector, GwsListener};
use gateway::exporters::{QueuingExporter, QueuingExporterConfig};
use gateway::resender::Resender;
use gateway_core::queuing::RecoverableJournalQueuingStrategy;
use gw_protocol::message::SensorDataConfirm;
use gw_protocol::{DeviceID, GWMessage, MessageKind, SensorData, SensorValue};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Mock link: records sends, fires events like a perfect network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockLink {
    listeners: Mutex<Vec<Arc<dyn GwsListener>>>,
    sent: Mutex<Vec<GWMessage>>,
}

impl MockLink {
    fn sent_exports(&self) -> Vec<GWMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, GWMessage::SensorDataExport(_)))
            .cloned()
            .collect()
    }

    /// Inject a message as if it arrived from the server.
    fn deliver(&self, message: &GWMessage) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            match message.kind() {
                MessageKind::Request => listener.on_request(message),
                MessageKind::Response => listener.on_response(message),
                MessageKind::Ack => listener.on_ack(message),
                MessageKind::Other => listener.on_other(message),
            }
        }
    }
}

impl GwsConnector for MockLink {
    fn send(&self, message: GWMessage) -> Result<(), ConnectorError> {
        self.sent.lock().unwrap().push(message.clone());

        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in &listeners {
            listener.on_try_send(&message);
        }
        for listener in &listeners {
            listener.on_sent(&message);
        }
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn GwsListener>) {
        self.listeners.lock().unwrap().push(listener);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn reading() -> SensorData {
    SensorData::new(
        DeviceID::from_raw(0xa300_0000_0000_0001),
        1_527_660_187_000_000,
        vec![SensorValue::new(0, 21.5), SensorValue::new(1, 47.0)],
    )
}

fn buffer_files(root: &Path) -> Vec<String> {
    fs::read_dir(root)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.len() == 40 && n.bytes().all(|b| b.is_ascii_hexdigit()))
        .collect()
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

// ---------------------------------------------------------------------------
// The round trip
// ---------------------------------------------------------------------------

#[test]
fn export_confirm_round_trip_shrinks_the_queue_without_resend() {
    let dir = tempfile::tempdir().unwrap();
    let link = Arc::new(MockLink::default());

    let mut strategy = RecoverableJournalQueuingStrategy::new(dir.path());
    strategy.setup().unwrap();

    let exporter = Arc::new(QueuingExporter::new(
        QueuingExporterConfig {
            active_count: 10,
            acquire_timeout: Duration::from_millis(20),
            send_failed_delay: Duration::from_millis(20),
        },
        link.clone() as Arc<dyn GwsConnector>,
        Box::new(strategy),
    ));
    link.add_listener(exporter.clone() as Arc<dyn GwsListener>);

    let resender = Arc::new(Resender::new(
        link.clone() as Arc<dyn GwsConnector>,
        Duration::from_millis(200),
    ));
    link.add_listener(resender.clone() as Arc<dyn GwsListener>);

    let exporter_worker = exporter.clone().spawn();
    let resender_worker = resender.clone().spawn();

    // ship one reading: it lands in the persisted queue as a buffer file
    use gateway_core::export::Exporter;
    assert!(exporter.ship(&reading()).unwrap());
    assert_eq!(buffer_files(dir.path()).len(), 1);

    // exactly one export goes out, with a fresh correlation id
    assert!(wait_until(Duration::from_secs(5), || {
        !link.sent_exports().is_empty()
    }));
    let export = link.sent_exports()[0].clone();
    let GWMessage::SensorDataExport(ref payload) = export else {
        panic!("expected an export");
    };
    assert!(!payload.id.is_nil());
    assert_eq!(payload.data, vec![reading()]);

    // the server confirms by id: the persisted queue shrinks by the entry
    link.deliver(&GWMessage::SensorDataConfirm(SensorDataConfirm {
        id: payload.id,
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        buffer_files(dir.path()).is_empty()
    }));

    // past the resend timeout: the confirmed export is never resent
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(link.sent_exports().len(), 1);
    assert_eq!(resender.scheduled_count(), 0);

    resender.stop();
    exporter.stop();
    exporter_worker.join().unwrap();
    resender_worker.join().unwrap();
}

#[test]
fn unconfirmed_export_is_resent_until_confirmed() {
    let dir = tempfile::tempdir().unwrap();
    let link = Arc::new(MockLink::default());

    let mut strategy = RecoverableJournalQueuingStrategy::new(dir.path());
    strategy.setup().unwrap();

    let exporter = Arc::new(QueuingExporter::new(
        QueuingExporterConfig {
            active_count: 10,
            acquire_timeout: Duration::from_millis(20),
            send_failed_delay: Duration::from_millis(20),
        },
        link.clone() as Arc<dyn GwsConnector>,
        Box::new(strategy),
    ));
    link.add_listener(exporter.clone() as Arc<dyn GwsListener>);

    let resender = Arc::new(Resender::new(
        link.clone() as Arc<dyn GwsConnector>,
        Duration::from_millis(60),
    ));
    link.add_listener(resender.clone() as Arc<dyn GwsListener>);

    let exporter_worker = exporter.clone().spawn();
    let resender_worker = resender.clone().spawn();

    use gateway_core::export::Exporter;
    exporter.ship(&reading()).unwrap();

    // without a confirmation the resender keeps re-transmitting
    assert!(wait_until(Duration::from_secs(5), || {
        link.sent_exports().len() >= 2
    }));
    let exports = link.sent_exports();
    assert_eq!(exports[0].id(), exports[1].id(), "same message instance");

    // confirming stops the retransmissions and drains the queue
    link.deliver(&GWMessage::SensorDataConfirm(SensorDataConfirm {
        id: exports[0].id(),
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        buffer_files(dir.path()).is_empty()
    }));

    resender.stop();
    exporter.stop();
    exporter_worker.join().unwrap();
    resender_worker.join().unwrap();
}
