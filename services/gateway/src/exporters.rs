//! Shipment of measured data over the server link.
//!
//! Two flavors:
//! - [`QueuingExporter`] — stop-and-go: batches from a persistent queuing
//!   strategy are exported one at a time and popped only after the server
//!   confirms them, so nothing is lost across restarts or link failures.
//! - [`OptimisticExporter`] — unbatched with a small in-flight window;
//!   refuses data while disconnected or at the cap, leaving backpressure
//!   to the caller's distributor queue.

use crate::connector::{GwsConnector, GwsListener};
use gateway_core::export::{ExportError, Exporter};
use gateway_core::queuing::QueuingStrategy;
use gateway_core::sync::{Event, StopControl};
use gw_protocol::message::SensorDataExport;
use gw_protocol::{GWMessage, SensorData};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// QueuingExporter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueuingExporterConfig {
    /// Max readings per export message.
    pub active_count: usize,
    /// How long to wait for queued data before re-checking.
    pub acquire_timeout: Duration,
    /// Pause after a failed send before retrying the same batch.
    pub send_failed_delay: Duration,
}

impl Default for QueuingExporterConfig {
    fn default() -> QueuingExporterConfig {
        QueuingExporterConfig {
            active_count: 10,
            acquire_timeout: Duration::from_secs(5),
            send_failed_delay: Duration::from_secs(5),
        }
    }
}

pub struct QueuingExporter {
    config: QueuingExporterConfig,
    connector: Arc<dyn GwsConnector>,
    strategy: Mutex<Box<dyn QueuingStrategy>>,
    not_empty: Event,
    confirmed: Mutex<HashSet<Uuid>>,
    confirm_event: Event,
    stop: StopControl,
}

impl QueuingExporter {
    pub fn new(
        config: QueuingExporterConfig,
        connector: Arc<dyn GwsConnector>,
        strategy: Box<dyn QueuingStrategy>,
    ) -> QueuingExporter {
        QueuingExporter {
            config,
            connector,
            strategy: Mutex::new(strategy),
            not_empty: Event::new(),
            confirmed: Mutex::new(HashSet::new()),
            confirm_event: Event::new(),
            stop: StopControl::new(),
        }
    }

    /// Export loop; call from a dedicated thread.
    pub fn run(&self) {
        info!("starting queuing exporter");

        while !self.stop.should_stop() {
            let batch = self.acquire(self.config.active_count, self.config.acquire_timeout);
            if batch.is_empty() {
                continue;
            }

            if tracing::enabled!(tracing::Level::TRACE) {
                let details: Vec<String> = batch
                    .iter()
                    .map(|d| format!("{} ({})", d.device_id, d.len()))
                    .collect();
                trace!(values = %details.join(", "), "exporting values");
            }

            let id = Uuid::new_v4();
            let export = GWMessage::SensorDataExport(SensorDataExport {
                id,
                data: batch.clone(),
            });

            if let Err(e) = self.connector.send(export) {
                warn!(error = %e, "cannot send export, retrying the same batch");
                self.stop.wait_stoppable(self.config.send_failed_delay);
                continue;
            }

            if self.wait_confirmed(id) {
                self.ack(batch.len());
                debug!(%id, "export has been confirmed");
            }
        }

        info!("queuing exporter has stopped");
    }

    pub fn spawn(self: Arc<Self>) -> thread::JoinHandle<()> {
        let this = self;
        thread::Builder::new()
            .name("queuing-exporter".into())
            .spawn(move || this.run())
            .expect("cannot spawn exporter thread")
    }

    pub fn stop(&self) {
        self.stop.request_stop();
        self.not_empty.set();
        self.confirm_event.set();
    }

    /// Peek up to `count` readings, waiting up to `timeout` for data.  The
    /// strategy's stable peek makes retries of the same batch safe.
    fn acquire(&self, count: usize, timeout: Duration) -> Vec<SensorData> {
        {
            let mut strategy = self.lock_strategy();
            if strategy.empty() {
                drop(strategy);
                if !self.not_empty.try_wait(timeout) {
                    return Vec::new();
                }
            }
        }

        let mut batch = Vec::new();
        let mut strategy = self.lock_strategy();
        match strategy.peek(&mut batch, count) {
            Ok(_) => batch,
            Err(e) => {
                warn!(error = %e, "cannot peek queued data");
                Vec::new()
            }
        }
    }

    fn wait_confirmed(&self, id: Uuid) -> bool {
        loop {
            if self.stop.should_stop() {
                return false;
            }
            self.confirm_event.wait();

            let mut confirmed = self.confirmed.lock().unwrap_or_else(|e| e.into_inner());
            let acked = confirmed.remove(&id);
            if acked {
                return true;
            }
        }
    }

    fn ack(&self, count: usize) {
        let mut strategy = self.lock_strategy();
        if let Err(e) = strategy.pop(count) {
            warn!(error = %e, "cannot pop confirmed batch");
        }
    }

    fn lock_strategy(&self) -> std::sync::MutexGuard<'_, Box<dyn QueuingStrategy>> {
        self.strategy.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Exporter for QueuingExporter {
    fn ship(&self, data: &SensorData) -> Result<bool, ExportError> {
        let mut strategy = self.lock_strategy();
        strategy
            .push(std::slice::from_ref(data))
            .map_err(|e| ExportError::Broken(e.to_string()))?;
        drop(strategy);

        self.not_empty.set();
        Ok(true)
    }
}

impl GwsListener for QueuingExporter {
    fn on_connected(&self, _address: &str) {
        self.stop.request_wakeup();
        self.not_empty.set();
    }

    fn on_other(&self, message: &GWMessage) {
        let GWMessage::SensorDataConfirm(confirm) = message else {
            return;
        };
        self.confirmed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(confirm.id);
        self.confirm_event.set();
    }
}

// ---------------------------------------------------------------------------
// OptimisticExporter
// ---------------------------------------------------------------------------

pub struct OptimisticExporter {
    connector: Arc<dyn GwsConnector>,
    /// Max unconfirmed exports in flight.
    export_non_confirmed: usize,
    connected: AtomicBool,
    exported: Mutex<HashSet<Uuid>>,
}

impl OptimisticExporter {
    /// `export_non_confirmed` must be at least 1.
    pub fn new(connector: Arc<dyn GwsConnector>, export_non_confirmed: usize) -> OptimisticExporter {
        OptimisticExporter {
            connector,
            export_non_confirmed: export_non_confirmed.max(1),
            connected: AtomicBool::new(false),
            exported: Mutex::new(HashSet::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.exported.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Exporter for OptimisticExporter {
    fn ship(&self, data: &SensorData) -> Result<bool, ExportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let mut exported = self.exported.lock().unwrap_or_else(|e| e.into_inner());
        if exported.len() >= self.export_non_confirmed {
            return Ok(false);
        }

        let id = Uuid::new_v4();
        let export = GWMessage::SensorDataExport(SensorDataExport {
            id,
            data: vec![data.clone()],
        });

        debug!(
            device_id = %data.device_id,
            values = data.len(),
            "exporting optimistically"
        );

        match self.connector.send(export) {
            Ok(()) => {
                exported.insert(id);
                Ok(true)
            }
            Err(e) => {
                debug!(error = %e, "optimistic export failed");
                Ok(false)
            }
        }
    }
}

impl GwsListener for OptimisticExporter {
    fn on_connected(&self, _address: &str) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn on_disconnected(&self, _address: &str) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn on_other(&self, message: &GWMessage) {
        if let GWMessage::SensorDataConfirm(confirm) = message {
            self.exported
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&confirm.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorError;
    use gateway_core::queuing::InMemoryQueuingStrategy;
    use gw_protocol::message::SensorDataConfirm;
    use gw_protocol::{DeviceID, SensorValue};

    #[derive(Default)]
    struct RecordingConnector {
        sent: Mutex<Vec<GWMessage>>,
        fail: AtomicBool,
    }

    impl GwsConnector for RecordingConnector {
        fn send(&self, message: GWMessage) -> Result<(), ConnectorError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ConnectorError::Connection("down".into()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn add_listener(&self, _listener: Arc<dyn GwsListener>) {}
    }

    fn data(n: u64) -> SensorData {
        SensorData::new(
            DeviceID::from_raw(0xa300_0000_0000_0000 + n),
            n,
            vec![SensorValue::new(0, n as f64)],
        )
    }

    #[test]
    fn optimistic_refuses_while_disconnected() {
        let connector = Arc::new(RecordingConnector::default());
        let exporter = OptimisticExporter::new(connector.clone(), 2);

        assert_eq!(exporter.ship(&data(1)).unwrap(), false);
        assert!(connector.sent.lock().unwrap().is_empty());

        exporter.on_connected("ws://test");
        assert_eq!(exporter.ship(&data(1)).unwrap(), true);
        assert_eq!(connector.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn optimistic_caps_unconfirmed_exports() {
        let connector = Arc::new(RecordingConnector::default());
        let exporter = OptimisticExporter::new(connector.clone(), 2);
        exporter.on_connected("ws://test");

        assert!(exporter.ship(&data(1)).unwrap());
        assert!(exporter.ship(&data(2)).unwrap());
        // at the cap: backpressure
        assert!(!exporter.ship(&data(3)).unwrap());
        assert_eq!(exporter.in_flight(), 2);

        // confirming one in-flight export frees a slot
        let confirmed_id = connector.sent.lock().unwrap()[0].id();
        exporter.on_other(&GWMessage::SensorDataConfirm(SensorDataConfirm {
            id: confirmed_id,
        }));
        assert_eq!(exporter.in_flight(), 1);
        assert!(exporter.ship(&data(3)).unwrap());
    }

    #[test]
    fn optimistic_send_failure_reports_backpressure() {
        let connector = Arc::new(RecordingConnector::default());
        let exporter = OptimisticExporter::new(connector.clone(), 2);
        exporter.on_connected("ws://test");

        connector.fail.store(true, Ordering::SeqCst);
        assert!(!exporter.ship(&data(1)).unwrap());
        assert_eq!(exporter.in_flight(), 0);
    }

    #[test]
    fn queuing_ship_persists_into_the_strategy() {
        let connector = Arc::new(RecordingConnector::default());
        let exporter = QueuingExporter::new(
            QueuingExporterConfig::default(),
            connector,
            Box::new(InMemoryQueuingStrategy::new()),
        );

        exporter.ship(&data(1)).unwrap();
        exporter.ship(&data(2)).unwrap();

        let batch = exporter.acquire(10, Duration::from_millis(1));
        assert_eq!(batch, vec![data(1), data(2)]);
    }

    #[test]
    fn acquire_times_out_on_an_empty_strategy() {
        let connector = Arc::new(RecordingConnector::default());
        let exporter = QueuingExporter::new(
            QueuingExporterConfig::default(),
            connector,
            Box::new(InMemoryQueuingStrategy::new()),
        );

        let batch = exporter.acquire(10, Duration::from_millis(10));
        assert!(batch.is_empty());
    }
}
