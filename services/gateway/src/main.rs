// gateway: Mediates between local sensor/actuator devices and the remote
// server: ships measurements upstream with at-least-once delivery and
// applies server commands back to the devices.

use gateway::command_bridge::{GwsCommandHandler, GwsCommandSender};
use gateway::config;
use gateway::connector::{FixedPriorityAssigner, GwsConnector, GwsListener};
use gateway::exporters::{QueuingExporter, QueuingExporterConfig};
use gateway::resender::Resender;
use gateway::ws::{ConnectorConfig, GwsServerConnector};
use gateway_core::dispatch::{BlockingPoolExecutor, CommandDispatcher, SerialExecutor};
use gateway_core::export::{DistributorConfig, QueuingDistributor};
use gateway_core::queuing::RecoverableJournalQueuingStrategy;
use gateway_core::status::{DeviceStatusFetcher, FetcherConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    let cfg = {
        let result = match std::env::args().nth(1) {
            Some(path) => config::load_config_from(Path::new(&path)),
            None => config::load_config(),
        };
        match result {
            Ok(cfg) => {
                info!(
                    server = %cfg.server.url,
                    queue_dir = %cfg.queue.root_dir,
                    "config loaded"
                );
                cfg
            }
            Err(e) => {
                eprintln!("FATAL: failed to load config: {e}");
                std::process::exit(1);
            }
        }
    };

    // listener delivery must preserve event order, so it runs serialized;
    // command handlers may block and go to the blocking pool
    let events_executor = Arc::new(SerialExecutor::new("gws-events"));
    let command_executor = Arc::new(BlockingPoolExecutor::current());

    let connector = Arc::new(GwsServerConnector::new(
        ConnectorConfig {
            url: cfg.server.url.clone(),
            reconnect_delay: cfg.server.reconnect_delay,
            outputs_count: cfg.server.outputs_count,
        },
        Arc::new(FixedPriorityAssigner),
        events_executor,
    ));
    let connector_dyn: Arc<dyn GwsConnector> = connector.clone();

    let dispatcher = Arc::new(CommandDispatcher::new(command_executor));

    // durable export pipeline
    let mut strategy = RecoverableJournalQueuingStrategy::new(&cfg.queue.root_dir);
    strategy.set_bytes_limit(cfg.queue.bytes_limit);
    strategy.set_never_drop_oldest(cfg.queue.never_drop_oldest);
    strategy.set_gc_disabled(cfg.queue.disable_gc);
    if let Err(e) = strategy.setup() {
        eprintln!("FATAL: cannot set up the queue directory: {e}");
        std::process::exit(1);
    }

    let exporter = Arc::new(QueuingExporter::new(
        QueuingExporterConfig {
            active_count: cfg.export.active_count,
            acquire_timeout: cfg.export.acquire_timeout,
            send_failed_delay: cfg.export.send_failed_delay,
        },
        connector_dyn.clone(),
        Box::new(strategy),
    ));
    connector.add_listener(exporter.clone() as Arc<dyn GwsListener>);

    let resender = Arc::new(Resender::new(
        connector_dyn.clone(),
        cfg.server.resend_timeout,
    ));
    connector.add_listener(resender.clone() as Arc<dyn GwsListener>);

    // command bridge in both directions
    let gws_handler = Arc::new(GwsCommandHandler::new(connector_dyn.clone()));
    if let Err(e) = dispatcher.register_handler(gws_handler.clone()) {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }
    connector.add_listener(gws_handler.clone() as Arc<dyn GwsListener>);

    let command_sender = Arc::new(GwsCommandSender::new(
        connector_dyn.clone(),
        dispatcher.clone(),
    ));
    connector.add_listener(command_sender.clone() as Arc<dyn GwsListener>);

    // fan-out of measured data; device managers call distributor.export_data
    let distributor = Arc::new(QueuingDistributor::new(DistributorConfig {
        dead_timeout: cfg.distributor.dead_timeout,
        idle_timeout: cfg.distributor.idle_timeout,
        queue_capacity: cfg.distributor.queue_capacity,
        batch_size: cfg.distributor.batch_size,
        threshold: cfg.distributor.threshold,
    }));
    distributor.register_exporter(exporter.clone());

    let fetcher = match DeviceStatusFetcher::new(
        dispatcher.clone(),
        FetcherConfig {
            idle_duration: cfg.status.idle_duration,
            wait_timeout: cfg.status.wait_timeout,
            repeat_timeout: cfg.status.repeat_timeout,
        },
    ) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let distributor_worker = distributor.clone().spawn();
    let exporter_worker = exporter.clone().spawn();
    let resender_worker = resender.clone().spawn();
    let command_worker = command_sender.clone().spawn();
    let fetcher_worker = fetcher.clone().spawn();
    let connector_task = tokio::spawn(connector.clone().run());

    info!("gateway initialized");

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("FATAL: cannot wait for shutdown signal: {e}");
    }
    info!("shutting down");

    fetcher.stop();
    command_sender.stop();
    resender.stop();
    exporter.stop();
    distributor.stop();
    connector.stop();

    let _ = connector_task.await;
    let _ = tokio::task::spawn_blocking(move || {
        for worker in [
            distributor_worker,
            exporter_worker,
            resender_worker,
            command_worker,
            fetcher_worker,
        ] {
            let _ = worker.join();
        }
    })
    .await;

    info!("gateway stopped");
}
