//! Relay Broker
//!
//! Relays Modbus messages between collectors and transductors.
//!
//! Usage: relay-broker --max-msg-size 4096 --port 9000
//! Every flag can also be set from the environment (MAX_MSG_SIZE,
//! BROKER_PORT, RUST_LOG, LOG_FORMAT, BROKER_IDLE_TIMEOUT_SECS,
//! BROKER_QUEUE_CAPACITY).

use clap::Parser;
use tracing::{error, info};
use voltage_collector::{init_logging, BrokerArgs, ModbusResult, RelayBroker};

#[tokio::main]
async fn main() {
    let args = BrokerArgs::parse();
    if let Err(err) = run(args).await {
        error!("Relay broker failed: {}", err);
        eprintln!("relay-broker: {}", err);
        std::process::exit(1);
    }
}

async fn run(args: BrokerArgs) -> ModbusResult<()> {
    init_logging(&args.log_config()?)?;
    info!("{}", voltage_collector::info());

    let broker = RelayBroker::bind(args.broker_config()?).await?;
    let stats = broker.stats();
    broker.run_until(shutdown_signal()).await?;

    let totals = stats.snapshot();
    info!(
        "Totals: {} received, {} relayed, {} failed, {} rejected",
        totals.received, totals.relayed, totals.failed, totals.rejected
    );
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Cannot listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
