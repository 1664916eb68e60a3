//! Teleport Oracle
//!
//! Relays `Teleport` events from the source EVM contract to token transfers
//! on the EOSIO chain.
//!
//! Startup:
//! 1. Load and validate configuration (`--config <file.json>` or env/.env)
//! 2. Connect the relay ledger and run migrations
//! 3. Report records left PENDING by a previous run
//! 4. Connect both chains, then relay until SIGINT/SIGTERM
//!
//! Exits non-zero on invalid configuration, an unavailable ledger, or when
//! the source subscription cannot be re-established.

use clap::Parser;
use eyre::WrapErr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use teleport_oracle::alert;
use teleport_oracle::amount::AmountConverter;
use teleport_oracle::api::{self, AppState};
use teleport_oracle::config::RawConfig;
use teleport_oracle::coordinator::RelayCoordinator;
use teleport_oracle::destination::EosioClient;
use teleport_oracle::dispatcher::Dispatcher;
use teleport_oracle::ledger::{PgLedger, RelayLedger};
use teleport_oracle::source::{EventSubscriber, EvmSource};

#[derive(Debug, Parser)]
#[command(name = "teleport-oracle", about = "EVM to EOSIO teleport relay", version)]
struct Cli {
    /// JSON configuration file; environment variables are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_logging();

    info!("Starting Teleport Oracle");

    let config = RawConfig::load(cli.config.as_deref())?
        .validate()
        .wrap_err("Configuration rejected")?;
    info!(
        source = %config.source.ws_url,
        contract = %config.source.contract,
        event = %config.source.event_name,
        destination = %config.destination.api_endpoint,
        token_contract = %config.destination.token_contract,
        issuer = %config.destination.issuer,
        exchange_rate = %config.relay.exchange_rate,
        "Configuration loaded"
    );

    let ledger: Arc<dyn RelayLedger> = Arc::new(
        PgLedger::connect(&config.database_url)
            .await
            .wrap_err("Failed to open relay ledger")?,
    );
    info!("Relay ledger ready");

    let alerts = alert::from_config(config.alert_webhook_url.as_deref())?;
    let converter = AmountConverter::new(
        config.source.decimals,
        config.destination.decimals,
        &config.relay.exchange_rate,
    )?;
    info!(
        source_decimals = converter.source_decimals(),
        destination_decimals = converter.destination_decimals(),
        multiplier = converter.multiplier(),
        "Amount converter ready"
    );

    let destination = EosioClient::new(&config.destination)?;
    destination.check_chain().await?;
    let dispatcher = Dispatcher::new(Arc::new(destination), config.relay.dispatch_retry.clone());

    let coordinator = Arc::new(RelayCoordinator::new(
        ledger.clone(),
        converter,
        dispatcher,
        alerts,
        &config.relay,
    ));

    coordinator.report_pending().await?;

    let source = EvmSource::connect(&config.source).await?;
    let start_block = coordinator.resume_block(config.source.start_block).await?;
    let subscriber = EventSubscriber::new(Arc::new(source), config.relay.reconnect.clone())
        .with_start_block(start_block)
        .with_max_block_range(config.source.max_block_range);

    let cancel = CancellationToken::new();

    if let Some(addr) = config.api_bind_addr {
        let state = AppState::new(ledger.clone());
        let api_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(addr, state, api_cancel).await {
                error!(error = %e, "Status API error");
            }
        });
    }

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    let result = coordinator.run(subscriber, cancel.clone()).await;
    cancel.cancel();

    let summary = result.wrap_err("Relay pipeline stopped with a fatal error")?;
    info!(
        observed = summary.observed,
        skipped = summary.skipped,
        issued = summary.issued,
        failed = summary.failed,
        "Teleport Oracle stopped"
    );
    Ok(())
}

/// Initialize tracing; `LOG_FORMAT=json` switches to JSON lines
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,teleport_oracle=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
