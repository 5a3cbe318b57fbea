use anyhow::Result;
use hydrolix_history::config::{load_config, DEFAULT_CONFIG_PATH};
use hydrolix_history::diagnostics::run_diagnostics_reporter;
use hydrolix_history::provisioning::{ConfigApiClient, Orchestrator};
use hydrolix_history::{HubStateChange, Pipeline, PipelineSettings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hydrolix_history=info".into()),
        )
        .init();

    info!("Hydrolix history shipper starting...");

    let config_path = std::env::var("HYDROLIX_HISTORY_CONFIG")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let mut config = load_config(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    info!(
        config_path = %config_path,
        host = %config.host,
        use_ssl = config.use_ssl,
        batch_size = config.batch_size,
        batch_interval = config.batch_interval,
        "Configuration loaded"
    );

    // Listen for ctrl_c from the start so provisioning can stop between stages
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for ctrl_c signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    // Provisioning failures abort startup; nothing is shipped without a target
    let api = ConfigApiClient::new(
        &config.host,
        config.bearer_token.clone(),
        config.use_ssl,
        config.request_timeout(),
    )?;
    let state = match Orchestrator::new(api)
        .with_shutdown(shutdown_rx.clone())
        .run(&config.provisioning_request())
        .await
    {
        Ok(state) => state,
        Err(e) if e.cancelled => {
            info!(stage = %e.stage, "Stopped during provisioning");
            return Ok(());
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Provisioning failed")),
    };

    let pipeline = Pipeline::start(PipelineSettings::from_config(&config), &state)?;
    pipeline.check_connectivity().await;

    let reporter = tokio::spawn(run_diagnostics_reporter(
        pipeline.counters().clone(),
        config.report_interval(),
    ));

    // One hub state change per stdin line
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<HubStateChange>(line) {
                            Ok(change) => match change.into_event() {
                                Some(event) => {
                                    pipeline.handle_state_change(event);
                                }
                                None => debug!("Ignoring state change without new state"),
                            },
                            Err(e) => warn!(error = %e, "Skipping malformed state change"),
                        }
                    }
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read input");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    // Graceful shutdown: drain queued batches, then stop reporting
    pipeline.shutdown().await;
    reporter.abort();

    let snapshot = pipeline.diagnostics();
    info!(
        events_sent = snapshot.events_sent,
        events_dropped = snapshot.events_dropped,
        connection_status = ?snapshot.connection_status,
        "Hydrolix history shipper stopped"
    );

    Ok(())
}
