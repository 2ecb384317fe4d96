//! Careforge Signature Worker
//!
//! Background reconciliation of envelope status:
//! 1. Sweeps documents in the sent state on a fixed interval
//! 2. Polls the signature provider with bounded concurrency
//! 3. Merges results into the lifecycle state machine
//! 4. Moves freshly signed documents into the comparison index

use backoff::{future::retry, ExponentialBackoff};
use careforge_common::{
    bootstrap,
    config::AppConfig,
    metrics,
    workflow::sweep::{run_sweep, SweepStats},
    VERSION,
};
use std::time::Duration;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .json()
        .init();

    info!("Starting Careforge Signature Worker v{}", VERSION);

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
        e
    })?;

    if config.database.backend != "postgres" {
        // The memory store is process-local; a standalone worker would
        // sweep an empty store while the gateway holds the documents.
        warn!(
            backend = %config.database.backend,
            "Store backend is not shared; the gateway runs its own sweep. Exiting."
        );
        return Ok(());
    }

    metrics::register_metrics();

    // Assemble the orchestrator against the shared store
    let services = bootstrap::build(&config).await?;
    let orchestrator = services.orchestrator;

    info!(
        interval_secs = config.workflow.poll_interval_secs,
        concurrency = config.workflow.poll_concurrency,
        "Signature worker ready, starting status sweeps..."
    );

    // Circuit breaker state
    let mut consecutive_failures = 0u32;
    const MAX_FAILURES: u32 = 5;
    const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);

    let mut interval = tokio::time::interval(config.workflow.poll_interval());

    loop {
        // Circuit breaker check
        if consecutive_failures >= MAX_FAILURES {
            warn!(
                failures = consecutive_failures,
                "Circuit breaker open, pausing..."
            );
            tokio::time::sleep(CIRCUIT_BREAK_DURATION).await;
            consecutive_failures = 0;
            info!("Circuit breaker reset, resuming...");
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                // Store-level failures (connection loss) are retried with
                // exponential backoff before counting against the breaker.
                let swept: Result<SweepStats, _> = retry(
                    ExponentialBackoff {
                        max_elapsed_time: Some(Duration::from_secs(60)),
                        ..ExponentialBackoff::default()
                    },
                    || async {
                        run_sweep(&orchestrator, config.workflow.poll_concurrency)
                            .await
                            .map_err(backoff::Error::transient)
                    },
                )
                .await;

                match swept {
                    Ok(stats) => {
                        if stats.all_failed() {
                            consecutive_failures += 1;
                            warn!(
                                failures = consecutive_failures,
                                "Sweep made no progress"
                            );
                        } else {
                            consecutive_failures = 0;
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(error = %e, failures = consecutive_failures, "Sweep failed");
                    }
                }
            }
        }
    }

    info!("Signature worker shutting down");
    Ok(())
}
