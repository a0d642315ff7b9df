use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use pricewatch_core::{AppConfig, AppCore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::RunArgs;

/// Removes the PID file when the service stops.
struct PidFile(PathBuf);

impl PidFile {
    fn create(path: PathBuf) -> Result<Self> {
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write PID file {:?}", path))?;
        Ok(Self(path))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

pub async fn run(config: AppConfig, args: RunArgs) -> Result<()> {
    let core = Arc::new(AppCore::new(config).await?);
    let runner = core.runner().await?;
    let _pid_file = args.pid_file.map(PidFile::create).transpose()?;

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(core.clone(), shutdown.clone());

    println!("Pricewatch running. Press Ctrl+C to stop.");
    let result = runner.run(shutdown.clone()).await;
    shutdown.cancel();
    core.shutdown().await;

    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "runner failed");
    }
    println!("Pricewatch stopped");
    result
}

/// Ctrl+C and `SIGTERM` stop the service; `SIGHUP` reloads the rules.
fn spawn_signal_handlers(core: Arc<AppCore>, shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let stop = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    error!(error = %err, "failed to listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    stop.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = stop.cancelled() => return,
            }
            stop.cancel();
        });

        tokio::spawn(async move {
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(hangup) => hangup,
                Err(err) => {
                    error!(error = %err, "failed to listen for SIGHUP");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = hangup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        match core.reload_rules() {
                            Ok(count) => info!(count, "rules reloaded"),
                            Err(err) => error!(
                                error = %format!("{err:#}"),
                                "rule reload failed, keeping current rules"
                            ),
                        }
                    }
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        let _ = core;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
            }
            shutdown.cancel();
        });
    }
}
