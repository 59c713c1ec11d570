//! Service registry and lifecycle.
//!
//! Services are started in registration order and shut down in reverse,
//! one at a time: cancel the service's token, then await its task as the
//! completion acknowledgement, bounded by a deadline.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use std::time::Duration;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run the service until the token is cancelled. Returning an error
    /// marks the whole process as failed.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

pub struct Supervisor {
    running: Vec<(&'static str, CancellationToken, JoinHandle<Result<()>>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            running: Vec::new(),
        }
    }

    pub fn start(&mut self, service: Box<dyn Service>) {
        let name = service.name();
        let token = CancellationToken::new();
        info!(service = name, "starting service");
        self.running
            .push((name, token.clone(), tokio::spawn(service.run(token))));
    }

    /// Block until a termination signal arrives or any service exits on its
    /// own. A premature exit is returned as an error.
    pub async fn wait(&mut self) -> Result<()> {
        if self.running.is_empty() {
            return Ok(());
        }

        let early = {
            let services =
                future::select_all(self.running.iter_mut().map(|(_, _, handle)| handle));
            tokio::select! {
                _ = wait_for_signal() => None,
                (result, index, _) = services => Some((result, index)),
            }
        };

        match early {
            None => Ok(()),
            Some((result, index)) => {
                let (name, _, _) = self.running.remove(index);
                match result {
                    Ok(Ok(())) => Err(anyhow!("service {name} exited unexpectedly")),
                    Ok(Err(e)) => Err(e.context(format!("service {name} failed"))),
                    Err(e) => Err(anyhow!("service {name} panicked: {e}")),
                }
            }
        }
    }

    /// Stop services one at a time in reverse registration order. Returns
    /// whether all of them acknowledged within the deadline.
    pub async fn shutdown_all(&mut self) -> bool {
        info!("shutting down services");

        let mut clean = true;
        for (name, token, handle) in self.running.drain(..).rev() {
            token.cancel();
            match tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await {
                Ok(Ok(Ok(()))) => info!(service = name, "service closed"),
                Ok(Ok(Err(e))) => {
                    error!(service = name, error = %e, "service failed during shutdown");
                    clean = false;
                }
                Ok(Err(e)) => {
                    error!(service = name, error = %e, "service panicked during shutdown");
                    clean = false;
                }
                Err(_) => {
                    warn!(service = name, "service did not close within deadline");
                    clean = false;
                }
            }
        }
        clean
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received SIGINT");
    }
}
