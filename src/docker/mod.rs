//! Lifecycle controller: provisions and destroys challenge instances and
//! reconciles desired versus observed engine state every tick.
//!
//! The controller is the only component talking to the container engine, so
//! the engine sees at most one control-plane command from this process at a
//! time. Engine mutation errors are fatal; a control plane that diverged
//! from reality cannot be recovered from locally.

pub mod client;
pub mod compose;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broadcast::Bus;
use crate::shared::addr::ContainerAddr;
use crate::shared::config::Config;
use crate::supervisor::Service;
use self::client::DockerClient;
use self::compose::ComposeProject;

/// Reconciliation cadence.
const STATE_PERIOD: Duration = Duration::from_secs(5);

pub struct DockerService {
    client: DockerClient,
    bus: Arc<Bus>,
    session_request: mpsc::Receiver<()>,
    session_stop: mpsc::Receiver<ContainerAddr>,
    /// Last allocated instance id; strictly monotonic for the lifetime of
    /// the process, rebased above anything observed on the engine.
    current_id: u64,
}

impl DockerService {
    /// Connect to the engine and prepare the controller. The compose
    /// description must already be validated.
    pub async fn new(config: &Config, project: ComposeProject, bus: Arc<Bus>) -> Result<Self> {
        let client = DockerClient::connect(
            &config.docker.host,
            &config.docker.network,
            &config.docker.container_name,
            project,
        )
        .await?;

        let session_request = bus.session_request.subscribe();
        let session_stop = bus.session_stop.subscribe();
        Ok(Self {
            client,
            bus,
            session_request,
            session_stop,
            current_id: 0,
        })
    }

    async fn run_loop(mut self, shutdown: CancellationToken) -> Result<()> {
        self.bus
            .docker_metric_project_size
            .broadcast(self.client.project().service_count());

        let mut ticker = tokio::time::interval(STATE_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.client.down().await;
                    info!("lifecycle controller closed");
                    return Ok(());
                }
                Some(()) = self.session_request.recv() => self.provision().await?,
                Some(addr) = self.session_stop.recv() => self.destroy(addr).await?,
                _ = ticker.tick() => self.reconcile().await?,
            }
        }
    }

    async fn provision(&mut self) -> Result<()> {
        self.current_id += 1;
        let ctf_id = self.current_id;
        match self.client.start_resource(ctf_id).await {
            Ok(addr) => {
                info!(%addr, "instance ready");
                self.bus.docker_ready.broadcast(addr);
                Ok(())
            }
            Err(e) => {
                error!(ctf_id, error = %e, "failed to provision instance");
                Err(e)
            }
        }
    }

    async fn destroy(&mut self, addr: ContainerAddr) -> Result<()> {
        self.client.stop_resource(addr.ctf_id).await?;
        self.bus.docker_stop.broadcast(addr);
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<()> {
        let report = self.client.check_state().await?;

        for ctf_id in report.dirty {
            // The instance is already gone from the engine; let the session
            // manager reconcile its own tables.
            self.bus
                .docker_stop
                .broadcast(self.client.project().instance_addr(ctf_id));
        }

        if report.max_id > self.current_id {
            info!(
                from = self.current_id,
                to = report.max_id,
                "rebasing instance id allocator"
            );
            self.current_id = report.max_id;
        }

        self.bus.docker_metric_state.broadcast(report.healthy.len());
        self.bus
            .docker_state
            .broadcast(report.healthy.into_iter().collect());
        Ok(())
    }
}

#[async_trait]
impl Service for DockerService {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("starting lifecycle controller");
        self.run_loop(shutdown).await
    }
}
