//! Metrics collector: one more bus consumer, folding metric topics into
//! Prometheus gauges and counters. The management server renders the
//! registry on `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcast::Bus;
use crate::shared::addr::ContainerAddr;
use crate::supervisor::Service;

pub struct MetricsService {
    registry: Arc<Registry>,

    project_size: IntGauge,
    projects_running: IntGauge,
    containers_running: IntGauge,
    sessions: IntGauge,
    sessions_total: IntCounter,
    http_requests_total: IntCounter,

    /// Containers per instance, cached to derive the container gauge from
    /// the instance count.
    project_size_value: i64,

    session_start: mpsc::Receiver<()>,
    session_stop: mpsc::Receiver<ContainerAddr>,
    docker_project_size: mpsc::Receiver<usize>,
    docker_state: mpsc::Receiver<usize>,
    proxy_time: mpsc::Receiver<Duration>,
}

impl MetricsService {
    pub fn new(bus: &Bus) -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let project_size = IntGauge::with_opts(Opts::new(
            "ctf_reverseproxy_project_size",
            "Size of the current project deployed by the reverse proxy",
        ))?;
        let containers_running = IntGauge::with_opts(Opts::new(
            "ctf_reverseproxy_containers",
            "Number of current containers handled by the reverse proxy",
        ))?;
        let projects_running = IntGauge::with_opts(Opts::new(
            "ctf_reverseproxy_projects",
            "Number of current projects handled by the reverse proxy",
        ))?;
        let sessions = IntGauge::with_opts(Opts::new(
            "ctf_reverseproxy_sessions",
            "Number of current sessions",
        ))?;
        let sessions_total = IntCounter::with_opts(Opts::new(
            "ctf_reverseproxy_sessions_total",
            "Number of total sessions served",
        ))?;
        let http_requests_total = IntCounter::with_opts(Opts::new(
            "ctf_reverseproxy_http_request_proxy_total",
            "Number of total http requests served",
        ))?;

        registry.register(Box::new(project_size.clone()))?;
        registry.register(Box::new(containers_running.clone()))?;
        registry.register(Box::new(projects_running.clone()))?;
        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;

        Ok(Self {
            registry,
            project_size,
            projects_running,
            containers_running,
            sessions,
            sessions_total,
            http_requests_total,
            project_size_value: 0,
            session_start: bus.session_metric_start.subscribe(),
            session_stop: bus.session_stop.subscribe(),
            docker_project_size: bus.docker_metric_project_size.subscribe(),
            docker_state: bus.docker_metric_state.subscribe(),
            proxy_time: bus.proxy_metric_time.subscribe(),
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    async fn run_loop(mut self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("metrics collector closed");
                    return Ok(());
                }
                Some(()) = self.session_start.recv() => {
                    self.sessions.inc();
                    self.sessions_total.inc();
                }
                Some(_) = self.session_stop.recv() => self.sessions.dec(),
                Some(size) = self.docker_project_size.recv() => {
                    self.project_size_value = size as i64;
                    self.project_size.set(self.project_size_value);
                }
                Some(projects) = self.docker_state.recv() => {
                    self.projects_running.set(projects as i64);
                    self.containers_running.set(projects as i64 * self.project_size_value);
                }
                Some(_) = self.proxy_time.recv() => self.http_requests_total.inc(),
            }
        }
    }
}

#[async_trait]
impl Service for MetricsService {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("starting metrics collector");
        self.run_loop(shutdown).await
    }
}
