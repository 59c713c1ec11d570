mod broadcast;
mod docker;
mod http;
mod metrics;
mod sessionmanager;
mod shared;
mod supervisor;

use anyhow::Result;
use tracing::{error, info};

use broadcast::Bus;
use docker::compose::ComposeProject;
use docker::DockerService;
use http::mgmt::MgmtServer;
use http::reverseproxy::ProxyServer;
use metrics::MetricsService;
use sessionmanager::SessionManager;
use shared::config::Config;
use supervisor::Supervisor;

/// Capacity of the RPC command channel into the session manager.
const COMMAND_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = shared::logging::init_service_logging("logs", "ctf-reverseproxy");

    let config = Config::load()?;
    let project = ComposeProject::load(
        &config.docker.compose.workdir,
        &config.docker.compose.file,
    )?;
    info!(
        main = %project.main().name,
        services = project.service_count(),
        pool = config.reverseproxy.pool,
        "challenge project loaded"
    );

    let bus = Bus::new();
    let (sessions, commands) = sessionmanager::request::channel(COMMAND_QUEUE);

    // Construction order matters: every service subscribes to its topics
    // here, before any loop starts publishing.
    let docker_service = DockerService::new(&config, project, bus.clone()).await?;
    let session_manager = SessionManager::new(&config, bus.clone(), commands);
    let metrics_service = MetricsService::new(&bus)?;
    let registry = metrics_service.registry();
    let mgmt_server = MgmtServer::new(&config, sessions.clone(), registry);
    let proxy_server = ProxyServer::new(&config, sessions, bus.clone());

    let mut supervisor = Supervisor::new();
    supervisor.start(Box::new(docker_service));
    supervisor.start(Box::new(session_manager));
    supervisor.start(Box::new(metrics_service));
    supervisor.start(Box::new(mgmt_server));
    supervisor.start(Box::new(proxy_server));

    let outcome = supervisor.wait().await;
    let clean = supervisor.shutdown_all().await;

    if let Err(e) = outcome {
        error!(error = %e, "exiting after service failure");
        return Err(e);
    }
    if !clean {
        error!("shutdown did not complete cleanly");
        std::process::exit(1);
    }
    info!("shutdown complete");
    Ok(())
}
