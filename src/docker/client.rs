//! Engine operations for challenge instances.
//!
//! Ownership on the engine is label-based: objects carrying
//! `ctf-reverseproxy.resource=true` belong to this proxy, everything else
//! is ignored. Every instance additionally carries its `ctf-reverseproxy.id`.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    RemoveContainerOptions,
};
use bollard::models::{ContainerSummary, EndpointSettings, HostConfig};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use tracing::{debug, info, warn};

use super::compose::{ComposeProject, ValidatedService};
use crate::shared::addr::ContainerAddr;

pub const LABEL_RESOURCE: &str = "ctf-reverseproxy.resource";
pub const LABEL_ID: &str = "ctf-reverseproxy.id";

const ENGINE_TIMEOUT_SECS: u64 = 120;

/// Outcome of one reconciliation pass over the engine.
#[derive(Debug, Default)]
pub struct StateReport {
    /// Addrs of instances with exactly the expected set of services.
    pub healthy: Vec<ContainerAddr>,
    /// Instance ids that were malformed and have been removed.
    pub dirty: Vec<u64>,
    /// Highest instance id observed, for rebasing the allocator.
    pub max_id: u64,
}

pub struct DockerClient {
    docker: Docker,
    project: ComposeProject,
    default_network: String,
    self_id: String,
}

impl DockerClient {
    /// Connect to the engine, resolve the proxy's own container and make
    /// sure the default network exists. Any failure here is fatal.
    pub async fn connect(
        host: &str,
        default_network: &str,
        self_container_name: &str,
        project: ComposeProject,
    ) -> Result<Self> {
        let docker = connect_engine(host)?;
        docker
            .ping()
            .await
            .with_context(|| format!("container engine at {host} is unreachable"))?;

        let self_id = find_container_id(&docker, self_container_name)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "own container {self_container_name:?} not found; \
                     the proxy must run as a container to attach to instance networks"
                )
            })?;

        let client = Self {
            docker,
            project,
            default_network: default_network.to_string(),
            self_id,
        };
        client.ensure_default_network().await?;
        Ok(client)
    }

    pub fn project(&self) -> &ComposeProject {
        &self.project
    }

    async fn ensure_default_network(&self) -> Result<()> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        if networks
            .iter()
            .any(|network| network.name.as_deref() == Some(self.default_network.as_str()))
        {
            debug!(network = %self.default_network, "default network found");
            return Ok(());
        }

        info!(network = %self.default_network, "creating default network");
        self.docker
            .create_network(CreateNetworkOptions {
                name: self.default_network.clone(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Create one full instance: its networks, then its containers in the
    /// compose order. The returned addr routes to the main service.
    pub async fn start_resource(&self, ctf_id: u64) -> Result<ContainerAddr> {
        info!(ctf_id, "starting instance");

        for network in &self.project.networks {
            let network_name = self.instance_network_name(network, ctf_id);
            self.docker
                .create_network(CreateNetworkOptions {
                    name: network_name.clone(),
                    driver: "bridge".to_string(),
                    labels: resource_labels(ctf_id),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("failed to create network {network_name}"))?;

            self.docker
                .connect_network(
                    &network_name,
                    ConnectNetworkOptions {
                        container: self.self_id.clone(),
                        endpoint_config: EndpointSettings::default(),
                    },
                )
                .await
                .with_context(|| format!("failed to attach proxy to network {network_name}"))?;
        }

        for service in &self.project.services {
            let container_name = instance_container_name(service, ctf_id);

            // A stale container of the same name blocks creation.
            match self
                .docker
                .remove_container(
                    &container_name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => warn!(container = %container_name, "removed stale container"),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e).context("failed to remove stale container"),
            }

            let (options, config) = self.container_config(service, ctf_id)?;
            self.docker
                .create_container(Some(options), config)
                .await
                .with_context(|| format!("failed to create container {container_name}"))?;
            self.docker
                .start_container::<String>(&container_name, None)
                .await
                .with_context(|| format!("failed to start container {container_name}"))?;
            debug!(container = %container_name, "container started");
        }

        Ok(self.project.instance_addr(ctf_id))
    }

    /// Remove every container and network belonging to one instance.
    pub async fn stop_resource(&self, ctf_id: u64) -> Result<()> {
        info!(ctf_id, "stopping instance");

        for container in self.list_resource_containers(Some(ctf_id)).await? {
            let Some(id) = container.id else { continue };
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {}
                // Reconciliation may have raced us to it.
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e).context(format!("failed to remove container {id}")),
            }
        }

        for network in self.list_resource_networks(Some(ctf_id)).await? {
            let Some(name) = network.name else { continue };
            self.disconnect_self(&name).await;
            self.docker
                .remove_network(&name)
                .await
                .with_context(|| format!("failed to remove network {name}"))?;
        }

        Ok(())
    }

    /// Enumerate the engine's view of our instances, remove malformed ones
    /// and re-attach the proxy to any instance network it is missing from.
    pub async fn check_state(&self) -> Result<StateReport> {
        let containers = self.list_resource_containers(None).await?;
        let observation = group_instances(&containers, self.project.service_count());

        // Containers with our resource label but no usable id cannot be
        // addressed as an instance; remove them directly.
        for container_id in &observation.orphans {
            warn!(container = %container_id, "removing unlabeled resource container");
            if let Err(e) = self
                .docker
                .remove_container(
                    container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                if !is_not_found(&e) {
                    return Err(e).context("failed to remove orphaned container");
                }
            }
        }

        for ctf_id in &observation.dirty {
            warn!(ctf_id, "removing malformed instance");
            self.stop_resource(*ctf_id).await?;
        }

        self.attach_missing_networks().await?;

        Ok(StateReport {
            healthy: observation
                .healthy
                .iter()
                .map(|id| self.project.instance_addr(*id))
                .collect(),
            dirty: observation.dirty,
            max_id: observation.max_id,
        })
    }

    async fn attach_missing_networks(&self) -> Result<()> {
        for network in self.list_resource_networks(None).await? {
            let Some(name) = network.name else { continue };
            let inspected = self.docker.inspect_network::<String>(&name, None).await?;
            let attached = inspected
                .containers
                .map(|containers| containers.contains_key(&self.self_id))
                .unwrap_or(false);
            if !attached {
                info!(network = %name, "re-attaching proxy to instance network");
                self.docker
                    .connect_network(
                        &name,
                        ConnectNetworkOptions {
                            container: self.self_id.clone(),
                            endpoint_config: EndpointSettings::default(),
                        },
                    )
                    .await
                    .with_context(|| format!("failed to attach proxy to network {name}"))?;
            }
        }
        Ok(())
    }

    /// Shutdown sweep: remove everything carrying the resource label,
    /// regardless of instance id. Best effort, errors are warned.
    pub async fn down(&self) {
        info!("removing all instances");

        match self.list_resource_containers(None).await {
            Ok(containers) => {
                for container in containers {
                    let Some(id) = container.id else { continue };
                    if let Err(e) = self
                        .docker
                        .remove_container(
                            &id,
                            Some(RemoveContainerOptions {
                                force: true,
                                ..Default::default()
                            }),
                        )
                        .await
                    {
                        warn!(container = %id, error = %e, "failed to remove container");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to list containers during shutdown"),
        }

        match self.list_resource_networks(None).await {
            Ok(networks) => {
                for network in networks {
                    let Some(name) = network.name else { continue };
                    self.disconnect_self(&name).await;
                    if let Err(e) = self.docker.remove_network(&name).await {
                        warn!(network = %name, error = %e, "failed to remove network");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to list networks during shutdown"),
        }
    }

    /// Disconnect the proxy from an instance network. Failure only means
    /// we were not attached; it is never fatal.
    async fn disconnect_self(&self, network_name: &str) {
        if let Err(e) = self
            .docker
            .disconnect_network(
                network_name,
                DisconnectNetworkOptions {
                    container: self.self_id.clone(),
                    force: true,
                },
            )
            .await
        {
            warn!(network = %network_name, error = %e, "failed to disconnect proxy from network");
        }
    }

    async fn list_resource_containers(&self, ctf_id: Option<u64>) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: label_filters(ctf_id),
                ..Default::default()
            }))
            .await?;
        Ok(containers)
    }

    async fn list_resource_networks(&self, ctf_id: Option<u64>) -> Result<Vec<bollard::models::Network>> {
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: label_filters(ctf_id),
            }))
            .await?;
        Ok(networks)
    }

    fn instance_network_name(&self, network: &str, ctf_id: u64) -> String {
        format!("{}-{}-{}", self.project.name, network, ctf_id)
    }

    fn container_config(
        &self,
        service: &ValidatedService,
        ctf_id: u64,
    ) -> Result<(CreateContainerOptions<String>, Config<String>)> {
        let container_name = instance_container_name(service, ctf_id);

        let exposed_ports: HashMap<String, HashMap<(), ()>> = service
            .expose
            .iter()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();

        let endpoints: HashMap<String, EndpointSettings> = self
            .project
            .service_networks(service)
            .iter()
            .map(|network| {
                (
                    self.instance_network_name(network, ctf_id),
                    EndpointSettings {
                        // The plain service name resolves inside the instance.
                        aliases: Some(vec![service.name.clone()]),
                        ..Default::default()
                    },
                )
            })
            .collect();

        let env = service.spec.environment.to_pairs();
        let security_opt = service.spec.security_opt.clone();
        let memory = service
            .spec
            .mem_limit
            .as_ref()
            .map(|limit| limit.bytes())
            .transpose()
            .with_context(|| format!("service {} has an invalid mem_limit", service.name))?;

        let host_config = HostConfig {
            memory,
            nano_cpus: service.spec.cpus.map(|cpus| (cpus * 1e9) as i64),
            pids_limit: service.spec.pids_limit,
            security_opt: (!security_opt.is_empty()).then_some(security_opt),
            tmpfs: service
                .tmpfs_map()
                .map(|tmpfs| tmpfs.into_iter().collect()),
            restart_policy: service.restart_policy(),
            ..Default::default()
        };

        let config = Config {
            image: Some(service.image().to_string()),
            hostname: Some(container_name.clone()),
            labels: Some(resource_labels(ctf_id)),
            env: (!env.is_empty()).then_some(env),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            healthcheck: service.healthcheck()?,
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        Ok((
            CreateContainerOptions {
                name: container_name,
                ..Default::default()
            },
            config,
        ))
    }
}

fn connect_engine(host: &str) -> Result<Docker> {
    let docker = if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(path, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)
    } else {
        Docker::connect_with_socket(host, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)
    };
    docker.with_context(|| format!("failed to connect to container engine at {host}"))
}

async fn find_container_id(docker: &Docker, name: &str) -> Result<Option<String>> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![name.to_string()]);
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await?;

    // The name filter matches substrings; require an exact name.
    let wanted = format!("/{name}");
    Ok(containers
        .into_iter()
        .find(|container| {
            container
                .names
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|candidate| candidate == &wanted || candidate == name)
        })
        .and_then(|container| container.id))
}

pub fn instance_container_name(service: &ValidatedService, ctf_id: u64) -> String {
    format!("{}-{}", service.name, ctf_id)
}

pub fn resource_labels(ctf_id: u64) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_RESOURCE.to_string(), "true".to_string());
    labels.insert(LABEL_ID.to_string(), ctf_id.to_string());
    labels
}

fn label_filters(ctf_id: Option<u64>) -> HashMap<String, Vec<String>> {
    let mut labels = vec![format!("{LABEL_RESOURCE}=true")];
    if let Some(ctf_id) = ctf_id {
        labels.push(format!("{LABEL_ID}={ctf_id}"));
    }
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), labels);
    filters
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Observation of the labeled containers, grouped per instance id.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StateObservation {
    pub healthy: Vec<u64>,
    pub dirty: Vec<u64>,
    /// Container ids carrying the resource label but no parseable instance
    /// id; they cannot be grouped and are removed individually.
    pub orphans: Vec<String>,
    pub max_id: u64,
}

/// Group labeled containers by instance id. A group is healthy only when it
/// holds exactly the expected number of services.
pub fn group_instances(
    containers: &[ContainerSummary],
    expected_services: usize,
) -> StateObservation {
    let mut groups: HashMap<u64, usize> = HashMap::new();
    let mut observation = StateObservation::default();

    for container in containers {
        let ctf_id = container
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_ID))
            .and_then(|raw| raw.parse::<u64>().ok());
        match ctf_id {
            Some(ctf_id) => *groups.entry(ctf_id).or_default() += 1,
            None => {
                if let Some(id) = &container.id {
                    observation.orphans.push(id.clone());
                }
            }
        }
    }

    for (ctf_id, count) in groups {
        observation.max_id = observation.max_id.max(ctf_id);
        if count == expected_services {
            observation.healthy.push(ctf_id);
        } else {
            observation.dirty.push(ctf_id);
        }
    }
    observation.healthy.sort_unstable();
    observation.dirty.sort_unstable();
    observation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(ctf_id: Option<&str>, container_id: &str) -> ContainerSummary {
        let labels = match ctf_id {
            Some(id) => {
                let mut labels = HashMap::new();
                labels.insert(LABEL_RESOURCE.to_string(), "true".to_string());
                labels.insert(LABEL_ID.to_string(), id.to_string());
                Some(labels)
            }
            None => Some(HashMap::from([(
                LABEL_RESOURCE.to_string(),
                "true".to_string(),
            )])),
        };
        ContainerSummary {
            id: Some(container_id.to_string()),
            labels,
            ..Default::default()
        }
    }

    #[test]
    fn complete_groups_are_healthy() {
        let containers = vec![
            summary(Some("1"), "a"),
            summary(Some("1"), "b"),
            summary(Some("2"), "c"),
            summary(Some("2"), "d"),
        ];
        let observation = group_instances(&containers, 2);
        assert_eq!(observation.healthy, vec![1, 2]);
        assert!(observation.dirty.is_empty());
        assert_eq!(observation.max_id, 2);
    }

    #[test]
    fn incomplete_groups_are_dirty() {
        let containers = vec![
            summary(Some("1"), "a"),
            summary(Some("1"), "b"),
            summary(Some("3"), "c"),
        ];
        let observation = group_instances(&containers, 2);
        assert_eq!(observation.healthy, vec![1]);
        assert_eq!(observation.dirty, vec![3]);
        assert_eq!(observation.max_id, 3);
    }

    #[test]
    fn oversized_groups_are_dirty() {
        let containers = vec![
            summary(Some("4"), "a"),
            summary(Some("4"), "b"),
            summary(Some("4"), "c"),
        ];
        let observation = group_instances(&containers, 2);
        assert!(observation.healthy.is_empty());
        assert_eq!(observation.dirty, vec![4]);
        assert_eq!(observation.max_id, 4);
    }

    #[test]
    fn unparseable_ids_become_orphans() {
        let containers = vec![summary(None, "orphan"), summary(Some("x"), "bad")];
        let observation = group_instances(&containers, 1);
        assert_eq!(observation.orphans, vec!["orphan", "bad"]);
        assert!(observation.healthy.is_empty());
        assert_eq!(observation.max_id, 0);
    }

    #[test]
    fn empty_observation_rebases_nothing() {
        let observation = group_instances(&[], 2);
        assert_eq!(observation, StateObservation::default());
    }

    #[test]
    fn label_filters_narrow_by_id() {
        let base = label_filters(None);
        assert_eq!(base["label"], vec!["ctf-reverseproxy.resource=true"]);

        let scoped = label_filters(Some(7));
        assert_eq!(
            scoped["label"],
            vec![
                "ctf-reverseproxy.resource=true".to_string(),
                "ctf-reverseproxy.id=7".to_string()
            ]
        );
    }
}
