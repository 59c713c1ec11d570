//! Compose description model and one-shot validation.
//!
//! The challenge is described by a compose-style file. It is parsed into a
//! dedicated model (not the engine API types), validated once at startup
//! and then retained for the life of the process. Violations are fatal
//! with a descriptive message.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bollard::models::{HealthConfig, RestartPolicy, RestartPolicyNameEnum};
use serde::Deserialize;
use tracing::{info, warn};

use crate::shared::addr::ContainerAddr;

/// Annotation marking the service the proxy routes to.
pub const MAIN_SERVICE_ANNOTATION: &str = "ctf-reverseproxy";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default)]
    pub networks: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub volumes: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceSpec {
    pub image: Option<String>,
    #[serde(default)]
    pub expose: Vec<ExposeEntry>,
    #[serde(default)]
    pub ports: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub volumes: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub environment: ListOrMap,
    #[serde(default)]
    pub annotations: ListOrMap,
    pub healthcheck: Option<HealthcheckSpec>,
    #[serde(default)]
    pub security_opt: Vec<String>,
    #[serde(default)]
    pub tmpfs: OneOrMany,
    pub restart: Option<String>,
    pub mem_limit: Option<ByteValue>,
    pub cpus: Option<f64>,
    pub pids_limit: Option<i64>,
    #[serde(default)]
    pub networks: ListOrMap,
}

/// `expose` entries may be numbers or strings like `"8080/tcp"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExposeEntry {
    Port(u16),
    Spec(String),
}

impl ExposeEntry {
    pub fn port(&self) -> Result<u16> {
        match self {
            ExposeEntry::Port(port) => Ok(*port),
            ExposeEntry::Spec(spec) => {
                let number = spec.split('/').next().unwrap_or(spec);
                number
                    .parse()
                    .map_err(|_| anyhow!("invalid expose entry {spec:?}"))
            }
        }
    }
}

/// Compose allows `key: value` mappings or `["key=value"]` lists for
/// environment, annotations and service networks.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(untagged)]
pub enum ListOrMap {
    #[default]
    Empty,
    List(Vec<String>),
    Map(BTreeMap<String, Option<ScalarValue>>),
}

/// YAML scalars show up as strings, numbers or booleans.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    String(String),
    Number(serde_yaml::Number),
    Bool(bool),
}

impl ScalarValue {
    fn render(&self) -> String {
        match self {
            ScalarValue::String(s) => s.clone(),
            ScalarValue::Number(n) => n.to_string(),
            ScalarValue::Bool(b) => b.to_string(),
        }
    }
}

impl ListOrMap {
    pub fn is_empty(&self) -> bool {
        match self {
            ListOrMap::Empty => true,
            ListOrMap::List(items) => items.is_empty(),
            ListOrMap::Map(map) => map.is_empty(),
        }
    }

    /// `KEY=VALUE` pairs, the engine API form.
    pub fn to_pairs(&self) -> Vec<String> {
        match self {
            ListOrMap::Empty => Vec::new(),
            ListOrMap::List(items) => items.clone(),
            ListOrMap::Map(map) => map
                .iter()
                .map(|(key, value)| match value {
                    Some(value) => format!("{key}={}", value.render()),
                    None => key.clone(),
                })
                .collect(),
        }
    }

    /// Keys only, for mapping-form network lists.
    pub fn keys(&self) -> Vec<String> {
        match self {
            ListOrMap::Empty => Vec::new(),
            ListOrMap::List(items) => items.clone(),
            ListOrMap::Map(map) => map.keys().cloned().collect(),
        }
    }

    pub fn get(&self, wanted: &str) -> Option<String> {
        match self {
            ListOrMap::Empty => None,
            ListOrMap::List(items) => items.iter().find_map(|item| {
                let (key, value) = item.split_once('=').unwrap_or((item.as_str(), ""));
                (key == wanted).then(|| value.to_string())
            }),
            ListOrMap::Map(map) => map
                .get(wanted)
                .map(|value| value.as_ref().map(ScalarValue::render).unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(untagged)]
pub enum OneOrMany {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn items(&self) -> Vec<String> {
        match self {
            OneOrMany::None => Vec::new(),
            OneOrMany::One(item) => vec![item.clone()],
            OneOrMany::Many(items) => items.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthcheckSpec {
    pub test: Option<HealthcheckTest>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub start_period: Option<String>,
    pub retries: Option<i64>,
    #[serde(default)]
    pub disable: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    Command(String),
    Argv(Vec<String>),
}

/// Byte quantities may be plain numbers or strings like `"512m"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ByteValue {
    Bytes(i64),
    Human(String),
}

impl ByteValue {
    pub fn bytes(&self) -> Result<i64> {
        match self {
            ByteValue::Bytes(bytes) => Ok(*bytes),
            ByteValue::Human(human) => parse_bytes(human),
        }
    }
}

/// One service of the validated project, with its exposed ports resolved.
#[derive(Debug, Clone)]
pub struct ValidatedService {
    pub name: String,
    pub spec: ServiceSpec,
    pub expose: Vec<u16>,
}

/// The validated challenge description.
#[derive(Debug, Clone)]
pub struct ComposeProject {
    /// Project name, used to prefix per-instance network names.
    pub name: String,
    /// Services in deterministic creation order.
    pub services: Vec<ValidatedService>,
    /// Network base names; a project without explicit networks gets one
    /// implicit `default` network.
    pub networks: Vec<String>,
    main_service: usize,
}

impl ComposeProject {
    pub fn load(workdir: &str, file: &str) -> Result<Self> {
        let path = Path::new(workdir).join(file);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed to read compose file at {}", path.display()))?;
        let name = Path::new(workdir)
            .canonicalize()
            .ok()
            .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "ctf".to_string());
        Self::from_yaml(&sanitize_name(&name), &data)
            .with_context(|| format!("invalid compose file at {}", path.display()))
    }

    pub fn from_yaml(project_name: &str, data: &str) -> Result<Self> {
        let file: ComposeFile = serde_yaml::from_str(data)?;
        Self::validate(project_name, file)
    }

    fn validate(project_name: &str, file: ComposeFile) -> Result<Self> {
        if file.services.is_empty() {
            bail!("the compose file defines no services");
        }
        if !file.volumes.is_empty() {
            bail!("volumes are not supported; remove the top-level volumes section");
        }

        let mut services = Vec::with_capacity(file.services.len());
        let mut main_service = None;

        for (index, (name, spec)) in file.services.into_iter().enumerate() {
            if spec.image.as_deref().unwrap_or("").is_empty() {
                bail!("service {name} does not specify an image");
            }
            if !spec.ports.is_empty() {
                bail!("service {name} has ports exposed; use the expose directive instead");
            }
            if !spec.volumes.is_empty() {
                bail!("service {name} uses volumes, which are not supported");
            }

            if spec
                .annotations
                .get(MAIN_SERVICE_ANNOTATION)
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
            {
                if main_service.is_some() {
                    bail!(
                        "multiple services carry the {MAIN_SERVICE_ANNOTATION} annotation; \
                         only one service can be the main service"
                    );
                }
                main_service = Some(index);
            }

            let expose = spec
                .expose
                .iter()
                .map(ExposeEntry::port)
                .collect::<Result<Vec<u16>>>()
                .with_context(|| format!("service {name} has an invalid expose entry"))?;

            for network in spec.networks.keys() {
                if !file.networks.contains_key(&network) {
                    bail!("service {name} references undeclared network {network}");
                }
            }

            services.push(ValidatedService { name, spec, expose });
        }

        let main_service = main_service.ok_or_else(|| {
            anyhow!(
                "no service carries the {MAIN_SERVICE_ANNOTATION} annotation; \
                 annotate the service the proxy should route to"
            )
        })?;

        let main = &services[main_service];
        if main.expose.is_empty() {
            bail!(
                "main service {} does not expose a port; the proxy needs a target",
                main.name
            );
        }
        if main.expose.len() > 1 {
            warn!(
                service = %main.name,
                port = main.expose[0],
                "main service exposes multiple ports, using the first"
            );
        }

        let mut networks: Vec<String> = file.networks.keys().cloned().collect();
        if networks.is_empty() {
            networks.push("default".to_string());
        }

        info!(main = %main.name, services = services.len(), "compose file validated");
        Ok(Self {
            name: project_name.to_string(),
            services,
            networks,
            main_service,
        })
    }

    pub fn main(&self) -> &ValidatedService {
        &self.services[self.main_service]
    }

    pub fn main_port(&self) -> u16 {
        self.main().expose[0]
    }

    /// Number of containers a healthy instance consists of.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn instance_addr(&self, ctf_id: u64) -> ContainerAddr {
        ContainerAddr::new(self.main().name.clone(), ctf_id, self.main_port())
    }

    /// Networks a service attaches to; a service naming none joins all of
    /// the project's networks.
    pub fn service_networks(&self, service: &ValidatedService) -> Vec<String> {
        let named = service.spec.networks.keys();
        if named.is_empty() {
            self.networks.clone()
        } else {
            named
        }
    }
}

impl ValidatedService {
    pub fn image(&self) -> &str {
        self.spec.image.as_deref().unwrap_or_default()
    }

    pub fn healthcheck(&self) -> Result<Option<HealthConfig>> {
        let Some(spec) = &self.spec.healthcheck else {
            return Ok(None);
        };
        if spec.disable {
            return Ok(Some(HealthConfig {
                test: Some(vec!["NONE".to_string()]),
                ..Default::default()
            }));
        }
        let test = match &spec.test {
            None => None,
            Some(HealthcheckTest::Command(command)) => {
                Some(vec!["CMD-SHELL".to_string(), command.clone()])
            }
            Some(HealthcheckTest::Argv(argv)) => Some(argv.clone()),
        };
        let interval = spec.interval.as_deref().map(parse_duration).transpose()?;
        let timeout = spec.timeout.as_deref().map(parse_duration).transpose()?;
        let start_period = spec
            .start_period
            .as_deref()
            .map(parse_duration)
            .transpose()?;
        Ok(Some(HealthConfig {
            test,
            interval: interval.map(duration_nanos),
            timeout: timeout.map(duration_nanos),
            start_period: start_period.map(duration_nanos),
            retries: spec.retries,
            ..Default::default()
        }))
    }

    pub fn restart_policy(&self) -> Option<RestartPolicy> {
        let restart = self.spec.restart.as_deref()?;
        let (name, attempts) = restart.split_once(':').unwrap_or((restart, ""));
        let name = match name {
            "no" => RestartPolicyNameEnum::NO,
            "always" => RestartPolicyNameEnum::ALWAYS,
            "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
            "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
            other => {
                warn!(service = %self.name, restart = other, "unknown restart policy, ignoring");
                return None;
            }
        };
        Some(RestartPolicy {
            name: Some(name),
            maximum_retry_count: attempts.parse().ok(),
        })
    }

    /// Per-service tmpfs mounts as the engine expects them: path mapped to
    /// mount options.
    pub fn tmpfs_map(&self) -> Option<BTreeMap<String, String>> {
        let items = self.spec.tmpfs.items();
        if items.is_empty() {
            return None;
        }
        Some(
            items
                .into_iter()
                .map(|entry| {
                    let (path, options) = entry.split_once(':').unwrap_or((entry.as_str(), ""));
                    (path.to_string(), options.to_string())
                })
                .collect(),
        )
    }
}

fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Parse compose-style durations such as `10s`, `1m30s` or `500ms`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty duration");
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut unit = String::new();

    let mut flush = |digits: &mut String, unit: &mut String| -> Result<()> {
        if digits.is_empty() {
            bail!("invalid duration {input:?}");
        }
        let value: u64 = digits.parse()?;
        let scaled = match unit.as_str() {
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" | "" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            "us" => Duration::from_micros(value),
            "ns" => Duration::from_nanos(value),
            other => bail!("unknown duration unit {other:?} in {input:?}"),
        };
        total += scaled;
        digits.clear();
        unit.clear();
        Ok(())
    };

    for c in input.chars() {
        if c.is_ascii_digit() {
            if !unit.is_empty() {
                flush(&mut digits, &mut unit)?;
            }
            digits.push(c);
        } else {
            unit.push(c);
        }
    }
    flush(&mut digits, &mut unit)?;
    Ok(total)
}

/// Parse byte quantities such as `512m` or `2g` (binary multiples).
pub fn parse_bytes(input: &str) -> Result<i64> {
    let input = input.trim().to_ascii_lowercase();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: i64 = digits
        .parse()
        .map_err(|_| anyhow!("invalid byte quantity {input:?}"))?;
    let multiplier: i64 = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        other => bail!("unknown byte unit {other:?} in {input:?}"),
    };
    Ok(value * multiplier)
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "ctf".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
services:
  web:
    image: ctf/web:latest
    expose:
      - 8080
      - "9090/tcp"
    annotations:
      ctf-reverseproxy: "true"
    environment:
      FLAG: "CTF{demo}"
      DEBUG: 1
    networks:
      - front
  db:
    image: postgres:16
    expose:
      - 5432
    environment:
      - POSTGRES_PASSWORD=secret
    networks:
      - back
networks:
  front: {}
  back: {}
"#;

    #[test]
    fn valid_project_identifies_main_service() {
        let project = ComposeProject::from_yaml("demo", VALID).unwrap();
        assert_eq!(project.main().name, "web");
        assert_eq!(project.main_port(), 8080);
        assert_eq!(project.service_count(), 2);
        assert_eq!(project.networks, vec!["back", "front"]);
        assert_eq!(project.instance_addr(3).to_string(), "web-3:8080");
    }

    #[test]
    fn environment_accepts_both_forms() {
        let project = ComposeProject::from_yaml("demo", VALID).unwrap();
        let web = project.main();
        let mut env = web.spec.environment.to_pairs();
        env.sort();
        assert_eq!(env, vec!["DEBUG=1", "FLAG=CTF{demo}"]);

        let db = &project.services[0];
        assert_eq!(db.name, "db");
        assert_eq!(db.spec.environment.to_pairs(), vec!["POSTGRES_PASSWORD=secret"]);
    }

    #[test]
    fn missing_annotation_is_rejected() {
        let yaml = "services:\n  web:\n    image: img\n    expose: [80]\n";
        let err = ComposeProject::from_yaml("demo", yaml).unwrap_err();
        assert!(err.to_string().contains("annotation"));
    }

    #[test]
    fn duplicate_annotation_is_rejected() {
        let yaml = r#"
services:
  a:
    image: img
    expose: [80]
    annotations:
      ctf-reverseproxy: "true"
  b:
    image: img
    expose: [81]
    annotations:
      ctf-reverseproxy: "true"
"#;
        let err = ComposeProject::from_yaml("demo", yaml).unwrap_err();
        assert!(err.to_string().contains("only one service"));
    }

    #[test]
    fn published_ports_are_rejected() {
        let yaml = r#"
services:
  web:
    image: img
    ports:
      - "8080:80"
    annotations:
      ctf-reverseproxy: "true"
"#;
        let err = ComposeProject::from_yaml("demo", yaml).unwrap_err();
        assert!(err.to_string().contains("expose directive"));
    }

    #[test]
    fn volumes_are_rejected() {
        let global = "services:\n  web:\n    image: img\nvolumes:\n  data: {}\n";
        assert!(ComposeProject::from_yaml("demo", global)
            .unwrap_err()
            .to_string()
            .contains("volumes"));

        let per_service = r#"
services:
  web:
    image: img
    expose: [80]
    volumes:
      - ./data:/data
    annotations:
      ctf-reverseproxy: "true"
"#;
        assert!(ComposeProject::from_yaml("demo", per_service)
            .unwrap_err()
            .to_string()
            .contains("volumes"));
    }

    #[test]
    fn missing_image_is_rejected() {
        let yaml = r#"
services:
  web:
    expose: [80]
    annotations:
      ctf-reverseproxy: "true"
"#;
        let err = ComposeProject::from_yaml("demo", yaml).unwrap_err();
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn main_service_must_expose_a_port() {
        let yaml = r#"
services:
  web:
    image: img
    annotations:
      ctf-reverseproxy: "true"
"#;
        let err = ComposeProject::from_yaml("demo", yaml).unwrap_err();
        assert!(err.to_string().contains("expose"));
    }

    #[test]
    fn undeclared_network_is_rejected() {
        let yaml = r#"
services:
  web:
    image: img
    expose: [80]
    networks: [ghost]
    annotations:
      ctf-reverseproxy: "true"
"#;
        let err = ComposeProject::from_yaml("demo", yaml).unwrap_err();
        assert!(err.to_string().contains("undeclared network"));
    }

    #[test]
    fn project_without_networks_gets_a_default() {
        let yaml = r#"
services:
  web:
    image: img
    expose: [80]
    annotations:
      ctf-reverseproxy: "true"
"#;
        let project = ComposeProject::from_yaml("demo", yaml).unwrap();
        assert_eq!(project.networks, vec!["default"]);
        assert_eq!(
            project.service_networks(project.main()),
            vec!["default".to_string()]
        );
    }

    #[test]
    fn healthcheck_translates_to_engine_form() {
        let yaml = r#"
services:
  web:
    image: img
    expose: [80]
    annotations:
      ctf-reverseproxy: "true"
    healthcheck:
      test: curl -f http://localhost/
      interval: 1m30s
      timeout: 10s
      retries: 3
"#;
        let project = ComposeProject::from_yaml("demo", yaml).unwrap();
        let health = project.main().healthcheck().unwrap().unwrap();
        assert_eq!(
            health.test,
            Some(vec![
                "CMD-SHELL".to_string(),
                "curl -f http://localhost/".to_string()
            ])
        );
        assert_eq!(health.interval, Some(90_000_000_000));
        assert_eq!(health.timeout, Some(10_000_000_000));
        assert_eq!(health.retries, Some(3));
    }

    #[test]
    fn restart_policy_parses_attempts() {
        let service = ValidatedService {
            name: "web".to_string(),
            spec: ServiceSpec {
                restart: Some("on-failure:3".to_string()),
                ..Default::default()
            },
            expose: vec![],
        };
        let policy = service.restart_policy().unwrap();
        assert_eq!(policy.name, Some(RestartPolicyNameEnum::ON_FAILURE));
        assert_eq!(policy.maximum_retry_count, Some(3));
    }

    #[test]
    fn durations_and_bytes_parse() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("abc").is_err());

        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert_eq!(parse_bytes("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_bytes("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_bytes("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_bytes("10x").is_err());
    }
}
