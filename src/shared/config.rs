use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::Deserialize;

const CONFIG_FILE: &str = "config.yaml";
const CONFIG_DIRS: [&str; 2] = [".", "/etc/ctf-reverseproxy"];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub reverseproxy: ReverseProxyConfig,
    #[serde(default)]
    pub mgmt: MgmtConfig,
    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReverseProxyConfig {
    pub host: String,
    pub port: u16,
    pub session: SessionConfig,
    /// Number of warm instances kept ready for new sessions.
    pub pool: usize,
}

impl Default for ReverseProxyConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8000,
            session: SessionConfig::default(),
            pool: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Header carrying the session id on data-plane requests.
    pub header: String,
    pub salt: String,
    /// Session TTL in seconds.
    pub timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            header: "X-Session-Id".to_string(),
            salt: String::new(),
            timeout: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    pub host: String,
    pub port: u16,
    /// Bearer credential expected in the X-Management-Key header.
    pub key: String,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8080,
            key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub host: String,
    /// Default bridge network, created at startup if missing.
    pub network: String,
    /// Name of the container this proxy runs in, used for network attach.
    #[serde(rename = "container-name")]
    pub container_name: String,
    pub compose: ComposeConfig,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: "unix:///var/run/docker.sock".to_string(),
            network: "ctf-bridge".to_string(),
            container_name: String::new(),
            compose: ComposeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    pub workdir: String,
    pub file: String,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            workdir: ".".to_string(),
            file: "docker-compose.yml".to_string(),
        }
    }
}

impl Config {
    /// Load `config.yaml` from the working directory, falling back to
    /// `/etc/ctf-reverseproxy/`. A missing file is a fatal startup error.
    pub fn load() -> Result<Self> {
        let path = CONFIG_DIRS
            .iter()
            .map(|dir| Path::new(dir).join(CONFIG_FILE))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                anyhow!(
                    "config file was not found; place {CONFIG_FILE} in the \
                     working directory or /etc/ctf-reverseproxy/"
                )
            })?;
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config at {}: {}", path.display(), e))?;
        Self::from_yaml(&data).map_err(|e| anyhow!("invalid config at {}: {}", path.display(), e))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.reverseproxy.session.salt.is_empty() {
            return Err(anyhow!(
                "the session salt is not set; set reverseproxy.session.salt in the config file"
            ));
        }
        if self.reverseproxy.pool == 0 {
            return Err(anyhow!(
                "the pool size is not set; set reverseproxy.pool to at least 1"
            ));
        }
        if self.mgmt.key.is_empty() {
            return Err(anyhow!(
                "the management key is not set; set mgmt.key in the config file"
            ));
        }
        if self.docker.container_name.is_empty() {
            return Err(anyhow!(
                "the proxy container name is not set; set docker.container-name in the config file"
            ));
        }
        Ok(())
    }

}

/// An empty host means "all interfaces".
pub fn listen_addr(host: &str, port: u16) -> String {
    if host.is_empty() {
        format!("0.0.0.0:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
reverseproxy:
  session:
    salt: pepper
  pool: 2
mgmt:
  key: hunter2
docker:
  container-name: ctf-reverseproxy
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.reverseproxy.port, 8000);
        assert_eq!(config.reverseproxy.session.header, "X-Session-Id");
        assert_eq!(config.reverseproxy.session.timeout, 300);
        assert_eq!(config.reverseproxy.pool, 2);
        assert_eq!(config.mgmt.port, 8080);
        assert_eq!(config.docker.host, "unix:///var/run/docker.sock");
        assert_eq!(config.docker.network, "ctf-bridge");
        assert_eq!(config.docker.compose.file, "docker-compose.yml");
    }

    #[test]
    fn missing_salt_is_fatal() {
        let err = Config::from_yaml(
            "reverseproxy:\n  pool: 1\nmgmt:\n  key: k\ndocker:\n  container-name: c\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("session salt"));
    }

    #[test]
    fn missing_pool_is_fatal() {
        let err = Config::from_yaml(
            "reverseproxy:\n  session:\n    salt: s\nmgmt:\n  key: k\ndocker:\n  container-name: c\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("pool"));
    }

    #[test]
    fn missing_mgmt_key_is_fatal() {
        let err = Config::from_yaml(
            "reverseproxy:\n  session:\n    salt: s\n  pool: 1\ndocker:\n  container-name: c\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("management key"));
    }

    #[test]
    fn missing_container_name_is_fatal() {
        let err =
            Config::from_yaml("reverseproxy:\n  session:\n    salt: s\n  pool: 1\nmgmt:\n  key: k\n")
                .unwrap_err();
        assert!(err.to_string().contains("container name"));
    }

    #[test]
    fn listen_addr_defaults_to_all_interfaces() {
        assert_eq!(listen_addr("", 8000), "0.0.0.0:8000");
        assert_eq!(listen_addr("127.0.0.1", 8080), "127.0.0.1:8080");
    }
}
