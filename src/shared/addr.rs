use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Serialize, Serializer};

/// Address of one running challenge instance, resolvable through the
/// container DNS of the networks the proxy is attached to.
///
/// The textual form is `<service>-<ctfId>:<port>`. Events on the bus carry
/// the structured form so consumers never have to parse ids back out of
/// strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerAddr {
    pub service: String,
    pub ctf_id: u64,
    pub port: u16,
}

impl ContainerAddr {
    pub fn new(service: impl Into<String>, ctf_id: u64, port: u16) -> Self {
        Self {
            service: service.into(),
            ctf_id,
            port,
        }
    }

    /// Hostname half of the address, `<service>-<ctfId>`. This is also the
    /// container name of the main service of the instance.
    pub fn host(&self) -> String {
        format!("{}-{}", self.service, self.ctf_id)
    }
}

impl fmt::Display for ContainerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{}", self.service, self.ctf_id, self.port)
    }
}

impl Serialize for ContainerAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for ContainerAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("address {s:?} is missing a port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow!("address {s:?} has an invalid port"))?;
        let (service, id) = host
            .rsplit_once('-')
            .ok_or_else(|| anyhow!("address {s:?} is missing an instance id"))?;
        if service.is_empty() {
            return Err(anyhow!("address {s:?} has an empty service name"));
        }
        let ctf_id: u64 = id
            .parse()
            .map_err(|_| anyhow!("address {s:?} has an invalid instance id"))?;
        Ok(Self {
            service: service.to_string(),
            ctf_id,
            port,
        })
    }
}
