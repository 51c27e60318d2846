//! Services file: the desired set of service frontends and their endpoints.
//!
//! ```yaml
//! services:
//!   - name: web
//!     namespace: default
//!     type: ClusterIP
//!     clusterIP: 10.96.0.10
//!     ports:
//!       - name: http
//!         port: 80
//!         targetPort: 8080
//!         protocol: TCP
//!     endpoints: [10.1.1.5, 10.1.1.6]
//! ```

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;
use svclb_common::{BackendValueV4, FrontendExtra, KubeProtocol, ServiceKeyV4};
use tracing::warn;

use crate::{Error, Result};

const CLUSTER_IP: &str = "ClusterIP";

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ServicesFile {
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(rename = "type", default = "default_type")]
    pub type_: String,
    #[serde(rename = "clusterIP")]
    pub cluster_ip: IpAddr,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub endpoints: Vec<IpAddr>,
    #[serde(default)]
    pub session_affinity_timeout_seconds: Option<u32>,
    #[serde(default)]
    pub l7_proxy_port: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    pub port: u16,
    /// Defaults to `port`.
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_namespace() -> String {
    "default".into()
}

fn default_type() -> String {
    CLUSTER_IP.into()
}

fn default_protocol() -> String {
    "TCP".into()
}

impl Service {
    pub fn unique_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn extra(&self) -> FrontendExtra {
        match self.l7_proxy_port {
            Some(port) => FrontendExtra::L7ProxyPort(port),
            None => {
                FrontendExtra::AffinityTimeout(self.session_affinity_timeout_seconds.unwrap_or(0))
            }
        }
    }
}

/// One frontend as it should be programmed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredService {
    /// `namespace/name/port/protocol`, for logs.
    pub name: String,
    pub frontend: ServiceKeyV4,
    pub extra: FrontendExtra,
    pub backends: Vec<BackendValueV4>,
}

pub type DesiredState = ahash::HashMap<ServiceKeyV4, DesiredService>;

pub fn load(path: &Path) -> Result<ServicesFile> {
    let raw = std::fs::read_to_string(path)?;
    parse(&raw)
}

pub fn parse(raw: &str) -> Result<ServicesFile> {
    // an empty document means no services
    if raw.trim().is_empty() {
        return Ok(ServicesFile::default());
    }
    Ok(serde_yaml::from_str(raw)?)
}

/// Flattens the file into frontends. Anything that cannot be programmed is
/// skipped with a warning rather than failing the whole file.
pub fn desired_state(file: &ServicesFile) -> DesiredState {
    let mut state = DesiredState::default();
    for service in &file.services {
        let name = service.unique_name();
        if service.type_ != CLUSTER_IP {
            warn!(
                service = %name,
                kind = %service.type_,
                "skipping service that is not ClusterIP"
            );
            continue;
        }
        let IpAddr::V4(cluster_ip) = service.cluster_ip else {
            warn!(service = %name, "skipping service with an IPv6 cluster IP");
            continue;
        };
        for port in &service.ports {
            let protocol = match KubeProtocol::try_from(port.protocol.as_str()) {
                Ok(p) => p,
                Err(e) => {
                    let e = Error::InvalidProtocol(e.into());
                    warn!(service = %name, port = port.port, "skipping port: {e}");
                    continue;
                }
            };
            let target_port = port.target_port.unwrap_or(port.port);
            let backends = service
                .endpoints
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(ip) => Some(BackendValueV4::new(*ip, target_port, protocol)),
                    IpAddr::V6(_) => None,
                })
                .collect();
            let desired = DesiredService {
                name: format!("{}/{}/{}", name, port.port, protocol),
                frontend: ServiceKeyV4::frontend(cluster_ip, port.port),
                extra: service.extra(),
                backends,
            };
            if let Some(previous) = state.insert(desired.frontend, desired) {
                warn!(
                    replaced = %previous.name,
                    "{}:{} is declared more than once, keeping the last one",
                    cluster_ip,
                    port.port
                );
            }
        }
    }
    state
}
