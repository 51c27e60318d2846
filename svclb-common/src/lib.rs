#![no_std]

pub mod connect;
pub mod netns;
pub mod select;
pub mod service;

use core::fmt::Display;

pub use connect::{ConnectAttempt, ConnectInterceptor, Outcome, SockAddr4, Skip, Translation};
pub use netns::{LoopGuard, ProbeResult, SocketProbe};
pub use select::{RandomSource, select_slot};
pub use service::{
    BackendId, BackendTable, BackendValueV4, Frontend, FrontendExtra, ServiceKeyV4,
    ServiceRecord, ServiceTable, ServiceValueV4,
};

pub const IPPROTO_TCP: u32 = 6;
pub const IPPROTO_UDP: u32 = 17;
pub const IPPROTO_SCTP: u32 = 132;

/// Return code of a `cgroup/connect4` program that lets the connect proceed.
pub const SYS_PROCEED: i32 = 1;

pub const MAX_MAP_ENTRIES: u32 = 65536;

pub const BPF_MAP_SERVICES_V4: &str = "svclb_svc_v4";
pub const BPF_MAP_BACKENDS_V4: &str = "svclb_be_v4";
pub const BPF_PROGRAM_CONNECT4: &str = "svclb_connect4";

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub enum KubeProtocol {
    #[default]
    Tcp = 6,
    Udp = 17,
    Sctp = 132,
}

impl KubeProtocol {
    pub fn number(self) -> u32 {
        self as u32
    }
}

impl TryFrom<&str> for KubeProtocol {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "TCP" | "tcp" | "Tcp" => Ok(KubeProtocol::Tcp),
            "UDP" | "udp" | "Udp" => Ok(KubeProtocol::Udp),
            "SCTP" | "sctp" | "Sctp" => Ok(KubeProtocol::Sctp),
            _ => Err(
                "Protocol provided is not a valid kube protocol. Only TCP, UDP, or SCTP allowed",
            ),
        }
    }
}

impl TryFrom<u32> for KubeProtocol {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let proto = match value {
            IPPROTO_TCP => KubeProtocol::Tcp,
            IPPROTO_UDP => KubeProtocol::Udp,
            IPPROTO_SCTP => KubeProtocol::Sctp,
            _ => {
                return Err(
                    "Protocol provided is not a valid kube protocol. Only TCP, UDP, or SCTP allowed",
                );
            }
        };
        Ok(proto)
    }
}

impl TryFrom<u8> for KubeProtocol {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        KubeProtocol::try_from(u32::from(value))
    }
}

impl Display for KubeProtocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KubeProtocol::Tcp => write!(f, "TCP"),
            KubeProtocol::Udp => write!(f, "UDP"),
            KubeProtocol::Sctp => write!(f, "SCTP"),
        }
    }
}
