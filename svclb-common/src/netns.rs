use core::net::{IpAddr, SocketAddr, SocketAddrV4};

use crate::KubeProtocol;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeResult {
    Found,
    NotFound,
    /// The host cannot look up sockets from this context.
    Unavailable,
}

/// Looks up a socket bound to `addr` in the network namespace of the process
/// that is connecting.
pub trait SocketProbe {
    fn lookup(&self, protocol: KubeProtocol, addr: SocketAddrV4) -> ProbeResult;
}

impl<T: SocketProbe + ?Sized> SocketProbe for &T {
    #[inline(always)]
    fn lookup(&self, protocol: KubeProtocol, addr: SocketAddrV4) -> ProbeResult {
        (**self).lookup(protocol, addr)
    }
}

/// Keeps a backend from being handed a connection that it opened itself
/// towards the service it backs.
///
/// When the backend owns a socket in the caller's own namespace the
/// translation would loop traffic back into that namespace, so it is skipped.
/// Pod traffic redirected to a backend in another namespace is unaffected.
/// Only TCP and UDP are probed; IPv4 and IPv4-mapped IPv6 candidates are
/// checked, plain IPv6 candidates always pass.
pub struct LoopGuard<P> {
    probe: P,
}

impl<P: SocketProbe> LoopGuard<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    #[inline(always)]
    pub fn would_loop(&self, protocol: u32, candidate: SocketAddr) -> bool {
        let ip = match candidate.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(ip) => ip,
                None => return false,
            },
        };
        let protocol = match KubeProtocol::try_from(protocol) {
            Ok(p @ (KubeProtocol::Tcp | KubeProtocol::Udp)) => p,
            _ => return false,
        };
        matches!(
            self.probe
                .lookup(protocol, SocketAddrV4::new(ip, candidate.port())),
            ProbeResult::Found
        )
    }
}
