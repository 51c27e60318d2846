use core::net::{Ipv4Addr, SocketAddrV4};

use crate::KubeProtocol;

pub type BackendId = u32;

/// Set in `flags2` when the frontend's union field carries an L7 proxy port
/// instead of a session affinity timeout.
pub const SVC_FLAG2_L7_LOADBALANCER: u8 = 1 << 2;

/// Key of the service table.
///
/// `address` and `port` hold network byte order values exactly as the connect
/// hook reads them from the socket address. `backend_slot` is host order; slot
/// 0 is the frontend record, slots 1..=count are indirection records.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceKeyV4 {
    pub address: u32,
    pub port: u16,
    pub backend_slot: u16,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ServiceKeyV4 {}

impl ServiceKeyV4 {
    pub const FRONTEND_SLOT: u16 = 0;

    pub fn new(ip: Ipv4Addr, port: u16, backend_slot: u16) -> Self {
        Self {
            address: u32::from_ne_bytes(ip.octets()),
            port: port.to_be(),
            backend_slot,
        }
    }

    pub fn frontend(ip: Ipv4Addr, port: u16) -> Self {
        Self::new(ip, port, Self::FRONTEND_SLOT)
    }

    /// Frontend key from raw network order values.
    #[inline(always)]
    pub fn from_wire(address: u32, port: u16) -> Self {
        Self {
            address,
            port,
            backend_slot: Self::FRONTEND_SLOT,
        }
    }

    #[inline(always)]
    pub fn with_slot(self, backend_slot: u16) -> Self {
        Self {
            backend_slot,
            ..self
        }
    }

    pub fn is_frontend(&self) -> bool {
        self.backend_slot == Self::FRONTEND_SLOT
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.address.to_ne_bytes())
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.port)
    }
}

/// Value of the service table. How `backend_id` is read depends on the slot of
/// the key the value was fetched with; see [`ServiceRecord`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub struct ServiceValueV4 {
    pub backend_id: u32,
    pub count: u16,
    pub rev_nat_index: u16,
    pub flags: u8,
    pub flags2: u8,
    pub pad: [u8; 2],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ServiceValueV4 {}

impl ServiceValueV4 {
    pub fn indirection(backend_id: BackendId) -> Self {
        Self {
            backend_id,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FrontendExtra {
    AffinityTimeout(u32),
    L7ProxyPort(u32),
}

impl Default for FrontendExtra {
    fn default() -> Self {
        FrontendExtra::AffinityTimeout(0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub struct Frontend {
    pub backend_count: u16,
    pub rev_nat_index: u16,
    pub flags: u8,
    pub flags2: u8,
    pub extra: FrontendExtra,
}

impl Frontend {
    pub fn session_affinity_timeout(&self) -> Option<u32> {
        match self.extra {
            FrontendExtra::AffinityTimeout(secs) => Some(secs),
            FrontendExtra::L7ProxyPort(_) => None,
        }
    }

    pub fn l7_proxy_port(&self) -> Option<u32> {
        match self.extra {
            FrontendExtra::L7ProxyPort(port) => Some(port),
            FrontendExtra::AffinityTimeout(_) => None,
        }
    }

    fn from_value(value: &ServiceValueV4) -> Self {
        let extra = if value.flags2 & SVC_FLAG2_L7_LOADBALANCER != 0 {
            FrontendExtra::L7ProxyPort(value.backend_id)
        } else {
            FrontendExtra::AffinityTimeout(value.backend_id)
        };
        Self {
            backend_count: value.count,
            rev_nat_index: value.rev_nat_index,
            flags: value.flags,
            flags2: value.flags2,
            extra,
        }
    }

    fn to_value(self) -> ServiceValueV4 {
        let (union, flags2) = match self.extra {
            FrontendExtra::AffinityTimeout(secs) => {
                (secs, self.flags2 & !SVC_FLAG2_L7_LOADBALANCER)
            }
            FrontendExtra::L7ProxyPort(port) => (port, self.flags2 | SVC_FLAG2_L7_LOADBALANCER),
        };
        ServiceValueV4 {
            backend_id: union,
            count: self.backend_count,
            rev_nat_index: self.rev_nat_index,
            flags: self.flags,
            flags2,
            pad: [0; 2],
        }
    }
}

/// A service table value interpreted through the slot of its key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ServiceRecord {
    Frontend(Frontend),
    Indirection(BackendId),
}

impl ServiceRecord {
    #[inline(always)]
    pub fn decode(key: &ServiceKeyV4, value: &ServiceValueV4) -> Self {
        if key.is_frontend() {
            ServiceRecord::Frontend(Frontend::from_value(value))
        } else {
            ServiceRecord::Indirection(value.backend_id)
        }
    }

    pub fn encode(&self) -> ServiceValueV4 {
        match self {
            ServiceRecord::Frontend(frontend) => frontend.to_value(),
            ServiceRecord::Indirection(backend_id) => ServiceValueV4::indirection(*backend_id),
        }
    }
}

/// Value of the backend table, keyed by [`BackendId`]. Address and port are
/// network byte order; `protocol` is advisory.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendValueV4 {
    pub address: u32,
    pub port: u16,
    pub protocol: u8,
    pub flags: u8,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendValueV4 {}

impl BackendValueV4 {
    pub fn new(ip: Ipv4Addr, port: u16, protocol: KubeProtocol) -> Self {
        Self {
            address: u32::from_ne_bytes(ip.octets()),
            port: port.to_be(),
            protocol: protocol as u8,
            flags: 0,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.address.to_ne_bytes())
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.port)
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip(), self.port())
    }

    pub fn protocol(&self) -> Option<KubeProtocol> {
        KubeProtocol::try_from(self.protocol).ok()
    }
}

/// Read side of the service table. `None` is an ordinary miss.
///
/// Values are returned by copy so a concurrent delete or update from the
/// control plane cannot change a record after it has been read.
pub trait ServiceTable {
    fn lookup(&self, key: &ServiceKeyV4) -> Option<ServiceValueV4>;
}

/// Read side of the backend table.
pub trait BackendTable {
    fn lookup(&self, id: BackendId) -> Option<BackendValueV4>;
}

impl<T: ServiceTable + ?Sized> ServiceTable for &T {
    #[inline(always)]
    fn lookup(&self, key: &ServiceKeyV4) -> Option<ServiceValueV4> {
        (**self).lookup(key)
    }
}

impl<T: BackendTable + ?Sized> BackendTable for &T {
    #[inline(always)]
    fn lookup(&self, id: BackendId) -> Option<BackendValueV4> {
        (**self).lookup(id)
    }
}

#[cfg(test)]
mod test {
    use core::mem::size_of;

    use super::*;

    #[test]
    fn test_wire_sizes() {
        assert_eq!(size_of::<ServiceKeyV4>(), 8);
        assert_eq!(size_of::<ServiceValueV4>(), 12);
        assert_eq!(size_of::<BackendValueV4>(), 8);
    }

    #[test]
    fn test_key_is_network_order() {
        let key = ServiceKeyV4::new(Ipv4Addr::new(10, 0, 0, 1), 80, 3);
        assert_eq!(key.address.to_ne_bytes(), [10, 0, 0, 1]);
        assert_eq!(key.port.to_ne_bytes(), [0, 80]);
        assert_eq!(key.backend_slot, 3);
        assert_eq!(key.ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(key.port(), 80);
    }

    #[test]
    fn test_with_slot_keeps_address() {
        let frontend = ServiceKeyV4::frontend(Ipv4Addr::new(10, 0, 0, 1), 80);
        let slot = frontend.with_slot(2);
        assert!(frontend.is_frontend());
        assert!(!slot.is_frontend());
        assert_eq!(slot.address, frontend.address);
        assert_eq!(slot.port, frontend.port);
    }

    #[test]
    fn test_record_is_discriminated_by_slot() {
        let value = ServiceValueV4 {
            backend_id: 7,
            count: 2,
            rev_nat_index: 4,
            ..Default::default()
        };
        let frontend_key = ServiceKeyV4::frontend(Ipv4Addr::new(10, 0, 0, 1), 80);

        let ServiceRecord::Frontend(frontend) = ServiceRecord::decode(&frontend_key, &value) else {
            panic!("slot 0 must decode as frontend");
        };
        assert_eq!(frontend.backend_count, 2);
        assert_eq!(frontend.rev_nat_index, 4);
        assert_eq!(frontend.session_affinity_timeout(), Some(7));
        assert_eq!(frontend.l7_proxy_port(), None);

        let record = ServiceRecord::decode(&frontend_key.with_slot(1), &value);
        assert_eq!(record, ServiceRecord::Indirection(7));
    }

    #[test]
    fn test_l7_proxy_port_sets_flag() {
        let frontend = Frontend {
            backend_count: 1,
            extra: FrontendExtra::L7ProxyPort(15001),
            ..Default::default()
        };
        let value = ServiceRecord::Frontend(frontend).encode();
        assert_eq!(value.backend_id, 15001);
        assert_ne!(value.flags2 & SVC_FLAG2_L7_LOADBALANCER, 0);

        let key = ServiceKeyV4::frontend(Ipv4Addr::new(10, 0, 0, 1), 80);
        let ServiceRecord::Frontend(decoded) = ServiceRecord::decode(&key, &value) else {
            panic!("slot 0 must decode as frontend");
        };
        assert_eq!(decoded.l7_proxy_port(), Some(15001));
        assert_eq!(decoded.session_affinity_timeout(), None);
    }

    #[test]
    fn test_backend_socket_addr() {
        let backend = BackendValueV4::new(Ipv4Addr::new(10, 1, 1, 5), 8080, KubeProtocol::Tcp);
        assert_eq!(
            backend.socket_addr(),
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 5), 8080)
        );
        assert_eq!(backend.protocol(), Some(KubeProtocol::Tcp));
    }
}
