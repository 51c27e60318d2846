use std::borrow::Cow;
use std::net::SocketAddrV4;

use rand::RngCore;
use rand::rngs::ThreadRng;
use svclb_common::{
    BackendId, BackendTable, BackendValueV4, ConnectInterceptor, KubeProtocol, Outcome,
    ProbeResult, RandomSource, ServiceKeyV4, ServiceRecord, ServiceTable, ServiceValueV4,
    SockAddr4, SocketProbe,
};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::bpf::{BpfMap, MapTable, open_pinned_maps};
use crate::config::{MapArgs, TranslateArgs};
use crate::{Error, Result};

#[derive(Default)]
pub struct ThreadRandom(ThreadRng);

impl RandomSource for ThreadRandom {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
}

/// Userspace cannot look into the namespace of an arbitrary caller.
pub struct UnavailableProbe;

impl SocketProbe for UnavailableProbe {
    fn lookup(&self, _protocol: KubeProtocol, _addr: SocketAddrV4) -> ProbeResult {
        ProbeResult::Unavailable
    }
}

/// A connect destination held in userspace, in the byte order the hook sees.
struct Destination {
    protocol: u32,
    ip4: u32,
    port: u16,
}

impl Destination {
    fn new(protocol: KubeProtocol, dst: SocketAddrV4) -> Self {
        Self {
            protocol: protocol.number(),
            ip4: u32::from_ne_bytes(dst.ip().octets()),
            port: dst.port().to_be(),
        }
    }

    fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip4.to_ne_bytes().into(), u16::from_be(self.port))
    }
}

impl SockAddr4 for Destination {
    fn protocol(&self) -> u32 {
        self.protocol
    }
    fn user_ip4(&self) -> u32 {
        self.ip4
    }
    fn user_port(&self) -> u16 {
        self.port
    }
    fn set_destination(&mut self, ip4: u32, port: u16) {
        self.ip4 = ip4;
        self.port = port;
    }
}

pub fn list(args: &MapArgs) -> Result<()> {
    let (services, backends) = open_pinned_maps(&args.pin_path())?;
    let rows = service_rows(&services.get_state()?, &backends.get_state()?);
    let table = Table::new(rows).with(Style::modern()).to_string();
    println!("{table}");
    Ok(())
}

pub fn translate(args: &TranslateArgs) -> Result<()> {
    let protocol = KubeProtocol::try_from(args.protocol.as_str())
        .map_err(|e| Error::InvalidProtocol(e.into()))?;
    let (services, backends) = open_pinned_maps(&args.maps.pin_path())?;
    let dst = SocketAddrV4::new(args.address, args.port);
    let (outcome, rewritten) = resolve(MapTable(services), MapTable(backends), protocol, dst);
    println!("{}", describe(protocol, dst, &outcome, rewritten));
    Ok(())
}

/// Runs one connect through the interceptor and returns the outcome with the
/// destination the socket ends up with.
pub fn resolve<S, B>(
    services: S,
    backends: B,
    protocol: KubeProtocol,
    dst: SocketAddrV4,
) -> (Outcome, SocketAddrV4)
where
    S: ServiceTable,
    B: BackendTable,
{
    let mut interceptor =
        ConnectInterceptor::new(services, backends, ThreadRandom::default(), UnavailableProbe);
    let mut sock = Destination::new(protocol, dst);
    let outcome = interceptor.connect4(&mut sock);
    (outcome, sock.addr())
}

pub fn describe(
    protocol: KubeProtocol,
    dst: SocketAddrV4,
    outcome: &Outcome,
    rewritten: SocketAddrV4,
) -> String {
    match outcome {
        Outcome::Rewritten(t) => format!(
            "{dst}/{protocol} -> {rewritten} (slot {}, backend {}, rev-nat {})",
            t.slot, t.backend_id, t.rev_nat_index
        ),
        Outcome::PassThrough(skip) => format!("{dst}/{protocol} left untouched: {skip}"),
    }
}

pub struct ServiceRow {
    frontend: SocketAddrV4,
    rev_nat_index: u16,
    extra: String,
    backends: Vec<String>,
}

impl Tabled for ServiceRow {
    const LENGTH: usize = 4;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        vec![
            Cow::Owned(self.frontend.to_string()),
            Cow::Owned(self.rev_nat_index.to_string()),
            Cow::Borrowed(&self.extra),
            Cow::Owned(self.backends.join("\n")),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        vec![
            Cow::Borrowed("FRONTEND"),
            Cow::Borrowed("REV_NAT"),
            Cow::Borrowed("OPTIONS"),
            Cow::Borrowed("BACKENDS"),
        ]
    }
}

pub fn service_rows(
    services: &ahash::HashMap<ServiceKeyV4, ServiceValueV4>,
    backends: &ahash::HashMap<BackendId, BackendValueV4>,
) -> Vec<ServiceRow> {
    let mut rows = Vec::new();
    for (key, value) in services.iter() {
        let ServiceRecord::Frontend(frontend) = ServiceRecord::decode(key, value) else {
            continue;
        };
        let extra = match (frontend.l7_proxy_port(), frontend.session_affinity_timeout()) {
            (Some(port), _) => format!("l7 proxy {port}"),
            (None, Some(secs)) if secs > 0 => format!("affinity {secs}s"),
            _ => String::new(),
        };
        let mut lines = Vec::with_capacity(usize::from(frontend.backend_count));
        for slot in 1..=frontend.backend_count {
            let slot_key = key.with_slot(slot);
            let line = match services.get(&slot_key).map(|v| ServiceRecord::decode(&slot_key, v))
            {
                Some(ServiceRecord::Indirection(id)) => match backends.get(&id) {
                    Some(backend) => format!(
                        "{slot}: {} {} (id {id})",
                        backend.socket_addr(),
                        backend
                            .protocol()
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| backend.protocol.to_string())
                    ),
                    None => format!("{slot}: id {id} <missing>"),
                },
                _ => format!("{slot}: <missing>"),
            };
            lines.push(line);
        }
        rows.push(ServiceRow {
            frontend: SocketAddrV4::new(key.ip(), key.port()),
            rev_nat_index: frontend.rev_nat_index,
            extra,
            backends: lines,
        });
    }
    rows.sort_by_key(|r| r.frontend);
    rows
}
