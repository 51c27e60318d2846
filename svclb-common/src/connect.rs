use core::fmt::Display;
use core::net::{SocketAddr, SocketAddrV4};
use core::num::NonZeroU16;

use crate::netns::{LoopGuard, SocketProbe};
use crate::select::{RandomSource, select_slot};
use crate::service::{
    BackendId, BackendTable, BackendValueV4, ServiceKeyV4, ServiceRecord, ServiceTable,
};
use crate::SYS_PROCEED;

/// The parts of a `bpf_sock_addr` the interceptor reads and writes.
/// Address and port are network byte order.
pub trait SockAddr4 {
    fn protocol(&self) -> u32;
    fn user_ip4(&self) -> u32;
    fn user_port(&self) -> u16;
    fn set_destination(&mut self, ip4: u32, port: u16);
}

/// Destination of an outbound connect, network byte order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectAttempt {
    pub protocol: u32,
    pub address: u32,
    pub port: u16,
}

impl ConnectAttempt {
    pub fn new(protocol: u32, dst: SocketAddrV4) -> Self {
        Self {
            protocol,
            address: u32::from_ne_bytes(dst.ip().octets()),
            port: dst.port().to_be(),
        }
    }

    #[inline(always)]
    pub fn from_sock<C: SockAddr4>(sock: &C) -> Self {
        Self {
            protocol: sock.protocol(),
            address: sock.user_ip4(),
            port: sock.user_port(),
        }
    }

    pub fn frontend_key(&self) -> ServiceKeyV4 {
        ServiceKeyV4::from_wire(self.address, self.port)
    }
}

/// Why a connection went through untouched.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Skip {
    ServiceNotFound,
    NoBackendsRegistered,
    BackendSlotMissing,
    BackendRecordMissing,
    LoopDetected,
}

impl Skip {
    pub fn as_str(&self) -> &'static str {
        match self {
            Skip::ServiceNotFound => "service not found",
            Skip::NoBackendsRegistered => "no backends registered",
            Skip::BackendSlotMissing => "backend slot missing",
            Skip::BackendRecordMissing => "backend record missing",
            Skip::LoopDetected => "loop detected",
        }
    }
}

impl Display for Skip {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Translation {
    pub frontend: ServiceKeyV4,
    pub slot: u16,
    pub backend_id: BackendId,
    pub backend: BackendValueV4,
    pub rev_nat_index: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Rewritten(Translation),
    PassThrough(Skip),
}

impl Outcome {
    /// Return code for the hook. Every outcome lets the connect proceed.
    pub fn verdict(&self) -> i32 {
        SYS_PROCEED
    }
}

/// Resolves a service frontend to one of its backends and rewrites the
/// destination of the connecting socket.
///
/// The chain is linear and does at most three table lookups: frontend,
/// indirection slot, backend. Any miss ends it with [`Outcome::PassThrough`]
/// and the socket untouched.
pub struct ConnectInterceptor<S, B, R, P> {
    services: S,
    backends: B,
    rng: R,
    guard: LoopGuard<P>,
}

impl<S, B, R, P> ConnectInterceptor<S, B, R, P>
where
    S: ServiceTable,
    B: BackendTable,
    R: RandomSource,
    P: SocketProbe,
{
    pub fn new(services: S, backends: B, rng: R, probe: P) -> Self {
        Self {
            services,
            backends,
            rng,
            guard: LoopGuard::new(probe),
        }
    }

    /// Hook entry point. Rewrites `sock` at most once.
    #[inline(always)]
    pub fn connect4<C: SockAddr4>(&mut self, sock: &mut C) -> Outcome {
        let attempt = ConnectAttempt::from_sock(sock);
        match self.translate(&attempt) {
            Ok(translation) => {
                sock.set_destination(translation.backend.address, translation.backend.port);
                Outcome::Rewritten(translation)
            }
            Err(skip) => Outcome::PassThrough(skip),
        }
    }

    #[inline(always)]
    pub fn translate(&mut self, attempt: &ConnectAttempt) -> Result<Translation, Skip> {
        let frontend_key = attempt.frontend_key();
        let value = self
            .services
            .lookup(&frontend_key)
            .ok_or(Skip::ServiceNotFound)?;
        let ServiceRecord::Frontend(frontend) = ServiceRecord::decode(&frontend_key, &value) else {
            return Err(Skip::ServiceNotFound);
        };
        let count = NonZeroU16::new(frontend.backend_count).ok_or(Skip::NoBackendsRegistered)?;

        let slot = select_slot(attempt.protocol, count, &mut self.rng);
        let slot_key = frontend_key.with_slot(slot);
        let value = self
            .services
            .lookup(&slot_key)
            .ok_or(Skip::BackendSlotMissing)?;
        let ServiceRecord::Indirection(backend_id) = ServiceRecord::decode(&slot_key, &value) else {
            return Err(Skip::BackendSlotMissing);
        };

        let backend = self
            .backends
            .lookup(backend_id)
            .ok_or(Skip::BackendRecordMissing)?;

        if self
            .guard
            .would_loop(attempt.protocol, SocketAddr::V4(backend.socket_addr()))
        {
            return Err(Skip::LoopDetected);
        }

        Ok(Translation {
            frontend: frontend_key,
            slot,
            backend_id,
            backend,
            rev_nat_index: frontend.rev_nat_index,
        })
    }
}
