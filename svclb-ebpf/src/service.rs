use core::net::{Ipv4Addr, SocketAddrV4};

use aya_ebpf::bindings::bpf_sock_addr;
use aya_ebpf::helpers::generated::bpf_get_prandom_u32;
use aya_ebpf::programs::SockAddrContext;
use aya_log_ebpf::debug;
use svclb_common::{
    ConnectInterceptor, KubeProtocol, Outcome, ProbeResult, RandomSource, SYS_PROCEED, Skip,
    SockAddr4, SocketProbe,
};

use crate::{Backends, Services};

const AF_INET: u32 = 2;

// https://docs.ebpf.io/linux/program-type/BPF_PROG_TYPE_CGROUP_SOCK_ADDR/#context
// struct bpf_sock_addr {
//     __u32 user_family;  /* Allows 4-byte read, but no write. */
//     __u32 user_ip4;     /* Allows 1,2,4-byte read and 4-byte write.
//                 * Stored in network byte order.
//                 */
//     __u32 user_ip6[4];
//     __u32 user_port;    /* Allows 1,2,4-byte read and 4-byte write.
//                 * Stored in network byte order
//                 */
//     __u32 family;       /* Allows 4-byte read, but no write */
//     __u32 type;     /* Allows 4-byte read, but no write */
//     __u32 protocol;     /* Allows 4-byte read, but no write */
//     ...
//     __bpf_md_ptr(struct bpf_sock *, sk);
// };

/// Return codes [0(deny),1(allow)]. Always allows.
#[inline(always)]
pub fn try_svclb_connect4(ctx: &SockAddrContext) -> i32 {
    let ptr = ctx.sock_addr;

    if unsafe { (*ptr).user_family } != AF_INET {
        return SYS_PROCEED;
    }

    let mut sock = Sock(ptr);
    let mut interceptor =
        ConnectInterceptor::new(Services, Backends, PrandomU32, NetnsProbe::new(ptr));
    let outcome = interceptor.connect4(&mut sock);

    match outcome {
        Outcome::Rewritten(t) => {
            debug!(
                ctx,
                "translated {}:{} to {}:{} backend {} slot {}",
                t.frontend.ip(),
                t.frontend.port(),
                t.backend.ip(),
                t.backend.port(),
                t.backend_id,
                t.slot
            );
        }
        Outcome::PassThrough(Skip::ServiceNotFound) => {}
        Outcome::PassThrough(skip) => {
            let dst = Ipv4Addr::from(sock.user_ip4().to_ne_bytes());
            debug!(
                ctx,
                "left {}:{} untouched: {}",
                dst,
                u16::from_be(sock.user_port()),
                skip.as_str()
            );
        }
    }

    outcome.verdict()
}

struct Sock(*mut bpf_sock_addr);

impl SockAddr4 for Sock {
    #[inline(always)]
    fn protocol(&self) -> u32 {
        unsafe { (*self.0).protocol }
    }

    #[inline(always)]
    fn user_ip4(&self) -> u32 {
        unsafe { (*self.0).user_ip4 }
    }

    #[inline(always)]
    fn user_port(&self) -> u16 {
        // the port sits in the low 16 bits, already in network order
        unsafe { (*self.0).user_port as u16 }
    }

    #[inline(always)]
    fn set_destination(&mut self, ip4: u32, port: u16) {
        unsafe {
            (*self.0).user_ip4 = ip4;
            (*self.0).user_port = u32::from(port);
        }
    }
}

struct PrandomU32;

impl RandomSource for PrandomU32 {
    #[inline(always)]
    fn next_u32(&mut self) -> u32 {
        unsafe { bpf_get_prandom_u32() }
    }
}

struct NetnsProbe {
    #[cfg_attr(not(feature = "socket-lookup"), allow(dead_code))]
    ctx: *mut bpf_sock_addr,
}

impl NetnsProbe {
    #[inline(always)]
    fn new(ctx: *mut bpf_sock_addr) -> Self {
        Self { ctx }
    }
}

#[cfg(feature = "socket-lookup")]
impl SocketProbe for NetnsProbe {
    #[inline(always)]
    fn lookup(&self, protocol: KubeProtocol, addr: SocketAddrV4) -> ProbeResult {
        use core::ffi::c_void;
        use core::mem::size_of_val;

        use aya_ebpf::bindings::bpf_sock_tuple;
        use aya_ebpf::helpers::generated::{bpf_sk_lookup_tcp, bpf_sk_lookup_udp, bpf_sk_release};

        // BPF_F_CURRENT_NETNS
        const CURRENT_NETNS: u64 = -1i64 as u64;

        let mut tuple: bpf_sock_tuple = unsafe { core::mem::zeroed() };
        let size = unsafe {
            tuple.__bindgen_anon_1.ipv4.daddr = u32::from_ne_bytes(addr.ip().octets());
            tuple.__bindgen_anon_1.ipv4.dport = addr.port().to_be();
            size_of_val(&tuple.__bindgen_anon_1.ipv4) as u32
        };

        let ctx = self.ctx as *mut c_void;
        let sk = unsafe {
            match protocol {
                KubeProtocol::Tcp => bpf_sk_lookup_tcp(ctx, &mut tuple, size, CURRENT_NETNS, 0),
                KubeProtocol::Udp => bpf_sk_lookup_udp(ctx, &mut tuple, size, CURRENT_NETNS, 0),
                KubeProtocol::Sctp => return ProbeResult::Unavailable,
            }
        };
        if sk.is_null() {
            return ProbeResult::NotFound;
        }
        unsafe { bpf_sk_release(sk as *mut c_void) };
        ProbeResult::Found
    }
}

#[cfg(not(feature = "socket-lookup"))]
impl SocketProbe for NetnsProbe {
    #[inline(always)]
    fn lookup(&self, _protocol: KubeProtocol, _addr: SocketAddrV4) -> ProbeResult {
        ProbeResult::Unavailable
    }
}
