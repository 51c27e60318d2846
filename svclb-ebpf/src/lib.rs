#![no_std]

pub mod service;

use aya_ebpf::macros::map;
use aya_ebpf::maps::HashMap;
use svclb_common::{
    BackendId, BackendTable, BackendValueV4, MAX_MAP_ENTRIES, ServiceKeyV4, ServiceTable,
    ServiceValueV4,
};

// names must match svclb_common::BPF_MAP_* so the agent finds the pins
#[map(name = "svclb_svc_v4")]
static SERVICES_V4: HashMap<ServiceKeyV4, ServiceValueV4> =
    HashMap::pinned(MAX_MAP_ENTRIES, 0);

#[map(name = "svclb_be_v4")]
static BACKENDS_V4: HashMap<BackendId, BackendValueV4> = HashMap::pinned(MAX_MAP_ENTRIES, 0);

pub struct Services;

impl ServiceTable for Services {
    #[inline(always)]
    fn lookup(&self, key: &ServiceKeyV4) -> Option<ServiceValueV4> {
        // copy out so a concurrent update or delete cannot change what was read
        unsafe { SERVICES_V4.get(key).copied() }
    }
}

pub struct Backends;

impl BackendTable for Backends {
    #[inline(always)]
    fn lookup(&self, id: BackendId) -> Option<BackendValueV4> {
        unsafe { BACKENDS_V4.get(&id).copied() }
    }
}
