use svclb_common::{
    BackendId, BackendValueV4, Frontend, FrontendExtra, ServiceKeyV4, ServiceRecord,
    ServiceValueV4,
};
use tracing::{debug, warn};

use crate::bpf::{BpfMap, BpfState};
use crate::{Error, Result};

#[derive(Clone, Debug, Default)]
struct FrontendEntry {
    rev_nat_index: u16,
    /// Every backend reference this frontend holds, oldest first. Between a
    /// failed update and its retry this covers both the old and new backends.
    backend_ids: Vec<BackendId>,
    /// Highest slot that may be present in the service map.
    slots: u16,
}

#[derive(Clone, Copy, Debug)]
struct BackendRef {
    id: BackendId,
    refs: u32,
}

/// Single writer of the service and backend tables.
///
/// The connect hook reads the tables while they are being written, so every
/// change is ordered to keep the chain frontend -> slot -> backend resolvable:
///
/// - a new or growing service gets its backend records, then its slots, then
///   the frontend carrying the new count;
/// - a shrinking service publishes the smaller count first, then drops the
///   surplus slots, then releases backends nobody references anymore;
/// - a removed service loses its frontend, then its slots, then its backends.
///
/// Backend records are shared between services by address, port and
/// protocol and are refcounted. Ids are never handed out twice within a run.
///
/// A frontend is tracked from its first write attempt on. When a write fails
/// the error is returned and the frontend keeps every reference it acquired,
/// so calling [`update`](Self::update) or [`remove`](Self::remove) again
/// picks up from what actually reached the maps.
pub struct ServiceBackendState<S, B>
where
    S: BpfMap<ServiceKeyV4, ServiceValueV4>,
    B: BpfMap<BackendId, BackendValueV4>,
{
    services: BpfState<S, ServiceKeyV4, ServiceValueV4>,
    backends: BpfState<B, BackendId, BackendValueV4>,
    frontends: ahash::HashMap<ServiceKeyV4, FrontendEntry>,
    backend_refs: ahash::HashMap<BackendValueV4, BackendRef>,
    next_backend_id: BackendId,
    next_rev_nat_index: u16,
    free_rev_nat_indexes: Vec<u16>,
}

impl<S, B> ServiceBackendState<S, B>
where
    S: BpfMap<ServiceKeyV4, ServiceValueV4>,
    B: BpfMap<BackendId, BackendValueV4>,
{
    /// Starts past every backend id already present in `backend_map`, so a
    /// slot left over from a previous run never resolves to a backend this
    /// run programs.
    pub fn try_new(service_map: S, backend_map: B) -> Result<Self> {
        let highest = backend_map.get_state()?.keys().copied().max().unwrap_or(0);
        let next_backend_id = highest
            .checked_add(1)
            .ok_or_else(|| Error::ConversionError("backend ids exhausted".into()))?;
        Ok(Self {
            services: BpfState::new(service_map),
            backends: BpfState::new(backend_map),
            frontends: ahash::HashMap::default(),
            backend_refs: ahash::HashMap::default(),
            next_backend_id,
            next_rev_nat_index: 1,
            free_rev_nat_indexes: Vec::new(),
        })
    }

    /// Programs `frontend` with `backends` in slot order and returns the
    /// rev-NAT index of the service.
    pub fn update(
        &mut self,
        frontend: ServiceKeyV4,
        extra: FrontendExtra,
        backends: &[BackendValueV4],
    ) -> Result<u16> {
        let frontend = frontend.with_slot(ServiceKeyV4::FRONTEND_SLOT);
        let new_count = u16::try_from(backends.len()).map_err(|e| {
            Error::ConversionError(format!(
                "{} backends for {}:{}: {e}",
                backends.len(),
                frontend.ip(),
                frontend.port()
            ))
        })?;

        let rev_nat_index = match self.frontends.get(&frontend) {
            Some(entry) => entry.rev_nat_index,
            None => {
                let rev_nat_index = self.allocate_rev_nat_index()?;
                self.frontends.insert(
                    frontend,
                    FrontendEntry {
                        rev_nat_index,
                        ..Default::default()
                    },
                );
                rev_nat_index
            }
        };
        let held = self
            .frontends
            .get(&frontend)
            .map_or(0, |e| e.backend_ids.len());

        let mut new_ids = Vec::with_capacity(backends.len());
        for backend in backends {
            let id = self.acquire_backend(*backend)?;
            if let Some(entry) = self.frontends.get_mut(&frontend) {
                entry.backend_ids.push(id);
            }
            new_ids.push(id);
        }
        let slots = match self.frontends.get_mut(&frontend) {
            Some(entry) => {
                entry.slots = entry.slots.max(new_count);
                entry.slots
            }
            None => new_count,
        };

        let record = ServiceRecord::Frontend(Frontend {
            backend_count: new_count,
            rev_nat_index,
            extra,
            ..Default::default()
        })
        .encode();

        let published = self
            .services
            .get_from_cache(&frontend)
            .map_or(0, |v| v.count);
        if new_count >= published {
            self.write_slots(frontend, &new_ids)?;
            self.services.update(frontend, record)?;
        } else {
            self.services.update(frontend, record)?;
            self.write_slots(frontend, &new_ids)?;
        }
        for slot in new_count + 1..=slots {
            self.services.delete(&frontend.with_slot(slot))?;
        }
        if let Some(entry) = self.frontends.get_mut(&frontend) {
            entry.slots = new_count;
        }

        self.release_held(&frontend, held)?;

        debug!(
            frontend = %format!("{}:{}", frontend.ip(), frontend.port()),
            backends = new_count,
            rev_nat_index,
            "programmed service"
        );
        Ok(rev_nat_index)
    }

    /// Removes `frontend` and every slot under it. Returns false when the
    /// frontend was never programmed.
    pub fn remove(&mut self, frontend: &ServiceKeyV4) -> Result<bool> {
        let frontend = frontend.with_slot(ServiceKeyV4::FRONTEND_SLOT);
        let Some(slots) = self.frontends.get(&frontend).map(|e| e.slots) else {
            return Ok(false);
        };

        self.services.delete(&frontend)?;
        for slot in 1..=slots {
            self.services.delete(&frontend.with_slot(slot))?;
        }
        let held = self
            .frontends
            .get(&frontend)
            .map_or(0, |e| e.backend_ids.len());
        self.release_held(&frontend, held)?;

        if let Some(entry) = self.frontends.remove(&frontend) {
            self.free_rev_nat_indexes.push(entry.rev_nat_index);
        }
        debug!(
            frontend = %format!("{}:{}", frontend.ip(), frontend.port()),
            "removed service"
        );
        Ok(true)
    }

    /// Backends of every programmed frontend in slot order, rebuilt from what
    /// was written to the maps.
    pub fn state_from_cache(&self) -> ahash::HashMap<ServiceKeyV4, Vec<BackendValueV4>> {
        let mut map = ahash::HashMap::default();
        for key in self.frontends.keys() {
            let Some(value) = self.services.get_from_cache(key) else {
                debug!("frontend {}:{} not written yet", key.ip(), key.port());
                continue;
            };
            let ServiceRecord::Frontend(frontend) = ServiceRecord::decode(key, value) else {
                continue;
            };
            let mut backends = Vec::with_capacity(usize::from(frontend.backend_count));
            for slot in 1..=frontend.backend_count {
                let slot_key = key.with_slot(slot);
                let Some(value) = self.services.get_from_cache(&slot_key) else {
                    warn!(
                        "did not find slot {} of {}:{}",
                        slot,
                        key.ip(),
                        key.port()
                    );
                    continue;
                };
                let ServiceRecord::Indirection(id) = ServiceRecord::decode(&slot_key, value)
                else {
                    continue;
                };
                let Some(backend) = self.backends.get_from_cache(&id) else {
                    warn!("did not find backend with id {}", id);
                    continue;
                };
                backends.push(*backend);
            }
            map.insert(*key, backends);
        }
        map
    }

    pub fn rev_nat_index(&self, frontend: &ServiceKeyV4) -> Option<u16> {
        self.frontends
            .get(&frontend.with_slot(ServiceKeyV4::FRONTEND_SLOT))
            .map(|e| e.rev_nat_index)
    }

    /// Every frontend with state in the maps, including ones whose last
    /// update failed.
    pub fn frontends(&self) -> impl Iterator<Item = &ServiceKeyV4> {
        self.frontends.keys()
    }

    pub fn frontend_count(&self) -> usize {
        self.frontends.len()
    }

    pub fn backend_count(&self) -> usize {
        self.backend_refs.len()
    }

    /// Deletes entries of both maps that this state did not write. Returns
    /// the number of service and backend entries deleted.
    pub fn prune_unmanaged(&mut self) -> Result<(usize, usize)> {
        // slots before the backends they point to
        let services = self.services.prune_unmanaged()?;
        let backends = self.backends.prune_unmanaged()?;
        Ok((services, backends))
    }

    fn write_slots(&mut self, frontend: ServiceKeyV4, ids: &[BackendId]) -> Result<()> {
        for (position, id) in ids.iter().enumerate() {
            let slot = u16::try_from(position + 1)
                .map_err(|e| Error::ConversionError(format!("failed to convert slot: {e}")))?;
            self.services.update(
                frontend.with_slot(slot),
                ServiceRecord::Indirection(*id).encode(),
            )?;
        }
        Ok(())
    }

    fn acquire_backend(&mut self, backend: BackendValueV4) -> Result<BackendId> {
        if let Some(r) = self.backend_refs.get_mut(&backend) {
            r.refs += 1;
            return Ok(r.id);
        }
        let id = self.next_backend_id;
        self.next_backend_id = id
            .checked_add(1)
            .ok_or_else(|| Error::ConversionError("backend ids exhausted".into()))?;
        self.backends.update(id, backend)?;
        self.backend_refs.insert(backend, BackendRef { id, refs: 1 });
        Ok(id)
    }

    /// Releases the `count` oldest references of `frontend`, dropping each
    /// from the entry only once released.
    fn release_held(&mut self, frontend: &ServiceKeyV4, count: usize) -> Result<()> {
        for _ in 0..count {
            let Some(id) = self
                .frontends
                .get(frontend)
                .and_then(|e| e.backend_ids.first().copied())
            else {
                break;
            };
            self.release_backend(id)?;
            if let Some(entry) = self.frontends.get_mut(frontend) {
                entry.backend_ids.remove(0);
            }
        }
        Ok(())
    }

    fn release_backend(&mut self, id: BackendId) -> Result<()> {
        let Some(backend) = self.backends.get_from_cache(&id).copied() else {
            warn!("released unknown backend id {}", id);
            return Ok(());
        };
        let Some(refs) = self.backend_refs.get(&backend).map(|r| r.refs) else {
            return Ok(());
        };
        if refs > 1 {
            if let Some(r) = self.backend_refs.get_mut(&backend) {
                r.refs -= 1;
            }
            return Ok(());
        }
        self.backends.delete(&id)?;
        self.backend_refs.remove(&backend);
        Ok(())
    }

    fn allocate_rev_nat_index(&mut self) -> Result<u16> {
        if let Some(index) = self.free_rev_nat_indexes.pop() {
            return Ok(index);
        }
        let index = self.next_rev_nat_index;
        if index == 0 {
            return Err(Error::ConversionError("rev-NAT indexes exhausted".into()));
        }
        self.next_rev_nat_index = index.wrapping_add(1);
        Ok(index)
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    use svclb_common::KubeProtocol;

    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Op {
        Slot(u16, bool),
        Backend(BackendId, bool),
    }
    use Op::*;

    type Journal = Rc<RefCell<Vec<Op>>>;
    /// The next write matching this op fails, once.
    type FailOn = Rc<RefCell<Option<Op>>>;

    fn record(journal: &Journal, fail: &FailOn, op: Op) -> Result<()> {
        if fail.borrow_mut().take_if(|f| *f == op).is_some() {
            return Err(Error::Other(format!("{op:?} failed")));
        }
        journal.borrow_mut().push(op);
        Ok(())
    }

    /// Deleting a missing key fails with ENOENT like a kernel map.
    fn remove_existing<K: Eq + std::hash::Hash, V>(
        map: &mut ahash::HashMap<K, V>,
        key: &K,
    ) -> Result<()> {
        match map.remove(key) {
            Some(_) => Ok(()),
            None => Err(Error::Other("ENOENT".into())),
        }
    }

    struct Services {
        inner: ahash::HashMap<ServiceKeyV4, ServiceValueV4>,
        journal: Journal,
        fail: FailOn,
    }

    impl BpfMap<ServiceKeyV4, ServiceValueV4> for Services {
        fn update(&mut self, key: ServiceKeyV4, value: ServiceValueV4) -> Result<()> {
            record(&self.journal, &self.fail, Slot(key.backend_slot, true))?;
            self.inner.update(key, value)
        }
        fn delete(&mut self, key: &ServiceKeyV4) -> Result<()> {
            record(&self.journal, &self.fail, Slot(key.backend_slot, false))?;
            remove_existing(&mut self.inner, key)
        }
        fn get(&self, key: &ServiceKeyV4) -> Result<ServiceValueV4> {
            BpfMap::get(&self.inner, key)
        }
        fn get_state(&self) -> Result<ahash::HashMap<ServiceKeyV4, ServiceValueV4>> {
            self.inner.get_state()
        }
    }

    struct Backends {
        inner: ahash::HashMap<BackendId, BackendValueV4>,
        journal: Journal,
        fail: FailOn,
    }

    impl BpfMap<BackendId, BackendValueV4> for Backends {
        fn update(&mut self, key: BackendId, value: BackendValueV4) -> Result<()> {
            record(&self.journal, &self.fail, Backend(key, true))?;
            self.inner.update(key, value)
        }
        fn delete(&mut self, key: &BackendId) -> Result<()> {
            record(&self.journal, &self.fail, Backend(*key, false))?;
            remove_existing(&mut self.inner, key)
        }
        fn get(&self, key: &BackendId) -> Result<BackendValueV4> {
            BpfMap::get(&self.inner, key)
        }
        fn get_state(&self) -> Result<ahash::HashMap<BackendId, BackendValueV4>> {
            self.inner.get_state()
        }
    }

    type TestState = ServiceBackendState<Services, Backends>;

    fn failing_state() -> (TestState, Journal, FailOn) {
        let journal = Journal::default();
        let fail = FailOn::default();
        let services = Services {
            inner: Default::default(),
            journal: journal.clone(),
            fail: fail.clone(),
        };
        let backends = Backends {
            inner: Default::default(),
            journal: journal.clone(),
            fail: fail.clone(),
        };
        let state = ServiceBackendState::try_new(services, backends).unwrap();
        (state, journal, fail)
    }

    fn new_state() -> (TestState, Journal) {
        let (state, journal, _fail) = failing_state();
        (state, journal)
    }

    /// Entries in the service and backend maps.
    fn map_sizes(state: &TestState) -> (usize, usize) {
        (
            state.services.bpf_map.inner.len(),
            state.backends.bpf_map.inner.len(),
        )
    }

    fn drain(journal: &Journal) -> Vec<Op> {
        journal.borrow_mut().drain(..).collect()
    }

    fn frontend() -> ServiceKeyV4 {
        ServiceKeyV4::frontend(Ipv4Addr::new(10, 96, 0, 10), 80)
    }

    fn backend(last: u8) -> BackendValueV4 {
        BackendValueV4::new(Ipv4Addr::new(10, 1, 1, last), 8080, KubeProtocol::Tcp)
    }

    #[test]
    fn test_new_service_publishes_frontend_last() -> Result<()> {
        let (mut state, journal) = new_state();
        state.update(frontend(), FrontendExtra::default(), &[backend(5), backend(6)])?;
        assert_eq!(
            drain(&journal),
            vec![
                Backend(1, true),
                Backend(2, true),
                Slot(1, true),
                Slot(2, true),
                Slot(0, true)
            ]
        );
        Ok(())
    }

    #[test]
    fn test_grow_writes_only_new_slot_before_frontend() -> Result<()> {
        let (mut state, journal) = new_state();
        state.update(frontend(), FrontendExtra::default(), &[backend(5)])?;
        drain(&journal);

        state.update(frontend(), FrontendExtra::default(), &[backend(5), backend(6)])?;
        assert_eq!(
            drain(&journal),
            vec![Backend(2, true), Slot(2, true), Slot(0, true)]
        );
        Ok(())
    }

    #[test]
    fn test_shrink_publishes_count_before_deleting() -> Result<()> {
        let (mut state, journal) = new_state();
        state.update(
            frontend(),
            FrontendExtra::default(),
            &[backend(5), backend(6), backend(7)],
        )?;
        drain(&journal);

        state.update(frontend(), FrontendExtra::default(), &[backend(5)])?;
        assert_eq!(
            drain(&journal),
            vec![
                Slot(0, true),
                Slot(2, false),
                Slot(3, false),
                Backend(2, false),
                Backend(3, false)
            ]
        );

        let value = state.services.get_from_map(&frontend())?;
        assert_eq!(value.count, 1);
        Ok(())
    }

    #[test]
    fn test_shrink_to_zero_keeps_frontend() -> Result<()> {
        let (mut state, _journal) = new_state();
        state.update(frontend(), FrontendExtra::default(), &[backend(5)])?;
        state.update(frontend(), FrontendExtra::default(), &[])?;

        assert_eq!(state.services.get_from_map(&frontend())?.count, 0);
        assert!(state.services.get_from_map(&frontend().with_slot(1)).is_err());
        assert_eq!(state.backend_count(), 0);
        Ok(())
    }

    #[test]
    fn test_remove_frontend_first() -> Result<()> {
        let (mut state, journal) = new_state();
        state.update(frontend(), FrontendExtra::default(), &[backend(5), backend(6)])?;
        drain(&journal);

        assert!(state.remove(&frontend())?);
        assert_eq!(
            drain(&journal),
            vec![
                Slot(0, false),
                Slot(1, false),
                Slot(2, false),
                Backend(1, false),
                Backend(2, false)
            ]
        );
        assert!(!state.remove(&frontend())?);
        assert!(drain(&journal).is_empty());
        assert_eq!(state.frontend_count(), 0);
        Ok(())
    }

    #[test]
    fn test_shared_backend_is_refcounted() -> Result<()> {
        let (mut state, _journal) = new_state();
        let other = ServiceKeyV4::frontend(Ipv4Addr::new(10, 96, 0, 11), 80);
        state.update(frontend(), FrontendExtra::default(), &[backend(5)])?;
        state.update(other, FrontendExtra::default(), &[backend(5), backend(6)])?;
        assert_eq!(state.backend_count(), 2);

        let slot = state.services.get_from_map(&other.with_slot(1))?;
        assert_eq!(slot.backend_id, 1);

        state.remove(&frontend())?;
        assert_eq!(state.backends.get_from_map(&1)?, backend(5));

        state.remove(&other)?;
        assert!(state.backends.get_from_map(&1).is_err());
        assert_eq!(state.backend_count(), 0);
        Ok(())
    }

    #[test]
    fn test_rev_nat_index_per_service() -> Result<()> {
        let (mut state, _journal) = new_state();
        let other = ServiceKeyV4::frontend(Ipv4Addr::new(10, 96, 0, 11), 443);
        let first = state.update(frontend(), FrontendExtra::default(), &[backend(5)])?;
        let second = state.update(other, FrontendExtra::default(), &[backend(6)])?;
        assert_ne!(first, 0);
        assert_ne!(first, second);

        let again = state.update(frontend(), FrontendExtra::default(), &[backend(7)])?;
        assert_eq!(first, again);
        assert_eq!(state.rev_nat_index(&frontend()), Some(first));

        state.remove(&frontend())?;
        let third = ServiceKeyV4::frontend(Ipv4Addr::new(10, 96, 0, 12), 80);
        assert_eq!(
            state.update(third, FrontendExtra::default(), &[backend(5)])?,
            first
        );
        Ok(())
    }

    #[test]
    fn test_frontend_extra_round_trips() -> Result<()> {
        let (mut state, _journal) = new_state();
        state.update(frontend(), FrontendExtra::L7ProxyPort(15001), &[backend(5)])?;
        let value = state.services.get_from_map(&frontend())?;
        let ServiceRecord::Frontend(record) = ServiceRecord::decode(&frontend(), &value) else {
            panic!("slot 0 must decode as a frontend");
        };
        assert_eq!(record.l7_proxy_port(), Some(15001));
        assert_eq!(record.backend_count, 1);
        Ok(())
    }

    #[test]
    fn test_state_from_cache_in_slot_order() -> Result<()> {
        let (mut state, _journal) = new_state();
        let backends = [backend(7), backend(5), backend(6)];
        state.update(frontend(), FrontendExtra::default(), &backends)?;
        let cached = state.state_from_cache();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached.get(&frontend()), Some(&backends.to_vec()));
        Ok(())
    }

    #[test]
    fn test_too_many_backends() {
        let (mut state, journal) = new_state();
        let backends = vec![backend(5); usize::from(u16::MAX) + 1];
        let result = state.update(frontend(), FrontendExtra::default(), &backends);
        assert!(matches!(result, Err(Error::ConversionError(_))));
        assert!(drain(&journal).is_empty());
    }

    #[test]
    fn test_ids_start_past_existing_backends() -> Result<()> {
        let journal = Journal::default();
        let mut existing = ahash::HashMap::default();
        existing.insert(41, backend(9));
        let services = Services {
            inner: Default::default(),
            journal: journal.clone(),
            fail: FailOn::default(),
        };
        let backends = Backends {
            inner: existing,
            journal: journal.clone(),
            fail: FailOn::default(),
        };
        let mut state = ServiceBackendState::try_new(services, backends)?;
        state.update(frontend(), FrontendExtra::default(), &[backend(5)])?;
        assert_eq!(state.services.get_from_map(&frontend().with_slot(1))?.backend_id, 42);

        assert_eq!(state.prune_unmanaged()?, (0, 1));
        assert!(state.backends.get_from_map(&41).is_err());
        Ok(())
    }

    #[test]
    fn test_remove_retries_after_failed_slot_delete() -> Result<()> {
        let (mut state, journal, fail) = failing_state();
        state.update(frontend(), FrontendExtra::default(), &[backend(5), backend(6)])?;
        drain(&journal);

        fail.replace(Some(Slot(1, false)));
        assert!(state.remove(&frontend()).is_err());
        assert_eq!(drain(&journal), vec![Slot(0, false)]);
        assert_eq!(state.frontend_count(), 1);

        assert!(state.remove(&frontend())?);
        assert_eq!(
            drain(&journal),
            vec![
                Slot(1, false),
                Slot(2, false),
                Backend(1, false),
                Backend(2, false)
            ]
        );
        assert_eq!(map_sizes(&state), (0, 0));
        assert_eq!(state.backend_count(), 0);
        assert!(!state.remove(&frontend())?);
        Ok(())
    }

    #[test]
    fn test_remove_retries_after_failed_backend_delete() -> Result<()> {
        let (mut state, journal, fail) = failing_state();
        let other = ServiceKeyV4::frontend(Ipv4Addr::new(10, 96, 0, 11), 80);
        state.update(frontend(), FrontendExtra::default(), &[backend(5), backend(6)])?;
        state.update(other, FrontendExtra::default(), &[backend(5)])?;
        drain(&journal);

        fail.replace(Some(Backend(2, false)));
        assert!(state.remove(&frontend()).is_err());
        assert!(state.remove(&frontend())?);
        assert_eq!(
            drain(&journal),
            vec![Slot(0, false), Slot(1, false), Slot(2, false), Backend(2, false)]
        );

        // still referenced by the other service exactly once
        assert_eq!(state.backends.get_from_map(&1)?, backend(5));
        assert_eq!(state.backend_count(), 1);
        state.remove(&other)?;
        assert_eq!(map_sizes(&state), (0, 0));
        Ok(())
    }

    #[test]
    fn test_failed_frontend_write_keeps_no_extra_references() -> Result<()> {
        let (mut state, _journal, fail) = failing_state();
        fail.replace(Some(Slot(0, true)));
        let backends = [backend(5), backend(6)];
        assert!(
            state
                .update(frontend(), FrontendExtra::default(), &backends)
                .is_err()
        );
        assert!(state.services.get_from_map(&frontend()).is_err());

        let rev_nat_index = state.update(frontend(), FrontendExtra::default(), &backends)?;
        assert_eq!(state.backend_count(), 2);
        assert_eq!(map_sizes(&state), (3, 2));

        assert!(state.remove(&frontend())?);
        assert_eq!(state.backend_count(), 0);
        assert_eq!(map_sizes(&state), (0, 0));

        let other = ServiceKeyV4::frontend(Ipv4Addr::new(10, 96, 0, 11), 80);
        assert_eq!(
            state.update(other, FrontendExtra::default(), &[backend(7)])?,
            rev_nat_index
        );
        Ok(())
    }

    #[test]
    fn test_failed_new_service_can_be_removed() -> Result<()> {
        let (mut state, _journal, fail) = failing_state();
        fail.replace(Some(Slot(2, true)));
        assert!(
            state
                .update(frontend(), FrontendExtra::default(), &[backend(5), backend(6)])
                .is_err()
        );
        assert_eq!(map_sizes(&state), (1, 2));
        assert_eq!(state.frontends().collect::<Vec<_>>(), vec![&frontend()]);

        assert!(state.remove(&frontend())?);
        assert_eq!(map_sizes(&state), (0, 0));
        assert_eq!(state.backend_count(), 0);
        assert_eq!(state.frontend_count(), 0);
        Ok(())
    }

    #[test]
    fn test_failed_backend_write_converges() -> Result<()> {
        let (mut state, _journal, fail) = failing_state();
        fail.replace(Some(Backend(2, true)));
        let backends = [backend(5), backend(6)];
        assert!(
            state
                .update(frontend(), FrontendExtra::default(), &backends)
                .is_err()
        );

        state.update(frontend(), FrontendExtra::default(), &backends)?;
        assert_eq!(
            state.state_from_cache().get(&frontend()),
            Some(&backends.to_vec())
        );
        assert_eq!(state.backend_count(), 2);
        assert_eq!(map_sizes(&state), (3, 2));
        Ok(())
    }

    #[test]
    fn test_failed_grow_converges() -> Result<()> {
        let (mut state, _journal, fail) = failing_state();
        state.update(frontend(), FrontendExtra::default(), &[backend(5)])?;

        fail.replace(Some(Slot(3, true)));
        let backends = [backend(5), backend(6), backend(7)];
        assert!(
            state
                .update(frontend(), FrontendExtra::default(), &backends)
                .is_err()
        );
        // readers still see the old count
        assert_eq!(state.services.get_from_map(&frontend())?.count, 1);

        state.update(frontend(), FrontendExtra::default(), &backends)?;
        assert_eq!(
            state.state_from_cache().get(&frontend()),
            Some(&backends.to_vec())
        );
        assert_eq!(map_sizes(&state), (4, 3));
        assert_eq!(state.backend_count(), 3);

        state.remove(&frontend())?;
        assert_eq!(map_sizes(&state), (0, 0));
        Ok(())
    }

    #[test]
    fn test_failed_shrink_converges() -> Result<()> {
        let (mut state, journal, fail) = failing_state();
        state.update(
            frontend(),
            FrontendExtra::default(),
            &[backend(5), backend(6), backend(7)],
        )?;

        fail.replace(Some(Slot(3, false)));
        assert!(
            state
                .update(frontend(), FrontendExtra::default(), &[backend(5)])
                .is_err()
        );
        assert_eq!(state.services.get_from_map(&frontend())?.count, 1);
        drain(&journal);

        state.update(frontend(), FrontendExtra::default(), &[backend(5)])?;
        assert_eq!(
            drain(&journal),
            vec![Slot(3, false), Backend(2, false), Backend(3, false)]
        );
        assert_eq!(map_sizes(&state), (2, 1));
        assert_eq!(state.backend_count(), 1);
        assert_eq!(
            state.state_from_cache().get(&frontend()),
            Some(&vec![backend(5)])
        );
        Ok(())
    }
}
