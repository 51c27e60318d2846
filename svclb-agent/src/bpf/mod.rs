pub mod loader;
pub mod service;

use std::borrow::BorrowMut;
use std::hash::Hash;
use std::io;
use std::path::Path;
use std::sync::Arc;

use aya::Pod;
use aya::maps::{HashMap, Map, MapData, MapError};
use aya::sys::SyscallError;
use dashmap::DashMap;
use svclb_common::{
    BPF_MAP_BACKENDS_V4, BPF_MAP_SERVICES_V4, BackendId, BackendTable, BackendValueV4,
    ServiceKeyV4, ServiceTable, ServiceValueV4,
};

use crate::{Error, Result};

pub type ServiceMapV4 = HashMap<MapData, ServiceKeyV4, ServiceValueV4>;
pub type BackendMapV4 = HashMap<MapData, BackendId, BackendValueV4>;

pub trait BpfMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()>;
    fn delete(&mut self, key: &K) -> Result<()>;
    fn get(&self, key: &K) -> Result<V>;
    fn get_state(&self) -> Result<ahash::HashMap<K, V>>;
}

impl<T: BorrowMut<MapData>, K: Pod + Eq + Hash, V: Pod> BpfMap<K, V> for HashMap<T, K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        Ok(self.insert(key, value, 0)?)
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        match self.remove(key) {
            Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
            // ENOENT: already gone
            Err(MapError::SyscallError(SyscallError { io_error, .. }))
                if io_error.kind() == io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
    fn get(&self, key: &K) -> Result<V> {
        Ok(<HashMap<T, K, V>>::get(self, key, 0)?)
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let mut map = ahash::HashMap::default();
        for v in self.iter() {
            let (k, v) = v?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<K: Copy + Eq + Hash, V: Copy> BpfMap<K, V> for ahash::HashMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
    fn get(&self, key: &K) -> Result<V> {
        match <ahash::HashMap<K, V>>::get(self, key) {
            Some(i) => Ok(*i),
            None => Err(Error::Other("not found".into())),
        }
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.clone())
    }
}

/// A map shared between one writer and any number of readers, standing in
/// for a kernel map that the connect hook reads while the agent writes.
impl<K: Copy + Eq + Hash, V: Copy> BpfMap<K, V> for Arc<DashMap<K, V>> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
    fn get(&self, key: &K) -> Result<V> {
        match DashMap::get(self, key) {
            Some(v) => Ok(*v),
            None => Err(Error::Other("not found".into())),
        }
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.iter().map(|e| (*e.key(), *e.value())).collect())
    }
}

/// Write-through cache over a [`BpfMap`]. Writes of a value equal to the
/// cached one never reach the map.
pub struct BpfState<M, K, V>
where
    M: BpfMap<K, V>,
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    cache: ahash::HashMap<K, V>,
    bpf_map: M,
}

impl<M, K, V> BpfState<M, K, V>
where
    M: BpfMap<K, V>,
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    pub fn new(bpf_map: M) -> Self {
        let cache = ahash::HashMap::default();
        Self { cache, bpf_map }
    }

    pub fn update(&mut self, key: K, value: V) -> Result<()> {
        if let Some(current) = self.cache.get(&key)
            && *current == value
        {
            return Ok(());
        };
        self.bpf_map.update(key.clone(), value.clone())?;
        self.cache.insert(key, value);
        Ok(())
    }

    /// Deleting a key this state never wrote, or already deleted, is a no-op,
    /// so a delete that failed halfway through a batch can be retried.
    pub fn delete(&mut self, key: &K) -> Result<()> {
        if !self.cache.contains_key(key) {
            return Ok(());
        }
        self.bpf_map.delete(key)?;
        self.cache.remove(key);
        Ok(())
    }

    pub fn get_from_cache(&self, key: &K) -> Option<&V> {
        self.cache.get(key)
    }

    pub fn get_from_map(&self, key: &K) -> Result<V> {
        self.bpf_map.get(key)
    }

    pub fn cache(&self) -> &ahash::HashMap<K, V> {
        &self.cache
    }

    /// Deletes map entries this state never wrote, such as the leftovers of a
    /// previous run in a pinned map. Returns how many were deleted.
    pub fn prune_unmanaged(&mut self) -> Result<usize> {
        let stale: Vec<K> = self
            .bpf_map
            .get_state()?
            .into_iter()
            .map(|(k, _)| k)
            .filter(|k| !self.cache.contains_key(k))
            .collect();
        for key in &stale {
            self.bpf_map.delete(key)?;
        }
        Ok(stale.len())
    }
}

/// Read view of a [`BpfMap`] for the connect interceptor. Every read error is
/// a miss.
pub struct MapTable<M>(pub M);

impl<M: BpfMap<ServiceKeyV4, ServiceValueV4>> ServiceTable for MapTable<M> {
    fn lookup(&self, key: &ServiceKeyV4) -> Option<ServiceValueV4> {
        self.0.get(key).ok()
    }
}

impl<M: BpfMap<BackendId, BackendValueV4>> BackendTable for MapTable<M> {
    fn lookup(&self, id: BackendId) -> Option<BackendValueV4> {
        self.0.get(&id).ok()
    }
}

/// Opens the service and backend maps pinned under `pin_path`.
pub fn open_pinned_maps(pin_path: &Path) -> Result<(ServiceMapV4, BackendMapV4)> {
    let services = open_pinned(pin_path, BPF_MAP_SERVICES_V4)?;
    let backends = open_pinned(pin_path, BPF_MAP_BACKENDS_V4)?;
    Ok((services.try_into()?, backends.try_into()?))
}

fn open_pinned(pin_path: &Path, name: &str) -> Result<Map> {
    let path = pin_path.join(name);
    if !path.exists() {
        return Err(Error::MapNotFound {
            name: path.display().to_string(),
        });
    }
    Ok(Map::HashMap(MapData::from_pin(&path)?))
}
