//! In-memory store for unit testing
//!
//! Implements [`Repository`] and [`WorkloadDirectory`] without a cluster.
//! Resource versions are tracked so compare-and-swap races can be reproduced,
//! and conflicts can be injected on the next N writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use crds::{ClusterIP, ClusterIPPool, IpFamily};

use crate::error::StoreError;
use crate::store::{BindingQuery, KUBEVIRT_VM_LABEL, Repository, WorkloadDirectory};

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<String, ClusterIPPool>,
    bindings: BTreeMap<String, ClusterIP>,
    version: u64,
    pool_conflicts: u32,
    binding_conflicts: u32,
    lost_statuses: u32,
    unavailable: bool,
}

impl State {
    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }
}

/// In-memory [`Repository`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<State>>,
}

impl MemoryRepository {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a pool (for test setup). Overwrites any pool with the same name.
    pub fn add_pool(&self, mut pool: ClusterIPPool) {
        let mut state = self.lock();
        let name = pool.metadata.name.clone().unwrap_or_default();
        pool.metadata.resource_version = Some(state.bump());
        state.pools.insert(name, pool);
    }

    /// Adds a binding (for test setup).
    pub fn add_binding(&self, mut binding: ClusterIP) {
        let mut state = self.lock();
        let name = binding.metadata.name.clone().unwrap_or_default();
        binding.metadata.resource_version = Some(state.bump());
        state.bindings.insert(name, binding);
    }

    /// Current copy of pool `name`.
    pub fn pool(&self, name: &str) -> Option<ClusterIPPool> {
        self.lock().pools.get(name).cloned()
    }

    /// Current copy of binding `name`.
    pub fn binding(&self, name: &str) -> Option<ClusterIP> {
        self.lock().bindings.get(name).cloned()
    }

    /// All bindings, ordered by name.
    pub fn bindings(&self) -> Vec<ClusterIP> {
        self.lock().bindings.values().cloned().collect()
    }

    /// Makes the next `count` pool status writes fail with a conflict.
    pub fn fail_next_pool_updates(&self, count: u32) {
        self.lock().pool_conflicts = count;
    }

    /// Makes the next `count` binding writes fail with a conflict.
    pub fn fail_next_binding_writes(&self, count: u32) {
        self.lock().binding_conflicts = count;
    }

    /// Makes the next `count` binding writes commit the spec but drop the
    /// status, as a failed second write against the API server would.
    pub fn lose_next_binding_statuses(&self, count: u32) {
        self.lock().lost_statuses = count;
    }

    /// Makes every call fail with a backend error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }
}

fn injected(counter: &mut u32, what: &str) -> Result<(), StoreError> {
    if *counter > 0 {
        *counter -= 1;
        return Err(StoreError::Conflict(format!("{what}: injected conflict")));
    }
    Ok(())
}

/// Stores `binding`, keeping the previous status when a lost status write
/// is injected.
fn store_binding(state: &mut State, name: String, binding: &ClusterIP) -> Result<ClusterIP, StoreError> {
    let mut stored = binding.clone();
    stored.metadata.resource_version = Some(state.bump());
    let lose_status = state.lost_statuses > 0;
    if lose_status {
        state.lost_statuses -= 1;
        stored.status = state.bindings.get(&name).and_then(|b| b.status.clone());
    }
    state.bindings.insert(name.clone(), stored.clone());
    if lose_status {
        return Err(StoreError::StatusNotWritten(format!("ClusterIP {name}: injected failure")));
    }
    Ok(stored)
}

fn check_version(stored: Option<&String>, incoming: Option<&String>, what: &str) -> Result<(), StoreError> {
    match incoming {
        Some(version) if Some(version) != stored => Err(StoreError::Conflict(format!(
            "{what}: resource version {version} is stale"
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_pools(&self, family: IpFamily) -> Result<Vec<ClusterIPPool>, StoreError> {
        let state = self.lock();
        state.check_available()?;
        Ok(state
            .pools
            .values()
            .filter(|pool| pool.spec.ip_family == family)
            .cloned()
            .collect())
    }

    async fn get_pool(&self, name: &str) -> Result<ClusterIPPool, StoreError> {
        let state = self.lock();
        state.check_available()?;
        state
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ClusterIPPool {name}")))
    }

    async fn update_pool_status(&self, pool: &ClusterIPPool) -> Result<ClusterIPPool, StoreError> {
        let mut state = self.lock();
        state.check_available()?;
        let name = pool.metadata.name.clone().unwrap_or_default();
        let what = format!("ClusterIPPool {name}");
        injected(&mut state.pool_conflicts, &what)?;

        let stored_version = state
            .pools
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?
            .metadata
            .resource_version
            .clone();
        check_version(stored_version.as_ref(), pool.metadata.resource_version.as_ref(), &what)?;

        let version = state.bump();
        let stored = state
            .pools
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;
        stored.status.clone_from(&pool.status);
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn find_bindings(&self, query: &BindingQuery) -> Result<Vec<ClusterIP>, StoreError> {
        let state = self.lock();
        state.check_available()?;
        Ok(state
            .bindings
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect())
    }

    async fn get_binding(&self, name: &str) -> Result<ClusterIP, StoreError> {
        let state = self.lock();
        state.check_available()?;
        state
            .bindings
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ClusterIP {name}")))
    }

    async fn create_binding(&self, binding: &ClusterIP) -> Result<ClusterIP, StoreError> {
        let mut state = self.lock();
        state.check_available()?;
        let name = binding.metadata.name.clone().unwrap_or_default();
        let what = format!("ClusterIP {name}");
        injected(&mut state.binding_conflicts, &what)?;
        if state.bindings.contains_key(&name) {
            return Err(StoreError::Conflict(format!("{what} already exists")));
        }

        store_binding(&mut state, name, binding)
    }

    async fn update_binding(&self, binding: &ClusterIP) -> Result<ClusterIP, StoreError> {
        let mut state = self.lock();
        state.check_available()?;
        let name = binding.metadata.name.clone().unwrap_or_default();
        let what = format!("ClusterIP {name}");
        injected(&mut state.binding_conflicts, &what)?;

        let stored_version = state
            .bindings
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?
            .metadata
            .resource_version
            .clone();
        check_version(stored_version.as_ref(), binding.metadata.resource_version.as_ref(), &what)?;

        store_binding(&mut state, name, binding)
    }
}

/// In-memory [`WorkloadDirectory`].
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    pods: Arc<Mutex<HashMap<(String, String), BTreeMap<String, String>>>>,
}

impl MemoryDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plain pod (for test setup).
    pub fn add_pod(&self, namespace: &str, pod: &str) {
        self.insert(namespace, pod, BTreeMap::new());
    }

    /// Adds a virt-launcher pod running VM `vm` (for test setup).
    pub fn add_vm_pod(&self, namespace: &str, pod: &str, vm: &str) {
        let labels = BTreeMap::from([(KUBEVIRT_VM_LABEL.to_string(), vm.to_string())]);
        self.insert(namespace, pod, labels);
    }

    fn insert(&self, namespace: &str, pod: &str, labels: BTreeMap<String, String>) {
        self.pods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((namespace.to_string(), pod.to_string()), labels);
    }
}

#[async_trait]
impl WorkloadDirectory for MemoryDirectory {
    async fn pod_labels(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        Ok(self
            .pods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), pod.to_string()))
            .cloned())
    }
}
