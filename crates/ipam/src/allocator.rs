//! Pool allocator
//!
//! Hands out `(address, MAC)` bindings from ClusterIPPools, finds them again
//! by workload or MAC and returns them to the pool when the workload goes
//! away.
//!
//! Writes are ordered binding first, pool counters second. A crash between
//! the two leaves the pool under-counting allocations; the next allocation
//! that lands on the bound index repairs the counters, and
//! [`Allocator::recount_pool`] rebuilds them from the binding set.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crds::{
    AllocationRecord, ClusterIP, ClusterIPPool, ClusterIPSpec, ClusterIPStatus, IpFamily,
    PoolCondition,
};
use tracing::{debug, error, info, warn};

use crate::cidr;
use crate::error::{IpamError, StoreError};
use crate::ledger;
use crate::mac::{self, MacPrefix};
use crate::store::{BindingQuery, Repository, WorkloadDirectory, WorkloadKey};

/// Default number of attempts for a write that keeps losing races.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Allocator settings.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    /// First octet of derived MACs
    pub mac_prefix: MacPrefix,
    /// Attempts before a conflicting write gives up
    pub max_attempts: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            mac_prefix: MacPrefix::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Attach request as seen by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Interface name inside the workload
    pub interface: String,
    /// Requested address family
    pub family: IpFamily,
}

/// A live binding and the pool it came from.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// The binding
    pub binding: ClusterIP,
    /// Owning pool
    pub pool: ClusterIPPool,
}

impl Allocation {
    /// Bound address.
    pub fn address(&self) -> Result<IpAddr, IpamError> {
        self.binding.spec.address.parse().map_err(|_| {
            IpamError::InvalidConfig(format!(
                "binding {} carries invalid address {:?}",
                self.binding.metadata.name.as_deref().unwrap_or("<unknown>"),
                self.binding.spec.address
            ))
        })
    }

    /// Bound MAC.
    pub fn mac(&self) -> &str {
        &self.binding.spec.mac
    }
}

fn pool_name(pool: &ClusterIPPool) -> Result<String, IpamError> {
    pool.metadata
        .name
        .clone()
        .ok_or_else(|| IpamError::InvalidConfig("ClusterIPPool missing name".to_string()))
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(20 * u64::from(attempt))
}

fn ready_condition(status: &str, reason: &str, message: String) -> PoolCondition {
    PoolCondition {
        type_: "Ready".to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
    }
}

/// Clears the tenancy of `binding` and records it in the history.
fn released_copy(binding: &ClusterIP, released_at: DateTime<Utc>) -> ClusterIP {
    let mut cleared = binding.clone();
    let mut status = cleared.status.take().unwrap_or_default();
    status.history.push(AllocationRecord {
        mac: binding.spec.mac.clone(),
        interface: binding.spec.interface.clone(),
        resource: binding.spec.resource.clone(),
        allocated_at: status.allocated_at,
        released_at,
    });
    status.allocated_at = None;
    cleared.status = Some(status);
    cleared.spec.mac.clear();
    cleared.spec.interface.clear();
    cleared.spec.resource.clear();
    cleared
}

/// Cluster address allocator.
pub struct Allocator {
    store: Arc<dyn Repository>,
    directory: Arc<dyn WorkloadDirectory>,
    config: AllocatorConfig,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Allocator {
    /// Creates an allocator over `store` and `directory`.
    pub fn new(
        store: Arc<dyn Repository>,
        directory: Arc<dyn WorkloadDirectory>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            store,
            directory,
            config: AllocatorConfig {
                max_attempts: config.max_attempts.max(1),
                ..config
            },
        }
    }

    /// Allocator settings.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Resolves the workload behind pod `namespace/pod`.
    pub async fn resolve_workload(&self, namespace: &str, pod: &str) -> Result<WorkloadKey, IpamError> {
        match self.directory.pod_labels(namespace, pod).await? {
            Some(labels) => Ok(WorkloadKey::for_pod(namespace, pod, &labels)),
            None => Err(IpamError::WorkloadNotFound(format!("{namespace}/{pod}"))),
        }
    }

    /// Returns the live binding for the request, allocating one if none exists.
    ///
    /// Repeated calls for the same workload interface and family return the
    /// same binding.
    pub async fn allocate_or_find(&self, request: &AttachRequest) -> Result<Allocation, IpamError> {
        let workload = self.resolve_workload(&request.namespace, &request.pod).await?;

        for attempt in 1..=self.config.max_attempts {
            if let Some(binding) = self
                .find_live(request.family, &request.interface, &workload)
                .await?
            {
                let pool = self.find_pool(&binding.spec.cluster_ip_pool).await?;
                debug!(
                    "Reusing binding {} ({}) for {} {}",
                    binding.metadata.name.as_deref().unwrap_or("<unknown>"),
                    binding.spec.address,
                    workload,
                    request.interface
                );
                return Ok(Allocation { binding, pool });
            }

            match self.allocate(request, &workload).await {
                Err(IpamError::Store(StoreError::Conflict(reason))) => {
                    warn!(attempt, %reason, "Allocation for {} raced with another writer, retrying", workload);
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
                result => return result,
            }
        }

        Err(IpamError::StoreConflict(format!(
            "allocation for {workload} {} lost {} races",
            request.interface, self.config.max_attempts
        )))
    }

    /// Live binding of `interface` of `workload` in `family`, if any.
    pub async fn find_live(
        &self,
        family: IpFamily,
        interface: &str,
        workload: &WorkloadKey,
    ) -> Result<Option<ClusterIP>, IpamError> {
        let query = BindingQuery::live(family, interface, workload);
        let mut found: Vec<ClusterIP> = self
            .store
            .find_bindings(&query)
            .await?
            .into_iter()
            .filter(ClusterIP::is_bound)
            .collect();
        if found.len() > 1 {
            warn!(
                "{} live {} bindings for {} {}, using the first by name",
                found.len(),
                family,
                workload,
                interface
            );
            found.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        }
        Ok(found.into_iter().next())
    }

    /// First pool of `family`, in listing order, with a free index.
    pub async fn select_pool(&self, family: IpFamily) -> Result<ClusterIPPool, IpamError> {
        self.store
            .list_pools(family)
            .await?
            .into_iter()
            .find(|pool| pool.status.as_ref().and_then(ledger::peek_index).is_some())
            .ok_or(IpamError::PoolExhausted(family))
    }

    /// Pool by name.
    pub async fn find_pool(&self, name: &str) -> Result<ClusterIPPool, IpamError> {
        match self.store.get_pool(name).await {
            Ok(pool) => Ok(pool),
            Err(StoreError::NotFound(_)) => Err(IpamError::NotFound(format!("ClusterIPPool {name}"))),
            Err(e) => Err(e.into()),
        }
    }

    /// Live binding carrying `mac` in `family`.
    pub async fn find_by_mac(&self, mac: &str, family: IpFamily) -> Result<ClusterIP, IpamError> {
        let mac = mac::normalize_mac(mac);
        self.store
            .find_bindings(&BindingQuery::by_mac(&mac, family))
            .await?
            .into_iter()
            .find(ClusterIP::is_bound)
            .ok_or_else(|| IpamError::NotFound(format!("no {family} binding for MAC {mac}")))
    }

    /// Fails when a live binding of another workload interface already
    /// carries `mac`, since MAC lookups would then be ambiguous.
    async fn ensure_mac_unused(&self, mac: &str, family: IpFamily, workload: &WorkloadKey) -> Result<(), IpamError> {
        let holder = self
            .store
            .find_bindings(&BindingQuery::by_mac(mac, family))
            .await?
            .into_iter()
            .find(ClusterIP::is_bound);
        match holder {
            Some(holder) => {
                error!(
                    "Derived MAC {} for {} collides with binding {} held by {}",
                    mac,
                    workload,
                    holder.metadata.name.as_deref().unwrap_or("<unknown>"),
                    holder.spec.resource
                );
                Err(IpamError::MacCollision(format!(
                    "{mac} for {workload} is held by {} {}",
                    holder.spec.resource, holder.spec.interface
                )))
            }
            None => Ok(()),
        }
    }

    async fn allocate(&self, request: &AttachRequest, workload: &WorkloadKey) -> Result<Allocation, IpamError> {
        let mac = mac::derive_mac(self.config.mac_prefix, &workload.to_string(), &request.interface);
        self.ensure_mac_unused(&mac, request.family, workload).await?;

        let pool = self.select_pool(request.family).await?;
        let name = pool_name(&pool)?;

        let mut status = pool.status_or_default();
        let index = ledger::take_index(&mut status).ok_or(IpamError::PoolExhausted(request.family))?;
        let mut claimed = pool.clone();
        claimed.status = Some(status);

        let address = cidr::address_at(&pool.spec.cidr, index)?;
        let spec = ClusterIPSpec {
            cluster_ip_pool: name.clone(),
            index,
            address: address.to_string(),
            mac,
            interface: request.interface.clone(),
            family: request.family,
            resource: workload.to_string(),
        };

        let binding = match self.bind_index(&name, spec).await {
            Ok(binding) => binding,
            Err(BindOutcome::HeldElsewhere(holder)) => {
                // The counters missed an allocation; record it so the next attempt moves on.
                warn!("Index {} of pool {} is already held by {}, repairing counters", index, name, holder);
                self.commit_claim(claimed, index).await?;
                return Err(StoreError::Conflict(format!("index {index} of {name} held by {holder}")).into());
            }
            Err(BindOutcome::Failed(e)) => return Err(e),
        };

        let pool = match self.commit_claim(claimed, index).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!("Binding {} created but pool {} counters not updated: {}", index, name, e);
                pool
            }
        };

        info!(
            "Allocated {} ({}) from pool {} to {} {}",
            binding.spec.address, binding.spec.mac, name, workload, request.interface
        );
        Ok(Allocation { binding, pool })
    }

    /// Writes the binding object for `spec.index`, reusing a retained unbound object.
    async fn bind_index(&self, pool: &str, spec: ClusterIPSpec) -> Result<ClusterIP, BindOutcome> {
        let name = ClusterIP::object_name(pool, spec.index);
        let now = Utc::now();

        match self.store.get_binding(&name).await {
            Ok(existing) if existing.is_bound() => Err(BindOutcome::HeldElsewhere(existing.spec.resource)),
            Ok(mut existing) => {
                existing.spec = spec;
                let mut status = existing.status.take().unwrap_or_default();
                status.allocated_at = Some(now);
                existing.status = Some(status);
                let written = self.store.update_binding(&existing).await;
                self.committed_binding(&name, written).await
            }
            Err(StoreError::NotFound(_)) => {
                let mut binding = ClusterIP::new(&name, spec);
                binding.status = Some(ClusterIPStatus {
                    allocated_at: Some(now),
                    history: Vec::new(),
                });
                let written = self.store.create_binding(&binding).await;
                self.committed_binding(&name, written).await
            }
            Err(e) => Err(IpamError::from(e).into()),
        }
    }

    /// The bound object after a binding write. A lost status only costs the
    /// tenure start, so the committed spec is read back and used.
    async fn committed_binding(
        &self,
        name: &str,
        written: Result<ClusterIP, StoreError>,
    ) -> Result<ClusterIP, BindOutcome> {
        match written {
            Ok(binding) => Ok(binding),
            Err(StoreError::StatusNotWritten(reason)) => {
                warn!("Binding {} bound without its status: {}", name, reason);
                Ok(self.store.get_binding(name).await.map_err(IpamError::from)?)
            }
            Err(e) => Err(IpamError::from(e).into()),
        }
    }

    /// Persists a claim of `index`, re-applying it to a fresh read on conflict.
    async fn commit_claim(&self, claimed: ClusterIPPool, index: u64) -> Result<ClusterIPPool, IpamError> {
        let name = pool_name(&claimed)?;
        let mut candidate = claimed;

        for attempt in 1..=self.config.max_attempts {
            match self.store.update_pool_status(&candidate).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::Conflict(reason)) => {
                    debug!(attempt, %reason, "Pool {} status update conflicted", name);
                    let mut fresh = self.store.get_pool(&name).await?;
                    let mut status = fresh.status_or_default();
                    if !ledger::claim(&mut status, index) {
                        return Ok(fresh);
                    }
                    fresh.status = Some(status);
                    candidate = fresh;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(IpamError::StoreConflict(format!(
            "claim of index {index} in pool {name} lost {} races",
            self.config.max_attempts
        )))
    }

    /// Releases every binding held by `workload`. Returns how many were released.
    ///
    /// Releasing a workload with no bindings is a no-op.
    pub async fn release(&self, workload: &WorkloadKey, released_at: DateTime<Utc>) -> Result<usize, IpamError> {
        let released = self.release_where(workload, released_at, |_| true).await?;
        if released > 0 {
            info!("Released {} binding(s) held by {}", released, workload);
        }
        Ok(released)
    }

    /// Releases the bindings of `workload` whose MAC is not in `live_macs`,
    /// i.e. interfaces that were unplugged while the workload keeps running.
    pub async fn release_unplugged(
        &self,
        workload: &WorkloadKey,
        live_macs: &BTreeSet<String>,
        released_at: DateTime<Utc>,
    ) -> Result<usize, IpamError> {
        let released = self
            .release_where(workload, released_at, |binding| {
                !live_macs.contains(&mac::normalize_mac(&binding.spec.mac))
            })
            .await?;
        if released > 0 {
            info!("Released {} unplugged binding(s) of {}", released, workload);
        }
        Ok(released)
    }

    async fn release_where<F>(
        &self,
        workload: &WorkloadKey,
        released_at: DateTime<Utc>,
        selected: F,
    ) -> Result<usize, IpamError>
    where
        F: Fn(&ClusterIP) -> bool,
    {
        let bindings = self.store.find_bindings(&BindingQuery::by_resource(workload)).await?;
        let mut released = 0;

        for binding in bindings.into_iter().filter(|b| b.is_bound() && selected(b)) {
            let pool = binding.spec.cluster_ip_pool.clone();
            let index = binding.spec.index;
            debug!(workload = %workload, mac = %binding.spec.mac, "Releasing binding of {}", pool);
            if self.release_binding(binding, workload, released_at).await? {
                self.restore_index(&pool, index).await?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Clears `binding` if it is still held by `workload`.
    async fn release_binding(
        &self,
        mut binding: ClusterIP,
        workload: &WorkloadKey,
        released_at: DateTime<Utc>,
    ) -> Result<bool, IpamError> {
        let name = binding.metadata.name.clone().unwrap_or_default();
        let owner = workload.to_string();

        for attempt in 1..=self.config.max_attempts {
            if !binding.is_bound() || binding.spec.resource != owner {
                return Ok(false);
            }
            match self.store.update_binding(&released_copy(&binding, released_at)).await {
                Ok(_) => {
                    debug!("Released binding {} ({})", name, binding.spec.address);
                    return Ok(true);
                }
                Err(StoreError::StatusNotWritten(reason)) => {
                    // The binding is already unbound; its index must go back to the pool
                    warn!("Released binding {} without recording its history: {}", name, reason);
                    return Ok(true);
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(attempt, %reason, "Release of binding {} conflicted", name);
                    binding = match self.store.get_binding(&name).await {
                        Ok(fresh) => fresh,
                        Err(StoreError::NotFound(_)) => return Ok(false),
                        Err(e) => return Err(e.into()),
                    };
                }
                Err(StoreError::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }

        Err(IpamError::StoreConflict(format!(
            "release of binding {name} lost {} races",
            self.config.max_attempts
        )))
    }

    /// Returns `index` to pool `name`.
    async fn restore_index(&self, name: &str, index: u64) -> Result<(), IpamError> {
        for attempt in 1..=self.config.max_attempts {
            let mut pool = match self.store.get_pool(name).await {
                Ok(pool) => pool,
                Err(StoreError::NotFound(_)) => {
                    warn!("Pool {} of released index {} no longer exists", name, index);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let mut status = pool.status_or_default();
            if !ledger::restore(&mut status, index) {
                warn!("Index {} was not counted as allocated in pool {}", index, name);
                return Ok(());
            }
            pool.status = Some(status);

            match self.store.update_pool_status(&pool).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict(reason)) => {
                    debug!(attempt, %reason, "Restoring index {} to pool {} conflicted", index, name);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(IpamError::StoreConflict(format!(
            "restoring index {index} to pool {name} lost {} races",
            self.config.max_attempts
        )))
    }

    /// Rebuilds the counters of pool `name` from its live bindings and marks it ready.
    pub async fn recount_pool(&self, name: &str) -> Result<ClusterIPPool, IpamError> {
        for attempt in 1..=self.config.max_attempts {
            let mut pool = self.store.get_pool(name).await?;
            let net = cidr::parse(&pool.spec.cidr)?;
            let total = cidr::usable_addresses(&net);

            let live: BTreeSet<u64> = self
                .store
                .find_bindings(&BindingQuery::in_pool(name))
                .await?
                .into_iter()
                .filter(ClusterIP::is_bound)
                .map(|b| b.spec.index)
                .collect();

            let before = pool.status_or_default();
            let mut status = before.clone();
            ledger::recount(&mut status, total, &live);
            status.set_condition(ready_condition(
                "True",
                "Reconciled",
                format!("{} of {} addresses allocated", status.allocated_ips, status.total_ips),
            ));
            if status == before {
                return Ok(pool);
            }
            status.last_reconciled = Some(Utc::now());
            let (allocated, free) = (status.allocated_ips, status.free_ips);
            pool.status = Some(status);

            match self.store.update_pool_status(&pool).await {
                Ok(updated) => {
                    info!("Recounted pool {}: {} allocated, {} free", name, allocated, free);
                    return Ok(updated);
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(attempt, %reason, "Recount of pool {} conflicted", name);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(IpamError::StoreConflict(format!(
            "recount of pool {name} lost {} races",
            self.config.max_attempts
        )))
    }

    /// Marks pool `name` as not ready because of `reason`.
    pub async fn mark_pool_unready(&self, name: &str, reason: &str, message: &str) -> Result<(), IpamError> {
        for _ in 0..self.config.max_attempts {
            let mut pool = self.store.get_pool(name).await?;
            let mut status = pool.status_or_default();
            let condition = ready_condition("False", reason, message.to_string());
            if status.conditions.contains(&condition) {
                return Ok(());
            }
            status.set_condition(condition);
            status.last_reconciled = Some(Utc::now());
            pool.status = Some(status);

            match self.store.update_pool_status(&pool).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(IpamError::StoreConflict(format!("marking pool {name} unready")))
    }
}

/// Result of trying to bind an index that turned out to be taken.
enum BindOutcome {
    /// Index is bound to another workload (`resource` given)
    HeldElsewhere(String),
    /// Any other failure
    Failed(IpamError),
}

impl From<IpamError> for BindOutcome {
    fn from(e: IpamError) -> Self {
        BindOutcome::Failed(e)
    }
}
