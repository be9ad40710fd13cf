//! Kubernetes-backed store.
//!
//! Pools and bindings are cluster-scoped custom resources. Every call is
//! bounded by the configured timeout.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use crds::{ClusterIP, ClusterIPPool, IpFamily};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::debug;

use crate::error::StoreError;
use crate::store::{BindingQuery, Repository, WorkloadDirectory};

/// Default deadline for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

async fn bounded<T, F>(timeout: Duration, what: &str, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(|e| StoreError::from_kube(what, e)),
        Err(_) => Err(StoreError::Timeout(format!("{what} after {timeout:?}"))),
    }
}

fn name_of<'a>(meta: &'a ObjectMeta, kind: &str) -> Result<&'a str, StoreError> {
    meta.name
        .as_deref()
        .ok_or_else(|| StoreError::Backend(format!("{kind} without metadata.name")))
}

/// [`Repository`] over the Kubernetes API.
#[derive(Clone)]
pub struct KubeRepository {
    pools: Api<ClusterIPPool>,
    bindings: Api<ClusterIP>,
    timeout: Duration,
}

impl std::fmt::Debug for KubeRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeRepository")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KubeRepository {
    /// Creates a repository using `client`.
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            pools: Api::all(client.clone()),
            bindings: Api::all(client),
            timeout,
        }
    }

    /// Second write of a binding; the spec is already committed at this point.
    async fn write_binding_status(&self, name: &str, binding: &ClusterIP) -> Result<ClusterIP, StoreError> {
        let patch = json!({ "status": binding.status });
        bounded(
            self.timeout,
            &format!("patch ClusterIP {name} status"),
            self.bindings
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .map_err(|e| StoreError::StatusNotWritten(e.to_string()))
    }
}

#[async_trait]
impl Repository for KubeRepository {
    async fn list_pools(&self, family: IpFamily) -> Result<Vec<ClusterIPPool>, StoreError> {
        let params = ListParams::default().fields(&format!("spec.ipFamily={family}"));
        let list = bounded(self.timeout, "list ClusterIPPools", self.pools.list(&params)).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|pool| pool.spec.ip_family == family)
            .collect())
    }

    async fn get_pool(&self, name: &str) -> Result<ClusterIPPool, StoreError> {
        bounded(self.timeout, &format!("get ClusterIPPool {name}"), self.pools.get(name)).await
    }

    async fn update_pool_status(&self, pool: &ClusterIPPool) -> Result<ClusterIPPool, StoreError> {
        let name = name_of(&pool.metadata, "ClusterIPPool")?;
        // resourceVersion in a merge patch turns the write into a compare-and-swap
        let patch = json!({
            "metadata": { "resourceVersion": pool.metadata.resource_version },
            "status": pool.status,
        });
        debug!("Updating ClusterIPPool {} status", name);
        bounded(
            self.timeout,
            &format!("patch ClusterIPPool {name} status"),
            self.pools
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
    }

    async fn find_bindings(&self, query: &BindingQuery) -> Result<Vec<ClusterIP>, StoreError> {
        let mut params = ListParams::default();
        let selector = query.field_selector();
        if !selector.is_empty() {
            params = params.fields(&selector);
        }
        let list = bounded(self.timeout, "list ClusterIPs", self.bindings.list(&params)).await?;
        Ok(list.items.into_iter().filter(|b| query.matches(b)).collect())
    }

    async fn get_binding(&self, name: &str) -> Result<ClusterIP, StoreError> {
        bounded(self.timeout, &format!("get ClusterIP {name}"), self.bindings.get(name)).await
    }

    async fn create_binding(&self, binding: &ClusterIP) -> Result<ClusterIP, StoreError> {
        let name = name_of(&binding.metadata, "ClusterIP")?;
        bounded(
            self.timeout,
            &format!("create ClusterIP {name}"),
            self.bindings.create(&PostParams::default(), binding),
        )
        .await?;
        self.write_binding_status(name, binding).await
    }

    async fn update_binding(&self, binding: &ClusterIP) -> Result<ClusterIP, StoreError> {
        let name = name_of(&binding.metadata, "ClusterIP")?;
        // replace carries metadata.resourceVersion, so a stale copy yields 409
        bounded(
            self.timeout,
            &format!("replace ClusterIP {name}"),
            self.bindings.replace(name, &PostParams::default(), binding),
        )
        .await?;
        self.write_binding_status(name, binding).await
    }
}

/// [`WorkloadDirectory`] reading pods from the Kubernetes API.
#[derive(Clone)]
pub struct KubeDirectory {
    client: Client,
    timeout: Duration,
}

impl std::fmt::Debug for KubeDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeDirectory")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KubeDirectory {
    /// Creates a directory using `client`.
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl WorkloadDirectory for KubeDirectory {
    async fn pod_labels(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let found = bounded(self.timeout, &format!("get Pod {namespace}/{pod}"), pods.get_opt(pod)).await?;
        Ok(found.map(|p| p.metadata.labels.unwrap_or_default()))
    }
}
