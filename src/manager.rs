//! Port Resource Manager (§4.2): the seam the allocation socket server talks to.
//! Combines the pool's in-memory bookkeeping with the durable pod→resources ledger
//! so that an allocation a pod already holds survives a daemon restart.

use crate::error::{PoolError, Result};
use crate::pool::{ObjectFactory, ResourceStatus, SimpleObjectPool};
use crate::storage::Ledger;
use crate::types::{PodInfo, PodResources, ResourceItem, RESOURCE_TYPE_PORT};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ResourceManager<F: ObjectFactory> {
    pool: Arc<SimpleObjectPool<F>>,
    factory: Arc<F>,
    ledger: Arc<Ledger<PodResources>>,
}

impl<F: ObjectFactory + 'static> ResourceManager<F> {
    pub fn new(pool: Arc<SimpleObjectPool<F>>, factory: Arc<F>, ledger: Arc<Ledger<PodResources>>) -> Self {
        Self { pool, factory, ledger }
    }

    /// Give `pod` a resource (§4.5). A pod requesting a static IP is routed to
    /// [`Self::allocate_static`]; everything else goes through the ordinary pool,
    /// reusing the pod's prior port (from the ledger) if it's still idle and within
    /// its stick window.
    pub async fn allocate(&self, pod: &PodInfo, cancel: &CancellationToken) -> Result<F::Resource> {
        let key = pod.key();

        if let Some(ip) = pod.static_ip.clone() {
            let resource = self.allocate_static(&key, &ip, cancel).await?;
            self.persist(&key, pod, &resource).await?;
            return Ok(resource);
        }

        let preferred = self.prior_resource_id(&key);
        let resource = self.pool.acquire(key.clone(), preferred.as_deref(), cancel).await?;
        self.persist(&key, pod, &resource).await?;
        Ok(resource)
    }

    /// Pin `key` to `ip` (§4.5 static-IP path). Relies on start-up reconciliation
    /// (§4.7) having already seeded the pool with every port this node owns, so
    /// checking pool state is equivalent to listing the SDN directly: idle ⇒ free
    /// to take, in-use by someone else ⇒ a clear conflict error, otherwise the IP
    /// has never been seen and a fresh port is created for it.
    async fn allocate_static(&self, key: &str, ip: &str, cancel: &CancellationToken) -> Result<F::Resource> {
        match self.pool.stat(ip).await {
            ResourceStatus::Idle => {}
            ResourceStatus::InUse(owner) if owner == key => {}
            ResourceStatus::InUse(owner) => {
                return Err(PoolError::StaticIpUnavailable(format!(
                    "ip {ip} is already in use by {owner}"
                )));
            }
            ResourceStatus::NotFound => {
                let resource = self.factory.create(Some(ip.to_string())).await?;
                self.pool.add_idle(resource).await;
            }
        }
        self.pool.acquire(key.to_string(), Some(ip), cancel).await
    }

    async fn persist(&self, key: &str, pod: &PodInfo, resource: &F::Resource) -> Result<()> {
        self.ledger
            .put(
                key,
                PodResources {
                    namespace: pod.namespace.clone(),
                    name: pod.name.clone(),
                    resources: vec![ResourceItem {
                        resource_type: RESOURCE_TYPE_PORT.to_string(),
                        id: resource.resource_id().to_string(),
                    }],
                },
            )
            .await
    }

    /// Whether the ledger still attributes any resource to `key` (`namespace/name`).
    /// Lets a caller decide a release is a no-op before doing anything else that
    /// might fail for a pod already gone from the cluster, such as fetching it
    /// from the orchestrator.
    pub fn has_record(&self, key: &str) -> bool {
        self.ledger.get(key).is_ok()
    }

    /// Release whatever `pod` currently holds, keeping it reserved for `pod` for
    /// its configured stick window before it can be handed to anyone else.
    ///
    /// Idempotent: a pod with no ledger record (already released, or never
    /// allocated) is a no-op success rather than an error, since CNI DEL is
    /// retried by the kubelet on any failure, including ones that happen after
    /// the release already went through.
    pub async fn release(&self, pod: &PodInfo) -> Result<()> {
        let key = pod.key();
        if !self.has_record(&key) {
            return Ok(());
        }
        self.pool.release(&key, pod.ip_stick_duration).await?;
        self.ledger.delete(&key).await?;
        Ok(())
    }

    /// Look up what `pod` currently holds without acquiring or releasing anything.
    pub async fn get_info(&self, pod: &PodInfo) -> Result<F::Resource> {
        let key = pod.key();
        self.pool.in_use_get(&key).await.ok_or(PoolError::NotFound)
    }

    /// Release every resource id in `expire_set` that the pool still holds in-use
    /// (§4.5 GarbageCollection), independent of whatever pod record prompted the
    /// sweep. Safe to call concurrently with ordinary allocation traffic.
    pub async fn garbage_collect(&self, expire_set: &[String]) {
        for id in expire_set {
            if let ResourceStatus::InUse(owner) = self.pool.stat(id).await {
                if let Err(e) = self.pool.release(&owner, Duration::ZERO).await {
                    tracing::warn!(resource_id = %id, owner = %owner, error = %e, "garbage collection release failed");
                }
            }
        }
    }

    /// The port id `key` held before this allocation, if the ledger attributes it
    /// exactly one. Zero means nothing to reuse; more than one means the ledger
    /// entry is corrupt or duplicated, and is treated the same as nothing — the
    /// caller falls back to picking a fresh resource rather than guessing.
    fn prior_resource_id(&self, key: &str) -> Option<String> {
        let pr = self.ledger.get(key).ok()?;
        let candidates = pr.resources_of_type(RESOURCE_TYPE_PORT);
        match candidates.len() {
            1 => Some(candidates[0].id.clone()),
            0 => None,
            n => {
                tracing::warn!(pod = %key, count = n, "ledger has more than one prior port, ignoring");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkResource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct TestResource {
        id: String,
    }

    impl NetworkResource for TestResource {
        fn resource_id(&self) -> &str {
            &self.id
        }
        fn resource_type(&self) -> &'static str {
            "port"
        }
        fn ip_address(&self) -> &str {
            &self.id
        }
    }

    struct SeqFactory {
        next: AtomicUsize,
    }

    #[async_trait]
    impl ObjectFactory for SeqFactory {
        type Resource = TestResource;

        async fn create(&self, preferred_id: Option<String>) -> Result<TestResource> {
            let id = preferred_id.unwrap_or_else(|| format!("res-{}", self.next.fetch_add(1, Ordering::SeqCst)));
            Ok(TestResource { id })
        }

        async fn dispose(&self, _resource: TestResource) -> Result<()> {
            Ok(())
        }
    }

    fn pod(ns: &str, name: &str) -> PodInfo {
        PodInfo {
            namespace: ns.into(),
            name: name.into(),
            pod_ip: None,
            ip_stick_duration: Duration::from_secs(300),
            static_ip: None,
        }
    }

    async fn manager() -> (ResourceManager<SeqFactory>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("ledger.db")).unwrap();
        let ledger = Arc::new(Ledger::open(&db, "pod_ports").unwrap());
        let factory = Arc::new(SeqFactory { next: AtomicUsize::new(0) });
        let pool = SimpleObjectPool::new(factory.clone(), 4, 0, 2).await.unwrap();
        (ResourceManager::new(pool, factory, ledger), dir)
    }

    #[tokio::test]
    async fn allocate_records_the_assignment_in_the_ledger() {
        let (mgr, _dir) = manager().await;
        let cancel = CancellationToken::new();
        let p = pod("default", "web-0");

        let r = mgr.allocate(&p, &cancel).await.unwrap();
        let looked_up = mgr.get_info(&p).await.unwrap();
        assert_eq!(looked_up.id, r.id);
    }

    #[tokio::test]
    async fn release_then_reallocate_within_stick_window_returns_same_resource() {
        let (mgr, _dir) = manager().await;
        let cancel = CancellationToken::new();
        let p = pod("default", "web-0");

        let r1 = mgr.allocate(&p, &cancel).await.unwrap();
        mgr.release(&p).await.unwrap();

        let r2 = mgr.allocate(&p, &cancel).await.unwrap();
        assert_eq!(r1.id, r2.id);
    }

    #[tokio::test]
    async fn allocate_with_a_static_ip_is_honored() {
        let (mgr, _dir) = manager().await;
        let cancel = CancellationToken::new();
        let mut p = pod("default", "pinned");
        p.static_ip = Some("10.0.0.99".into());

        let r = mgr.allocate(&p, &cancel).await.unwrap();
        assert_eq!(r.id, "10.0.0.99");
    }

    #[tokio::test]
    async fn a_static_ip_already_held_by_another_pod_is_refused() {
        let (mgr, _dir) = manager().await;
        let cancel = CancellationToken::new();

        let mut first = pod("default", "pinned-a");
        first.static_ip = Some("10.0.0.99".into());
        mgr.allocate(&first, &cancel).await.unwrap();

        let mut second = pod("default", "pinned-b");
        second.static_ip = Some("10.0.0.99".into());
        let err = mgr.allocate(&second, &cancel).await.unwrap_err();
        assert!(matches!(err, PoolError::StaticIpUnavailable(_)));
    }

    #[tokio::test]
    async fn garbage_collection_releases_expired_ids_still_in_use() {
        let (mgr, _dir) = manager().await;
        let cancel = CancellationToken::new();
        let p = pod("default", "web-0");
        let r = mgr.allocate(&p, &cancel).await.unwrap();

        mgr.garbage_collect(&[r.id.clone(), "never-allocated".into()]).await;

        assert!(mgr.get_info(&p).await.is_err());
    }

    #[tokio::test]
    async fn releasing_a_pod_with_no_ledger_record_is_a_no_op_success() {
        let (mgr, _dir) = manager().await;
        let p = pod("default", "never-allocated");

        mgr.release(&p).await.unwrap();
    }

    #[tokio::test]
    async fn releasing_twice_is_idempotent() {
        let (mgr, _dir) = manager().await;
        let cancel = CancellationToken::new();
        let p = pod("default", "web-0");
        mgr.allocate(&p, &cancel).await.unwrap();

        mgr.release(&p).await.unwrap();
        mgr.release(&p).await.unwrap();
    }

    #[tokio::test]
    async fn reacquiring_under_the_same_owner_without_releasing_returns_the_same_resource() {
        let (mgr, _dir) = manager().await;
        let cancel = CancellationToken::new();
        let p = pod("default", "web-0");

        let first = mgr.allocate(&p, &cancel).await.unwrap();
        let second = mgr.allocate(&p, &cancel).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn a_corrupted_ledger_with_two_prior_ports_is_treated_as_no_prior() {
        let (mgr, _dir) = manager().await;
        let cancel = CancellationToken::new();
        let p = pod("default", "web-0");
        let key = p.key();

        mgr.ledger
            .put(
                &key,
                PodResources {
                    namespace: p.namespace.clone(),
                    name: p.name.clone(),
                    resources: vec![
                        ResourceItem { resource_type: RESOURCE_TYPE_PORT.to_string(), id: "res-7".into() },
                        ResourceItem { resource_type: RESOURCE_TYPE_PORT.to_string(), id: "res-8".into() },
                    ],
                },
            )
            .await
            .unwrap();

        assert_eq!(mgr.prior_resource_id(&key), None);
    }
}
