//! The capability store (spec §4.2): an indexed set of live capabilities
//! plus per-capability usage records, with optional JSON persistence.

pub mod persistence;
pub mod usage;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::capability::{Capability, ContextValue};
use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::store::persistence::PersistedStore;
use crate::store::usage::{AccessEvent, CapabilityUsage};

/// Coarse lifecycle state used by [`ListFilter::status`] (spec §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityStatus {
    Active,
    Expired,
    Revoked,
}

fn status_of(cap: &Capability, now_unix: i64) -> CapabilityStatus {
    if cap.is_revoked() {
        CapabilityStatus::Revoked
    } else if cap.is_expired(now_unix) {
        CapabilityStatus::Expired
    } else {
        CapabilityStatus::Active
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortField {
    Id,
    Kind,
    Resource,
    Identity,
    IssuedAt,
    ExpiresAt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Filter and pagination parameters for [`CapabilityStore::list`].
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    pub identity: Option<String>,
    pub resource: Option<String>,
    pub kind: Option<crate::capability::CapabilityKind>,
    pub status: Option<CapabilityStatus>,
    pub issuer: Option<String>,
    pub issued_after: Option<i64>,
    pub issued_before: Option<i64>,
    pub metadata: HashMap<String, ContextValue>,
    pub sort_by: Option<SortField>,
    pub sort_order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Asc
    }
}

impl ListFilter {
    fn matches(&self, cap: &Capability, now_unix: i64) -> bool {
        if let Some(identity) = &self.identity {
            if &cap.identity != identity {
                return false;
            }
        }
        if let Some(resource) = &self.resource {
            if &cap.resource != resource {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if cap.kind != kind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if status_of(cap, now_unix) != status {
                return false;
            }
        }
        if let Some(issuer) = &self.issuer {
            if &cap.issuer != issuer {
                return false;
            }
        }
        if let Some(after) = self.issued_after {
            if cap.issued_at < after {
                return false;
            }
        }
        if let Some(before) = self.issued_before {
            if cap.issued_at > before {
                return false;
            }
        }
        for (k, v) in &self.metadata {
            if cap.metadata.get(k) != Some(v) {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts returned by [`CapabilityStore::stats`].
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub active: usize,
    pub expired: usize,
    pub revoked: usize,
    pub total: usize,
    pub persistence_enabled: bool,
    pub cache_enabled: bool,
}

struct Inner {
    capabilities: HashMap<String, Capability>,
    usage: HashMap<String, CapabilityUsage>,
}

/// Indexed, optionally-persisted store of live capabilities.
///
/// All operations take `&self`; the single [`RwLock`] guarding the index
/// means readers never observe a torn mutation and concurrent writers never
/// lose an update (spec §4.2 concurrency contract) — at the cost of
/// serializing all writes, which is the safe default the spec explicitly
/// allows ("per-id locking or compare-and-swap").
pub struct CapabilityStore {
    inner: RwLock<Inner>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl CapabilityStore {
    /// Loads persisted state (if enabled) and constructs a store. A
    /// corrupt persisted file aborts start-up (spec §4.2).
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let (capabilities, usage) = if config.enable_persistence {
            let persisted = persistence::load(&config.storage_file_path)?;
            (persisted.capabilities, persisted.usage)
        } else {
            (HashMap::new(), HashMap::new())
        };
        Ok(Self {
            inner: RwLock::new(Inner { capabilities, usage }),
            config,
            clock,
        })
    }

    fn storage_path(&self) -> &PathBuf {
        &self.config.storage_file_path
    }

    async fn persist(&self, inner: &Inner) -> CoreResult<()> {
        if !self.config.enable_persistence {
            return Ok(());
        }
        let doc = PersistedStore {
            capabilities: inner.capabilities.clone(),
            usage: inner.usage.clone(),
        };
        persistence::save(self.storage_path(), &doc)
    }

    /// Stores `capability`. Idempotent on id: fails if the id is already
    /// present, leaving the existing record untouched (spec §4.2).
    #[instrument(skip(self, capability), fields(id = %capability.id))]
    pub async fn store(&self, capability: Capability) -> CoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.capabilities.contains_key(&capability.id) {
            return Err(CoreError::DuplicateId(capability.id));
        }
        let id = capability.id.clone();
        inner.capabilities.insert(id.clone(), capability);
        inner.usage.insert(id.clone(), CapabilityUsage::new());
        if let Err(e) = self.persist(&inner).await {
            // Roll back the in-memory mutation: never leave an id-indexed
            // but unpersisted record diverging from a failed write.
            inner.capabilities.remove(&id);
            inner.usage.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    pub async fn retrieve(&self, id: &str) -> CoreResult<Capability> {
        let inner = self.inner.read().await;
        inner
            .capabilities
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::CapNotFound(id.to_string()))
    }

    /// Lists capabilities matching `filter`, sorted and paginated per spec
    /// §4.2. Returns the matched page and the total match count before
    /// pagination.
    pub async fn list(&self, filter: &ListFilter) -> (Vec<Capability>, usize) {
        let inner = self.inner.read().await;
        let now = self.clock.now_unix();
        let mut matches: Vec<&Capability> = inner
            .capabilities
            .values()
            .filter(|c| filter.matches(c, now))
            .collect();

        if let Some(field) = filter.sort_by {
            matches.sort_by(|a, b| {
                let ord = match field {
                    SortField::Id => a.id.cmp(&b.id),
                    SortField::Kind => a.kind.cmp(&b.kind),
                    SortField::Resource => a.resource.cmp(&b.resource),
                    SortField::Identity => a.identity.cmp(&b.identity),
                    SortField::IssuedAt => a.issued_at.cmp(&b.issued_at),
                    SortField::ExpiresAt => a.expires_at.cmp(&b.expires_at),
                };
                match filter.sort_order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }

        let total = matches.len();
        let page: Vec<Capability> = matches
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        (page, total)
    }

    /// Annotates the record as revoked. Never touches signed material.
    /// Idempotent: a second revoke of an already-revoked id succeeds
    /// without changing the first revocation's reason/timestamp.
    #[instrument(skip(self))]
    pub async fn revoke(&self, id: &str, reason: String, revoked_by: String) -> CoreResult<()> {
        let mut inner = self.inner.write().await;
        let now = self.clock.now_unix();
        let cap = inner
            .capabilities
            .get_mut(id)
            .ok_or_else(|| CoreError::CapNotFound(id.to_string()))?;
        if cap.revocation.is_none() {
            cap.revocation = Some(crate::capability::Revocation {
                revoked_at: now,
                revoked_by,
                reason,
            });
        }
        self.persist(&inner).await
    }

    /// Atomically records an access attempt against `id`'s usage record,
    /// incrementing `used_count` on the capability when `event.success` and
    /// usage tracking is requested by the caller.
    #[instrument(skip(self, event))]
    pub async fn update_usage(
        &self,
        id: &str,
        event: AccessEvent,
        increment_used_count: bool,
    ) -> CoreResult<()> {
        let mut inner = self.inner.write().await;
        {
            let cap = inner
                .capabilities
                .get_mut(id)
                .ok_or_else(|| CoreError::CapNotFound(id.to_string()))?;
            if increment_used_count && event.success {
                cap.used_count += 1;
            }
        }
        let usage = inner.usage.entry(id.to_string()).or_insert_with(CapabilityUsage::new);
        usage.record(event);
        self.persist(&inner).await
    }

    pub async fn get_usage(&self, id: &str) -> CoreResult<CapabilityUsage> {
        let inner = self.inner.read().await;
        inner
            .usage
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::CapNotFound(id.to_string()))
    }

    /// Removes expired-past-grace and revoked-past-retention records, and
    /// garbage-collects orphaned usage records. Running this twice in a
    /// row yields the same state as running it once (spec §8).
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> CoreResult<usize> {
        let mut inner = self.inner.write().await;
        let now = self.clock.now_unix();
        let grace = self.config.grace_period_seconds;
        let retention = self.config.revocation_retention_seconds;

        let purge_ids: Vec<String> = inner
            .capabilities
            .iter()
            .filter(|(_, cap)| match &cap.revocation {
                Some(rev) => now > rev.revoked_at + retention,
                None => now > cap.expires_at + grace,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &purge_ids {
            inner.capabilities.remove(id);
        }
        // Orphaned usage records: any usage entry whose capability no
        // longer exists, regardless of why it was removed.
        let live: std::collections::HashSet<String> =
            inner.capabilities.keys().cloned().collect();
        inner.usage.retain(|id, _| live.contains(id));

        if !purge_ids.is_empty() {
            self.persist(&inner).await?;
            debug!(count = purge_ids.len(), "cleanup purged capabilities");
        }
        Ok(purge_ids.len())
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        let now = self.clock.now_unix();
        let mut stats = StoreStats {
            persistence_enabled: self.config.enable_persistence,
            cache_enabled: self.config.enable_cache,
            ..Default::default()
        };
        for cap in inner.capabilities.values() {
            stats.total += 1;
            match status_of(cap, now) {
                CapabilityStatus::Active => stats.active += 1,
                CapabilityStatus::Expired => stats.expired += 1,
                CapabilityStatus::Revoked => stats.revoked += 1,
            }
        }
        stats
    }

    /// Test/debug hook: mutates a stored capability's signed fields without
    /// re-signing, used to exercise tamper-detection in validation (spec
    /// §8 scenario 6). Never reachable from a production code path.
    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn tamper_expires_at(&self, id: &str, new_expires_at: i64) -> CoreResult<()> {
        let mut inner = self.inner.write().await;
        let cap = inner
            .capabilities
            .get_mut(id)
            .ok_or_else(|| CoreError::CapNotFound(id.to_string()))?;
        cap.expires_at = new_expires_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityKind, Constraints};
    use crate::clock::FixedClock;
    use crate::signer::Signer;
    use testresult::TestResult;

    fn make_capability(id: &str, issued_at: i64, ttl: i64, signer: &Signer) -> Capability {
        let mut cap = Capability {
            id: id.to_string(),
            kind: CapabilityKind::Read,
            resource: "res".into(),
            actions: vec!["read".into()],
            identity: "app1".into(),
            issuer: "agent".into(),
            issued_at,
            expires_at: issued_at + ttl,
            ttl,
            max_uses: 10,
            used_count: 0,
            constraints: Constraints::default(),
            metadata: Default::default(),
            signature: ed25519_dalek::Signature::from_bytes(&[0u8; 64]),
            revocation: None,
        };
        let bytes = cap.canonical_bytes().unwrap();
        cap.signature = signer.sign(&bytes);
        cap
    }

    fn test_store(dir: &std::path::Path) -> CapabilityStore {
        let config = StoreConfig {
            storage_file_path: dir.join("store.json"),
            ..Default::default()
        };
        CapabilityStore::new(config, Arc::new(FixedClock::new(1_000))).unwrap()
    }

    #[tokio::test]
    async fn store_then_retrieve() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = test_store(dir.path());
        let signer = Signer::generate();
        let cap = make_capability("c1", 1_000, 60, &signer);
        store.store(cap.clone()).await?;
        let fetched = store.retrieve("c1").await?;
        assert_eq!(fetched.id, "c1");
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_store_fails() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = test_store(dir.path());
        let signer = Signer::generate();
        let cap = make_capability("c1", 1_000, 60, &signer);
        store.store(cap.clone()).await?;
        assert!(store.store(cap).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn revoke_is_idempotent() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = test_store(dir.path());
        let signer = Signer::generate();
        let cap = make_capability("c1", 1_000, 60, &signer);
        store.store(cap).await?;
        store.revoke("c1", "first".into(), "admin".into()).await?;
        store.revoke("c1", "second".into(), "other".into()).await?;
        let fetched = store.retrieve("c1").await?;
        assert_eq!(fetched.revocation.unwrap().reason, "first");
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = test_store(dir.path());
        let signer = Signer::generate();
        let cap = make_capability("c1", 1_000, 1, &signer); // expires at 1001, grace 300
        store.store(cap).await?;
        let first = store.cleanup().await?;
        let second = store.cleanup().await?;
        assert_eq!(first, 0);
        assert_eq!(second, 0);
        Ok(())
    }

    #[tokio::test]
    async fn list_sorts_and_paginates() -> TestResult {
        let dir = tempfile::tempdir()?;
        let store = test_store(dir.path());
        let signer = Signer::generate();
        for id in ["b", "a", "c"] {
            store.store(make_capability(id, 1_000, 60, &signer)).await?;
        }
        let filter = ListFilter {
            sort_by: Some(SortField::Id),
            sort_order: SortOrder::Asc,
            limit: Some(2),
            ..Default::default()
        };
        let (page, total) = store.list(&filter).await;
        assert_eq!(total, 3);
        assert_eq!(page.iter().map(|c| c.id.clone()).collect::<Vec<_>>(), vec!["a", "b"]);
        Ok(())
    }
}
