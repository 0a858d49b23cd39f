//! Client-side catalog mirrors and the ordering of the deltas applied to them.
//!
//! Every named cache carries two clocks: the client timestamp, advanced once
//! per synchronized plan, and the server generation the mirror was last
//! consistent with. A plan that needs the mirror at client timestamp `T`
//! waits until `T - 1` has landed, so deltas are applied in exactly the order
//! the server issued them even when many threads race to apply them.

mod wait_table;

use crate::catalog::delta::DeltaScript;
use crate::catalog::schema::UserMeta;
use crate::catalog::{ADMIN_USER_ID, Catalog, SYSTEM_USER_ID};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ResourceType};
use crate::remote::{PlanDescriptor, RemoteEngine};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_table::WaitTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// What the server requires of the mirror before a plan may be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub required_generation: u64,
    pub required_client_timestamp: u64,
    pub delta_applies: bool,
    pub delta_script: DeltaScript,
}

impl From<&PlanDescriptor> for SyncRequest {
    fn from(plan: &PlanDescriptor) -> Self {
        Self {
            required_generation: plan.current_generation,
            required_client_timestamp: plan.required_client_timestamp,
            delta_applies: plan.delta_applies,
            delta_script: plan.delta_script.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    AlreadyConsistent,
    Synchronized { wiped: bool, operations: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub client_timestamp: u64,
    pub server_timestamp: u64,
    pub deltas_applied: u64,
    pub wipes: u64,
    pub serialization_failures: u64,
    pub timeouts: u64,
    pub pending_waits: usize,
}

/// Process-held handles to the identities every mirror carries. Rebound
/// whenever the mirror is wiped so they never point at a discarded catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentities {
    pub system: Arc<UserMeta>,
    pub admin: Arc<UserMeta>,
}

impl SystemIdentities {
    fn bind(catalog: &Catalog) -> Self {
        Self {
            system: bind_identity(catalog, SYSTEM_USER_ID),
            admin: bind_identity(catalog, ADMIN_USER_ID),
        }
    }
}

fn bind_identity(catalog: &Catalog, user_id: &str) -> Arc<UserMeta> {
    let user = catalog.user(user_id).cloned().unwrap_or_else(|| UserMeta {
        user_id: user_id.to_string(),
        display_name: user_id.to_string(),
        is_system: true,
    });
    Arc::new(user)
}

struct MirrorState {
    catalog: Catalog,
    identities: SystemIdentities,
}

impl MirrorState {
    fn new() -> Self {
        let catalog = Catalog::baseline();
        let identities = SystemIdentities::bind(&catalog);
        Self {
            catalog,
            identities,
        }
    }

    fn wipe(&mut self) {
        self.catalog = Catalog::baseline();
        self.identities = SystemIdentities::bind(&self.catalog);
    }
}

#[derive(Default)]
struct CacheCounters {
    deltas_applied: AtomicU64,
    wipes: AtomicU64,
    serialization_failures: AtomicU64,
    timeouts: AtomicU64,
}

/// One named mirror of the server catalog, shared by every attached session.
pub struct ClientCache {
    name: String,
    state: RwLock<MirrorState>,
    client_timestamp: AtomicU64,
    server_timestamp: AtomicU64,
    plan_generation: Arc<AtomicU64>,
    sessions: Mutex<BTreeSet<SessionId>>,
    waits: WaitTable,
    counters: CacheCounters,
}

impl ClientCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MirrorState::new()),
            client_timestamp: AtomicU64::new(0),
            server_timestamp: AtomicU64::new(0),
            plan_generation: Arc::new(AtomicU64::new(0)),
            sessions: Mutex::new(BTreeSet::new()),
            waits: WaitTable::default(),
            counters: CacheCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_timestamp(&self) -> u64 {
        self.client_timestamp.load(Ordering::SeqCst)
    }

    pub fn server_timestamp(&self) -> u64 {
        self.server_timestamp.load(Ordering::SeqCst)
    }

    /// Bumped on every wipe. Deltas only add definitions for the current
    /// generation, so plans compiled before the last wipe are the stale ones.
    pub fn plan_generation(&self) -> u64 {
        self.plan_generation.load(Ordering::SeqCst)
    }

    pub(crate) fn plan_generation_source(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.plan_generation)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn pending_waits(&self) -> usize {
        self.waits.pending()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            client_timestamp: self.client_timestamp(),
            server_timestamp: self.server_timestamp(),
            deltas_applied: self.counters.deltas_applied.load(Ordering::Relaxed),
            wipes: self.counters.wipes.load(Ordering::Relaxed),
            serialization_failures: self.counters.serialization_failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            pending_waits: self.waits.pending(),
        }
    }

    /// Shared view of the mirrored catalog.
    pub fn catalog(
        &self,
        timeout: Duration,
    ) -> Result<MappedRwLockReadGuard<'_, Catalog>, ProxyError> {
        let guard = self
            .state
            .try_read_for(timeout)
            .ok_or_else(|| self.lock_timeout())?;
        Ok(RwLockReadGuard::map(guard, |state| &state.catalog))
    }

    pub fn identities(&self, timeout: Duration) -> Result<SystemIdentities, ProxyError> {
        let guard = self
            .state
            .try_read_for(timeout)
            .ok_or_else(|| self.lock_timeout())?;
        Ok(guard.identities.clone())
    }

    pub fn synchronize(
        &self,
        request: &SyncRequest,
        remote: &dyn RemoteEngine,
        serialization_timeout: Duration,
        lock_timeout: Duration,
    ) -> Result<SyncOutcome, ProxyError> {
        let required = request.required_client_timestamp;
        let current = self.client_timestamp();
        if current == required {
            return Ok(SyncOutcome::AlreadyConsistent);
        }
        if current > required {
            return Err(self.serialization_error(current, required, remote));
        }

        let waiting_for = required - 1;
        if !self
            .waits
            .wait_for(waiting_for, &self.client_timestamp, serialization_timeout)
        {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                cache_name = %self.name,
                waiting_for,
                timeout_ms = serialization_timeout.as_millis() as u64,
                "timed out waiting for prior catalog delta"
            );
            return Err(ProxyError::CacheSerializationTimeout {
                cache_name: self.name.clone(),
                waiting_for,
            });
        }

        let needs_wipe = request.required_generation > self.server_timestamp();
        if request.delta_applies || needs_wipe {
            let Some(mut state) = self.state.try_write_for(lock_timeout) else {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(self.lock_timeout());
            };
            let current = self.client_timestamp();
            if current == required {
                return Ok(SyncOutcome::AlreadyConsistent);
            }
            if current > required {
                return Err(self.serialization_error(current, required, remote));
            }
            let applied = self.apply_locked(&mut state, request);
            self.advance(required);
            drop(state);
            match applied {
                Ok((wiped, operations)) => Ok(SyncOutcome::Synchronized { wiped, operations }),
                Err(source) => {
                    warn!(
                        cache_name = %self.name,
                        required,
                        error = %source,
                        "failed to apply catalog delta"
                    );
                    self.notify_desynchronized(remote);
                    Err(ProxyError::CacheDeserialization {
                        cache_name: self.name.clone(),
                        source: Box::new(source),
                    })
                }
            }
        } else {
            let Some(state) = self.state.try_read_for(lock_timeout) else {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(self.lock_timeout());
            };
            let current = self.client_timestamp();
            if current == required {
                return Ok(SyncOutcome::AlreadyConsistent);
            }
            if current > required {
                drop(state);
                return Err(self.serialization_error(current, required, remote));
            }
            self.advance(required);
            drop(state);
            Ok(SyncOutcome::Synchronized {
                wiped: false,
                operations: 0,
            })
        }
    }

    fn apply_locked(
        &self,
        state: &mut MirrorState,
        request: &SyncRequest,
    ) -> Result<(bool, usize), ProxyError> {
        let mut wiped = false;
        if request.required_generation > self.server_timestamp() {
            info!(
                cache_name = %self.name,
                from_generation = self.server_timestamp(),
                to_generation = request.required_generation,
                "wiping catalog mirror"
            );
            state.wipe();
            self.server_timestamp
                .store(request.required_generation, Ordering::SeqCst);
            self.plan_generation.fetch_add(1, Ordering::SeqCst);
            self.counters.wipes.fetch_add(1, Ordering::Relaxed);
            wiped = true;
        }
        let mut operations = 0;
        if request.delta_applies {
            operations = request.delta_script.apply_to(&mut state.catalog)?;
            self.counters.deltas_applied.fetch_add(1, Ordering::Relaxed);
            debug!(
                cache_name = %self.name,
                required = request.required_client_timestamp,
                operations,
                "applied catalog delta"
            );
        }
        Ok((wiped, operations))
    }

    fn advance(&self, required: u64) {
        self.client_timestamp.fetch_max(required, Ordering::SeqCst);
        self.waits.signal(required);
    }

    fn serialization_error(
        &self,
        client_timestamp: u64,
        required_timestamp: u64,
        remote: &dyn RemoteEngine,
    ) -> ProxyError {
        self.counters
            .serialization_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            cache_name = %self.name,
            client_timestamp,
            required_timestamp,
            "catalog mirror is ahead of the plan's requirement"
        );
        self.notify_desynchronized(remote);
        ProxyError::CacheSerialization {
            client_timestamp,
            required_timestamp,
        }
    }

    fn notify_desynchronized(&self, remote: &dyn RemoteEngine) {
        if let Err(err) = remote.notify_desynchronized(&self.name) {
            warn!(cache_name = %self.name, error = %err, "desynchronization notice failed");
        }
    }

    fn lock_timeout(&self) -> ProxyError {
        ProxyError::CacheLockTimeout {
            cache_name: self.name.clone(),
        }
    }
}

/// Owns every named mirror in the process and routes synchronization
/// requests to them.
pub struct CatalogCacheCoordinator {
    remote: Arc<dyn RemoteEngine>,
    caches: Mutex<HashMap<String, Arc<ClientCache>>>,
    serialization_timeout: Duration,
    lock_timeout: Duration,
}

impl CatalogCacheCoordinator {
    pub fn new(remote: Arc<dyn RemoteEngine>, config: &ProxyConfig) -> Self {
        Self {
            remote,
            caches: Mutex::new(HashMap::new()),
            serialization_timeout: config.serialization_timeout(),
            lock_timeout: config.lock_timeout(),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteEngine> {
        &self.remote
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Attaches a session, creating the named cache on first use.
    pub fn attach(&self, cache_name: &str, session: SessionId) -> Arc<ClientCache> {
        let mut caches = self.caches.lock();
        let cache = caches
            .entry(cache_name.to_string())
            .or_insert_with(|| {
                debug!(cache_name, "creating client cache");
                Arc::new(ClientCache::new(cache_name))
            })
            .clone();
        cache.sessions.lock().insert(session);
        cache
    }

    /// Detaches a session; the cache is destroyed with its last session.
    /// Returns whether the cache was destroyed.
    pub fn detach(&self, cache_name: &str, session: SessionId) -> bool {
        let mut caches = self.caches.lock();
        let Some(cache) = caches.get(cache_name) else {
            return false;
        };
        let empty = {
            let mut sessions = cache.sessions.lock();
            sessions.remove(&session);
            sessions.is_empty()
        };
        if empty {
            caches.remove(cache_name);
            if let Err(err) = self.remote.release_cache(cache_name) {
                warn!(cache_name, error = %err, "failed to release server cache bookkeeping");
            }
            debug!(cache_name, "destroyed client cache");
        }
        empty
    }

    pub fn cache(&self, cache_name: &str) -> Option<Arc<ClientCache>> {
        self.caches.lock().get(cache_name).cloned()
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn synchronize(
        &self,
        cache_name: &str,
        request: &SyncRequest,
    ) -> Result<SyncOutcome, ProxyError> {
        let cache = self.cache(cache_name).ok_or_else(|| ProxyError::NotFound {
            resource_type: ResourceType::ClientCache,
            resource_id: cache_name.to_string(),
        })?;
        cache.synchronize(
            request,
            self.remote.as_ref(),
            self.serialization_timeout,
            self.lock_timeout,
        )
    }
}
