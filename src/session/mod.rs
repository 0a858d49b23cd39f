//! Client sessions: the public surface of the proxy.

pub(crate) mod resources;

use crate::config::ProxyConfig;
use crate::coordinator::{CatalogCacheCoordinator, ClientCache, SessionId};
use crate::cursor::BufferedCursor;
use crate::error::ProxyError;
use crate::plan::PlanProxy;
use crate::plan_cache::{PlanCache, PlanCacheKey, PlanCacheStats};
use crate::remote::{Param, PrepareRequest};
pub use resources::{OutstandingResource, RemoteResource};
use resources::ResourceTable;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Session {
    id: SessionId,
    coordinator: Arc<CatalogCacheCoordinator>,
    cache: Arc<ClientCache>,
    config: ProxyConfig,
    plans: PlanCache<PlanProxy>,
    resources: Arc<ResourceTable>,
    in_application_transaction: bool,
    closed: bool,
}

impl Session {
    /// Attaches to the named client cache, creating it on first use.
    pub fn open(
        coordinator: Arc<CatalogCacheCoordinator>,
        cache_name: &str,
        config: ProxyConfig,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        let cache = coordinator.attach(cache_name, id);
        let plans = PlanCache::new(config.plan_cache_size, cache.plan_generation_source());
        debug!(session = id.0, cache_name, "session opened");
        Ok(Self {
            id,
            coordinator,
            cache,
            config,
            plans,
            resources: Arc::new(ResourceTable::default()),
            in_application_transaction: false,
            closed: false,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn cache_name(&self) -> &str {
        self.cache.name()
    }

    pub fn client_cache(&self) -> &Arc<ClientCache> {
        &self.cache
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn set_in_application_transaction(&mut self, in_application_transaction: bool) {
        self.in_application_transaction = in_application_transaction;
    }

    /// Prepares `statement` in the configured default library.
    pub fn prepare(&self, statement: &str, params: &[Param]) -> Result<PlanProxy, ProxyError> {
        self.prepare_in(&self.config.default_library, statement, params)
    }

    /// Checks a cached plan out when one matches, otherwise prepares on the
    /// server. The caller owns the returned plan until it is released.
    pub fn prepare_in(
        &self,
        library: &str,
        statement: &str,
        params: &[Param],
    ) -> Result<PlanProxy, ProxyError> {
        let key = PlanCacheKey::new(statement, library, params, self.in_application_transaction);
        if let Some(mut plan) = self.plans.get(&key) {
            plan.mark_reused();
            return Ok(plan);
        }
        let request = PrepareRequest {
            cache_name: self.cache.name().to_string(),
            statement: statement.to_string(),
            library: library.to_string(),
            params: params.to_vec(),
        };
        PlanProxy::prepare(
            &self.coordinator,
            Arc::clone(&self.cache),
            Arc::clone(&self.resources),
            &request,
            key,
        )
    }

    /// Hands a plan back for reuse. Returns whether it was cached; plans that
    /// are not are unprepared immediately.
    pub fn release(&self, plan: PlanProxy) -> bool {
        self.plans.release(plan)
    }

    pub fn open_cursor(
        &self,
        plan: &PlanProxy,
        params: &[Param],
    ) -> Result<BufferedCursor, ProxyError> {
        plan.open_cursor(params, self.config.window_size)
    }

    pub fn plan_cache_stats(&self) -> PlanCacheStats {
        self.plans.stats()
    }

    pub fn resize_plan_cache(&self, capacity: usize) {
        self.plans.resize(capacity);
    }

    pub fn outstanding_resources(&self) -> Vec<OutstandingResource> {
        self.resources.outstanding()
    }

    /// Unprepares cached plans, releases every outstanding remote handle and
    /// detaches from the client cache.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.plans.clear();
        let remote = self.coordinator.remote();
        for resource in self.resources.drain() {
            let released = match resource {
                RemoteResource::Cursor(handle) => remote.close_cursor(handle),
                RemoteResource::Plan(handle) => remote.unprepare(handle),
            };
            if let Err(err) = released {
                warn!(session = self.id.0, ?resource, error = %err, "failed to release remote resource");
            }
        }
        let destroyed = self.coordinator.detach(self.cache.name(), self.id);
        debug!(session = self.id.0, cache_destroyed = destroyed, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_inner();
    }
}
