use crate::catalog::resolver::{CatalogResolver, LocalResolver, RemoteResolver};
use crate::catalog::schema::{CatalogObject, TableSchema};
use crate::catalog::types::ColumnType;
use crate::coordinator::{CatalogCacheCoordinator, ClientCache, SyncOutcome, SyncRequest};
use crate::cursor::BufferedCursor;
use crate::error::{ProxyError, ResourceType};
use crate::plan_cache::{CachedPlan, PlanCacheKey};
use crate::remote::{
    CursorCapabilities, Param, PlanDescriptor, PlanHandle, PrepareRequest, RemoteEngine,
    ResultTypeDescriptor,
};
use crate::session::resources::{RemoteResource, ResourceTable};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Result type of a prepared statement, resolved against the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Table(Arc<TableSchema>),
    Scalar(ColumnType),
}

impl DataType {
    pub fn table(&self) -> Option<&Arc<TableSchema>> {
        match self {
            DataType::Table(schema) => Some(schema),
            DataType::Scalar(_) => None,
        }
    }
}

/// Client-side handle to one server-prepared statement.
///
/// Preparing brings the named mirror up to what the statement needs before
/// the proxy is handed out, so its data type is always resolved against a
/// consistent catalog.
pub struct PlanProxy {
    descriptor: PlanDescriptor,
    key: PlanCacheKey,
    remote: Arc<dyn RemoteEngine>,
    cache: Arc<ClientCache>,
    resources: Arc<ResourceTable>,
    lock_timeout: Duration,
    compile_generation: u64,
    data_type: OnceCell<DataType>,
    invalid: AtomicBool,
    from_cache: bool,
}

impl PlanProxy {
    pub(crate) fn prepare(
        coordinator: &CatalogCacheCoordinator,
        cache: Arc<ClientCache>,
        resources: Arc<ResourceTable>,
        request: &PrepareRequest,
        key: PlanCacheKey,
    ) -> Result<Self, ProxyError> {
        let remote = Arc::clone(coordinator.remote());
        let descriptor = remote.prepare(request)?;
        resources.register(RemoteResource::Plan(descriptor.handle));
        let mut proxy = Self {
            key,
            remote,
            cache,
            resources,
            lock_timeout: coordinator.lock_timeout(),
            compile_generation: 0,
            data_type: OnceCell::new(),
            invalid: AtomicBool::new(false),
            from_cache: false,
            descriptor,
        };
        let outcome =
            coordinator.synchronize(proxy.cache.name(), &SyncRequest::from(&proxy.descriptor))?;
        proxy.compile_generation = proxy.cache.plan_generation();
        if let SyncOutcome::Synchronized { wiped, operations } = outcome {
            debug!(
                cache_name = %proxy.cache.name(),
                plan = proxy.descriptor.handle.0,
                wiped,
                operations,
                "synchronized catalog for plan"
            );
        }
        Ok(proxy)
    }

    pub fn handle(&self) -> PlanHandle {
        self.descriptor.handle
    }

    pub fn statement(&self) -> &str {
        &self.key.statement
    }

    pub fn capabilities(&self) -> CursorCapabilities {
        self.descriptor.capabilities
    }

    pub fn object_name(&self) -> Option<&str> {
        self.descriptor.object_name.as_deref()
    }

    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_reused(&mut self) {
        self.from_cache = true;
    }

    pub fn is_reused(&self) -> bool {
        self.from_cache
    }

    /// A reused plan that fails is not handed out again.
    fn check_reused<T>(&self, result: Result<T, ProxyError>) -> Result<T, ProxyError> {
        if let Err(err) = &result
            && self.from_cache
        {
            debug!(
                plan = self.descriptor.handle.0,
                error = %err,
                "reused plan failed, invalidating"
            );
            self.invalidate();
        }
        result
    }

    /// Resolved once per plan. Names missing from the mirror are looked up
    /// on the server without touching the mirror.
    pub fn data_type(&self) -> Result<&DataType, ProxyError> {
        self.check_reused(self.data_type.get_or_try_init(|| self.resolve_data_type()))
    }

    fn resolve_data_type(&self) -> Result<DataType, ProxyError> {
        let object_name = match &self.descriptor.result_type {
            ResultTypeDescriptor::Scalar(column_type) => return Ok(DataType::Scalar(*column_type)),
            ResultTypeDescriptor::Table { object_name } => object_name,
        };
        let catalog = self.cache.catalog(self.lock_timeout)?;
        let resolver = RemoteResolver::new(LocalResolver::new(&catalog), self.remote.as_ref());
        match resolver.resolve(object_name)? {
            Some(CatalogObject::Table(schema)) => Ok(DataType::Table(Arc::new(schema))),
            Some(other) => Err(ProxyError::Validation(format!(
                "{} is not a table",
                other.name()
            ))),
            None => Err(ProxyError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: object_name.clone(),
            }),
        }
    }

    pub fn open_cursor(
        &self,
        params: &[Param],
        window_size: usize,
    ) -> Result<BufferedCursor, ProxyError> {
        let table = self.data_type()?.table().cloned();
        let descriptor =
            self.check_reused(self.remote.open_cursor(self.descriptor.handle, params))?;
        Ok(BufferedCursor::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.resources),
            descriptor,
            table,
            self.descriptor.proposables.clone(),
            window_size,
        ))
    }
}

impl CachedPlan for PlanProxy {
    fn cache_key(&self) -> &PlanCacheKey {
        &self.key
    }

    fn compile_generation(&self) -> u64 {
        self.compile_generation
    }

    fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    fn is_session_scoped(&self) -> bool {
        self.descriptor.session_scoped
    }
}

impl Drop for PlanProxy {
    fn drop(&mut self) {
        let handle = self.descriptor.handle;
        if !self.resources.release(RemoteResource::Plan(handle)) {
            return;
        }
        if let Err(err) = self.remote.unprepare(handle) {
            warn!(plan = handle.0, error = %err, "failed to unprepare remote plan");
        }
    }
}
