//! Late-bound lookups of catalog objects by name.

use crate::catalog::Catalog;
use crate::catalog::schema::CatalogObject;
use crate::error::ProxyError;
use crate::remote::RemoteEngine;
use tracing::debug;

pub trait CatalogResolver {
    fn resolve(&self, name: &str) -> Result<Option<CatalogObject>, ProxyError>;
}

/// Answers from a mirrored catalog only.
pub struct LocalResolver<'a> {
    catalog: &'a Catalog,
}

impl<'a> LocalResolver<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }
}

impl CatalogResolver for LocalResolver<'_> {
    fn resolve(&self, name: &str) -> Result<Option<CatalogObject>, ProxyError> {
        Ok(self.catalog.object(name))
    }
}

/// Falls back to the server for names the inner resolver does not know.
/// Remote answers are never written into the mirror.
pub struct RemoteResolver<'a, R> {
    inner: R,
    remote: &'a dyn RemoteEngine,
}

impl<'a, R: CatalogResolver> RemoteResolver<'a, R> {
    pub fn new(inner: R, remote: &'a dyn RemoteEngine) -> Self {
        Self { inner, remote }
    }
}

impl<R: CatalogResolver> CatalogResolver for RemoteResolver<'_, R> {
    fn resolve(&self, name: &str) -> Result<Option<CatalogObject>, ProxyError> {
        if let Some(object) = self.inner.resolve(name)? {
            return Ok(Some(object));
        }
        debug!(object_name = name, "resolving catalog object remotely");
        self.remote.describe_object(name)
    }
}

#[cfg(test)]
mod tests {
    use super::{CatalogResolver, LocalResolver, RemoteResolver};
    use crate::catalog::schema::{CatalogObject, ColumnDef};
    use crate::catalog::types::ColumnType;
    use crate::catalog::{ADMIN_USER_ID, Catalog};
    use crate::remote::loopback::LoopbackEngine;

    fn server() -> LoopbackEngine {
        let engine = LoopbackEngine::new();
        engine.create_library("Sales").expect("library");
        engine
            .create_table(
                "Sales",
                "Orders",
                vec![ColumnDef::new("id", ColumnType::Integer, false)],
                &["id"],
            )
            .expect("table");
        engine
    }

    #[test]
    fn local_resolver_sees_only_the_mirror() {
        let catalog = Catalog::baseline();
        let resolver = LocalResolver::new(&catalog);
        assert!(matches!(
            resolver.resolve(ADMIN_USER_ID).expect("resolve"),
            Some(CatalogObject::User(_))
        ));
        assert!(resolver.resolve("Orders").expect("resolve").is_none());
    }

    #[test]
    fn remote_resolver_asks_server_on_every_local_miss() {
        let engine = server();
        let catalog = Catalog::baseline();
        let resolver = RemoteResolver::new(LocalResolver::new(&catalog), &engine);

        for _ in 0..3 {
            let object = resolver.resolve("Orders").expect("resolve");
            assert_eq!(object.map(|o| o.name().to_string()), Some("Orders".into()));
        }
        assert_eq!(engine.stats().describe_calls, 3);
    }

    #[test]
    fn remote_resolver_sees_objects_created_after_a_miss() {
        let engine = server();
        let catalog = Catalog::baseline();
        let resolver = RemoteResolver::new(LocalResolver::new(&catalog), &engine);
        assert!(resolver.resolve("Invoices").expect("resolve").is_none());

        engine
            .create_table(
                "Sales",
                "Invoices",
                vec![ColumnDef::new("id", ColumnType::Integer, false)],
                &["id"],
            )
            .expect("table");
        let object = resolver.resolve("Invoices").expect("resolve");
        assert_eq!(object.map(|o| o.name().to_string()), Some("Invoices".into()));
        assert_eq!(engine.stats().describe_calls, 2);
    }

    #[test]
    fn remote_resolver_prefers_local_objects() {
        let engine = server();
        let catalog = Catalog::baseline();
        let resolver = RemoteResolver::new(LocalResolver::new(&catalog), &engine);
        resolver.resolve(ADMIN_USER_ID).expect("resolve");
        assert_eq!(engine.stats().describe_calls, 0);
    }
}
