//! Driver catalog for explicit dependency injection.
//!
//! The [`DriverCatalog`] maps each [`DriverKind`] to the driver that opens its
//! sessions. It is constructed explicitly and handed to the connection
//! manager, so tests can swap a real engine for the in-memory driver.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::DriverKind;
use crate::drivers::{MemoryDriver, MssqlDriver, PostgresDriver};
#[cfg(feature = "mysql")]
use crate::drivers::MysqlDriver;

use super::traits::Driver;

/// Registry of drivers by engine.
///
/// ```rust,ignore
/// let mut catalog = DriverCatalog::with_builtins();
/// catalog.register(Arc::new(MemoryDriver::new()));
/// let manager = ConnectionManager::new(Arc::new(catalog), config.connection.clone());
/// ```
#[derive(Default, Clone)]
pub struct DriverCatalog {
    drivers: HashMap<DriverKind, Arc<dyn Driver>>,
}

impl DriverCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with PostgreSQL, MSSQL, an empty in-memory driver and, with the
    /// `mysql` feature, MySQL.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(PostgresDriver::new()));
        catalog.register(Arc::new(MssqlDriver::new()));
        catalog.register(Arc::new(MemoryDriver::new()));

        #[cfg(feature = "mysql")]
        catalog.register(Arc::new(MysqlDriver::new()));

        catalog
    }

    /// Register a driver, replacing any driver for the same engine.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    /// Driver for `kind`, if registered.
    pub fn driver(&self, kind: DriverKind) -> Option<Arc<dyn Driver>> {
        self.drivers.get(&kind).cloned()
    }

    pub fn has_driver(&self, kind: DriverKind) -> bool {
        self.drivers.contains_key(&kind)
    }

    /// Registered engines, sorted by name.
    pub fn kinds(&self) -> Vec<DriverKind> {
        let mut kinds: Vec<_> = self.drivers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl std::fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCatalog")
            .field("drivers", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let catalog = DriverCatalog::with_builtins();
        assert!(catalog.has_driver(DriverKind::Postgres));
        assert!(catalog.has_driver(DriverKind::Mssql));
        assert!(catalog.has_driver(DriverKind::Memory));
        #[cfg(feature = "mysql")]
        assert!(catalog.has_driver(DriverKind::Mysql));
    }

    #[test]
    fn test_register_replaces() {
        let mut catalog = DriverCatalog::new();
        assert!(catalog.driver(DriverKind::Memory).is_none());
        let memory = MemoryDriver::new();
        catalog.register(Arc::new(memory.clone()));
        catalog.register(Arc::new(memory));
        assert_eq!(catalog.kinds(), vec![DriverKind::Memory]);
    }
}
