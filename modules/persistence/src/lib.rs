//! SQL-backed persistence: workflow instances, the transition log and user
//! records behind the `persistence.store` module.

mod store;

pub use store::{PersistenceStoreModule, SqlInstanceStore, SqlUserStore};

use std::sync::Arc;

use flowkit::{Module, ModuleFactory};

/// Register this crate's module types with the engine factory.
pub fn register_module_types(factory: &mut ModuleFactory) {
    factory.register("persistence.store", |cfg| {
        Ok(Arc::new(PersistenceStoreModule::new(&cfg.name)) as Arc<dyn Module>)
    });
}
