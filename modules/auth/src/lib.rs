//! Authentication: bearer-token middleware, the JWT provider and the user
//! store abstraction.

mod jwt;
mod middleware;
mod provider;
mod users;

pub use jwt::{JwtProvider, JwtProviderConfig, JwtProviderModule};
pub use middleware::{AuthIdentity, AuthMiddlewareModule};
pub use provider::{AuthProvider, Identity};
pub use users::{MemoryUserStore, User, UserStore};

use std::sync::Arc;

use flowkit::{Module, ModuleFactory};

/// Register this crate's module types with the engine factory.
pub fn register_module_types(factory: &mut ModuleFactory) {
    factory.register("auth.jwt", |cfg| {
        Ok(Arc::new(JwtProviderModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("http.middleware.auth", |cfg| {
        Ok(Arc::new(AuthMiddlewareModule::new(&cfg.name)) as Arc<dyn Module>)
    });
}
