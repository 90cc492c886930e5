//! gproxy entities
//!
//! The uniform invocation pipeline: endpoint descriptors, request
//! validation, tenant resolution, the entity registry with
//! most-derived composition, the proxy composition root, and the
//! bundled entity set (tenants, accounts, storages, command_log,
//! instance, proxy).
//!
//! Channels never call endpoint methods directly: everything goes
//! through [`invoke`], which validates parameters against the method
//! descriptor and runs inside a transactional connection scope.

pub mod crud;
pub mod endpoint;
pub mod entities;
pub mod proxy;
pub mod registry;

pub use endpoint::{
    http_method, invoke, is_available, validate_params, CallerIdentity, Channel, ChannelDefaults,
    Endpoint, MethodSpec, ParamSpec, ParamType,
};
pub use proxy::{resolve_tenant_token, Proxy};
pub use registry::{
    EndpointCtor, EndpointSeed, EntityDef, EntityRegistry, MixinDef, TableCtor,
};
