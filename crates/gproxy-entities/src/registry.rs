//! Entity registry: static registration with most-derived composition.
//!
//! An entity is a pair of table and endpoint constructors bound by a
//! common name. Concrete proxies register [`EntityDef`]s (their own,
//! or the bundled set) in deterministic order; when two definitions
//! share an entity name, the most-derived one wins regardless of
//! registration order — derivation is declared through the static
//! `lineage` chain of type identifiers, most-derived first.
//!
//! Extension packages contribute [`MixinDef`]s: decorator functions
//! wrapped around the base constructors so the mixin behaves as the
//! leading ancestor (its overrides take precedence, the rest
//! delegates).

use gproxy_core::ProxyConfig;
use gproxy_sql::{Table, TableSchema};
use gproxy_supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::Arc;

use crate::endpoint::Endpoint;

/// Construction context handed to endpoint constructors.
pub struct EndpointSeed {
    /// The entity's registered table, when it has one.
    pub table: Option<Arc<Table>>,
    /// Process supervisor for instance-level endpoints.
    pub supervisor: Arc<Supervisor>,
    /// Immutable process configuration.
    pub config: Arc<ProxyConfig>,
}

pub type TableCtor = fn() -> Arc<dyn TableSchema>;
pub type EndpointCtor = fn(&EndpointSeed) -> Arc<dyn Endpoint>;
pub type TableDecorator = fn(Arc<dyn TableSchema>) -> Arc<dyn TableSchema>;
pub type EndpointDecorator = fn(Arc<dyn Endpoint>) -> Arc<dyn Endpoint>;

/// One entity: name plus its table/endpoint constructors.
#[derive(Clone)]
pub struct EntityDef {
    /// Entity name; also the table name when a table exists.
    pub name: &'static str,
    /// Type identifiers, most-derived first. A definition replaces an
    /// incumbent with the same entity name iff its lineage contains
    /// the incumbent's own identifier.
    pub lineage: &'static [&'static str],
    pub table: Option<TableCtor>,
    pub endpoint: EndpointCtor,
}

/// Extension mixin for one entity.
#[derive(Clone)]
pub struct MixinDef {
    pub name: &'static str,
    pub table: Option<TableDecorator>,
    pub endpoint: Option<EndpointDecorator>,
}

/// Ordered entity registry.
#[derive(Default)]
pub struct EntityRegistry {
    defs: Vec<EntityDef>,
    mixins: HashMap<&'static str, MixinDef>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity, applying the most-derived rule.
    ///
    /// A new definition for an already-registered name replaces the
    /// incumbent only when it derives from it; otherwise the first
    /// registration is kept.
    pub fn register(&mut self, def: EntityDef) {
        match self.defs.iter().position(|d| d.name == def.name) {
            None => self.defs.push(def),
            Some(pos) => {
                let incumbent = &self.defs[pos];
                let incumbent_id = incumbent.lineage.first().copied().unwrap_or_default();
                let new_id = def.lineage.first().copied().unwrap_or_default();
                if new_id != incumbent_id && def.lineage.contains(&incumbent_id) {
                    tracing::debug!(
                        entity = def.name,
                        replaced = incumbent_id,
                        with = new_id,
                        "most-derived entity replaces incumbent"
                    );
                    self.defs[pos] = def;
                }
            }
        }
    }

    /// Register several entities in order.
    pub fn register_all(&mut self, defs: impl IntoIterator<Item = EntityDef>) {
        for def in defs {
            self.register(def);
        }
    }

    /// Install an extension mixin for one entity. The decorators wrap
    /// the base constructors at instantiation time.
    pub fn register_mixin(&mut self, mixin: MixinDef) {
        self.mixins.insert(mixin.name, mixin);
    }

    pub fn defs(&self) -> &[EntityDef] {
        &self.defs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.iter().any(|d| d.name == name)
    }

    /// Instantiate the entity's table schema with mixins applied.
    pub fn build_table_schema(&self, def: &EntityDef) -> Option<Arc<dyn TableSchema>> {
        let ctor = def.table?;
        let mut schema = ctor();
        if let Some(decorate) = self.mixins.get(def.name).and_then(|m| m.table) {
            schema = decorate(schema);
        }
        Some(schema)
    }

    /// Instantiate the entity's endpoint with mixins applied.
    pub fn build_endpoint(&self, def: &EntityDef, seed: &EndpointSeed) -> Arc<dyn Endpoint> {
        let mut endpoint = (def.endpoint)(seed);
        if let Some(decorate) = self.mixins.get(def.name).and_then(|m| m.endpoint) {
            endpoint = decorate(endpoint);
        }
        endpoint
    }
}
