//! Bundled entities.
//!
//! These are illustrative leaves over the registry: tenants, accounts,
//! storage mounts, the command audit log, the instance singleton, and
//! the table-less proxy process endpoint. Concrete proxies register
//! them wholesale via [`builtin_entities`], subclass them through the
//! registry's most-derived rule, or replace them entirely.

pub mod account;
pub mod command_log;
pub mod instance;
pub mod process;
pub mod storage;
pub mod tenant;

use crate::registry::EntityDef;

/// The bundled entity set, in registration order.
pub fn builtin_entities() -> Vec<EntityDef> {
    vec![
        tenant::entity(),
        account::entity(),
        storage::entity(),
        command_log::entity(),
        instance::entity(),
        process::entity(),
    ]
}
