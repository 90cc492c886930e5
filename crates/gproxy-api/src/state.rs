//! Shared application state.

use gproxy_entities::Proxy;
use std::sync::Arc;

/// State threaded through every route and middleware.
///
/// The proxy pointer replaces any module-level global: auth gates and
/// handlers receive it explicitly through the router state.
#[derive(Clone)]
pub struct ApiState {
    pub proxy: Arc<Proxy>,
}

impl ApiState {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy }
    }
}
