//! gproxy API
//!
//! REST surface generated from endpoint descriptors: every method an
//! endpoint exposes on the API channel becomes a route under `/api/`,
//! guarded by the token gates and wrapped in the `{"data": …}` /
//! `{"error": …}` envelopes. `GET /health` is unauthenticated; a built
//! UI directory next to the binary is served at `/ui`.

pub mod auth;
pub mod routes;
pub mod server;
pub mod state;

pub use auth::{AuthContext, API_TOKEN_HEADER};
pub use routes::build_router;
pub use server::run_server;
pub use state::ApiState;
