//! Engine-facing transport for Cinder.
//!
//! [`HttpBackend`] speaks the engine's control API; [`stand_in`] serves the
//! same API from any other backend (usually the simulated engine) so the
//! bridge can be exercised without a running engine.

pub mod http;
pub mod stand_in;

pub use http::HttpBackend;
