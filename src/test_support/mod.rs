//! Test utilities shared across unit tests.

pub mod firebase;
#[cfg(not(target_arch = "wasm32"))]
pub mod http;

pub use firebase::test_app;
#[cfg(not(target_arch = "wasm32"))]
pub use http::start_mock_server;
