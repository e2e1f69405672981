//! ssogate — library crate for integration testing.
//!
//! Re-exports modules needed by integration tests in `tests/`.

pub mod adapter;
pub mod claims;
pub mod config;
pub mod errors;
pub mod gate;
pub mod logout;
pub mod session;
pub mod store;
pub mod sync;
