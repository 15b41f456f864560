//! Helpers for tests of the engine and of crates built on it. Enabled with the `test_utils` feature.
pub mod mock_gateway;
pub mod prepare_env;
pub mod seed;
