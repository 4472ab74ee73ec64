//! Logging setup for the binary.

mod logging;

pub use logging::{env_filter, init_tracing, LogFormat};
