//! Community detection task service
//!
//! Accepts "run algorithm X on this input" requests, runs each one in its own
//! container on a fixed worker pool, and serves status and results by task id.

pub mod algorithms;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod http;
pub mod pool;
pub mod runner;
pub mod store;
pub mod validator;

pub use config::ServiceConfig;
pub use engine::{EngineFactory, TaskEngine};
pub use error::{ConfigError, EngineError};
