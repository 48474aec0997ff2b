//! Orchestration core for a multi-model developer-assistant server: resolves
//! logical roles to backend processes, transforms requests per backend
//! capability, executes subprocesses, falls back across failures behind a
//! per-backend circuit breaker, enforces a four-level permission model, fans
//! workflows out across backends in parallel, and records RED metrics.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod deps;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod metrics;
pub mod model;
pub mod parallel;
pub mod permissions;
pub mod registry;
pub mod transform;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::Config;
pub use deps::Dependencies;
pub use error::OrchestratorError;
pub use model::*;
