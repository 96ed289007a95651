//! The cache orchestrator and its install/activate/route lifecycle.

mod error;
mod lifecycle;
mod orchestrator;

pub use lifecycle::WorkerSettings;
pub use orchestrator::{CacheOrchestrator, RouteSource, Routed};
