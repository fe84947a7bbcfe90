pub mod cache;
pub mod config;
pub mod error;
pub mod normalizer;
pub mod orchestrator;

pub mod postgres;
pub mod sink;

pub use cache::KeyColumnCache;
pub use config::Config;
pub use error::{Error, Result};
pub use normalizer::EventNormalizer;
pub use orchestrator::ChangeOrchestrator;
