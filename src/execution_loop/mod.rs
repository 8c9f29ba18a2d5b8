pub mod error_classifier;
pub mod orchestrator;

pub use error_classifier::*;
pub use orchestrator::*;
