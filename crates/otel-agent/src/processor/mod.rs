//! Processors: transformations applied inside a pipeline.

pub mod batch;
pub mod resource;

pub use batch::{BatchConfig, BatchProcessor, BatchProcessorFactory};
pub use resource::{ResourceConfig, ResourceProcessor, ResourceProcessorFactory};
