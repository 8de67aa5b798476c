//! Extensions shipped with the agent.

pub mod file_storage;

pub use file_storage::{FileStorage, FileStorageConfig, FileStorageFactory};
