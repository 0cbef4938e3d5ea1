// PhotonDB Datastore - Rust Implementation
// Generation-aware arena storage for densely packed fixed-size records

#![warn(rust_2018_idioms)]

pub mod config;
pub mod datastore;
pub mod generation;
pub mod metrics;

// Re-exports for convenience
pub use config::DataStoreConfig;
pub use datastore::{
    BufferType, BufferTypeBase, CompactingBuffers, CompactionSpec, CompactionStrategy,
    DataStore, DataStoreBase, DataStoreReader, EntryRef, RefLayout,
};
pub use generation::{Generation, GenerationGuard, GenerationHandler};

/// Datastore error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Metrics error: {0}")]
        Metrics(String),

        #[error("Serialization error: {0}")]
        SerializationError(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
