//! Crate error types.
//!
//! [`CacheError`] is the only error type the library returns. The stores
//! themselves have a single failure mode (operating on a stopped store);
//! the remaining variant covers configuration loading.

/// Errors returned by the connection stores and configuration loader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The store has been shut down, or is shutting down, and no longer
    /// processes requests.
    #[error("connection store is shut down")]
    ShutDown,

    /// An environment variable held a value that could not be parsed.
    #[error("invalid configuration: {key}={value:?}")]
    InvalidConfig {
        /// Environment variable name.
        key: String,
        /// Raw value found in the environment.
        value: String,
    },
}
