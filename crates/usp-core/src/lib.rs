//! Core support crate for the Uniflex shader patcher
//!
//! Provides the error types, configuration and logging setup shared by the
//! patcher and its command-line tool.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, LogLevel, LoggingConfig, PatcherConfig};
pub use error::{ContainerError, DecodeError, FinaliseError, GraphError, Result, UspError};
