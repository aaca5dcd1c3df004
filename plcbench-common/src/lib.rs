//! Shared types for plcbench: errors, controller value types and configuration.

pub mod types;
pub mod error;
pub mod config;

pub use types::*;
pub use error::{BenchError, ErrorKind, Result};
pub use config::{
    BenchSettings, ConfigSource, OpcUaConfig, Protocol, S7Config, ScenarioMatrix,
    VariableSpec, WebApiConfig, load_config, generate_default_config,
};
