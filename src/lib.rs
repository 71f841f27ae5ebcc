//! coral-hub: a meeting place for collaborating agents
//!
//! Agents are spawned as local processes or containers, connect back to a
//! session, and talk to each other through threads of mention-addressed
//! messages. Startup schedulers hold tightly linked agents back until their
//! whole group has connected.

pub mod bus;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod runtime;
pub mod scheduler;
pub mod session;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoralError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    #[error("Failed to tear down agent: {0}")]
    Teardown(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, CoralError>;
