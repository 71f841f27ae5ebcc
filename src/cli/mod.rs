//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "coral-hub")]
#[command(about = "Meeting place for collaborating agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the server config (applications, registry, orchestrator)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a session from an agent graph and supervise it until Ctrl-C
    Run {
        /// Agent graph file (YAML or JSON)
        graph: PathBuf,

        /// Application the session belongs to
        #[arg(short, long, default_value = "default-app")]
        app: String,

        /// Privacy key of the application
        #[arg(short, long, default_value = "public")]
        key: String,

        /// Session id (random if omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Also write agent output to ~/.coral/logs
        #[arg(long)]
        agent_logs: bool,
    },

    /// Show the startup groups an agent graph produces
    Groups {
        /// Agent graph file (YAML or JSON)
        graph: PathBuf,
    },

    /// List the agent types in the registry
    Agents {
        /// Show runtime and options for each type
        #[arg(short, long)]
        verbose: bool,
    },
}
