use anyhow::Result;
use clap::Parser;
use coral_hub::bus::BusError;
use coral_hub::cli::{Cli, Commands};
use coral_hub::config::AppConfig;
use coral_hub::orchestrator::Orchestrator;
use coral_hub::runtime::{logger, AgentRuntime, RuntimeEvent};
use coral_hub::session::{AgentGraph, SessionManager};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coral_hub=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Run { graph, app, key, session, agent_logs } => {
            if !config.authorize(&app, &key) {
                anyhow::bail!("Application '{}' does not accept that privacy key", app);
            }

            let graph = AgentGraph::load(&graph)?;
            let agent_names: Vec<String> = graph.agents.keys().map(|n| n.to_string()).collect();

            let mut settings = config.orchestrator.clone();
            if agent_logs && settings.agent_log_dir.is_none() {
                settings.agent_log_dir = Some(logger::logs_dir()?);
            }
            let orchestrator = Arc::new(Orchestrator::new(config.registry.clone(), settings));
            let manager = SessionManager::new(orchestrator.clone());

            let session = match session {
                Some(id) => manager.create_session_with_id(&id, &app, &key, Some(graph)).await?,
                None => manager.create_session(&app, &key, Some(graph)).await?,
            };

            println!("Session {} started", session.id());
            for (i, group) in session.groups().iter().enumerate() {
                let mut members: Vec<&str> = group.iter().map(String::as_str).collect();
                members.sort();
                println!("  group {}: {}", i + 1, members.join(", "));
            }

            for name in agent_names {
                if let Some(bus) = orchestrator.get_bus(session.id(), &name) {
                    tokio::spawn(async move {
                        let mut rx = bus.subscribe();
                        loop {
                            match rx.recv().await {
                                Ok(RuntimeEvent::Log { kind, message, .. }) => {
                                    println!("[{}] {:?}: {}", name, kind, message);
                                }
                                Err(BusError::Lagged(_)) => continue,
                                Err(_) => break,
                            }
                        }
                    });
                }
            }

            let mut events = session.events();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let Ok(json) = serde_json::to_string(&event) {
                        println!("event: {}", json);
                    }
                }
            });

            println!("Press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            println!("Shutting down...");
            manager.shutdown().await;
        }

        Commands::Groups { graph } => {
            let graph = AgentGraph::load(&graph)?;
            let groups = graph.startup_groups();
            if groups.is_empty() {
                println!("No startup groups");
            }
            for (i, group) in groups.iter().enumerate() {
                let mut members: Vec<&str> = group.iter().map(String::as_str).collect();
                members.sort();
                println!("group {}: {}", i + 1, members.join(", "));
            }
            let ungrouped: Vec<String> = graph
                .agents
                .keys()
                .map(|n| n.to_string())
                .filter(|n| !groups.iter().any(|g| g.contains(n)))
                .collect();
            if !ungrouped.is_empty() {
                println!("ungrouped: {}", ungrouped.join(", "));
            }
        }

        Commands::Agents { verbose } => {
            let mut types: Vec<_> = config.registry.agent_types().collect();
            types.sort();
            if types.is_empty() {
                println!("No agent types registered");
            }
            for agent_type in types {
                if !verbose {
                    println!("{}", agent_type);
                    continue;
                }
                let entry = config.registry.get(agent_type)?;
                let runtime = match &entry.runtime {
                    AgentRuntime::Executable(exe) => format!("executable: {}", exe.command.join(" ")),
                    AgentRuntime::Docker(docker) => format!("docker: {}", docker.image),
                    AgentRuntime::Remote(remote) => format!("remote: {}", remote.host),
                };
                println!("{}  ({})", agent_type, runtime);
                for option in &entry.options {
                    let default = option
                        .default_value()
                        .map(|v| format!(" = {}", v))
                        .unwrap_or_else(|| " (required)".to_string());
                    println!("    {}{}", option.name(), default);
                }
            }
        }
    }

    Ok(())
}
