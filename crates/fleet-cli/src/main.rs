use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_agent::{CapabilityRegistry, CapabilitySlot, StaticCapability};
use fleet_orchestrator::{
    default_profiles, open_store, profile, AgentRole, AgentSpec, FleetConfig, Orchestrator,
    Scheduler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Provider registered when the config declares none.
const LOCAL_PROVIDER: &str = "local";

#[derive(Parser)]
#[command(name = "fleet", about = "Fleet: agent orchestration with KPI feedback control")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fleet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the fleet and run the control loop until Ctrl-C
    Run,
    /// Print the built-in role catalogue
    Roles,
    /// Parse and validate the config file
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Roles => print_roles(),
        Commands::Check => {
            let config = FleetConfig::load(&cli.config)?;
            println!(
                "{}: ok ({} providers, {} agents, {} policies, {} scheduled jobs)",
                cli.config.display(),
                config.providers.len(),
                config.agents.len(),
                config.policies.len(),
                config.schedule.len()
            );
        }
        Commands::Run => run(cli.config).await?,
    }
    Ok(())
}

async fn run(path: PathBuf) -> anyhow::Result<()> {
    let config = if path.exists() {
        FleetConfig::load(&path)?
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        FleetConfig::default()
    };

    let mut registry = CapabilityRegistry::from_configs(&config.providers)?;
    if registry.is_empty() {
        registry.register(LOCAL_PROVIDER, Arc::new(StaticCapability::new(LOCAL_PROVIDER)));
        info!("no providers configured, using the local static provider");
    }
    let provider = config
        .providers
        .first()
        .map_or_else(|| LOCAL_PROVIDER.to_string(), |p| p.name.clone());

    let specs = if config.agents.is_empty() {
        default_specs(&provider)
    } else {
        config.agents.clone()
    };

    let store = open_store(config.data_dir.as_deref()).await?;
    let scheduler = Scheduler::new(config.schedule.clone())?;
    let engine = Arc::new(Orchestrator::new(config, registry, store)?);

    for spec in specs {
        let name = spec.display_name.clone();
        match engine.create_agent(spec).await {
            Ok(agent) => info!(agent_id = %agent.id, name = %name, "agent started"),
            Err(e) => warn!(name = %name, error = %e, "agent rejected"),
        }
    }

    let cancel = CancellationToken::new();
    let engine_loop = engine.clone().start(cancel.child_token());
    let scheduler_loop = scheduler.start(engine.queue().clone(), cancel.child_token());
    info!(agents = engine.list_agents().await.len(), "fleet running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();
    let (engine_exit, scheduler_exit) = tokio::join!(engine_loop, scheduler_loop);
    engine.shutdown().await;
    check_loop("engine", engine_exit)?;
    check_loop("scheduler", scheduler_exit)?;
    Ok(())
}

/// Surface a background loop that panicked or was aborted.
fn check_loop(name: &str, exit: Result<(), JoinError>) -> anyhow::Result<()> {
    if let Err(e) = &exit {
        error!(task = name, error = %e, "background loop ended abnormally");
    }
    exit.with_context(|| format!("{name} loop ended abnormally"))
}

/// One agent per role, every required slot bound to `provider`.
fn default_specs(provider: &str) -> Vec<AgentSpec> {
    AgentRole::ALL
        .into_iter()
        .map(|role| {
            profile(role)
                .required_slots
                .into_iter()
                .fold(AgentSpec::new(role, role.as_str()), |spec, slot| {
                    spec.with_binding(slot, provider)
                })
        })
        .collect()
}

fn print_roles() {
    for p in default_profiles() {
        let slots: Vec<String> = p.required_slots.iter().map(CapabilitySlot::to_string).collect();
        let defaults: Vec<String> = p
            .default_parameters()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        println!("{}", p.role);
        println!("  slots:    {}", slots.join(", "));
        println!("  actions:  {}", p.actions.join(", "));
        if let Some(kpi) = p.score_metric {
            println!("  kpi:      {kpi}");
        }
        if !defaults.is_empty() {
            println!("  defaults: {}", defaults.join(", "));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_orchestrator::validate_spec;

    #[test]
    fn test_default_specs_cover_every_role() {
        let specs = default_specs("local");
        assert_eq!(specs.len(), AgentRole::ALL.len());
        for spec in &specs {
            validate_spec(spec).unwrap();
        }
    }

    #[test]
    fn test_sample_config_is_valid() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fleet.toml");
        FleetConfig::load(&path).unwrap();
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["fleet", "--config", "x.toml", "check"]).unwrap();
        assert!(matches!(cli.command, Commands::Check));
        assert_eq!(cli.config, PathBuf::from("x.toml"));
    }

    #[tokio::test]
    async fn test_panicked_loop_is_reported() {
        let clean = tokio::spawn(async {}).await;
        check_loop("engine", clean).unwrap();

        let panicked: Result<(), JoinError> =
            tokio::spawn(async { panic!("cycle blew up") }).await;
        let err = check_loop("scheduler", panicked).unwrap_err();
        assert!(err.to_string().contains("scheduler"));
    }

    #[test]
    fn test_missing_config_fails_check() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(FleetConfig::load(&tmp.path().join("absent.toml")).is_err());
    }
}
