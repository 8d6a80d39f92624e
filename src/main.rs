mod canary;
mod cli;
mod config;
mod container;
mod engine;
mod history;
mod hooks;
mod lock;
mod output;
mod probe;
mod proxy;
mod quote;
mod secrets;
mod ssh;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use canary::CanaryController;
use cli::{CanaryAction, Cli, Command, HooksAction, SecretsAction};
use config::AzudConfig;
use engine::{resolve_performer, DeploymentPlan, Engine};
use proxy::ProxyClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .without_time()
        .init();

    let project_root = std::env::current_dir()?;

    if let Command::Init = cli.command {
        cli::init::run()?;
        return Ok(());
    }

    let config_path = cli.config_path();
    let config = AzudConfig::load(&config_path)?;
    let state_dir = lock::state_dir()?;

    match cli.command {
        Command::Init => unreachable!("handled above"),

        Command::Deploy { hosts, version, roles } => {
            let engine = Engine::new(config.clone(), state_dir)?;
            let mut plan = DeploymentPlan::resolve(&config, version.as_deref(), roles.as_deref())?;
            if let Some(hosts) = hosts {
                plan.hosts = hosts;
            }
            engine.deploy(plan).await?;
        }

        Command::Rollback { hosts, to } => {
            let engine = Engine::new(config.clone(), state_dir)?;
            let hosts = hosts.unwrap_or_else(|| config.all_hosts());
            let performer = resolve_performer();
            engine.rollback(&hosts, to.as_deref(), &performer).await?;
        }

        Command::Canary { action } => {
            let mut canary_config = config.clone();
            if let CanaryAction::Deploy { initial_weight: Some(weight), .. } = &action {
                canary_config.deploy.canary.initial_weight = *weight;
            }
            let pool = ssh::Pool::new(&canary_config.ssh);
            let proxy = ProxyClient::new(format!("http://{}:8081", canary_config.proxy.host))?;
            let controller = CanaryController::new(canary_config.clone(), pool, proxy, state_dir);

            match action {
                CanaryAction::Deploy { version, hosts, .. } => {
                    let hosts = hosts.unwrap_or_else(|| {
                        canary_config
                            .servers
                            .values()
                            .next()
                            .map(|role| role.hosts.clone())
                            .unwrap_or_default()
                    });
                    let (repo, _) = canary_config
                        .image
                        .repository
                        .rsplit_once(':')
                        .unwrap_or((&canary_config.image.repository, ""));
                    let image = format!("{}:{}", repo, version);
                    controller.deploy(&image, &version, &hosts).await?;
                }
                CanaryAction::SetWeight { weight } => {
                    controller.set_weight(weight).await?;
                }
                CanaryAction::Promote => {
                    controller.promote().await?;
                }
                CanaryAction::Rollback => {
                    controller.rollback().await?;
                }
            }
        }

        Command::History { limit } => {
            let engine = Engine::new(config.clone(), state_dir)?;
            let records = engine.history().list(&config.service).await?;
            let records = match limit {
                Some(n) => records.into_iter().take(n).collect::<Vec<_>>(),
                None => records,
            };
            if records.is_empty() {
                output::info(&format!("no recorded deployments for '{}'", config.service));
            } else {
                output::header(&format!("Deployment history for '{}'", config.service));
                for record in &records {
                    println!(
                        "  {}  {:<10}  {}  by {}{}",
                        record.recorded_at.to_rfc3339(),
                        format!("{:?}", record.status),
                        record.version,
                        record.performer,
                        record
                            .error
                            .as_ref()
                            .map(|e| format!("  ({})", e))
                            .unwrap_or_default()
                    );
                }
            }
        }

        Command::Secrets { action } => match action {
            SecretsAction::Init => cli::secrets_cmd::init(&config)?,
            SecretsAction::Set { pair } => cli::secrets_cmd::set(&config, &pair, &project_root)?,
            SecretsAction::Unset { key } => cli::secrets_cmd::unset(&config, &key, &project_root)?,
            SecretsAction::List { reveal } => cli::secrets_cmd::list(&config, reveal, &project_root)?,
            SecretsAction::Edit => cli::secrets_cmd::edit(&config, &project_root)?,
            SecretsAction::Push => {
                let pool = ssh::Pool::new(&config.ssh);
                let hosts = config.all_hosts();
                cli::secrets_cmd::push(&config, &pool, &hosts, &project_root).await?;
            }
        },

        Command::Hooks { action } => match action {
            HooksAction::List => {
                let hooks = hooks::list_hooks(std::path::Path::new(&config.hooks.dir))?;
                if hooks.is_empty() {
                    output::info(&format!("no hooks found in {}", config.hooks.dir));
                } else {
                    output::header(&format!("Hooks in {}", config.hooks.dir));
                    for hook in hooks {
                        println!("  {}", hook);
                    }
                }
            }
        },
    }

    Ok(())
}
