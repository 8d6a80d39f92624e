use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod init;
pub mod secrets_cmd;

#[derive(Parser)]
#[command(name = "azud", version, about = "Blue/green + canary container deploys over SSH")]
pub struct Cli {
    /// Path to the service config (overridden by --stage)
    #[arg(short, long, default_value = "azud.toml")]
    pub config: PathBuf,

    /// Environment overlay: resolves to azud.<stage>.toml instead of --config
    #[arg(long)]
    pub stage: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        match &self.stage {
            Some(stage) => PathBuf::from(format!("azud.{}.toml", stage)),
            None => self.config.clone(),
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Scaffold azud.toml in the current directory
    Init,

    /// Deploy the configured image to its hosts
    Deploy {
        /// Restrict to these hosts (default: every host in scope)
        #[arg(long, value_delimiter = ',')]
        hosts: Option<Vec<String>>,
        /// Image version/tag (required unless image.repository already has one)
        #[arg(long)]
        version: Option<String>,
        /// Restrict to these roles (default: every role)
        #[arg(long, value_delimiter = ',')]
        roles: Option<Vec<String>>,
    },

    /// Roll back to a previously-successful deployment
    Rollback {
        /// Restrict to these hosts (default: every host for the service)
        #[arg(long, value_delimiter = ',')]
        hosts: Option<Vec<String>>,
        /// Specific version to roll back to (default: last successful)
        #[arg(long = "to")]
        to: Option<String>,
    },

    /// Parallel-canary deploy/weight/promote/rollback
    Canary {
        #[command(subcommand)]
        action: CanaryAction,
    },

    /// List recorded deployments
    History {
        /// Limit to the N most recent records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage encrypted secrets (age-encrypted .env)
    Secrets {
        #[command(subcommand)]
        action: SecretsAction,
    },

    /// List hooks discovered in the configured hooks directory
    Hooks {
        #[command(subcommand)]
        action: HooksAction,
    },
}

#[derive(Subcommand)]
pub enum CanaryAction {
    /// Start a canary deploy at the configured (or overridden) initial weight
    Deploy {
        /// Image version/tag for the canary
        #[arg(long)]
        version: String,
        /// Hosts to run the canary on (default: first role's hosts)
        #[arg(long, value_delimiter = ',')]
        hosts: Option<Vec<String>>,
        /// Override deploy.canary.initial_weight
        #[arg(long = "initial-weight")]
        initial_weight: Option<u8>,
    },
    /// Shift the running canary's traffic weight
    SetWeight {
        /// New weight, 0-100
        weight: u8,
    },
    /// Promote the running canary to stable
    Promote,
    /// Tear down the running canary, leaving stable untouched
    Rollback,
}

#[derive(Subcommand)]
pub enum SecretsAction {
    /// Generate an age keypair and show setup instructions
    Init,
    /// Set a secret (KEY=VALUE)
    Set {
        /// KEY=VALUE pair
        pair: String,
    },
    /// Remove a secret
    Unset {
        /// Secret key name
        key: String,
    },
    /// List secrets (values masked by default)
    List {
        /// Show actual values
        #[arg(long)]
        reveal: bool,
    },
    /// Decrypt, open in $EDITOR, re-encrypt
    Edit,
    /// Push the local secrets store to every configured host and validate it
    Push,
}

#[derive(Subcommand)]
pub enum HooksAction {
    /// List hooks discovered in the configured hooks directory
    List,
}
