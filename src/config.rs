//! Command line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::auth::StageOrder;
use crate::profile::Profile;

#[derive(Parser)]
#[command(version, about)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Resolve a job resource request and print the completed layout
    Resources(ResourcesArgs),
    /// Show which credentials would be offered, and in which order, without connecting
    Plan(PlanArgs),
}

#[derive(Args)]
pub struct ResourcesArgs {
    /// Resource parameter as `name=value`, e.g. `num_machines=2`. Repeatable.
    #[arg(long = "param", short, value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// YAML mapping of resource parameters. Merged with `--param`.
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Accept a total that fills every machine exactly
    #[arg(long)]
    pub allow_full_population: bool,
}

#[derive(Args)]
pub struct PlanArgs {
    /// Login user name on the remote machine
    #[arg(long, short)]
    pub username: String,

    /// Deployment profile
    #[arg(long, value_enum, default_value = "standard")]
    pub profile: ProfileName,

    /// Override the profile's stage order
    #[arg(long, value_enum)]
    pub order: Option<OrderVariant>,

    /// Private key file to offer. Repeatable.
    #[arg(long = "key-file", short)]
    pub key_files: Vec<PathBuf>,

    /// Don't look for keys in ~/.ssh
    #[arg(long)]
    pub no_look_for_keys: bool,

    /// Offer keys held by a running SSH agent
    #[arg(long)]
    pub allow_agent: bool,
}

#[derive(PartialEq, Clone, Copy, ValueEnum)]
pub enum ProfileName {
    Archer2,
    Standard,
}

impl ProfileName {
    pub fn profile(&self) -> Profile {
        match self {
            Self::Archer2 => Profile::archer2(),
            Self::Standard => Profile::standard(),
        }
    }
}

#[derive(PartialEq, Clone, Copy, ValueEnum)]
pub enum OrderVariant {
    PasswordFirst,
    KeyFirst,
}

impl OrderVariant {
    pub fn order(&self) -> StageOrder {
        match self {
            Self::PasswordFirst => StageOrder::password_first(),
            Self::KeyFirst => StageOrder::key_first(),
        }
    }
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected `name=value`, got `{}`", s)),
    }
}
