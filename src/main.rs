use std::process::ExitCode;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use hpc_negotiate::config::{Command, Config, PlanArgs, ResourcesArgs};
use hpc_negotiate::{
    read_resource_params, AuthError, CredentialBundle, DryRunTransport, EnvSecrets,
    NegotiateError, ParamValue, PopulationRule, ResourceSpec,
};

fn prefix() -> ColoredString {
    "[hpc-negotiate]".bold().cyan()
}

fn run_resources(args: &ResourcesArgs) -> Result<(), NegotiateError> {
    let mut params = match &args.file {
        Some(file) => read_resource_params(file)?,
        None => vec![],
    };
    params.extend(
        args.params
            .iter()
            .map(|(name, value)| (name.clone(), ParamValue::from(value.as_str()))),
    );

    let rule = if args.allow_full_population {
        PopulationRule::AllowFull
    } else {
        PopulationRule::RejectFull
    };
    let resolved = ResourceSpec::from_params(params)?.resolve_with(rule)?;

    eprintln!("{} Resolved {}.", prefix(), resolved);
    println!("num_machines: {}", resolved.machines);
    println!("num_mpiprocs_per_machine: {}", resolved.procs_per_machine);
    println!("tot_num_mpiprocs: {}", resolved.total_procs);
    if let Some(per_proc) = resolved.cores_per_proc {
        println!("num_cores_per_mpiproc: {}", per_proc);
    }
    if let Some(per_machine) = resolved.cores_per_machine {
        println!("num_cores_per_machine: {}", per_machine);
    }
    Ok(())
}

async fn run_plan(args: &PlanArgs) -> Result<(), NegotiateError> {
    let mut profile = args.profile.profile();
    if let Some(order) = args.order {
        profile = profile.with_order(order.order());
    }
    eprintln!(
        "{} Profile {}, stage order: {}.",
        prefix(),
        profile.name,
        profile
            .order
            .stages()
            .iter()
            .map(|stage| stage.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let mut bundle = CredentialBundle::new(&args.username)
        .look_for_keys(!args.no_look_for_keys)
        .allow_agent(args.allow_agent);
    bundle.key_filenames = args.key_files.clone();

    let negotiator = profile.negotiator();
    let mut transport = DryRunTransport::new();
    let result = profile
        .authenticate(&negotiator, bundle, &EnvSecrets, &mut transport)
        .await;

    for (i, offered) in transport.offered().iter().enumerate() {
        println!("{:>3}. {}", i + 1, offered);
    }
    match result {
        // Nothing is accepted in a dry run, so exhaustion is the expected end.
        Err(NegotiateError::Auth(e @ AuthError::AuthExhausted { .. })) => {
            eprintln!("{} {}", prefix(), e);
            Ok(())
        }
        Err(e) => Err(e),
        Ok(authenticated) => {
            eprintln!(
                "{} Authenticated at the {} stage.",
                prefix(),
                authenticated.stage
            );
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Config::parse();

    let result = match &cli.command {
        Command::Resources(args) => run_resources(args),
        Command::Plan(args) => run_plan(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", prefix(), e.to_string().red());
            ExitCode::FAILURE
        }
    }
}
