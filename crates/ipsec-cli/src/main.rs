use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ipsec_core::prelude::*;
use ipsec_core::{ClusterHandles, ModeStore};
use ipsec_kube::KubeBackend;
use ipsec_test_utils::SimCluster;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mode names on the command line are matched without regard to case
fn parse_mode(s: &str) -> Result<SecurityMode, String> {
    SecurityMode::ALL
        .into_iter()
        .find(|m| m.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown mode '{s}' (expected Disabled, External or Full)"))
}

fn mode_arg() -> Arg {
    Arg::new("mode")
        .long("mode")
        .value_parser(parse_mode)
        .help("Target IPsec mode (Disabled, External, Full)")
}

fn json_arg() -> Arg {
    Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Print the scenario report as JSON")
}

fn cluster_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("kubeconfig")
            .long("kubeconfig")
            .value_parser(value_parser!(PathBuf))
            .help("Kubeconfig file (defaults to in-cluster config or $KUBECONFIG)"),
    )
    .arg(
        Arg::new("namespace")
            .long("namespace")
            .default_value(ipsec_kube::DEFAULT_NAMESPACE)
            .help("Namespace for probe pods"),
    )
    .arg(
        Arg::new("capture-image")
            .long("capture-image")
            .default_value(ipsec_kube::DEFAULT_CAPTURE_IMAGE)
            .help("Image with tcpdump and ping for the probe pods"),
    )
    .arg(
        Arg::new("config")
            .long("config")
            .value_parser(value_parser!(PathBuf))
            .help("TOML rollout configuration"),
    )
}

fn cli() -> Command {
    Command::new("ipsec-rollout")
        .version(ipsec_core::VERSION)
        .about("Roll a cluster's IPsec mode out and verify it on the wire")
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a scenario against the in-memory cluster")
                .arg(mode_arg().default_value("Full"))
                .arg(
                    Arg::new("north-south")
                        .long("north-south")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("mode")
                        .help("Run the host-to-host tunnel scenario"),
                )
                .arg(
                    Arg::new("from")
                        .long("from")
                        .default_value("Disabled")
                        .value_parser(parse_mode)
                        .help("Mode the simulated cluster starts in"),
                )
                .arg(
                    Arg::new("stall")
                        .long("stall")
                        .action(ArgAction::SetTrue)
                        .help("Never let the simulated rollout settle"),
                )
                .arg(json_arg()),
        )
        .subcommand(cluster_args(
            Command::new("run")
                .about("Run a scenario against a live cluster")
                .arg(mode_arg().required_unless_present("north-south"))
                .arg(
                    Arg::new("north-south")
                        .long("north-south")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("mode")
                        .help("Run the host-to-host tunnel scenario"),
                )
                .arg(json_arg()),
        ))
        .subcommand(cluster_args(
            Command::new("mode")
                .about("Read or write the cluster IPsec mode")
                .subcommand_required(true)
                .subcommand(Command::new("get").about("Print the effective mode"))
                .subcommand(
                    Command::new("set")
                        .about("Request a mode and optionally wait for convergence")
                        .arg(
                            Arg::new("target")
                                .required(true)
                                .value_parser(parse_mode),
                        )
                        .arg(
                            Arg::new("wait")
                                .long("wait")
                                .action(ArgAction::SetTrue)
                                .help("Block until the fleet has converged"),
                        ),
                ),
        ))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn scenario_kind(args: &ArgMatches) -> Result<ScenarioKind> {
    if args.get_flag("north-south") {
        return Ok(ScenarioKind::NorthSouth);
    }
    match args.get_one::<SecurityMode>("mode") {
        Some(mode) => Ok(ScenarioKind::ModeTransition(*mode)),
        None => bail!("either --mode or --north-south is required"),
    }
}

fn load_config(args: &ArgMatches) -> Result<RolloutConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => RolloutConfig::load(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(RolloutConfig::new()),
    }
}

async fn kube_backend(args: &ArgMatches, config: &RolloutConfig) -> Result<KubeBackend> {
    let mut backend = match args.get_one::<PathBuf>("kubeconfig") {
        Some(path) => KubeBackend::from_kubeconfig(path)
            .await
            .with_context(|| format!("connecting with {}", path.display()))?,
        None => KubeBackend::try_default()
            .await
            .context("connecting with the default client configuration")?,
    };
    backend = backend.with_fleet_settings(config.fleet.clone());
    if let Some(namespace) = args.get_one::<String>("namespace") {
        backend = backend.with_namespace(namespace);
    }
    if let Some(image) = args.get_one::<String>("capture-image") {
        backend = backend.with_capture_image(image);
    }
    Ok(backend)
}

fn print_report(report: &ScenarioReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("Scenario {} ({})", report.kind, report.id);
    println!("  Original mode: {}", report.original_mode);
    println!("  Target mode:   {}", report.target_mode);
    println!(
        "  States:        {}",
        report
            .states
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    for trial in &report.trials {
        println!(
            "  Trial {}: {} expected={} observed={} ({} ms)",
            trial.id,
            trial.signature,
            trial.expected,
            trial.observed,
            trial.elapsed_ms
        );
    }
    println!("  Elapsed:       {} ms", report.elapsed_ms);
    Ok(())
}

async fn simulate(args: &ArgMatches) -> Result<()> {
    let kind = scenario_kind(args)?;
    let from = args
        .get_one::<SecurityMode>("from")
        .copied()
        .unwrap_or(SecurityMode::Disabled);

    let sim = Arc::new(
        SimCluster::new()
            .with_mode(from)
            .with_rollout_duration(Duration::from_secs(2)),
    );
    sim.stall_rollouts(args.get_flag("stall"));

    let fast = ConvergenceDeadline::new(Duration::from_secs(1), Duration::from_secs(30));
    let config = RolloutConfig::new()
        .with_convergence(fast)
        .with_policy_wait(fast);

    info!(%kind, %from, "simulating scenario");
    let report = RolloutCoordinator::new(sim.handles(), config).run(kind).await?;
    print_report(&report, args.get_flag("json"))
}

async fn run(args: &ArgMatches) -> Result<()> {
    let kind = scenario_kind(args)?;
    let config = load_config(args)?;
    let backend = Arc::new(kube_backend(args, &config).await?);

    let coordinator = RolloutCoordinator::new(ClusterHandles::from_backend(backend), config);
    let report = coordinator.run(kind).await?;
    print_report(&report, args.get_flag("json"))
}

async fn mode(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let backend = Arc::new(kube_backend(args, &config).await?);
    let handles = ClusterHandles::from_backend(backend);
    let store = ModeStore::new(handles.network.clone(), config.mode_store);

    match args.subcommand() {
        Some(("get", _)) => {
            println!("{}", store.get_mode().await?);
        }
        Some(("set", sub)) => {
            let target = sub
                .get_one::<SecurityMode>("target")
                .copied()
                .context("missing target mode")?;
            let change = store.set_mode(target).await?;
            println!("{target}: {change:?}");
            if sub.get_flag("wait") {
                let checker = RolloutCoordinator::new(handles, config);
                checker.checker().wait_for_mode(target).await?;
                println!("{target}: converged");
            }
        }
        _ => bail!("unknown mode subcommand"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("run", args)) => run(args).await,
        Some(("mode", args)) => mode(args).await,
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn north_south_flag_selects_scenario() {
        let m = cli()
            .try_get_matches_from(["ipsec-rollout", "simulate", "--north-south"])
            .unwrap();
        let (_, args) = m.subcommand().unwrap();
        assert!(scenario_kind(args).unwrap().is_north_south());
    }

    #[test]
    fn mode_is_parsed_case_insensitively() {
        let m = cli()
            .try_get_matches_from(["ipsec-rollout", "run", "--mode", "external"])
            .unwrap();
        let (_, args) = m.subcommand().unwrap();
        assert_eq!(
            scenario_kind(args).unwrap().target_mode(),
            SecurityMode::External
        );
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(parse_mode("FULL").is_ok());
        assert!(parse_mode("tunnel").is_err());
        assert!(cli()
            .try_get_matches_from(["ipsec-rollout", "simulate", "--mode", "tunnel"])
            .is_err());
    }

    #[test]
    fn backend_flags_have_defaults() {
        let m = cli()
            .try_get_matches_from(["ipsec-rollout", "mode", "get"])
            .unwrap();
        let (_, args) = m.subcommand().unwrap();
        assert_eq!(
            args.get_one::<String>("capture-image").map(String::as_str),
            Some(ipsec_kube::DEFAULT_CAPTURE_IMAGE)
        );
        assert_eq!(
            args.get_one::<String>("namespace").map(String::as_str),
            Some(ipsec_kube::DEFAULT_NAMESPACE)
        );
    }
}
