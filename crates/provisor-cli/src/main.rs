//! Provisor — declarative lab-environment provisioning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use provisor_core::{DesiredState, ProvisorConfig};
use provisor_host::{AptHost, DockerCli, HttpFetcher};
use provisor_runtime::Reconciler;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod report;

fn resolve_data_dir() -> PathBuf {
    std::env::var("PROVISOR_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".provisor"))
}

const HELP: &str = "\
Provisor — declarative lab-environment provisioning

Usage: provisor <command> <spec.json> [--json]

Commands:
  up <spec> [--json]    Reconcile the environment to the spec
  plan <spec> [--json]  Show the actions `up` would apply
  status <spec>         Print the observed state as JSON
  down <spec>           Stop the container if it is running
  validate <spec>       Load and validate the spec only
  help                  Show this help message

Exit codes: 0 success, 2 partial (fallbacks or warnings), 1 failure";

fn print_help() {
    println!("{}", HELP);
}

fn build_reconciler(config: &ProvisorConfig) -> Reconciler {
    Reconciler::new(
        Arc::new(DockerCli::new(&config.docker_bin)),
        Arc::new(AptHost::new()),
        Arc::new(HttpFetcher::new()),
        config,
    )
}

fn load_spec(path: &Path) -> anyhow::Result<DesiredState> {
    DesiredState::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `--json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let json = args.iter().any(|a| a == "--json");
    let positional: Vec<&str> = args
        .iter()
        .skip(1)
        .map(String::as_str)
        .filter(|a| !a.starts_with("--"))
        .collect();

    let command = match positional.first() {
        Some(c) => *c,
        None => {
            print_help();
            std::process::exit(1);
        }
    };
    if matches!(command, "help" | "-h") || args.iter().any(|a| a == "--help") {
        print_help();
        return Ok(());
    }
    if !matches!(command, "up" | "plan" | "status" | "down" | "validate") {
        eprintln!("Unknown command: {}. Use 'provisor help' for usage.", command);
        std::process::exit(1);
    }
    let Some(spec_path) = positional.get(1).map(PathBuf::from) else {
        eprintln!("Usage: provisor {} <spec.json>", command);
        std::process::exit(1);
    };

    let desired = match load_spec(&spec_path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    if command == "validate" {
        println!(
            "{} is valid: container '{}' from {} on port {}",
            spec_path.display(),
            desired.container.name,
            desired.image.reference,
            desired.container.ports.host
        );
        return Ok(());
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());
    let config = ProvisorConfig::from_env(&data_dir)?;
    let reconciler = build_reconciler(&config);

    match command {
        "up" => {
            let token = reconciler.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received; stopping after the current action");
                    token.cancel();
                }
            });

            let state = reconciler.reconcile(&desired).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                report::print_report(&state);
            }
            std::process::exit(state.exit_class().code());
        }
        "plan" => match reconciler.plan(&desired).await {
            Ok(actions) if json => println!("{}", serde_json::to_string_pretty(&actions)?),
            Ok(actions) => report::print_plan(&actions),
            Err(e) => {
                eprintln!("Probe failed: {}", e);
                std::process::exit(1);
            }
        },
        "status" => match reconciler.observe(&desired).await {
            Ok(observed) => println!("{}", serde_json::to_string_pretty(&observed)?),
            Err(e) => {
                eprintln!("Probe failed: {}", e);
                std::process::exit(1);
            }
        },
        "down" => match reconciler.stop(&desired).await {
            Ok(true) => println!("Stopped {}", desired.container.name),
            Ok(false) => println!("{} is not running", desired.container.name),
            Err(e) => {
                eprintln!("Stop failed: {}", e);
                std::process::exit(1);
            }
        },
        _ => unreachable!("command validated above"),
    }

    Ok(())
}
