use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};
use unitvisor_core::{config_schema_json, load_config, load_state, PersistedState, UnitStatus};

#[derive(Parser)]
#[command(name = "unitvisor", version, about = "Unit orchestrator utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Orchestrator configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    /// Persisted state helpers
    State {
        #[command(subcommand)]
        cmd: StateCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the JSON schema for the config file
    Schema(PrettyArgs),
    /// Validate a TOML config and print the effective values
    Check(FileArgs),
}

#[derive(Subcommand)]
enum StateCmd {
    /// List the units in a persisted state file
    Inspect(InspectArgs),
}

#[derive(Args)]
struct PrettyArgs {
    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct FileArgs {
    file: PathBuf,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct InspectArgs {
    file: PathBuf,
    /// Emit JSON instead of a table
    #[arg(long)]
    json: bool,
    /// Only list units with this status (e.g. `stopped`, `crashed`)
    #[arg(long, value_parser = parse_status)]
    status: Option<UnitStatus>,
}

fn parse_status(value: &str) -> Result<UnitStatus, String> {
    UnitStatus::from_slug(value).ok_or_else(|| format!("unknown unit status `{value}`"))
}

fn main() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Config { cmd } => match cmd {
            ConfigCmd::Schema(args) => {
                print_json(&config_schema_json(), args.pretty);
                Ok(())
            }
            ConfigCmd::Check(args) => cmd_config_check(&args),
        },
        Commands::State { cmd } => match cmd {
            StateCmd::Inspect(args) => cmd_state_inspect(&args),
        },
    };
    if let Err(e) = outcome {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn print_json(value: &serde_json::Value, pretty: bool) {
    if pretty {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    } else {
        println!("{}", value);
    }
}

fn cmd_config_check(args: &FileArgs) -> Result<()> {
    let cfg = load_config(&args.file)
        .with_context(|| format!("config {} is invalid", args.file.display()))?;
    tracing::info!(path = %args.file.display(), "config ok");
    let value = serde_json::to_value(&cfg).context("serializing effective config")?;
    print_json(&value, args.pretty);
    Ok(())
}

fn cmd_state_inspect(args: &InspectArgs) -> Result<()> {
    let mut state = read_state(&args.file)?;
    if let Some(status) = args.status {
        state.units.retain(|_, persisted| persisted.unit.status == status);
    }
    if args.json {
        print_json(&state_summary(&state), true);
    } else {
        print!("{}", state_table(&state));
    }
    Ok(())
}

fn read_state(path: &Path) -> Result<PersistedState> {
    anyhow::ensure!(path.exists(), "state file {} does not exist", path.display());
    load_state(path)
}

fn state_summary(state: &PersistedState) -> serde_json::Value {
    let units: Vec<_> = state
        .units
        .values()
        .map(|persisted| {
            let unit = &persisted.unit;
            json!({
                "id": unit.id,
                "version": unit.version.to_string(),
                "status": unit.status.as_str(),
                "enabled": unit.enabled,
                "blocked": unit.blocked,
                "has_source": persisted.source_code.is_some(),
                "has_state": state.unit_states.contains_key(&unit.id),
            })
        })
        .collect();
    json!({ "units": units })
}

fn state_table(state: &PersistedState) -> String {
    if state.units.is_empty() {
        return "no units\n".to_string();
    }
    let width = state.units.keys().map(String::len).max().unwrap_or(2).max(2);
    let mut out = format!("{:<width$}  {:<10}  {:<8}  FLAGS\n", "ID", "VERSION", "STATUS");
    for persisted in state.units.values() {
        let unit = &persisted.unit;
        let mut flags = Vec::new();
        if !unit.enabled {
            flags.push("disabled");
        }
        if unit.blocked {
            flags.push("blocked");
        }
        if state.unit_states.contains_key(&unit.id) {
            flags.push("state");
        }
        out.push_str(&format!(
            "{:<width$}  {:<10}  {:<8}  {}\n",
            unit.id,
            unit.version.to_string(),
            unit.status.display_label(),
            flags.join(",")
        ));
    }
    out
}
