//! `tsp_deploy`: load, upload and save firmware scripts on TSP instruments.
//!
//! ```bash
//! tsp_deploy --address 192.168.0.50:5025 load
//! tsp_deploy upload --node 2
//! tsp_deploy save --node 2
//! RUST_LOG=tsp_firmware=debug tsp_deploy --dry-run state
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tsp_firmware::config::TspConfig;
use tsp_firmware::firmware::{BatchOutcome, FirmwareManager};
use tsp_firmware::firmware::load::LoadOptions;
use tsp_firmware::logging;
use tsp_firmware::node::{discover_nodes, NodeEntity};
use tsp_firmware::script::ScriptEntityCollection;
use tsp_firmware::session::{MockInstrument, TcpTransport, TspSession};
use tsp_firmware::subsystem::TspDisplay;

/// Command line of `tsp_deploy`.
#[derive(Parser)]
#[command(name = "tsp_deploy", about = "Deploy firmware scripts to TSP instruments", version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config/tsp_firmware.toml")]
    config: PathBuf,
    /// Controller address (host:port), overrides the configuration
    #[arg(long)]
    address: Option<String>,
    /// Run against the built-in simulator instead of an instrument
    #[arg(long)]
    dry_run: bool,
    /// Show progress on the instrument front panel
    #[arg(long)]
    front_panel: bool,
    #[command(subcommand)]
    command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
enum Commands {
    /// Load catalog scripts onto the controller
    Load {
        /// Scripts to load; all controller scripts when empty
        names: Vec<String>,
        /// Echo errors while streaming
        #[arg(long)]
        show_errors: bool,
        /// Use prompts to track execution state while streaming
        #[arg(long)]
        show_prompts: bool,
        /// Keep leading indentation of transmitted lines
        #[arg(long)]
        retain_outline: bool,
    },
    /// Upload controller scripts to a remote node
    Upload {
        #[arg(long)]
        node: u32,
        /// Scripts to upload; all scripts deployed to the node when empty
        names: Vec<String>,
    },
    /// Save loaded scripts and sequence the boot script
    Save {
        /// Node to save on; the controller when omitted
        #[arg(long)]
        node: Option<u32>,
    },
    /// Print the state of catalog scripts
    State {
        #[arg(long)]
        node: Option<u32>,
    },
    /// List TSP-Link nodes
    Nodes,
    /// Copy the source of a controller script to a folder
    Export {
        name: String,
        #[arg(long, default_value = ".")]
        to: PathBuf,
    },
    /// Assign nil to a global
    Nil {
        name: String,
        #[arg(long)]
        node: Option<u32>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = TspConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(address) = &cli.address {
        config.session.address = address.clone();
    }
    logging::init(&config.application).map_err(|e| anyhow!(e))?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let session = open_session(&config, cli.dry_run).await?;
    let nodes = discover_nodes(&session).await?;
    let mut manager = FirmwareManager::new(session, config.protocol.clone());
    if cli.front_panel {
        manager = manager.with_display(TspDisplay);
    }
    run(cli.command, &manager, &config, nodes).await
}

async fn open_session(config: &TspConfig, dry_run: bool) -> Result<TspSession> {
    if dry_run {
        warn!("dry run: using the simulator");
        let mock = MockInstrument::new();
        for node in config.scripts.iter().flat_map(|s| s.nodes.iter().copied()) {
            if node != mock.controller() {
                mock.add_node(node, "2612B");
            }
        }
        return Ok(TspSession::new(mock, config.session.clone()));
    }
    let transport = TcpTransport::connect(&config.session)
        .await
        .with_context(|| format!("connecting to {}", config.session.address))?;
    info!(address = %config.session.address, "connected");
    Ok(TspSession::new(transport, config.session.clone()))
}

async fn run(
    command: Commands,
    manager: &FirmwareManager,
    config: &TspConfig,
    nodes: Vec<NodeEntity>,
) -> Result<()> {
    let controller = nodes
        .iter()
        .find(|n| n.is_controller())
        .cloned()
        .ok_or_else(|| anyhow!("no controller node"))?;

    match command {
        Commands::Load {
            names,
            show_errors,
            show_prompts,
            retain_outline,
        } => {
            let mut options = LoadOptions::new(show_errors, show_prompts);
            if retain_outline {
                options = options.with_retain_outline(true);
            }
            let mut scripts = catalog(config, &controller, &names);
            let mut failed = 0;
            for item in scripts.iter_mut() {
                match manager.load_script_with(item, options).await {
                    Ok(true) => println!("loaded {}", item.name()),
                    Ok(false) => {
                        failed += 1;
                        println!("{}: load did not complete", item.name());
                    }
                    Err(e) if e.is_absorbable() => {
                        failed += 1;
                        error!(script = item.name(), error = %e, "load failed");
                        println!("{}: {e}", item.name());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if failed > 0 {
                bail!("{failed} of {} scripts failed to load", scripts.len());
            }
        }
        Commands::Upload { node, names } => {
            let node = find_node(&nodes, node)?;
            let mut scripts = catalog(config, &node, &names);
            report(&manager.upload_user_scripts(&mut scripts, &node).await?)?;
        }
        Commands::Save { node } => {
            let mut node = match node {
                Some(number) => find_node(&nodes, number)?,
                None => controller,
            };
            let mut scripts = catalog(config, &node, &[]);
            report(&manager.save_user_scripts(&mut scripts, &mut node).await?)?;
        }
        Commands::State { node } => {
            let selected: Vec<NodeEntity> = match node {
                Some(number) => vec![find_node(&nodes, number)?],
                None => nodes,
            };
            for node in &selected {
                let mut scripts = catalog(config, node, &[]);
                manager.read_scripts_state(&mut scripts, node).await?;
                for item in &scripts {
                    println!(
                        "node {:>2}  {:<24} loaded={:<5} saved={:<5} activated={}",
                        node.number,
                        item.name(),
                        item.loaded,
                        item.saved,
                        item.activated
                    );
                }
            }
        }
        Commands::Nodes => {
            for node in &nodes {
                println!(
                    "node {:>2}  {:<8} {:?}{}",
                    node.number,
                    node.model,
                    node.model_family,
                    if node.is_controller() { "  (controller)" } else { "" }
                );
            }
        }
        Commands::Export { name, to } => {
            let mut scripts = catalog(config, &controller, std::slice::from_ref(&name));
            let item = scripts
                .get_mut(&name)
                .ok_or_else(|| anyhow!("'{name}' is not in the catalog"))?;
            let path = manager.export_script(item, &to).await?;
            println!("exported {name} to {}", path.display());
        }
        Commands::Nil { name, node } => {
            match node {
                Some(number) if number != controller.number => {
                    manager
                        .nill_object_on_node(&find_node(&nodes, number)?, &name)
                        .await?;
                }
                _ => manager.nill_object(&name).await?,
            }
            println!("{name} is nil");
        }
        Commands::Config => {}
    }
    Ok(())
}

fn find_node(nodes: &[NodeEntity], number: u32) -> Result<NodeEntity> {
    nodes
        .iter()
        .find(|n| n.number == number)
        .cloned()
        .ok_or_else(|| anyhow!("node {number} is not on the TSP-Link bus"))
}

/// Catalog scripts deployed to `node`, or the named ones when `names` is set.
fn catalog(config: &TspConfig, node: &NodeEntity, names: &[String]) -> ScriptEntityCollection {
    let root = config.application.firmware_root.as_deref();
    let selected = config
        .scripts
        .iter()
        .filter(|d| {
            if names.is_empty() {
                d.nodes.contains(&node.number) || (node.is_controller() && d.nodes.is_empty())
            } else {
                names.contains(&d.name)
            }
        })
        .map(|d| d.to_script(root));
    ScriptEntityCollection::from_scripts(node.number, selected)
}

fn report(outcome: &BatchOutcome) -> Result<()> {
    for item in &outcome.items {
        match &item.error {
            None => println!("node {:>2}  {:<24} ok", item.node, item.name),
            Some(e) => println!("node {:>2}  {:<24} FAILED: {e}", item.node, item.name),
        }
    }
    if let Some(reset) = outcome.reset {
        println!("reset: {}", if reset { "ok" } else { "FAILED" });
    }
    if !outcome.success {
        bail!("{} script(s) failed", outcome.failures().count());
    }
    Ok(())
}
