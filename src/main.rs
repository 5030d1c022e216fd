//! meshfw - in-pod traffic capture for a node-level mesh agent
//!
//! Installs the netfilter rules and policy routing that send a pod's TCP
//! traffic through the mesh proxy, plus the host rules that let node health
//! probes reach captured pods.
//!
//! # Usage
//!
//! ```bash
//! # Capture a pod's traffic (run from the node, namespace by path)
//! meshfw inpod --netns /proc/4242/ns/net --probe-v4 169.254.7.127
//!
//! # Ingress-only capture with IPv6
//! meshfw --config /etc/meshfw.json inpod --netns /var/run/netns/pod --probe-v4 169.254.7.127 \
//!     --probe-v6 fd16:9254:7127:1337:ffff:ffff:ffff:ffff --ingress
//!
//! # Host rules for health probes
//! meshfw host --probe-v4 169.254.7.127
//!
//! # Show what would run
//! meshfw --dry-run inpod --probe-v4 169.254.7.127
//! meshfw plan --probe-v4 169.254.7.127 --format json
//!
//! # Undo
//! meshfw delete-inpod --netns /proc/4242/ns/net
//! meshfw delete-host
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use meshfw::config::{Config, load_config};
use meshfw::core::configurator::Configurator;
use meshfw::core::error::{Error, IptablesErrorPattern, Result};
use meshfw::exec::{CommandExecutor, StubExecutor, SystemExecutor};
use meshfw::netlink::{EmptyNetlink, IprouteNetlink};
use shadow_rs::shadow;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, debug, warn};

shadow!(build);

#[derive(Parser)]
#[command(name = "meshfw")]
#[command(version = build::PKG_VERSION)]
#[command(about = "Traffic capture rules for mesh-enrolled pods", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print commands instead of running them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install capture rules in a pod network namespace
    Inpod {
        /// Network namespace path (e.g. /proc/<pid>/ns/net); current namespace if omitted
        #[arg(long, value_name = "PATH")]
        netns: Option<PathBuf>,
        #[command(flatten)]
        probes: InpodProbes,
        /// Capture inbound traffic only
        #[arg(long)]
        ingress: bool,
    },
    /// Install health-probe SNAT rules in the host namespace
    Host {
        #[command(flatten)]
        probes: HostProbes,
    },
    /// Remove capture rules from a pod network namespace
    DeleteInpod {
        #[arg(long, value_name = "PATH")]
        netns: Option<PathBuf>,
    },
    /// Remove the host health-probe rules
    DeleteHost,
    /// Show the guarded plans without running anything
    Plan {
        #[command(flatten)]
        probes: InpodProbes,
        #[arg(long)]
        ingress: bool,
        /// Plan host rules instead of in-pod rules
        #[arg(long)]
        host: bool,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(clap::Args)]
struct InpodProbes {
    /// Health-probe source address (IPv4)
    #[arg(long, value_name = "ADDR")]
    probe_v4: Ipv4Addr,
    /// Health-probe source address (IPv6, required when IPv6 is enabled)
    #[arg(long, value_name = "ADDR")]
    probe_v6: Option<Ipv6Addr>,
}

#[derive(clap::Args)]
struct HostProbes {
    #[arg(long, value_name = "ADDR")]
    probe_v4: Option<Ipv4Addr>,
    #[arg(long, value_name = "ADDR")]
    probe_v6: Option<Ipv6Addr>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    debug!(
        "meshfw {} ({} built {})",
        build::PKG_VERSION,
        build::SHORT_COMMIT,
        build::BUILD_TIME
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    if let Commands::Plan {
        probes,
        ingress,
        host,
        format,
    } = &cli.command
    {
        return print_plan(config, probes, *ingress, *host, *format);
    }

    if cli.dry_run {
        let stub = StubExecutor::new();
        execute(&cli.command, config, &stub)?;
        for line in stub.executed() {
            println!("{line}");
        }
        return Ok(());
    }

    if !nix::unistd::getuid().is_root() {
        warn!("Not running as root; netfilter changes need CAP_NET_ADMIN");
    }

    let executor = match &cli.command {
        Commands::Inpod {
            netns: Some(path), ..
        }
        | Commands::DeleteInpod { netns: Some(path) } => SystemExecutor::in_netns(path.clone()),
        _ => SystemExecutor::new(),
    };
    execute(&cli.command, config, &executor)
}

fn execute<E: CommandExecutor>(command: &Commands, config: Config, executor: &E) -> Result<()> {
    let configurator = Configurator::new(config, executor, IprouteNetlink::new(executor))?;

    match command {
        Commands::Inpod {
            probes, ingress, ..
        } => {
            configurator.create_inpod_rules(probes.probe_v4, probes.probe_v6, *ingress)?;
            println!("✓ Capture rules installed.");
        }
        Commands::Host { probes } => {
            configurator.create_host_rules_for_health_checks(probes.probe_v4, probes.probe_v6)?;
            println!("✓ Host probe rules installed.");
        }
        Commands::DeleteInpod { .. } => {
            configurator.delete_inpod_rules()?;
            println!("✓ Capture rules removed.");
        }
        Commands::DeleteHost => {
            configurator.delete_host_rules()?;
            println!("✓ Host probe rules removed.");
        }
        Commands::Plan { .. } => {
            return Err(Error::Internal("plan is never executed".into()));
        }
    }
    Ok(())
}

fn print_plan(
    config: Config,
    probes: &InpodProbes,
    ingress: bool,
    host: bool,
    format: OutputFormat,
) -> Result<()> {
    let configurator = Configurator::new(config, StubExecutor::new(), EmptyNetlink)?;
    let plans = if host {
        configurator.plan_host(Some(probes.probe_v4), probes.probe_v6)?
    } else {
        configurator.plan_inpod(probes.probe_v4, probes.probe_v6, ingress)?
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plans)?),
        OutputFormat::Text => {
            for plan in &plans {
                println!(
                    "# {} {} plan, {} steps, fingerprint {}",
                    plan.family,
                    plan.intent,
                    plan.steps.len(),
                    plan.fingerprint()
                );
                for command in plan.commands() {
                    println!("{command}");
                }
            }
        }
    }
    Ok(())
}

fn report(err: &Error) {
    eprintln!("Error: {err}");

    let detail = match err {
        Error::Execution { stderr, .. } => stderr.clone(),
        Error::Netlink { source, .. } => Some(source.to_string()),
        _ => None,
    };
    if let Some(detail) = detail {
        let translation = IptablesErrorPattern::match_error(&detail);
        eprintln!("  {}", translation.user_message);
        for suggestion in translation.suggestions {
            eprintln!("  → {suggestion}");
        }
    }
    if let Error::Execution {
        attempted, journal, ..
    } = err
    {
        for command in journal.iter().take(attempted.saturating_sub(1)) {
            debug!("applied: {command}");
        }
        eprintln!("  {attempted} command(s) attempted; re-running is safe once the cause is fixed");
    }
}
