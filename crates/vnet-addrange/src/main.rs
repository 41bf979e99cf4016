//! arctl: operator tool for an address range pool.
//!
//! The pool lives in a JSON state file holding the persisted template of
//! every range. Each invocation restores the pool, runs one command and
//! writes the state back if the command changed it. No IPAM driver is
//! connected, so IPAM-backed ranges are refused.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use vnet_addrange::{
    init_logging, AddressTarget, FreeCheck, Owner, RangeConfig, RangeContext, RangePool,
    DEFAULT_CONFIG_PATH,
};
use vnet_types::{parse_ipv4, parse_ipv6, MacAddress, ParseError, Template};

/// Address range pool administration
#[derive(Parser, Debug)]
#[command(name = "arctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Pool state file (JSON list of range templates)
    #[arg(short = 's', long, default_value = "addrange-state.json")]
    state: PathBuf,

    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every range
    Show {
        /// Include last addresses and lease counts
        #[arg(long)]
        extended: bool,

        /// Print the leases instead of the ranges
        #[arg(long, conflicts_with = "extended")]
        leases: bool,
    },

    /// Add a range from a JSON definition file
    Add { file: PathBuf },

    /// Remove a range
    Remove {
        id: u32,

        /// Remove even with leases outstanding
        #[arg(long)]
        force: bool,
    },

    /// Lease an address
    Allocate {
        /// Lease owner, e.g. vm:12 or net:3
        #[arg(long)]
        owner: Owner,

        #[command(flatten)]
        address: AddressArgs,

        /// Only use this range
        #[arg(long)]
        ar: Option<u32>,

        /// Re-issue an address already leased to the same owner
        #[arg(long)]
        reattach: bool,
    },

    /// Put an address on hold
    Hold {
        #[command(flatten)]
        address: AddressArgs,

        #[arg(long)]
        ar: Option<u32>,
    },

    /// Release a lease or a hold
    Free {
        /// Lease owner; use "hold" to release a hold
        #[arg(long)]
        owner: Owner,

        #[command(flatten)]
        address: AddressArgs,

        #[arg(long)]
        ar: Option<u32>,

        /// Release this many consecutive addresses (requires --ar)
        #[arg(long, requires = "ar")]
        count: Option<u64>,
    },

    /// Release every lease of an owner
    FreeOwner {
        #[arg(long)]
        owner: Owner,
    },

    /// Carve addresses out for another network and print the reservation
    /// range definition
    Reserve {
        /// Network the addresses are reserved for
        #[arg(long)]
        network: i32,

        #[arg(long)]
        size: u64,

        #[arg(long)]
        ar: Option<u32>,

        // First address of the reservation; needs --ar.
        #[command(flatten)]
        address: AddressArgs,
    },

    /// Update a range from a JSON definition file carrying its AR_ID
    Update {
        file: PathBuf,

        /// Allow changes to restricted attributes
        #[arg(long)]
        privileged: bool,
    },
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct AddressArgs {
    #[arg(long)]
    mac: Option<MacAddress>,

    #[arg(long, value_parser = ipv4_arg)]
    ip: Option<u32>,

    #[arg(long, value_parser = ipv6_arg)]
    ip6: Option<u128>,
}

fn ipv4_arg(s: &str) -> Result<u32, ParseError> {
    parse_ipv4(s)
}

fn ipv6_arg(s: &str) -> Result<u128, ParseError> {
    parse_ipv6(s)
}

impl AddressArgs {
    fn target(&self) -> AddressTarget {
        match (self.mac, self.ip, self.ip6) {
            (Some(mac), _, _) => AddressTarget::Mac(mac),
            (_, Some(ip), _) => AddressTarget::Ip(ip),
            (_, _, Some(ip6)) => AddressTarget::Ip6(ip6),
            _ => AddressTarget::Next,
        }
    }

    fn explicit(&self) -> anyhow::Result<AddressTarget> {
        match self.target() {
            AddressTarget::Next => bail!("one of --mac, --ip or --ip6 is required"),
            target => Ok(target),
        }
    }
}

fn load_state(path: &Path) -> anyhow::Result<Vec<Template>> {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("cannot parse state file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("cannot read state file {}", path.display())),
    }
}

fn save_state(path: &Path, pool: &RangePool) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(&pool.to_templates())?;
    fs::write(path, text).with_context(|| format!("cannot write state file {}", path.display()))
}

fn read_template(path: &Path) -> anyhow::Result<Template> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read definition {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("cannot parse definition {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs one command. Returns true if the pool changed.
async fn run(pool: &mut RangePool, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Show { extended, leases } => {
            if leases {
                let rows: Vec<Template> = pool
                    .leases()
                    .into_iter()
                    .map(|(_, lease)| lease.to_template())
                    .collect();
                print_json(&rows)?;
            } else if extended {
                print_json(&pool.to_extended())?;
            } else {
                print_json(&pool.to_templates())?;
            }
            Ok(false)
        }

        Command::Add { file } => {
            let definition = read_template(&file)?;
            let id = pool.add_range(&definition).await?;
            println!("{id}");
            Ok(true)
        }

        Command::Remove { id, force } => {
            let removed = pool.remove_range(id, force).await?;
            info!(ar_id = id, released = removed.used(), "range removed");
            Ok(true)
        }

        Command::Allocate {
            owner,
            address,
            ar,
            reattach,
        } => {
            let check = if reattach {
                FreeCheck::Reattach
            } else {
                FreeCheck::Strict
            };
            let mut lease = Template::new();
            pool.allocate(&address.target(), owner, &mut lease, ar, check)
                .await?;
            print_json(&lease)?;
            Ok(true)
        }

        Command::Hold { address, ar } => {
            let id = pool.hold(&address.explicit()?, ar).await?;
            println!("{id}");
            Ok(true)
        }

        Command::Free {
            owner,
            address,
            ar,
            count,
        } => {
            let target = address.explicit()?;
            match (count, ar) {
                (Some(count), Some(ar)) => {
                    let freed = pool.free_range(ar, &target, count, owner).await?;
                    println!("{freed}");
                }
                _ => {
                    pool.free(&target, owner, ar).await?;
                }
            }
            Ok(true)
        }

        Command::FreeOwner { owner } => {
            let freed = pool.free_by_owner(owner).await?;
            println!("{freed}");
            Ok(freed > 0)
        }

        Command::Reserve {
            network,
            size,
            ar,
            address,
        } => {
            let start = match address.target() {
                AddressTarget::Next => None,
                target => Some(target),
            };
            let definition = pool.reserve(network, size, ar, start.as_ref()).await?;
            print_json(&definition)?;
            Ok(true)
        }

        Command::Update { file, privileged } => {
            let replacement = read_template(&file)?;
            let report = pool.update(&replacement, privileged)?;
            print_json(&serde_json::json!({
                "changed_inherited": report.changed_inherited,
                "security_groups_added": report.security_groups_added,
                "security_groups_removed": report.security_groups_removed,
            }))?;
            Ok(true)
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = RangeConfig::load_or_default(&cli.config)
        .with_context(|| format!("cannot load {}", cli.config.display()))?;
    let ctx = RangeContext::new(config)?;

    let templates = load_state(&cli.state)?;
    let mut pool = RangePool::restore(&templates, ctx)
        .with_context(|| format!("cannot restore pool from {}", cli.state.display()))?;

    if run(&mut pool, cli.command).await? {
        save_state(&cli.state, &pool)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("arctl: {e:#}");
            ExitCode::FAILURE
        }
    }
}
