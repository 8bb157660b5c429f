// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hypervisor::{Arch, Hal, SoftHal};
use log::{info, warn, LevelFilter};
use thiserror::Error;
use vm_device::device_tree::DeviceNode;
use vm_device::SharedWriter;
use vmm::{config, ErrorKind, Vmm, VmmConfig};

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Vmm(#[from] vmm::Error),
    #[error("Failed to read a command: {0}")]
    Stdin(#[source] io::Error),
    #[error("Failed to print the result: {0}")]
    Output(#[source] serde_json::Error),
    #[error("{0}")]
    Usage(String),
}

impl CliError {
    fn code(&self) -> i32 {
        match self {
            CliError::Vmm(e) => e.kind().code(),
            CliError::Stdin(_) | CliError::Output(_) => ErrorKind::IoError.code(),
            CliError::Usage(_) => ErrorKind::Invalid.code(),
        }
    }
}

type Result<T> = std::result::Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "xvisor", version, about = "Run guests on the hosted hypervisor core")]
struct CliArgs {
    /// Device tree describing the guests (JSON unless --dtb)
    #[arg(long)]
    config: PathBuf,

    /// The configuration is a flattened device tree blob
    #[arg(long)]
    dtb: bool,

    /// Number of host CPUs
    #[arg(long, default_value_t = config::DEFAULT_HOST_CPUS)]
    cpus: usize,

    /// Guest architecture: arm32, aarch64, x86_64 or riscv64
    #[arg(long, default_value = "arm32", value_parser = parse_arch)]
    arch: Arch,

    /// Host RAM handed to the hypervisor, in MiB
    #[arg(long, default_value_t = config::DEFAULT_HOST_RAM_SIZE >> 20)]
    host_ram_mb: u64,

    /// More output; repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    verb: Verb,
}

#[derive(Subcommand, Debug)]
enum Verb {
    /// Create one guest of the configuration
    GuestCreate { guest: String },
    /// Destroy a halted or never started guest
    GuestDestroy { guest: String },
    GuestReset { guest: String },
    GuestKick { guest: String },
    GuestPause { guest: String },
    GuestResume { guest: String },
    GuestHalt { guest: String },
    /// Show the registers and scheduling statistics of a VCPU
    VcpuDumpreg { guest: String, vcpu: String },
    RegionList { guest: String },
    GuestList,
    /// Create every guest, start the host CPUs, then read verbs from stdin
    Run,
}

/// One line of the `run` console.
#[derive(Parser, Debug)]
#[command(name = "xvisor", no_binary_name = true)]
struct ConsoleLine {
    #[command(subcommand)]
    verb: Verb,
}

fn parse_arch(s: &str) -> std::result::Result<Arch, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown architecture {}", s))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(CliError::Output)?;
    println!("{}", json);
    Ok(())
}

fn guest_node<'a>(tree: &'a DeviceNode, name: &str) -> Result<&'a DeviceNode> {
    config::guest_nodes(tree)
        .into_iter()
        .find(|n| n.name == name)
        .ok_or_else(|| {
            vmm::Error::NotFound(format!("guest {} in the configuration", name)).into()
        })
}

fn execute(vmm: &Vmm, tree: &DeviceNode, verb: &Verb) -> Result<()> {
    match verb {
        Verb::GuestCreate { guest } => {
            vmm.guest_create(guest_node(tree, guest)?)?;
        }
        Verb::GuestDestroy { guest } => vmm.guest_destroy(guest)?,
        Verb::GuestReset { guest } => vmm.guest_reset(guest)?,
        Verb::GuestKick { guest } => vmm.guest_kick(guest)?,
        Verb::GuestPause { guest } => vmm.guest_pause(guest)?,
        Verb::GuestResume { guest } => vmm.guest_resume(guest)?,
        Verb::GuestHalt { guest } => vmm.guest_halt(guest)?,
        Verb::VcpuDumpreg { guest, vcpu } => println!("{}", vmm.vcpu_dumpreg(guest, vcpu)?),
        Verb::RegionList { guest } => {
            for region in vmm.region_list(guest)? {
                println!("{}", region);
            }
        }
        Verb::GuestList => print_json(&vmm.guest_list())?,
        Verb::Run => return Err(CliError::Usage("already running".to_string())),
    }
    Ok(())
}

fn report(e: &CliError) {
    println!("{} {}", e.code(), e);
}

fn run(vmm: &Vmm, tree: &DeviceNode) -> Result<()> {
    let guests = vmm.guests_create(tree)?;
    vmm.start()?;
    for guest in &guests {
        if let Err(e) = guest.kick() {
            warn!("{}: not started: {}", guest.name, e);
        }
    }
    info!("{} guests running", guests.len());

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.map_err(CliError::Stdin)?;
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        if words == ["quit"] {
            break;
        }
        let result = ConsoleLine::try_parse_from(words.iter().copied())
            .map_err(|e| {
                let usage = e.to_string();
                CliError::Usage(usage.lines().next().unwrap_or_default().to_string())
            })
            .and_then(|console| execute(vmm, tree, &console.verb));
        match result {
            Ok(()) => println!("0 ok"),
            Err(e) => report(&e),
        }
        let _ = io::stdout().flush();
    }
    vmm.shutdown();
    Ok(())
}

fn start(args: &CliArgs) -> Result<()> {
    let tree = config::load_tree(&args.config, args.dtb)?;
    let vmm_config = VmmConfig {
        host_cpus: args.cpus,
        host_ram_size: args.host_ram_mb << 20,
        arch: args.arch,
        ..Default::default()
    };
    let hal = Arc::new(SoftHal::with_tick(args.cpus, vmm_config.tick));
    let console = SharedWriter::new(io::stdout());
    let vmm = Vmm::with_console(vmm_config, hal as Arc<dyn Hal>, Some(console))?;

    match &args.verb {
        Verb::Run => run(&vmm, &tree),
        Verb::GuestCreate { .. } => execute(&vmm, &tree, &args.verb),
        verb => {
            vmm.guests_create(&tree)?;
            execute(&vmm, &tree, verb)
        }
    }
}

fn main() {
    let args = CliArgs::parse();

    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(e) = start(&args) {
        report(&e);
        process::exit(1);
    }
}
