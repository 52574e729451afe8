// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{io, process};

use accel::{cli_print_error_chain, load_smoke_guest, SmokeOps};
use clap::{Arg, ArgAction, ArgMatches, Command};
use env_logger::{Builder, Env};
use signal_hook::consts::{SIGINT, SIGTERM};
use thiserror::Error;
use vm_memory::{GuestAddress, GuestMemoryError, GuestMemoryMmap};
use vmm::config::{self, AccelConfig, CpusConfig, MemoryConfig};
use vmm::session::{Session, SessionError};
use vmm::Accelerator;

#[derive(Error, Debug)]
enum Error {
    #[error("Failed to parse the configuration")]
    ParsingConfig(#[source] config::Error),
    #[error("Requested {0} vCPUs but the hypervisor supports at most {1}")]
    TooManyVcpus(u8, u32),
    #[error("Failed to open the hypervisor session")]
    OpenSession(#[source] SessionError),
    #[error("Failed to allocate guest memory")]
    GuestMemory(#[source] anyhow::Error),
    #[error("Failed to set up the accelerator")]
    Accelerator(#[source] vmm::Error),
    #[error("Failed to load the smoke guest")]
    LoadGuest(#[source] GuestMemoryError),
    #[error("Failed to register the termination signal handler")]
    SignalHandler(#[source] io::Error),
    #[error("Failed to serialize to JSON")]
    Serialize(#[source] serde_json::Error),
}

fn create_app() -> Command {
    Command::new("accel")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Drive an x86 guest through the in-kernel hypervisor.")
        .arg(
            Arg::new("accel")
                .long("accel")
                .help(
                    "Accelerator parameters \
                     \"kernel_irqchip=on|off|split,emulation_error=strict|permissive,\
                     readonly_two_step=on|off,smm=on|off,identity_map=<addr>,tss=<addr>\"",
                )
                .num_args(1)
                .default_value(""),
        )
        .arg(
            Arg::new("capabilities")
                .long("capabilities")
                .help("Print the negotiated capabilities as JSON and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cpus")
                .long("cpus")
                .help("CPU parameters \"boot=<boot_vcpus>,max=<max_vcpus>\"")
                .num_args(1)
                .default_value(""),
        )
        .arg(
            Arg::new("memory")
                .long("memory")
                .help("Memory parameters \"size=<guest_memory_size>\"")
                .num_args(1)
                .default_value(""),
        )
        .arg(
            Arg::new("smoke")
                .long("smoke")
                .help("Boot the built-in guest, which prints to the serial port and exits")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .help("Sets the level of debugging output")
                .action(ArgAction::Count),
        )
}

fn log_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn string_arg<'a>(cmd_arguments: &'a ArgMatches, id: &str) -> &'a str {
    cmd_arguments
        .get_one::<String>(id)
        .map(String::as_str)
        .unwrap_or_default()
}

fn start_accel(cmd_arguments: &ArgMatches) -> Result<(), Error> {
    let accel_config =
        AccelConfig::parse(string_arg(cmd_arguments, "accel")).map_err(Error::ParsingConfig)?;
    let cpus_config =
        CpusConfig::parse(string_arg(cmd_arguments, "cpus")).map_err(Error::ParsingConfig)?;
    let memory_config =
        MemoryConfig::parse(string_arg(cmd_arguments, "memory")).map_err(Error::ParsingConfig)?;
    debug!(
        "Effective accelerator configuration: {}",
        serde_json::to_string(&accel_config).map_err(Error::Serialize)?
    );

    let session = Session::open_default(accel_config).map_err(Error::OpenSession)?;
    let capabilities = session.capabilities();

    if cmd_arguments.get_flag("capabilities") {
        println!(
            "{}",
            serde_json::to_string_pretty(capabilities).map_err(Error::Serialize)?
        );
        return Ok(());
    }

    println!(
        "Hypervisor API version {}: {} memory slots, {} vCPUs (recommended {}), {} routable GSIs",
        capabilities.api_version,
        capabilities.nr_slots,
        capabilities.max_vcpus,
        capabilities.recommended_vcpus,
        capabilities.gsi_count,
    );

    if !cmd_arguments.get_flag("smoke") {
        return Ok(());
    }

    if u32::from(cpus_config.boot_vcpus) > capabilities.max_vcpus {
        return Err(Error::TooManyVcpus(
            cpus_config.boot_vcpus,
            capabilities.max_vcpus,
        ));
    }

    let guest_memory =
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), memory_config.size as usize)])
            .map_err(|e| Error::GuestMemory(e.into()))?;

    let (exit_evt, exit_rx) = flume::bounded(1);
    let ops = Arc::new(SmokeOps::new(exit_evt, true));
    let accel = Accelerator::new(session, guest_memory, ops).map_err(Error::Accelerator)?;

    let mut vcpus = accel
        .create_vcpus(cpus_config.boot_vcpus)
        .map_err(Error::Accelerator)?;
    if let Some(bsp) = vcpus.first_mut() {
        load_smoke_guest(accel.guest_memory(), bsp).map_err(Error::LoadGuest)?;
    }

    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, terminate.clone()).map_err(Error::SignalHandler)?;
    }

    accel.start(vcpus).map_err(Error::Accelerator)?;
    loop {
        match exit_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
            Err(flume::RecvTimeoutError::Timeout) => {
                if terminate.load(Ordering::SeqCst) {
                    info!("Received termination signal");
                    break;
                }
            }
        }
    }

    accel.shutdown().map_err(Error::Accelerator)
}

fn main() {
    let cmd_arguments = create_app().get_matches();

    let verbosity = cmd_arguments.get_count("v");
    Builder::from_env(Env::default().default_filter_or(log_level(verbosity))).init();

    if let Err(top_error) = start_accel(&cmd_arguments) {
        cli_print_error_chain(&top_error, "accel");
        process::exit(1);
    }
}
