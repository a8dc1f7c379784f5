//! mdns-bridge: bridge mDNS service discovery between network segments that
//! are not linked at layer 2.
//!
//! The daemon joins the mDNS multicast groups on every configured interface
//! and re-originates traffic between them. It is a bridge, not a router:
//! each forwarded packet is a fresh locally-originated multicast datagram,
//! re-encoded with name compression rebuilt and allow/deny name filters
//! applied on the way in and out.

mod bridge;
mod config;
mod interface;
mod net;
mod pidfile;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio_stream::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::interface::{Family, Runtime};

#[derive(Parser)]
#[command(name = "mdns-bridge", version, about = "Bridge mDNS between isolated network segments")]
struct Args {
    /// Run in the foreground and dump the resolved configuration
    #[arg(short = 'f')]
    foreground: bool,

    /// Log as JSON on stderr for syslog/journald collectors
    #[arg(short = 's')]
    syslog: bool,

    /// Warn for mDNS decode issues that are silent by default
    #[arg(short = 'w')]
    warn: bool,

    /// Configuration file name
    #[arg(short = 'c', default_value = "mdns-bridge.conf")]
    config: PathBuf,

    /// Process id file name
    #[arg(short = 'p')]
    pidfile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".parse().unwrap());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    if args.syslog {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = Config::load(&args.config)?;
    let os = net::validate_interfaces(&config.interfaces)?;
    let runtime = interface::build_runtime(config, os)?;

    if args.foreground {
        dump_config(&runtime);
    }

    let pidfile = match &args.pidfile {
        Some(path) => Some(pidfile::PidFile::create(path)?),
        None => None,
    };

    info!("mDNS bridge version {} starting", env!("CARGO_PKG_VERSION"));

    for family in Family::ALL {
        let members = &runtime.families[family.index()];
        if members.is_empty() {
            continue;
        }

        let mut ports = Vec::with_capacity(members.len());
        for member in members {
            let socket = net::bind_multicast(family, &member.iface)
                .with_context(|| format!("{} setup on {} failed", family, member.iface.name))?;
            let socket = tokio::net::UdpSocket::from_std(socket)?;
            ports.push(bridge::Port {
                iface: member.iface.clone(),
                socket,
                peers: member.peers.clone(),
                peer_filters: member.peer_filters.clone(),
                peer_nofilter_count: member.peer_nofilter_count,
            });
        }

        let worker = bridge::Bridge::new(
            family,
            ports,
            runtime.filtering_enabled,
            runtime.global_filter.clone(),
            args.warn,
        );
        tokio::spawn(worker.run());
    }

    // Block until a terminating signal, then clean up and exit.
    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    if let Some(signal) = signals.next().await {
        info!("exiting on signal {}", signal);
    }
    if let Some(pidfile) = &pidfile {
        pidfile.remove();
    }
    Ok(())
}

/// Print the resolved configuration the way the daemon will use it.
fn dump_config(runtime: &Runtime) {
    println!("\nGlobal settings:");
    println!(" packet filtering: {}", on_off(runtime.filtering_enabled));
    match &runtime.global_filter {
        Some(filter) => {
            println!(" global filter ({:?}):", filter.mode());
            for name in filter.names() {
                println!("  {name}");
            }
        }
        None => println!(" global filter: (none)"),
    }

    println!("\nInterface list:");
    for iface in &runtime.interfaces {
        println!(" {} ({})", iface.name, iface.if_index);
        for family in Family::ALL {
            match iface.addr[family.index()] {
                Some(addr) => {
                    println!("  {family} address {addr}");
                    let members = &runtime.families[family.index()];
                    if let Some(member) =
                        members.iter().find(|m| m.iface.name == iface.name)
                    {
                        let peers: Vec<&str> = member
                            .peers
                            .iter()
                            .map(|&peer| members[peer].iface.name.as_str())
                            .collect();
                        println!("   peer interfaces: {}", peers.join(" "));
                    }
                }
                None => println!("  {family} disabled"),
            }
        }
        for (direction, filter) in [
            ("inbound", &iface.inbound_filter),
            ("outbound", &iface.outbound_filter),
        ] {
            if let Some(filter) = filter {
                println!("  {} filter list ({:?}):", direction, filter.mode());
                for name in filter.names() {
                    println!("   {name}");
                }
            }
        }
    }
    println!();
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}
