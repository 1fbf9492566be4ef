// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Demonstration driver for the IGMP host engine.
//!
//! Runs the engine against a simulated link that logs every frame it is
//! asked to transmit, joins the requested groups, holds the memberships for
//! a while, then leaves and waits for the leave retransmissions to drain.

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use igmp_host::{IgmpConfig, IgmpHost, LinkId, LocalAddress, NetworkLink};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Multicast groups to join
    #[arg(long, value_delimiter = ',', default_value = "239.1.2.3")]
    groups: Vec<Ipv4Addr>,

    /// Local IPv4 address of the simulated link
    #[arg(long, default_value = "192.168.1.10")]
    address: Ipv4Addr,

    /// Subnet mask of the simulated link
    #[arg(long, default_value = "255.255.255.0")]
    netmask: Ipv4Addr,

    /// Seconds to hold the memberships before leaving
    #[arg(long, default_value_t = 3)]
    hold: u64,

    /// Optional JSON5 configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

/// A link that prints outbound frames instead of transmitting them.
struct ConsoleLink {
    local: Ipv4Addr,
}

impl NetworkLink for ConsoleLink {
    fn id(&self) -> LinkId {
        LinkId(1)
    }

    fn mtu(&self) -> usize {
        1500
    }

    fn is_up(&self) -> bool {
        true
    }

    fn send(&self, destination: Ipv4Addr, frame: Vec<u8>) -> io::Result<()> {
        info!(
            "{} -> {}: {} bytes [{}]",
            self.local,
            destination,
            frame.len(),
            hex_dump(&frame)
        );
        Ok(())
    }
}

fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => IgmpConfig::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => IgmpConfig::default(),
    };

    let link = Arc::new(ConsoleLink {
        local: args.address,
    });
    let link_id = link.id();
    let local = LocalAddress::new(args.address, args.netmask);
    let host = IgmpHost::new(config);

    for group in &args.groups {
        host.join_group(link.clone(), local, *group)
            .with_context(|| format!("joining {group}"))?;
    }

    info!(
        "holding {} membership(s) for {}s",
        host.group_count(link_id),
        args.hold
    );
    tokio::time::sleep(Duration::from_secs(args.hold)).await;

    for group in &args.groups {
        host.leave_group(link_id, *group)
            .with_context(|| format!("leaving {group}"))?;
    }

    // Let the leave retransmissions drain before exiting.
    tokio::time::sleep(Duration::from_secs(3)).await;
    Ok(())
}
