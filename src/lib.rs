// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IPv4 multicast group membership engine (IGMP host mode).
//!
//! This crate implements the host side of the Internet Group Management
//! Protocol: joining and leaving IPv4 multicast groups on a network link,
//! answering router queries, and negotiating version compatibility with
//! IGMPv1/v2 queriers (RFC 1112, RFC 2236, RFC 3376).
//!
//! ## Architecture
//!
//! - **[`host::IgmpHost`]** owns a registry of per-link membership state and
//!   a dispatcher task that turns timer expirations into protocol work.
//! - **[`link::NetworkLink`]** is the only hardware-facing interface: the
//!   engine hands it finished IPv4 frames and asks it for MTU and up/down
//!   state. Physical multicast address resolution lives behind it.
//! - **[`wire`]** holds the message formats, checksum, and the IPv4
//!   router-alert encapsulation applied to every outbound packet.
//!
//! Join and leave are synchronous; every delayed action (report responses,
//! retransmissions, compatibility windows) runs on cancellable deferred
//! timers over the tokio runtime.
//!
//! ## Packet flow
//!
//! | Direction | Path |
//! |-----------|------|
//! | Inbound | IPv4 layer → [`host::IgmpHost::receive`] → processor → state + timers |
//! | Outbound | join/leave or timer → builder → IPv4 wrap → [`link::NetworkLink::send`] |
//!
//! Router-mode behavior (querier election, forwarding) is out of scope; the
//! engine only reports this host's own memberships.

pub mod config;
pub mod host;
pub mod link;
pub mod wire;

mod builder;
mod membership;
mod processor;
mod timer;

pub use config::{ConfigError, IgmpConfig};
pub use host::{IgmpError, IgmpHost};
pub use link::{LinkHandle, LinkId, LocalAddress, NetworkLink};
pub use membership::CompatibilityMode;
pub use processor::ReceiveContext;
pub use timer::{RandomDelay, ReportDelay};
