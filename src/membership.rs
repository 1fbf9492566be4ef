// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-link membership state: configuration, the compatibility-mode machine,
//! and the multicast group records.
//!
//! One mutex per link guards everything mutable here. Packet transmission
//! never happens under that lock; senders snapshot what they need, release,
//! and transmit while an `Arc<LinkState>` clone keeps the state alive.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::info;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::config::IgmpConfig;
use crate::link::{LinkHandle, LinkId, LocalAddress};
use crate::timer::{
    self, CancelOutcome, DeferredTimer, ReportDelay, TimerEventSender, TimerKey,
};
use crate::wire;

/// Identity of one group record instance. Globally unique, so a rejoin
/// racing a still-draining leave of the same address, or a fresh link
/// reusing a retired link's id, can never receive the other's timer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupId(pub u64);

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

impl GroupId {
    fn next() -> Self {
        Self(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The oldest IGMP version currently required by observed traffic on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityMode {
    V1,
    V2,
    V3,
}

/// Where a group record is in its life: an active member reporting state, or
/// unlinked and draining leave transmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupPhase {
    /// Linked member. The next send is a change-of-state record while
    /// `state_change` holds; a query response clears it.
    Member { state_change: bool },
    /// Unlinked, transmitting leaves. `leave_sent` is set once the first
    /// leave hits the wire, authorizing timer-driven retransmissions.
    Leaving { leave_sent: bool },
}

/// One multicast group membership on a link.
#[derive(Debug)]
pub(crate) struct GroupMembership {
    pub id: GroupId,
    pub address: Ipv4Addr,
    /// Outstanding local join calls. The record sits in the active list iff
    /// this is non-zero.
    pub join_count: u32,
    /// Report or leave transmissions remaining, never above the robustness
    /// variable.
    pub send_count: u32,
    /// Set when this host sent the most recent report for the group, putting
    /// it on the hook for the leave messages.
    pub last_reporter: bool,
    pub phase: GroupPhase,
    pub timer: DeferredTimer,
}

impl GroupMembership {
    /// A freshly joined group: one join, a full complement of state-change
    /// sends ahead of it, and reporting responsibility assumed.
    fn new(id: GroupId, address: Ipv4Addr, robustness_variable: u32) -> Self {
        Self {
            id,
            address,
            join_count: 1,
            send_count: robustness_variable,
            last_reporter: true,
            phase: GroupPhase::Member { state_change: true },
            timer: DeferredTimer::new(),
        }
    }

    pub fn is_state_change(&self) -> bool {
        matches!(self.phase, GroupPhase::Member { state_change: true })
            || matches!(self.phase, GroupPhase::Leaving { .. })
    }

    /// A query response reports current state, not a change.
    pub fn clear_state_change(&mut self) {
        if let GroupPhase::Member { state_change } = &mut self.phase {
            *state_change = false;
        }
    }

    /// Transition to the leaving phase: reset the send budget and invalidate
    /// any in-flight join retransmission so it cannot corrupt the count.
    pub fn begin_leave(&mut self, robustness_variable: u32) {
        self.phase = GroupPhase::Leaving { leave_sent: false };
        self.send_count = robustness_variable;
        self.timer.cancel_and_flush();
    }
}

/// Mutable per-link state, guarded by the link's mutex.
#[derive(Debug)]
pub(crate) struct LinkInner {
    /// Router-controlled retransmission count, updated by IGMPv3 queries.
    pub robustness_variable: u32,
    /// Router-controlled query interval in seconds, updated by IGMPv3
    /// queries.
    pub query_interval: u32,
    /// Maximum response time from the most recent query, in tenths of a
    /// second.
    pub max_response_time: u32,
    pub compatibility_mode: CompatibilityMode,
    v1_timer: DeferredTimer,
    v2_timer: DeferredTimer,
    /// Timer for the IGMPv3 link-wide response to a general query.
    pub report_timer: DeferredTimer,
    /// Active memberships; the group count of the link.
    pub groups: Vec<GroupMembership>,
    /// Former members still draining leave transmissions.
    pub parting: Vec<GroupMembership>,
    /// Set under the registry's exclusive lock when the link is removed.
    /// Holders of a stale handle must retry through the registry.
    pub retired: bool,
}

impl LinkInner {
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn find_group_mut(&mut self, address: Ipv4Addr) -> Option<&mut GroupMembership> {
        self.groups.iter_mut().find(|g| g.address == address)
    }

    pub fn group_by_id(&self, id: GroupId) -> Option<&GroupMembership> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn group_by_id_mut(&mut self, id: GroupId) -> Option<&mut GroupMembership> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    pub fn parting_by_id(&self, id: GroupId) -> Option<&GroupMembership> {
        self.parting.iter().find(|g| g.id == id)
    }

    pub fn parting_by_id_mut(&mut self, id: GroupId) -> Option<&mut GroupMembership> {
        self.parting.iter_mut().find(|g| g.id == id)
    }

    /// Drop a draining record for good.
    pub fn remove_parting(&mut self, id: GroupId) {
        self.parting.retain(|g| g.id != id);
    }

    /// Whether nothing keeps this link's state alive.
    pub fn is_idle(&self) -> bool {
        self.groups.is_empty() && self.parting.is_empty()
    }
}

/// Protocol state for one network link.
pub(crate) struct LinkState {
    id: LinkId,
    link: LinkHandle,
    local: LocalAddress,
    /// Largest IGMP payload a single packet may carry on this link.
    max_packet_size: usize,
    unsolicited_report_interval: u32,
    runtime: Handle,
    events: TimerEventSender,
    delay: Arc<dyn ReportDelay>,
    inner: Mutex<LinkInner>,
}

impl LinkState {
    /// Build a fully initialized link state. Done outside any registry lock;
    /// the candidate is discarded if another thread wins the insert race.
    pub fn new(
        link: LinkHandle,
        local: LocalAddress,
        config: &IgmpConfig,
        runtime: Handle,
        events: TimerEventSender,
        delay: Arc<dyn ReportDelay>,
    ) -> Self {
        let max_packet_size = link.mtu().saturating_sub(wire::IP4_HEADER_SIZE);
        Self {
            id: link.id(),
            link,
            local,
            max_packet_size,
            unsolicited_report_interval: config.unsolicited_report_interval,
            runtime,
            events,
            delay,
            inner: Mutex::new(LinkInner {
                robustness_variable: config.robustness_variable,
                query_interval: config.query_interval,
                max_response_time: config.max_response_time,
                compatibility_mode: CompatibilityMode::V3,
                v1_timer: DeferredTimer::new(),
                v2_timer: DeferredTimer::new(),
                report_timer: DeferredTimer::new(),
                groups: Vec::new(),
                parting: Vec::new(),
                retired: false,
            }),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn network(&self) -> &LinkHandle {
        &self.link
    }

    pub fn local(&self) -> LocalAddress {
        self.local
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn unsolicited_report_interval(&self) -> u32 {
        self.unsolicited_report_interval
    }

    pub fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().expect("IGMP link state lock poisoned")
    }

    /// Create a new active group record for a first join.
    pub fn allocate_group(&self, inner: &mut LinkInner, address: Ipv4Addr) -> GroupId {
        let id = GroupId::next();
        let robustness = inner.robustness_variable;
        inner.groups.push(GroupMembership::new(id, address, robustness));
        id
    }

    /// (Re)arm the compatibility window for a legacy querier version, then
    /// recompute the mode. The window is
    /// `robustness * query_interval + max_response_time`, using the response
    /// time seen before the triggering query updates it.
    pub fn queue_compatibility_timer(&self, inner: &mut LinkInner, version: CompatibilityMode) {
        let window = Duration::from_secs(
            inner.robustness_variable as u64 * inner.query_interval as u64,
        ) + timer::units_to_duration(inner.max_response_time);
        let due = Instant::now() + window;
        let key = TimerKey::Compatibility {
            link: self.id,
            version,
        };
        let compatibility_timer = match version {
            CompatibilityMode::V1 => &mut inner.v1_timer,
            CompatibilityMode::V2 => &mut inner.v2_timer,
            CompatibilityMode::V3 => return,
        };

        // Requeueing always pushes the window out; it never pulls it in. A
        // cancel that comes too late means the expiry worker is already on
        // its way to recompute the mode, so leave the timer alone.
        let rearm = match compatibility_timer.due_time() {
            Some(_) => compatibility_timer.cancel() != CancelOutcome::AlreadyFired,
            None => true,
        };
        if rearm {
            compatibility_timer.arm(&self.runtime, &self.events, key, due);
        }

        self.update_compatibility_mode(inner);
    }

    /// Recompute the compatibility mode from the legacy-version timers. On a
    /// transition, every pending send formatted for the old mode is
    /// cancelled.
    pub fn update_compatibility_mode(&self, inner: &mut LinkInner) {
        let new_mode = if inner.v1_timer.due_time().is_some() {
            CompatibilityMode::V1
        } else if inner.v2_timer.due_time().is_some() {
            CompatibilityMode::V2
        } else {
            CompatibilityMode::V3
        };

        if new_mode != inner.compatibility_mode {
            inner.report_timer.cancel();
            for group in inner.groups.iter_mut() {
                group.timer.cancel();
            }

            info!(
                "{}: IGMP compatibility mode {:?} -> {:?}",
                self.id, inner.compatibility_mode, new_mode
            );
            inner.compatibility_mode = new_mode;
        }
    }

    /// Schedule a delayed report between zero and `max_units` tenths of a
    /// second out. An already-armed earlier schedule stands; a cancel that
    /// loses to the firing timer leaves the imminent send in place.
    pub fn queue_report_timer(
        &self,
        report_timer: &mut DeferredTimer,
        key: TimerKey,
        max_units: u32,
    ) {
        let delay = self.delay.response_delay(max_units);
        let due = Instant::now() + timer::units_to_duration(delay);
        if let Some(current) = report_timer.due_time() {
            if current <= due {
                return;
            }

            if report_timer.cancel() == CancelOutcome::AlreadyFired {
                return;
            }
        }

        report_timer.arm(&self.runtime, &self.events, key, due);
    }

    /// Tear down the link-wide timers as part of retirement.
    pub fn cancel_link_timers(&self, inner: &mut LinkInner) {
        inner.report_timer.cancel();
        inner.v1_timer.cancel();
        inner.v2_timer.cancel();
    }
}
