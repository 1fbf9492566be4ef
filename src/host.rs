// SPDX-License-Identifier: Apache-2.0 OR MIT
//! The IGMP host engine: link registry, the join/leave API, and the timer
//! event dispatcher.
//!
//! `join_group` and `leave_group` are the only operations exposed to the
//! multicast-membership owner; both run synchronously on the caller's
//! thread. Received packets enter through [`IgmpHost::receive`]. Timer
//! expirations arrive on an unbounded channel and are executed by a
//! dispatcher task spawned at construction, which holds only a weak
//! reference so dropping the last engine handle shuts it down.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock, Weak};

use log::{debug, info};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::builder;
use crate::config::IgmpConfig;
use crate::link::{LinkHandle, LinkId, LocalAddress};
use crate::membership::{CompatibilityMode, GroupPhase, LinkState};
use crate::processor::{self, ReceiveContext};
use crate::timer::{
    RandomDelay, ReportDelay, TimerEvent, TimerEventReceiver, TimerEventSender, TimerKey,
};
use crate::wire;

/// Errors surfaced by the join/leave API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IgmpError {
    /// The address is not a joinable multicast group, or no matching
    /// membership exists on the link to leave.
    #[error("invalid multicast address {0}")]
    InvalidAddress(Ipv4Addr),

    /// An internal resource could not be obtained. Partial state is unwound
    /// before this is returned.
    #[error("insufficient resources")]
    ResourceExhausted,
}

/// The multicast membership engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct IgmpHost {
    inner: Arc<HostInner>,
}

pub(crate) struct HostInner {
    config: IgmpConfig,
    runtime: Handle,
    events: TimerEventSender,
    delay: Arc<dyn ReportDelay>,
    links: RwLock<HashMap<LinkId, Arc<LinkState>>>,
}

impl IgmpHost {
    /// Create an engine with the production random-delay source. Must be
    /// called within a tokio runtime.
    pub fn new(config: IgmpConfig) -> Self {
        Self::with_delay(config, Arc::new(RandomDelay))
    }

    /// Create an engine with an explicit delay source.
    pub fn with_delay(config: IgmpConfig, delay: Arc<dyn ReportDelay>) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let runtime = Handle::current();
        let inner = Arc::new(HostInner {
            config,
            runtime: runtime.clone(),
            events,
            delay,
            links: RwLock::new(HashMap::new()),
        });
        runtime.spawn(dispatch_loop(Arc::downgrade(&inner), receiver));
        Self { inner }
    }

    /// Join a multicast group on a link.
    ///
    /// The first join of a group sends a state-change report immediately and
    /// schedules retransmissions up to the robustness variable; repeat joins
    /// only grow the membership count and produce no traffic. Joining the
    /// all-systems group succeeds without being tracked.
    pub fn join_group(
        &self,
        link: LinkHandle,
        local: LocalAddress,
        group: Ipv4Addr,
    ) -> Result<(), IgmpError> {
        if !group.is_multicast() {
            return Err(IgmpError::InvalidAddress(group));
        }

        if !wire::is_reportable_address(group) {
            return Ok(());
        }

        loop {
            let state = self.inner.create_or_lookup(&link, local);
            let group_id = {
                let mut inner = state.lock();
                // Lost a race against retirement; the registry no longer
                // holds this state, so go create a fresh one.
                if inner.retired {
                    continue;
                }

                if let Some(existing) = inner.find_group_mut(group) {
                    existing.join_count += 1;
                    debug!(
                        "{}: join {} now held {} times",
                        state.id(),
                        group,
                        existing.join_count
                    );
                    return Ok(());
                }

                state.allocate_group(&mut inner, group)
            };

            info!("{}: joined {}", state.id(), group);
            builder::send_group_report(&state, group_id);
            return Ok(());
        }
    }

    /// Leave a multicast group on a link.
    ///
    /// While other local joins remain the call only drops the count. The
    /// last leave unlinks the group and starts the leave sequence: the
    /// group's timer is cancelled and flushed first so a stale join
    /// retransmission cannot touch the new send budget, and leave messages
    /// then go out up to the robustness variable, unless the link is down,
    /// in which case the record is dropped on the spot.
    pub fn leave_group(&self, link_id: LinkId, group: Ipv4Addr) -> Result<(), IgmpError> {
        if !group.is_multicast() {
            return Err(IgmpError::InvalidAddress(group));
        }

        if !wire::is_reportable_address(group) {
            return Ok(());
        }

        let Some(state) = self.inner.lookup(link_id) else {
            return Err(IgmpError::InvalidAddress(group));
        };

        let group_id = {
            let mut inner = state.lock();
            let robustness = inner.robustness_variable;
            let Some(position) = inner.groups.iter().position(|g| g.address == group) else {
                return Err(IgmpError::InvalidAddress(group));
            };

            let member = &mut inner.groups[position];
            member.join_count -= 1;
            if member.join_count > 0 {
                debug!(
                    "{}: leave {} still held {} times",
                    state.id(),
                    group,
                    member.join_count
                );
                return Ok(());
            }

            let mut member = inner.groups.remove(position);
            member.begin_leave(robustness);
            let id = member.id;
            inner.parting.push(member);
            id
        };

        info!("{}: left {}", state.id(), group);
        if state.network().is_up() {
            if builder::send_group_leave(&state, group_id) {
                self.inner.retire_if_idle(&state);
            }
        } else {
            // No traffic is possible; drop the record immediately.
            state.lock().remove_parting(group_id);
            self.inner.retire_if_idle(&state);
        }

        Ok(())
    }

    /// Hand a received IGMP payload to the engine. `context` carries the
    /// IPv4 addressing and whether the router alert option was present.
    pub fn receive(&self, link_id: LinkId, context: &ReceiveContext, payload: &[u8]) {
        let Some(state) = self.inner.lookup(link_id) else {
            debug!("{link_id}: no IGMP state, dropping packet");
            return;
        };

        if payload.len() < wire::HEADER_SIZE {
            debug!("{link_id}: dropping {}-byte runt packet", payload.len());
            return;
        }

        if wire::checksum(payload) != 0 {
            debug!("{link_id}: dropping packet with bad checksum");
            return;
        }

        match payload[0] {
            wire::MESSAGE_TYPE_QUERY => processor::process_query(&state, context, payload),
            wire::MESSAGE_TYPE_REPORT_V1 | wire::MESSAGE_TYPE_REPORT_V2 => {
                processor::process_report(&state, context, payload)
            }
            // Host mode takes no action on v3 reports or on leave messages;
            // both are router input.
            wire::MESSAGE_TYPE_REPORT_V3 | wire::MESSAGE_TYPE_LEAVE_V2 => {}
            other => debug!("{link_id}: dropping unknown IGMP type {other:#04x}"),
        }
    }

    /// Number of active group memberships on a link.
    pub fn group_count(&self, link_id: LinkId) -> usize {
        self.inner
            .lookup(link_id)
            .map(|state| state.lock().group_count())
            .unwrap_or(0)
    }

    /// The link's current compatibility mode, if the link is known.
    pub fn compatibility_mode(&self, link_id: LinkId) -> Option<CompatibilityMode> {
        self.inner
            .lookup(link_id)
            .map(|state| state.lock().compatibility_mode)
    }

    /// Whether any membership state exists for the link.
    pub fn has_link(&self, link_id: LinkId) -> bool {
        self.inner.lookup(link_id).is_some()
    }
}

impl HostInner {
    fn lookup(&self, link_id: LinkId) -> Option<Arc<LinkState>> {
        self.links
            .read()
            .expect("IGMP link registry lock poisoned")
            .get(&link_id)
            .cloned()
    }

    /// Shared-mode lookup first; on a miss, build a fully initialized
    /// candidate outside every lock, then re-check under the exclusive lock
    /// and either insert it or discard it in favor of the race winner.
    fn create_or_lookup(&self, link: &LinkHandle, local: LocalAddress) -> Arc<LinkState> {
        let link_id = link.id();
        if let Some(state) = self.lookup(link_id) {
            return state;
        }

        let candidate = Arc::new(LinkState::new(
            link.clone(),
            local,
            &self.config,
            self.runtime.clone(),
            self.events.clone(),
            self.delay.clone(),
        ));
        let mut links = self.links.write().expect("IGMP link registry lock poisoned");
        match links.entry(link_id) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                info!("{link_id}: tracking multicast membership");
                slot.insert(candidate.clone());
                candidate
            }
        }
    }

    /// Remove a link whose membership has fully drained. The check and the
    /// removal share one exclusive critical section so a lookup never sees a
    /// half-removed entry; late joiners observe the `retired` flag under the
    /// link lock and retry.
    fn retire_if_idle(&self, state: &Arc<LinkState>) {
        let mut links = self.links.write().expect("IGMP link registry lock poisoned");
        let mut inner = state.lock();
        if inner.retired || !inner.is_idle() {
            return;
        }

        inner.retired = true;
        state.cancel_link_timers(&mut inner);
        links.remove(&state.id());
        info!("{}: membership drained, untracking", state.id());
    }

    fn handle_timer_event(self: &Arc<Self>, event: TimerEvent) {
        match event.key {
            TimerKey::GroupTimeout { link, group } => {
                let Some(state) = self.lookup(link) else {
                    return;
                };

                enum Pending {
                    Report,
                    Leave,
                }

                let pending = {
                    let inner = state.lock();
                    if let Some(member) = inner.group_by_id(group) {
                        if member.timer.generation() != event.generation {
                            return;
                        }

                        Pending::Report
                    } else if let Some(parting) = inner.parting_by_id(group) {
                        if parting.timer.generation() != event.generation {
                            return;
                        }

                        // The leave request sends the first message itself;
                        // only after that may a timer drive the rest.
                        debug_assert!(matches!(
                            parting.phase,
                            GroupPhase::Leaving { leave_sent: true }
                        ));
                        Pending::Leave
                    } else {
                        return;
                    }
                };

                match pending {
                    Pending::Report => builder::send_group_report(&state, group),
                    Pending::Leave => {
                        if builder::send_group_leave(&state, group) {
                            self.retire_if_idle(&state);
                        }
                    }
                }
            }
            TimerKey::LinkReport { link } => {
                let Some(state) = self.lookup(link) else {
                    return;
                };

                {
                    let inner = state.lock();
                    if inner.report_timer.generation() != event.generation {
                        return;
                    }
                }

                builder::send_link_report(&state);
            }
            TimerKey::Compatibility { link, .. } => {
                // Recomputing the mode from the timer states is idempotent,
                // so a superseded expiration may still run it.
                let Some(state) = self.lookup(link) else {
                    return;
                };

                let mut inner = state.lock();
                state.update_compatibility_mode(&mut inner);
            }
        }
    }
}

/// Drain timer expirations into protocol work until the engine goes away.
async fn dispatch_loop(host: Weak<HostInner>, mut events: TimerEventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(host) = host.upgrade() else {
            break;
        };

        host.handle_timer_event(event);
    }
}
