// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Outbound report and leave construction.
//!
//! Senders snapshot the compatibility mode and group state under the link
//! lock, build and transmit with the lock released, then take the lock again
//! to account for the send and schedule any retransmission.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::warn;

use crate::membership::{CompatibilityMode, GroupId, GroupPhase, LinkState};
use crate::timer::TimerKey;
use crate::wire::{self, GroupRecord, MessageBuilder, PacketBuilder, ReportV3Builder};

/// Wrap the payload in IPv4 and hand it to the link layer. Send failures are
/// logged and swallowed; protocol state is never unwound for them.
fn transmit(link: &LinkState, destination: Ipv4Addr, payload: Vec<u8>) {
    let frame = wire::wrap_ipv4(link.local().address, destination, &payload);
    if let Err(error) = link.network().send(destination, frame) {
        warn!("{}: IGMP send to {destination} failed: {error}", link.id());
    }
}

/// Send one membership report for a group, in the wire format of the link's
/// current compatibility mode, then schedule the next retransmission if the
/// send budget has not drained.
pub(crate) fn send_group_report(link: &Arc<LinkState>, group_id: GroupId) {
    let (mode, address, state_change) = {
        let inner = link.lock();
        let Some(group) = inner.group_by_id(group_id).or_else(|| inner.parting_by_id(group_id))
        else {
            return;
        };

        (
            inner.compatibility_mode,
            group.address,
            group.is_state_change(),
        )
    };

    debug_assert!(wire::is_reportable_address(address));
    let (destination, payload) = match mode {
        CompatibilityMode::V3 => {
            let record_type = if state_change {
                wire::GROUP_RECORD_CHANGE_TO_EXCLUDE
            } else {
                wire::GROUP_RECORD_MODE_IS_EXCLUDE
            };
            let report = ReportV3Builder::new(vec![GroupRecord::new(record_type, address)]);
            (wire::ALL_ROUTERS_ADDRESS_V3, report.build())
        }
        CompatibilityMode::V2 => (
            address,
            MessageBuilder::new(wire::MESSAGE_TYPE_REPORT_V2, address).build(),
        ),
        CompatibilityMode::V1 => (
            address,
            MessageBuilder::new(wire::MESSAGE_TYPE_REPORT_V1, address).build(),
        ),
    };

    transmit(link, destination, payload);

    // This host now holds the reporting responsibility for the group. The
    // send budget only moves while the group is still an active member; a
    // leave that slipped in while the lock was dropped owns it now.
    let mut inner = link.lock();
    let link_id = link.id();
    let interval = link.unsolicited_report_interval();
    let inner = &mut *inner;
    if let Some(group) = inner.group_by_id_mut(group_id) {
        group.last_reporter = true;
        debug_assert!(group.send_count > 0);
        group.send_count = group.send_count.saturating_sub(1);
        if group.send_count > 0 {
            let key = TimerKey::GroupTimeout {
                link: link_id,
                group: group_id,
            };
            link.queue_report_timer(&mut group.timer, key, interval);
        }
    } else if let Some(group) = inner.parting_by_id_mut(group_id) {
        group.last_reporter = true;
    }
}

/// Send one leave message for a departing group. Returns `true` once the
/// record has fully drained and been dropped, so the caller can retire the
/// link if nothing else holds it.
pub(crate) fn send_group_leave(link: &Arc<LinkState>, group_id: GroupId) -> bool {
    let (mode, address, last_reporter) = {
        let inner = link.lock();
        let Some(group) = inner.parting_by_id(group_id) else {
            return false;
        };

        (inner.compatibility_mode, group.address, group.last_reporter)
    };

    // Another host reported this group more recently, so the leave is its
    // problem. IGMPv1 has no leave message at all. Either way the record is
    // done.
    if !last_reporter || mode == CompatibilityMode::V1 {
        let mut inner = link.lock();
        inner.remove_parting(group_id);
        return true;
    }

    let (destination, payload) = match mode {
        CompatibilityMode::V3 => {
            let report = ReportV3Builder::new(vec![GroupRecord::new(
                wire::GROUP_RECORD_CHANGE_TO_INCLUDE,
                address,
            )]);
            (wire::ALL_ROUTERS_ADDRESS_V3, report.build())
        }
        CompatibilityMode::V2 => (
            wire::ALL_ROUTERS_ADDRESS,
            MessageBuilder::new(wire::MESSAGE_TYPE_LEAVE_V2, address).build(),
        ),
        CompatibilityMode::V1 => unreachable!("IGMPv1 sends no leave messages"),
    };

    transmit(link, destination, payload);

    // Mark that a leave went out, authorizing the timeout worker to send the
    // rest; an expiry arriving before this point would have been acting on a
    // stale join schedule.
    let mut inner = link.lock();
    let link_id = link.id();
    let interval = link.unsolicited_report_interval();
    let inner = &mut *inner;
    let Some(group) = inner.parting_by_id_mut(group_id) else {
        return false;
    };

    group.phase = GroupPhase::Leaving { leave_sent: true };
    debug_assert!(group.send_count > 0);
    group.send_count = group.send_count.saturating_sub(1);
    if group.send_count > 0 {
        let key = TimerKey::GroupTimeout {
            link: link_id,
            group: group_id,
        };
        link.queue_report_timer(&mut group.timer, key, interval);
        return false;
    }

    inner.remove_parting(group_id);
    true
}

/// Send the IGMPv3 response to a general query: current-state records for
/// every active membership, split across as many packets as the link's
/// maximum packet size and the per-report record cap require.
pub(crate) fn send_link_report(link: &Arc<LinkState>) {
    let mut packets = Vec::new();
    {
        let inner = link.lock();
        let record_capacity = link
            .max_packet_size()
            .saturating_sub(wire::REPORT_V3_HEADER_SIZE)
            / wire::GROUP_RECORD_SIZE;
        if record_capacity == 0 {
            warn!(
                "{}: max packet size {} cannot fit a group record",
                link.id(),
                link.max_packet_size()
            );
            return;
        }

        let mut groups = inner.groups.iter();
        let mut remaining = inner.group_count();
        while remaining != 0 {
            let count = remaining
                .min(wire::MAX_GROUP_RECORD_COUNT)
                .min(record_capacity);
            remaining -= count;
            let records = groups
                .by_ref()
                .take(count)
                .map(|group| {
                    debug_assert!(wire::is_reportable_address(group.address));
                    GroupRecord::new(wire::GROUP_RECORD_MODE_IS_EXCLUDE, group.address)
                })
                .collect();
            packets.push(ReportV3Builder::new(records).build());
        }
    }

    for payload in packets {
        transmit(link, wire::ALL_ROUTERS_ADDRESS_V3, payload);
    }
}
