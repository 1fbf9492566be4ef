// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Inbound query and report processing.
//!
//! Malformed or policy-violating packets are dropped and logged; nothing
//! here surfaces an error to a caller. The policy filters (router alert
//! presence, general-query destination, report source subnet) harden the
//! host against forged traffic from outside the local network.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::debug;

use crate::membership::{CompatibilityMode, LinkState};
use crate::timer::TimerKey;
use crate::wire::{self, IgmpMessage, QueryV3};

/// Addressing metadata for a received IGMP payload, supplied by the IPv4
/// layer along with whether the packet carried the router alert option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveContext {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub router_alert: bool,
}

/// Process a membership query.
///
/// Generates a delayed report for each multicast group the link belongs to,
/// or a single link-wide response when an IGMPv3 general query arrives in V3
/// mode. Legacy-framed queries additionally drive the compatibility-mode
/// machine.
pub(crate) fn process_query(link: &Arc<LinkState>, context: &ReceiveContext, payload: &[u8]) {
    let Some(query) = IgmpMessage::parse(payload) else {
        return;
    };

    // Classify the query by length: 8 octets with a zero response code is
    // IGMPv1, 8 octets with a non-zero code is IGMPv2, 12 or more octets is
    // IGMPv3. Anything else is discarded.
    let mut max_response_code = query.max_response_code;
    let version;
    if payload.len() == wire::MESSAGE_SIZE {
        version = if max_response_code == 0 {
            max_response_code = wire::QUERY_V1_MAX_RESPONSE_CODE;
            CompatibilityMode::V1
        } else {
            CompatibilityMode::V2
        };

        let mut inner = link.lock();
        link.queue_compatibility_timer(&mut inner, version);
    } else if payload.len() >= wire::QUERY_V3_SIZE {
        version = CompatibilityMode::V3;
        let Some(query_v3) = QueryV3::parse(payload) else {
            return;
        };

        // Zero values request no change.
        let query_interval = wire::decode_time_code(query_v3.query_interval_code);
        let robustness_variable = query_v3.robustness_variable();
        let mut inner = link.lock();
        if query_interval != 0 {
            inner.query_interval = query_interval;
        }

        if robustness_variable != 0 {
            inner.robustness_variable = robustness_variable;
        }
    } else {
        debug!(
            "{}: dropping {}-byte runt query",
            link.id(),
            payload.len()
        );
        return;
    }

    // Version 2 and 3 queries without the router alert option are spoofing
    // candidates from off-link.
    if version != CompatibilityMode::V1 && !context.router_alert {
        debug!("{}: dropping query without router alert", link.id());
        return;
    }

    // A general query must arrive on the all-systems address.
    if query.group.is_unspecified() && context.destination != wire::ALL_SYSTEMS_ADDRESS {
        debug!(
            "{}: dropping general query addressed to {}",
            link.id(),
            context.destination
        );
        return;
    }

    // The all-systems membership is never reported, so a query for it is
    // meaningless.
    if query.group == wire::ALL_SYSTEMS_ADDRESS {
        debug!("{}: dropping query for the all-systems group", link.id());
        return;
    }

    let max_response_time = wire::decode_time_code(max_response_code);
    let mut inner = link.lock();
    inner.max_response_time = max_response_time;

    // In V3 mode one report can answer a general query for every membership
    // at once; otherwise each matching group schedules its own response.
    if inner.compatibility_mode == CompatibilityMode::V3 && query.group.is_unspecified() {
        let key = TimerKey::LinkReport { link: link.id() };
        let inner = &mut *inner;
        link.queue_report_timer(&mut inner.report_timer, key, max_response_time);
    } else {
        let link_id = link.id();
        let inner = &mut *inner;
        for group in inner.groups.iter_mut() {
            if !query.group.is_unspecified() && query.group != group.address {
                continue;
            }

            group.clear_state_change();
            if group.send_count == 0 {
                group.send_count = 1;
            }

            let key = TimerKey::GroupTimeout {
                link: link_id,
                group: group.id,
            };
            link.queue_report_timer(&mut group.timer, key, max_response_time);
        }
    }
}

/// Process an IGMPv1/v2 membership report.
///
/// A router only needs one report per group per network, so when another
/// host reports a group this link also belongs to, the pending response is
/// cancelled and the leave obligation handed over.
pub(crate) fn process_report(link: &Arc<LinkState>, context: &ReceiveContext, payload: &[u8]) {
    // Only the 8-octet legacy reports matter; IGMPv3 reports are router
    // input and already filtered out.
    if payload.len() != wire::MESSAGE_SIZE {
        return;
    }

    let Some(report) = IgmpMessage::parse(payload) else {
        return;
    };

    // Reports from the unspecified address are accepted; anything else must
    // originate on the local subnet.
    if !context.source.is_unspecified() && !link.local().on_local_subnet(context.source) {
        debug!(
            "{}: ignoring report from off-subnet source {}",
            link.id(),
            context.source
        );
        return;
    }

    if report.msg_type == wire::MESSAGE_TYPE_REPORT_V2 && !context.router_alert {
        debug!("{}: dropping v2 report without router alert", link.id());
        return;
    }

    // A report travels to the group it reports on.
    if context.destination != report.group || report.group.is_unspecified() {
        debug!(
            "{}: dropping report for {} sent to {}",
            link.id(),
            report.group,
            context.destination
        );
        return;
    }

    let mut inner = link.lock();
    if let Some(group) = inner.find_group_mut(report.group) {
        group.timer.cancel();
        group.last_reporter = false;
    }
}
