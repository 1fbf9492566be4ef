// SPDX-License-Identifier: Apache-2.0 OR MIT
//! End-to-end tests for the IGMP host engine over a capturing mock link,
//! with paused tokio time and a deterministic response-delay source that
//! always picks the maximum allowed delay.

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use igmp_host::{
    wire, IgmpConfig, IgmpHost, LinkId, LocalAddress, NetworkLink, ReceiveContext, ReportDelay,
};

const LINK: LinkId = LinkId(1);
const ROUTER: &str = "192.168.1.1";

/// A link that records every frame instead of transmitting it.
struct CaptureLink {
    mtu: usize,
    up: AtomicBool,
    frames: Mutex<Vec<(Ipv4Addr, Vec<u8>)>>,
}

impl CaptureLink {
    fn new() -> Arc<Self> {
        Self::with_mtu(1500)
    }

    fn with_mtu(mtu: usize) -> Arc<Self> {
        Arc::new(Self {
            mtu,
            up: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
        })
    }

    fn captured(&self) -> Vec<(Ipv4Addr, Vec<u8>)> {
        self.frames.lock().unwrap().clone()
    }

    fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl NetworkLink for CaptureLink {
    fn id(&self) -> LinkId {
        LINK
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    fn send(&self, destination: Ipv4Addr, frame: Vec<u8>) -> io::Result<()> {
        self.frames.lock().unwrap().push((destination, frame));
        Ok(())
    }
}

/// Always waits the full maximum, making every schedule deterministic.
struct MaxDelay;

impl ReportDelay for MaxDelay {
    fn response_delay(&self, max_units: u32) -> u32 {
        max_units.max(1)
    }
}

fn test_host() -> IgmpHost {
    IgmpHost::with_delay(IgmpConfig::default(), Arc::new(MaxDelay))
}

fn local() -> LocalAddress {
    LocalAddress::new(
        "192.168.1.10".parse().unwrap(),
        "255.255.255.0".parse().unwrap(),
    )
}

fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

/// Fill in the checksum of a hand-built IGMP payload.
fn finish(mut payload: Vec<u8>) -> Vec<u8> {
    let value = wire::checksum(&payload);
    payload[2..4].copy_from_slice(&value.to_be_bytes());
    payload
}

fn v1_general_query() -> Vec<u8> {
    finish(vec![wire::MESSAGE_TYPE_QUERY, 0, 0, 0, 0, 0, 0, 0])
}

fn v2_query(group: Ipv4Addr, code: u8) -> Vec<u8> {
    let mut payload = vec![wire::MESSAGE_TYPE_QUERY, code, 0, 0];
    payload.extend_from_slice(&group.octets());
    finish(payload)
}

fn v3_query(group: Ipv4Addr, code: u8, robustness: u8, interval_code: u8) -> Vec<u8> {
    let mut payload = vec![wire::MESSAGE_TYPE_QUERY, code, 0, 0];
    payload.extend_from_slice(&group.octets());
    payload.push(robustness & wire::QUERY_FLAG_ROBUSTNESS_MASK);
    payload.push(interval_code);
    payload.extend_from_slice(&[0, 0]);
    finish(payload)
}

fn v2_report(group: Ipv4Addr) -> Vec<u8> {
    let mut payload = vec![wire::MESSAGE_TYPE_REPORT_V2, 0, 0, 0];
    payload.extend_from_slice(&group.octets());
    finish(payload)
}

fn from_router(destination: Ipv4Addr) -> ReceiveContext {
    ReceiveContext {
        source: addr(ROUTER),
        destination,
        router_alert: true,
    }
}

/// The IGMP payload inside a captured frame.
fn payload(frame: &[u8]) -> &[u8] {
    &frame[wire::IP4_HEADER_SIZE..]
}

async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[tokio::test(start_paused = true)]
async fn test_fresh_join_reports_then_retries_then_silence() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("224.1.1.1");
    host.join_group(link.clone(), local(), group).unwrap();

    // The first state-change report goes out synchronously.
    let frames = link.captured();
    assert_eq!(frames.len(), 1);
    let (destination, frame) = &frames[0];
    assert_eq!(*destination, wire::ALL_ROUTERS_ADDRESS_V3);
    let report = payload(frame);
    assert_eq!(report[0], wire::MESSAGE_TYPE_REPORT_V3);
    assert_eq!(report[8], wire::GROUP_RECORD_CHANGE_TO_EXCLUDE);
    assert_eq!(&report[12..16], &group.octets());
    assert_eq!(wire::checksum(report), 0);
    assert_eq!(wire::checksum(&frame[..wire::IP4_HEADER_SIZE]), 0);

    // Robustness 2: exactly one retransmission about a second later.
    advance(Duration::from_millis(1100)).await;
    assert_eq!(link.frame_count(), 2);
    let frames = link.captured();
    assert_eq!(payload(&frames[1].1)[8], wire::GROUP_RECORD_CHANGE_TO_EXCLUDE);

    // And then nothing more.
    advance(Duration::from_secs(30)).await;
    assert_eq!(link.frame_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_join_produces_no_traffic() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.1.1.1");
    host.join_group(link.clone(), local(), group).unwrap();
    advance(Duration::from_secs(5)).await;
    let after_first_join = link.frame_count();

    host.join_group(link.clone(), local(), group).unwrap();
    advance(Duration::from_secs(5)).await;
    assert_eq!(link.frame_count(), after_first_join);
    assert_eq!(host.group_count(LINK), 1);
}

#[tokio::test(start_paused = true)]
async fn test_double_join_single_leave_keeps_membership() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.1.1.1");
    host.join_group(link.clone(), local(), group).unwrap();
    host.join_group(link.clone(), local(), group).unwrap();
    advance(Duration::from_secs(5)).await;
    let baseline = link.frame_count();

    // One leave of two: membership stays, no traffic.
    host.leave_group(LINK, group).unwrap();
    advance(Duration::from_secs(5)).await;
    assert_eq!(link.frame_count(), baseline);
    assert_eq!(host.group_count(LINK), 1);

    // Final leave: change-to-include records, robustness-many times, then
    // the whole link drains away.
    host.leave_group(LINK, group).unwrap();
    assert_eq!(link.frame_count(), baseline + 1);
    let frames = link.captured();
    let leave = payload(&frames[baseline].1);
    assert_eq!(leave[0], wire::MESSAGE_TYPE_REPORT_V3);
    assert_eq!(leave[8], wire::GROUP_RECORD_CHANGE_TO_INCLUDE);
    assert_eq!(frames[baseline].0, wire::ALL_ROUTERS_ADDRESS_V3);

    advance(Duration::from_millis(1100)).await;
    assert_eq!(link.frame_count(), baseline + 2);
    advance(Duration::from_secs(30)).await;
    assert_eq!(link.frame_count(), baseline + 2);
    assert_eq!(host.group_count(LINK), 0);
    assert!(!host.has_link(LINK));
}

#[tokio::test(start_paused = true)]
async fn test_n_joins_require_n_leaves() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.4.4.4");
    for _ in 0..4 {
        host.join_group(link.clone(), local(), group).unwrap();
    }

    for _ in 0..3 {
        host.leave_group(LINK, group).unwrap();
        assert_eq!(host.group_count(LINK), 1);
    }

    host.leave_group(LINK, group).unwrap();
    advance(Duration::from_secs(30)).await;
    assert_eq!(host.group_count(LINK), 0);
    assert!(!host.has_link(LINK));
}

#[tokio::test(start_paused = true)]
async fn test_v1_query_forces_compatibility_then_expires() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.1.1.1");
    host.join_group(link.clone(), local(), group).unwrap();
    advance(Duration::from_secs(5)).await;
    let baseline = link.frame_count();

    host.receive(
        LINK,
        &from_router(wire::ALL_SYSTEMS_ADDRESS),
        &v1_general_query(),
    );
    assert_eq!(
        host.compatibility_mode(LINK),
        Some(igmp_host::CompatibilityMode::V1)
    );

    // The general query schedules a response; a v1 query advertises 10
    // seconds (code 100), and the response comes framed for IGMPv1.
    advance(Duration::from_secs(11)).await;
    assert_eq!(link.frame_count(), baseline + 1);
    let frames = link.captured();
    let (destination, frame) = &frames[baseline];
    assert_eq!(*destination, group);
    assert_eq!(payload(frame)[0], wire::MESSAGE_TYPE_REPORT_V1);
    assert_eq!(&payload(frame)[4..8], &group.octets());

    // The compatibility window is robustness * query interval + max
    // response time = 2 * 125s + 10s. Once it elapses with no further
    // legacy queries the link speaks IGMPv3 again.
    advance(Duration::from_secs(300)).await;
    assert_eq!(
        host.compatibility_mode(LINK),
        Some(igmp_host::CompatibilityMode::V3)
    );
    host.join_group(link.clone(), local(), addr("239.8.8.8")).unwrap();
    let frames = link.captured();
    assert_eq!(payload(&frames.last().unwrap().1)[0], wire::MESSAGE_TYPE_REPORT_V3);
}

#[tokio::test(start_paused = true)]
async fn test_no_leave_message_in_v1_mode() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.1.1.1");
    host.join_group(link.clone(), local(), group).unwrap();
    advance(Duration::from_secs(5)).await;

    host.receive(
        LINK,
        &from_router(wire::ALL_SYSTEMS_ADDRESS),
        &v1_general_query(),
    );
    advance(Duration::from_secs(11)).await;
    let baseline = link.frame_count();

    // IGMPv1 has no leave message; the membership just evaporates.
    host.leave_group(LINK, group).unwrap();
    advance(Duration::from_secs(30)).await;
    assert_eq!(link.frame_count(), baseline);
    assert!(!host.has_link(LINK));
}

#[tokio::test(start_paused = true)]
async fn test_v2_mode_report_and_leave_formats() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.2.2.2");
    host.join_group(link.clone(), local(), group).unwrap();
    advance(Duration::from_secs(5)).await;
    let baseline = link.frame_count();

    // A v2 group-specific query: 5s max response, drives mode to V2.
    host.receive(LINK, &from_router(group), &v2_query(group, 50));
    assert_eq!(
        host.compatibility_mode(LINK),
        Some(igmp_host::CompatibilityMode::V2)
    );

    advance(Duration::from_secs(6)).await;
    assert_eq!(link.frame_count(), baseline + 1);
    let frames = link.captured();
    let (destination, frame) = &frames[baseline];
    assert_eq!(*destination, group);
    assert_eq!(payload(frame)[0], wire::MESSAGE_TYPE_REPORT_V2);

    // A v2 leave goes to the all-routers group.
    host.leave_group(LINK, group).unwrap();
    let frames = link.captured();
    let (destination, frame) = &frames[baseline + 1];
    assert_eq!(*destination, wire::ALL_ROUTERS_ADDRESS);
    assert_eq!(payload(frame)[0], wire::MESSAGE_TYPE_LEAVE_V2);
    assert_eq!(&payload(frame)[4..8], &group.octets());
}

#[tokio::test(start_paused = true)]
async fn test_v3_general_query_answers_with_link_report() {
    let host = test_host();
    let link = CaptureLink::new();
    host.join_group(link.clone(), local(), addr("239.0.0.1")).unwrap();
    host.join_group(link.clone(), local(), addr("239.0.0.2")).unwrap();
    advance(Duration::from_secs(5)).await;
    let baseline = link.frame_count();

    // General query, 5 second max response.
    host.receive(
        LINK,
        &from_router(wire::ALL_SYSTEMS_ADDRESS),
        &v3_query(addr("0.0.0.0"), 50, 0, 0),
    );
    advance(Duration::from_secs(6)).await;

    // One packet reporting both memberships as current state.
    assert_eq!(link.frame_count(), baseline + 1);
    let frames = link.captured();
    let (destination, frame) = &frames[baseline];
    assert_eq!(*destination, wire::ALL_ROUTERS_ADDRESS_V3);
    let report = payload(frame);
    assert_eq!(report[0], wire::MESSAGE_TYPE_REPORT_V3);
    assert_eq!(&report[6..8], &[0, 2]);
    assert_eq!(report[8], wire::GROUP_RECORD_MODE_IS_EXCLUDE);
    assert_eq!(report[16], wire::GROUP_RECORD_MODE_IS_EXCLUDE);
    assert_eq!(wire::checksum(report), 0);
}

#[tokio::test(start_paused = true)]
async fn test_link_report_splits_at_max_packet_size() {
    let host = test_host();
    // Room for the IPv4 header, the report header, and two group records.
    let link = CaptureLink::with_mtu(wire::IP4_HEADER_SIZE + wire::REPORT_V3_HEADER_SIZE + 2 * wire::GROUP_RECORD_SIZE);
    for last in 1..=3u8 {
        let group = Ipv4Addr::new(239, 0, 0, last);
        host.join_group(link.clone(), local(), group).unwrap();
    }

    advance(Duration::from_secs(5)).await;
    let baseline = link.frame_count();

    host.receive(
        LINK,
        &from_router(wire::ALL_SYSTEMS_ADDRESS),
        &v3_query(addr("0.0.0.0"), 10, 0, 0),
    );
    advance(Duration::from_secs(2)).await;

    let frames = link.captured();
    assert_eq!(frames.len(), baseline + 2);
    assert_eq!(&payload(&frames[baseline].1)[6..8], &[0, 2]);
    assert_eq!(&payload(&frames[baseline + 1].1)[6..8], &[0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_another_hosts_report_suppresses_ours() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.3.3.3");
    host.join_group(link.clone(), local(), group).unwrap();
    advance(Duration::from_secs(5)).await;
    let baseline = link.frame_count();

    // A group-specific query schedules our response...
    host.receive(LINK, &from_router(group), &v3_query(group, 100, 0, 0));

    // ...but another host on the subnet answers first.
    let reporter = ReceiveContext {
        source: addr("192.168.1.77"),
        destination: group,
        router_alert: true,
    };
    host.receive(LINK, &reporter, &v2_report(group));

    advance(Duration::from_secs(30)).await;
    assert_eq!(link.frame_count(), baseline);

    // That host also took over the leave obligation.
    host.leave_group(LINK, group).unwrap();
    advance(Duration::from_secs(30)).await;
    assert_eq!(link.frame_count(), baseline);
    assert!(!host.has_link(LINK));
}

#[tokio::test(start_paused = true)]
async fn test_off_subnet_report_is_ignored() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.3.3.3");
    host.join_group(link.clone(), local(), group).unwrap();
    advance(Duration::from_secs(5)).await;
    let baseline = link.frame_count();

    host.receive(LINK, &from_router(group), &v3_query(group, 100, 0, 0));
    let spoofed = ReceiveContext {
        source: addr("10.9.9.9"),
        destination: group,
        router_alert: true,
    };
    host.receive(LINK, &spoofed, &v2_report(group));

    // The response still goes out; the spoofed report changed nothing.
    advance(Duration::from_secs(11)).await;
    assert_eq!(link.frame_count(), baseline + 1);
}

#[tokio::test(start_paused = true)]
async fn test_query_policy_filters() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.5.5.5");
    host.join_group(link.clone(), local(), group).unwrap();
    advance(Duration::from_secs(5)).await;
    let baseline = link.frame_count();

    // A general query must arrive on the all-systems address.
    host.receive(LINK, &from_router(addr("192.168.1.10")), &v3_query(addr("0.0.0.0"), 10, 0, 0));

    // Queries for the all-systems group are never answered.
    host.receive(
        LINK,
        &from_router(wire::ALL_SYSTEMS_ADDRESS),
        &v3_query(wire::ALL_SYSTEMS_ADDRESS, 10, 0, 0),
    );

    // A v3 query without the router alert option is spoofing.
    let no_alert = ReceiveContext {
        source: addr(ROUTER),
        destination: wire::ALL_SYSTEMS_ADDRESS,
        router_alert: false,
    };
    host.receive(LINK, &no_alert, &v3_query(addr("0.0.0.0"), 10, 0, 0));

    // A corrupted packet is dropped outright.
    let mut corrupt = v3_query(addr("0.0.0.0"), 10, 0, 0);
    corrupt[1] ^= 0xFF;
    host.receive(LINK, &from_router(wire::ALL_SYSTEMS_ADDRESS), &corrupt);

    advance(Duration::from_secs(30)).await;
    assert_eq!(link.frame_count(), baseline);
}

#[tokio::test(start_paused = true)]
async fn test_v3_query_updates_router_parameters() {
    let host = test_host();
    let link = CaptureLink::new();
    host.join_group(link.clone(), local(), addr("239.0.0.1")).unwrap();
    advance(Duration::from_secs(5)).await;

    // Robustness 3 from the querier; zero interval code means no change.
    host.receive(
        LINK,
        &from_router(wire::ALL_SYSTEMS_ADDRESS),
        &v3_query(addr("0.0.0.0"), 10, 3, 0),
    );
    advance(Duration::from_secs(5)).await;
    let baseline = link.frame_count();

    // A later first join transmits three times under the new robustness.
    host.join_group(link.clone(), local(), addr("239.0.0.2")).unwrap();
    advance(Duration::from_secs(10)).await;
    assert_eq!(link.frame_count(), baseline + 3);
}

#[tokio::test(start_paused = true)]
async fn test_query_resets_state_change_to_current_state() {
    let host = test_host();
    let link = CaptureLink::new();
    let group = addr("239.6.6.6");
    host.join_group(link.clone(), local(), group).unwrap();
    // Only the first state-change send has happened; the retry is pending.
    assert_eq!(link.frame_count(), 1);

    // The query's response replaces the pending change record with a
    // current-state record.
    host.receive(LINK, &from_router(group), &v3_query(group, 5, 0, 0));
    advance(Duration::from_secs(2)).await;

    let frames = link.captured();
    assert!(frames.len() >= 2);
    assert_eq!(payload(&frames[1].1)[8], wire::GROUP_RECORD_MODE_IS_EXCLUDE);
}
