// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Deferred protocol timers.
//!
//! Every delay in the engine runs through a [`DeferredTimer`]: a cancellable
//! two-stage dispatch where a spawned sleep task fires first (cheap, no
//! protocol state touched) and posts a [`TimerEvent`] onto the host's event
//! channel, and the dispatcher task then runs the actual protocol work under
//! the owning link's lock. The split exists because the expiry-side work may
//! allocate and contend for locks, which the sleep stage must never do.
//!
//! Cancellation is best effort. A cancel that loses the race against the
//! sleep stage reports [`CancelOutcome::AlreadyFired`] and leaves the queued
//! event to run. Callers that must guarantee a quiet baseline (leave
//! processing) use [`DeferredTimer::cancel_and_flush`], which bumps the
//! generation so the dispatcher discards any event already in flight.

use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::link::LinkId;
use crate::membership::{CompatibilityMode, GroupId};

/// Identifies the protocol work to run when a timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKey {
    /// A group's delayed report or leave retransmission is due.
    GroupTimeout { link: LinkId, group: GroupId },
    /// The link-wide IGMPv3 general query response is due.
    LinkReport { link: LinkId },
    /// A compatibility window for a legacy querier version has elapsed.
    Compatibility {
        link: LinkId,
        version: CompatibilityMode,
    },
}

/// Posted onto the host event channel when a timer's sleep stage completes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerEvent {
    pub key: TimerKey,
    pub generation: u64,
}

pub(crate) type TimerEventSender = mpsc::UnboundedSender<TimerEvent>;
pub(crate) type TimerEventReceiver = mpsc::UnboundedReceiver<TimerEvent>;

/// Outcome of a cancel attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// The sleep stage was still pending and has been stopped.
    Cancelled,
    /// The sleep stage already completed; its event is (or was) in flight.
    AlreadyFired,
    /// No timer was armed.
    NotArmed,
}

/// A single cancellable deferred timer, owned by the state it times.
///
/// The generation counter ties each armed schedule to the events it emits:
/// the dispatcher only acts on an event whose generation matches the timer's
/// current one, so re-arming or flushing invalidates stale expirations.
#[derive(Debug, Default)]
pub(crate) struct DeferredTimer {
    generation: u64,
    due: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl DeferredTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer for the given due time, replacing any earlier schedule.
    pub fn arm(
        &mut self,
        runtime: &Handle,
        events: &TimerEventSender,
        key: TimerKey,
        due: Instant,
    ) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        self.generation = self.generation.wrapping_add(1);
        self.due = Some(due);
        let generation = self.generation;
        let events = events.clone();
        self.task = Some(runtime.spawn(async move {
            tokio::time::sleep_until(due).await;
            let _ = events.send(TimerEvent { key, generation });
        }));
    }

    /// The due time of a pending schedule, or `None` if the timer is idle or
    /// its sleep stage has already completed.
    pub fn due_time(&self) -> Option<Instant> {
        match &self.task {
            Some(task) if !task.is_finished() => self.due,
            _ => None,
        }
    }

    /// Generation of the most recent schedule.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Best-effort cancel. An `AlreadyFired` outcome leaves the in-flight
    /// event valid; the caller decides whether that is tolerable.
    pub fn cancel(&mut self) -> CancelOutcome {
        let Some(task) = self.task.take() else {
            return CancelOutcome::NotArmed;
        };

        self.due = None;
        if task.is_finished() {
            return CancelOutcome::AlreadyFired;
        }

        task.abort();
        self.generation = self.generation.wrapping_add(1);
        CancelOutcome::Cancelled
    }

    /// Cancel and invalidate any event already posted by this timer. After
    /// this returns, no previously armed schedule can reach the dispatcher.
    pub fn cancel_and_flush(&mut self) -> CancelOutcome {
        let outcome = self.cancel();
        if outcome == CancelOutcome::AlreadyFired {
            self.generation = self.generation.wrapping_add(1);
        }

        outcome
    }
}

/// Source of the random delay applied before answering a query, drawn from
/// `(0, max]` query time units (tenths of a second).
///
/// Pluggable so tests can pin the delay; production uses [`RandomDelay`].
pub trait ReportDelay: Send + Sync {
    fn response_delay(&self, max_units: u32) -> u32;
}

/// Uniformly random delay in `(0, max]`.
#[derive(Debug, Default)]
pub struct RandomDelay;

impl ReportDelay for RandomDelay {
    fn response_delay(&self, max_units: u32) -> u32 {
        rand::thread_rng().gen_range(1..=max_units.max(1))
    }
}

/// Convert a delay in query time units (tenths of a second) to a duration.
pub(crate) fn units_to_duration(units: u32) -> Duration {
    Duration::from_millis(units as u64 * 100)
}
