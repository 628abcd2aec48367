//! Lifecycle state shared by experiment runs and steps.
//!
//! # State Machine
//!
//! ```text
//! ┌───────┐  begin()  ┌─────────┐  request_stop()  ┌──────────┐
//! │ Ready │──────────▶│ Running │─────────────────▶│ Stopping │
//! └───────┘           └────┬────┘                  └────┬─────┘
//!   │   │                  │ complete(outcome)          │ complete(outcome)
//!   │   │ complete(..)     ▼                            │
//!   │   └────────────▶┌──────────┐◀─────────────────────┘
//!   │                 │ Complete │  (terminal, outcome set once)
//!   │                 └──────────┘
//!   └── stop_if_ready() ──▶ Stopping  (never started; nothing is executing)
//! ```
//!
//! `begin`, `stop_if_ready` and `complete_if_ready` only apply from `Ready`,
//! so exactly one of them wins when they race.

use bench_core::{BenchError, BenchResult, SubscriberSet, SubscriptionId};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Lifecycle state of a run or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Built, not started
    Ready,
    /// Executing
    Running,
    /// Abort requested, still executing
    Stopping,
    /// Finished; outcome is set
    Complete,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Ready => write!(f, "ready"),
            State::Running => write!(f, "running"),
            State::Stopping => write!(f, "stopping"),
            State::Complete => write!(f, "complete"),
        }
    }
}

/// Result of a completed run or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Everything went as planned
    Succeeded,
    /// Completed, but something deserves a look
    SucceededWithWarnings,
    /// Did not achieve its goal
    Failed,
    /// Not executed
    Skipped,
    /// Ended early because of an abort request
    Aborted,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::SucceededWithWarnings => write!(f, "succeeded_with_warnings"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Skipped => write!(f, "skipped"),
            Outcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Point-in-time view of a [`Lifecycle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleSnapshot {
    /// Current state
    pub state: State,
    /// Set once the state is `Complete`
    pub outcome: Option<Outcome>,
    /// When execution began
    pub start_time: Option<DateTime<Utc>>,
    /// When the state became `Complete`
    pub end_time: Option<DateTime<Utc>>,
}

impl LifecycleSnapshot {
    fn ready() -> Self {
        Self {
            state: State::Ready,
            outcome: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// Observable state machine cell.
///
/// Transitions return whether they applied; `Complete` is terminal, so late
/// calls (e.g. a `stop` racing with completion) are ignored rather than
/// rewinding the state.
pub struct Lifecycle {
    owner: String,
    inner: Mutex<LifecycleSnapshot>,
    changed: Condvar,
    subscribers: SubscriberSet<LifecycleSnapshot>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("owner", &self.owner)
            .field("snapshot", &*self.inner.lock())
            .finish()
    }
}

impl Lifecycle {
    /// New lifecycle in `Ready`. `owner` names the run or step in logs.
    pub fn new(owner: impl Into<String>) -> Self {
        let owner = owner.into();
        Self {
            subscribers: SubscriberSet::new(owner.clone()),
            owner,
            inner: Mutex::new(LifecycleSnapshot::ready()),
            changed: Condvar::new(),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.inner.lock().clone()
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Outcome, once complete.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.lock().outcome
    }

    /// `Ready` → `Running`, recording the start time.
    pub fn begin(&self) -> bool {
        self.transition(|s| {
            if s.state != State::Ready {
                return false;
            }
            s.state = State::Running;
            s.start_time = Some(Utc::now());
            true
        })
    }

    /// `Running` → `Stopping`.
    pub fn request_stop(&self) -> bool {
        self.transition(|s| {
            if s.state != State::Running {
                return false;
            }
            s.state = State::Stopping;
            true
        })
    }

    /// `Ready` → `Stopping`, claiming a run that never started so it can no
    /// longer `begin`.
    pub fn stop_if_ready(&self) -> bool {
        self.transition(|s| {
            if s.state != State::Ready {
                return false;
            }
            s.state = State::Stopping;
            true
        })
    }

    /// `Ready` → `Complete` with `outcome`, leaving anything already begun alone.
    pub fn complete_if_ready(&self, outcome: Outcome) -> bool {
        self.transition(|s| {
            if s.state != State::Ready {
                return false;
            }
            s.state = State::Complete;
            s.outcome = Some(outcome);
            s.end_time = Some(Utc::now());
            true
        })
    }

    /// Any non-terminal state → `Complete` with `outcome`.
    pub fn complete(&self, outcome: Outcome) -> bool {
        self.transition(|s| {
            if s.state == State::Complete {
                return false;
            }
            s.state = State::Complete;
            s.outcome = Some(outcome);
            s.end_time = Some(Utc::now());
            true
        })
    }

    /// Register a callback receiving every state change.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LifecycleSnapshot) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Remove a state-change subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Block until `predicate` holds, failing with `Timeout` after `timeout`.
    pub fn wait_for_state<P>(
        &self,
        predicate: P,
        timeout: Option<Duration>,
    ) -> BenchResult<LifecycleSnapshot>
    where
        P: Fn(&LifecycleSnapshot) -> bool,
    {
        // A timeout past the representable range waits without a deadline
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t).map(|d| (t, d)));
        let mut inner = self.inner.lock();
        loop {
            if predicate(&inner) {
                return Ok(inner.clone());
            }
            match deadline {
                None => self.changed.wait(&mut inner),
                Some((timeout, deadline)) => {
                    if self.changed.wait_until(&mut inner, deadline).timed_out() {
                        return if predicate(&inner) {
                            Ok(inner.clone())
                        } else {
                            Err(BenchError::Timeout(timeout))
                        };
                    }
                }
            }
        }
    }

    /// Block until `Complete`.
    pub fn wait_complete(&self, timeout: Option<Duration>) -> BenchResult<LifecycleSnapshot> {
        self.wait_for_state(|s| s.state == State::Complete, timeout)
    }

    fn transition<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut LifecycleSnapshot) -> bool,
    {
        let snapshot = {
            let mut inner = self.inner.lock();
            if !apply(&mut inner) {
                return false;
            }
            self.changed.notify_all();
            inner.clone()
        };
        debug!(owner = %self.owner, state = %snapshot.state, "State changed");
        self.subscribers.notify(&snapshot);
        true
    }
}
