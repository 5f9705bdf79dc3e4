//! Connection Manager for a room's realtime channel.
//!
//! Pure state machine: methods take channel events and return actions for the
//! session driver to execute (open a socket, close it, arm or cancel the
//! reconnect timer). No I/O and no clocks live here.
//!
//! ```text
//!            connect            on_open
//!   ┌──────┐ ───────> ┌────────────┐ ───────> ┌──────┐
//!   │ Idle │          │ Connecting │          │ Open │
//!   └──────┘ <─┐      └────────────┘          └──────┘
//!      ^       │          ^     │ abnormal close  │ teardown
//!      │       │   timer  │     v                 v
//!      │       │      ┌────────┐            ┌─────────┐
//!      │       └──────│ Closed │            │ Closing │
//!      │   give up    └────────┘            └─────────┘
//!      └─────────────────────────────────────────┘ closed
//! ```

use std::time::Duration;

use tracing::{debug, info, warn};

use super::capabilities::Viewer;

/// Clean shutdown requested by this client.
pub const CLOSE_NORMAL: u16 = 1000;

/// Sent by the backend for a bad token or an unapproved viewer.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed wait between an abnormal close and the next attempt.
    pub delay: Duration,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Treat a 1008 close as a credential rejection and stop retrying.
    pub stop_on_policy_close: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: None,
            stop_on_policy_close: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Teardown requested; waiting for the channel to finish closing.
    Closing,
    /// Closed abnormally; a reconnect timer is pending.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Why the manager stopped reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The server closed with 1008.
    PolicyViolation,
    AttemptsExhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open the channel.
    Open,
    Close { code: u16 },
    ScheduleReconnect { timer: TimerId, delay: Duration },
    CancelReconnect { timer: TimerId },
    GiveUp(GiveUpReason),
}

#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    policy: ReconnectPolicy,
    /// Abnormal closures since the last successful open.
    attempts: u32,
    /// At most one reconnect timer is ever pending.
    pending: Option<TimerId>,
    next_timer: u64,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
            attempts: 0,
            pending: None,
            next_timer: 1,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn pending_timer(&self) -> Option<TimerId> {
        self.pending
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Start connecting. Anonymous viewers never open a channel.
    pub fn connect(&mut self, viewer: Option<&Viewer>) -> Vec<ConnectionAction> {
        if viewer.is_none() {
            debug!("no viewer, channel stays idle");
            return vec![];
        }
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed => {
                let mut actions = self.cancel_pending();
                self.transition(ConnectionState::Connecting);
                actions.push(ConnectionAction::Open);
                actions
            }
            _ => vec![],
        }
    }

    /// Handshake confirmed.
    pub fn on_open(&mut self) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connecting {
            debug!(state = self.state.as_str(), "ignoring open in unexpected state");
            return vec![];
        }
        self.attempts = 0;
        self.transition(ConnectionState::Open);
        vec![]
    }

    /// The channel closed, for any reason.
    pub fn on_closed(&mut self, code: Option<u16>) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::Idle => vec![],
            ConnectionState::Closing => {
                self.transition(ConnectionState::Idle);
                vec![]
            }
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closed => {
                if code == Some(CLOSE_POLICY_VIOLATION) && self.policy.stop_on_policy_close {
                    warn!("channel rejected by server policy, not reconnecting");
                    let mut actions = self.cancel_pending();
                    self.transition(ConnectionState::Idle);
                    actions.push(ConnectionAction::GiveUp(GiveUpReason::PolicyViolation));
                    return actions;
                }
                self.abnormal_close(code)
            }
        }
    }

    fn abnormal_close(&mut self, code: Option<u16>) -> Vec<ConnectionAction> {
        // A repeated close while already waiting (error then close) does not
        // count as another attempt, but it does re-arm the timer.
        if self.state != ConnectionState::Closed {
            self.attempts += 1;
        }
        let mut actions = self.cancel_pending();

        if let Some(max) = self.policy.max_attempts
            && self.attempts >= max
        {
            warn!(attempts = self.attempts, "reconnect attempts exhausted");
            self.transition(ConnectionState::Idle);
            actions.push(ConnectionAction::GiveUp(GiveUpReason::AttemptsExhausted {
                attempts: self.attempts,
            }));
            return actions;
        }

        let timer = TimerId(self.next_timer);
        self.next_timer += 1;
        self.pending = Some(timer);
        self.transition(ConnectionState::Closed);
        info!(
            code = ?code,
            attempt = self.attempts,
            delay_secs = self.policy.delay.as_secs_f64(),
            "channel closed abnormally, reconnect scheduled"
        );
        actions.push(ConnectionAction::ScheduleReconnect {
            timer,
            delay: self.policy.delay,
        });
        actions
    }

    /// A reconnect timer fired. Stale timers are ignored.
    pub fn on_timer(&mut self, timer: TimerId) -> Vec<ConnectionAction> {
        if self.pending != Some(timer) || self.state != ConnectionState::Closed {
            debug!(timer = timer.0, "ignoring stale reconnect timer");
            return vec![];
        }
        self.pending = None;
        self.transition(ConnectionState::Connecting);
        vec![ConnectionAction::Open]
    }

    /// Unmount, logout or room change. Cancels any pending retry and closes
    /// with the clean-shutdown code, which suppresses the reconnect edge.
    pub fn teardown(&mut self) -> Vec<ConnectionAction> {
        let mut actions = self.cancel_pending();
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                self.transition(ConnectionState::Closing);
                actions.push(ConnectionAction::Close { code: CLOSE_NORMAL });
            }
            ConnectionState::Closed => self.transition(ConnectionState::Idle),
            ConnectionState::Idle | ConnectionState::Closing => {}
        }
        actions
    }

    fn cancel_pending(&mut self) -> Vec<ConnectionAction> {
        match self.pending.take() {
            Some(timer) => {
                debug!(timer = timer.0, "reconnect timer cancelled");
                vec![ConnectionAction::CancelReconnect { timer }]
            }
            None => vec![],
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = self.state.as_str(), to = next.as_str(), "connection state");
            self.state = next;
        }
    }
}
