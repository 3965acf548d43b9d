// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Heartbeat liveness monitoring.
//!
//! Two timers, both armed only once bring-up has finished: a repeating send
//! timer and a one-shot reply deadline. A send tick while a reply is still
//! outstanding skips the cycle instead of stacking pings; a deadline expiry
//! is fatal.

use std::pin::Pin;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, Sleep};

/// Pure outstanding-ping bookkeeping, kept by the channel state machine.
#[derive(Debug, Default)]
pub(crate) struct HeartbeatMonitor {
    waiting_reply: bool,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on every send-timer tick. Returns whether a ping should go out
    /// now; `false` means a previous ping is still unanswered and this cycle
    /// is skipped.
    pub fn on_send_due(&mut self) -> bool {
        if self.waiting_reply {
            return false;
        }
        self.waiting_reply = true;
        true
    }

    pub fn on_reply(&mut self) {
        self.waiting_reply = false;
    }

    #[cfg(test)]
    pub fn waiting_reply(&self) -> bool {
        self.waiting_reply
    }
}

/// What a timer firing means for the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatTick {
    SendDue,
    ReplyTimedOut,
}

/// Driver-side timer pair.
///
/// Unarmed timers never fire; `next()` is cancel-safe so the channel actor
/// can select over it together with its input queues.
pub(crate) struct HeartbeatTimers {
    send_every: Duration,
    reply_within: Duration,
    send_timer: Option<Interval>,
    reply_deadline: Option<Pin<Box<Sleep>>>,
}

impl HeartbeatTimers {
    pub fn new(send_every: Duration, reply_within: Duration) -> Self {
        Self {
            send_every,
            reply_within,
            send_timer: None,
            reply_deadline: None,
        }
    }

    /// Arm the repeating send timer. The first tick fires one full interval
    /// from now, not immediately.
    pub fn start(&mut self) {
        self.send_timer = Some(interval_at(
            Instant::now() + self.send_every,
            self.send_every,
        ));
    }

    pub fn arm_reply_deadline(&mut self) {
        self.reply_deadline = Some(Box::pin(tokio::time::sleep(self.reply_within)));
    }

    pub fn clear_reply_deadline(&mut self) {
        self.reply_deadline = None;
    }

    pub fn stop(&mut self) {
        self.send_timer = None;
        self.reply_deadline = None;
    }

    /// Wait for the next timer firing. Pending forever while nothing is
    /// armed.
    pub async fn next(&mut self) -> HeartbeatTick {
        let tick = {
            let Self {
                send_timer,
                reply_deadline,
                ..
            } = self;
            tokio::select! {
                () = async { reply_deadline.as_mut().expect("deadline armed").await },
                        if reply_deadline.is_some() => HeartbeatTick::ReplyTimedOut,
                _ = async { send_timer.as_mut().expect("send timer armed").tick().await },
                        if send_timer.is_some() => HeartbeatTick::SendDue,
                else => std::future::pending().await,
            }
        };
        if tick == HeartbeatTick::ReplyTimedOut {
            // The deadline is one-shot.
            self.reply_deadline = None;
        }
        tick
    }
}
