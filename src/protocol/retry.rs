//! Command retry engine.
//!
//! The device link drops writes and notifications without telling anyone,
//! so every command is retransmitted until the device acknowledges it or the
//! attempt budget runs out. The engine is a plain state holder: the owner
//! transmits, feeds it acknowledgments and deadline expiries, and acts on the
//! [`RetryStep`] it gets back. It never sleeps or spawns on its own.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ATTEMPTS};
use crate::error::{Error, Result};
use crate::protocol::frame::Command;

/// How hard to try before giving up on a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Total number of transmissions, including the first.
    pub max_attempts: u32,
    /// How long to wait for an acknowledgment after each transmission.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts,
            attempt_timeout,
        }
    }

    /// Upper bound on how long a command can stay pending.
    ///
    /// Saturates at [`Duration::MAX`].
    pub fn total_budget(&self) -> Duration {
        self.attempt_timeout.saturating_mul(self.max_attempts)
    }
}

/// Roughly 30 years, the same horizon tokio uses for "never".
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, clamped to a far-future instant when the sum overflows.
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The device acknowledged the command.
    Acknowledged,
    /// No acknowledgment arrived within the attempt budget.
    TimedOut {
        /// Number of transmissions made.
        attempts: u32,
    },
    /// The link went down while the command was pending.
    Abandoned,
}

impl CommandOutcome {
    /// Check if the command was acknowledged.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged)
    }
}

/// Reply channel for a command's outcome.
pub type OutcomeSender = oneshot::Sender<Result<CommandOutcome>>;

/// What the owner should do after a deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Nothing was pending or the deadline has not passed yet.
    Idle,
    /// Transmit the command again; a new deadline is armed.
    Retransmit(Command),
    /// The attempt budget is spent; the command resolved as timed out.
    Exhausted(Command),
}

/// The in-flight command.
#[derive(Debug)]
struct PendingCommand {
    command: Command,
    attempts: u32,
    policy: RetryPolicy,
    deadline: Instant,
    reply: Option<OutcomeSender>,
}

impl PendingCommand {
    /// Complete the caller's future. Only the first call has any effect.
    fn resolve(&mut self, outcome: CommandOutcome) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Ok(outcome));
        }
    }
}

/// Tracks at most one pending command and its acknowledgment.
#[derive(Debug, Default)]
pub struct RetryEngine {
    pending: Option<PendingCommand>,
    ack_received: bool,
}

impl RetryEngine {
    /// Create an idle engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a command is waiting for its acknowledgment.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The command waiting for its acknowledgment, if any.
    pub fn pending_command(&self) -> Option<Command> {
        self.pending.as_ref().map(|p| p.command)
    }

    /// Number of transmissions made for the pending command.
    pub fn attempts(&self) -> u32 {
        self.pending.as_ref().map_or(0, |p| p.attempts)
    }

    /// When the current attempt times out.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Start tracking `command`. The caller transmits it right after.
    ///
    /// Any acknowledgment seen before this point belongs to an earlier
    /// command and is discarded.
    pub fn begin(
        &mut self,
        command: Command,
        policy: RetryPolicy,
        now: Instant,
        reply: OutcomeSender,
    ) -> Result<Command> {
        if let Some(pending) = &self.pending {
            let pending = pending.command;
            let _ = reply.send(Err(Error::CommandPending { pending }));
            return Err(Error::CommandPending { pending });
        }

        if self.ack_received {
            debug!("Discarding stale acknowledgment before {}", command);
        }
        self.ack_received = false;

        self.pending = Some(PendingCommand {
            command,
            attempts: 1,
            policy,
            deadline: deadline_after(now, policy.attempt_timeout),
            reply: Some(reply),
        });

        Ok(command)
    }

    /// Record that the device sent an acknowledgment.
    pub fn note_acknowledgment(&mut self) {
        self.ack_received = true;
    }

    /// Resolve the pending command if an acknowledgment has been recorded.
    ///
    /// Reads and clears the acknowledgment flag in one step. Returns the
    /// command that was acknowledged.
    pub fn resolve_acknowledged(&mut self) -> Option<Command> {
        if !std::mem::take(&mut self.ack_received) {
            return None;
        }

        match self.pending.take() {
            Some(mut pending) => {
                debug!(
                    "{} acknowledged after {} attempt(s)",
                    pending.command, pending.attempts
                );
                pending.resolve(CommandOutcome::Acknowledged);
                Some(pending.command)
            }
            None => {
                debug!("Acknowledgment with no command pending, ignoring");
                None
            }
        }
    }

    /// Handle the passage of time.
    pub fn on_deadline(&mut self, now: Instant) -> RetryStep {
        let Some(pending) = self.pending.as_mut() else {
            return RetryStep::Idle;
        };

        if now < pending.deadline {
            return RetryStep::Idle;
        }

        if pending.attempts < pending.policy.max_attempts {
            pending.attempts += 1;
            pending.deadline = deadline_after(now, pending.policy.attempt_timeout);
            debug!(
                "No acknowledgment for {}, retrying (attempt {} of {})",
                pending.command, pending.attempts, pending.policy.max_attempts
            );
            return RetryStep::Retransmit(pending.command);
        }

        let mut pending = match self.pending.take() {
            Some(pending) => pending,
            None => return RetryStep::Idle,
        };
        warn!(
            "No acknowledgment received after {} attempts for {}",
            pending.attempts, pending.command
        );
        pending.resolve(CommandOutcome::TimedOut {
            attempts: pending.attempts,
        });
        RetryStep::Exhausted(pending.command)
    }

    /// Drop the pending command because the link is gone.
    pub fn abandon(&mut self) -> Option<Command> {
        self.ack_received = false;
        let mut pending = self.pending.take()?;
        debug!("Abandoning {} after {} attempt(s)", pending.command, pending.attempts);
        pending.resolve(CommandOutcome::Abandoned);
        Some(pending.command)
    }
}
