use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

/// Where a timed run stands on its way from "running" to "forcefully killed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// No timeout configured.
    Unbounded,
    /// Running; SIGTERM is due once `deadline` has passed.
    Armed { deadline: Instant },
    /// SIGTERM sent; SIGKILL is due once `deadline` has passed. `None` when
    /// the grace period reaches past what `Instant` can represent.
    Terminating { deadline: Option<Instant> },
    /// SIGKILL sent. Nothing further to do.
    Killed,
}

/// Two-stage timeout timeline: SIGTERM when the timeout is exceeded, then
/// SIGKILL when the grace period that follows is exceeded as well.
///
/// Pure function of the clock; the caller delivers the returned signals.
#[derive(Debug, Clone)]
pub(crate) struct Escalation {
    grace: Duration,
    stage: Stage,
}

impl Escalation {
    /// A zero timeout means the run is unbounded, and so does one too large
    /// to add to `start`.
    pub(crate) fn new(timeout: Option<Duration>, grace: Duration, start: Instant) -> Self {
        let stage = match timeout
            .filter(|t| !t.is_zero())
            .and_then(|t| start.checked_add(t))
        {
            Some(deadline) => Stage::Armed { deadline },
            None => Stage::Unbounded,
        };
        Self { grace, stage }
    }

    /// Advance the timeline to `now`, returning the signal to deliver, if any.
    /// Each signal is returned at most once.
    pub(crate) fn step(&mut self, now: Instant) -> Option<Signal> {
        match self.stage {
            Stage::Armed { deadline } if now > deadline => {
                self.stage = Stage::Terminating {
                    deadline: now.checked_add(self.grace),
                };
                Some(Signal::SIGTERM)
            }
            Stage::Terminating {
                deadline: Some(deadline),
            } if now > deadline => {
                self.stage = Stage::Killed;
                Some(Signal::SIGKILL)
            }
            _ => None,
        }
    }

    pub(crate) fn is_escalating(&self) -> bool {
        matches!(self.stage, Stage::Terminating { .. } | Stage::Killed)
    }
}
