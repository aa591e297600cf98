//! Countdown gate.
//!
//! Synchronizes the software reset with a physical key press: the user sees
//! the count go 3, 2, 1 and presses the key as it reaches zero, which is the
//! moment the reset goes out. The gate itself is a pure state machine; a
//! [`Clock`] drives it in [`run_countdown`].

use std::time::Duration;

use log::debug;

use crate::clock::Clock;
use crate::error::CancelError;

/// Default starting value.
pub const DEFAULT_COUNTDOWN: u32 = 3;

/// Default interval between ticks.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Not started.
    Idle,
    /// Counting; holds the value last shown.
    Counting(u32),
    /// Reached zero.
    Fired,
    /// Stopped before reaching zero.
    Cancelled,
}

/// One emitted countdown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateTick {
    /// Value to show.
    pub remaining: u32,
    /// Whether this tick completed the countdown.
    pub fired: bool,
}

/// Countdown state machine that fires exactly once.
#[derive(Debug, Clone)]
pub struct CountdownGate {
    from: u32,
    state: GateState,
}

impl Default for CountdownGate {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTDOWN)
    }
}

impl CountdownGate {
    /// Create a gate counting down from `from`.
    pub fn new(from: u32) -> Self {
        Self {
            from,
            state: GateState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Value currently shown, while counting.
    pub fn remaining(&self) -> Option<u32> {
        match self.state {
            GateState::Counting(n) => Some(n),
            _ => None,
        }
    }

    /// Start counting. Returns `None` if the gate was already started.
    pub fn start(&mut self) -> Option<GateTick> {
        if self.state != GateState::Idle {
            return None;
        }
        let fired = self.from == 0;
        self.state = if fired {
            GateState::Fired
        } else {
            GateState::Counting(self.from)
        };
        Some(GateTick {
            remaining: self.from,
            fired,
        })
    }

    /// Value the next [`advance`](Self::advance) will produce.
    pub fn peek_next(&self) -> Option<u32> {
        match self.state {
            GateState::Counting(n) => Some(n - 1),
            _ => None,
        }
    }

    /// Move one step down. Returns `None` unless counting.
    pub fn advance(&mut self) -> Option<GateTick> {
        let next = self.peek_next()?;
        let fired = next == 0;
        self.state = if fired {
            GateState::Fired
        } else {
            GateState::Counting(next)
        };
        Some(GateTick {
            remaining: next,
            fired,
        })
    }

    /// Stop the countdown before it fires.
    pub fn cancel(&mut self) -> Result<(), CancelError> {
        match self.state {
            GateState::Idle | GateState::Counting(_) => {
                self.state = GateState::Cancelled;
                Ok(())
            },
            GateState::Fired => Err(CancelError::TooLate),
            GateState::Cancelled => Err(CancelError::NotActive),
        }
    }
}

/// How a driven countdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResult {
    /// Reached zero.
    Fired,
    /// `proceed` refused a step.
    Cancelled,
}

/// Drive `gate` to completion.
///
/// Before every value is shown, `proceed(value)` decides whether the count
/// may continue; returning `false` cancels. When `proceed(0)` returns `true`
/// the caller is committed. `on_tick` is called once per shown value, with
/// `tick` of clock time between values.
pub fn run_countdown<P, T>(
    gate: &mut CountdownGate,
    clock: &dyn Clock,
    tick: Duration,
    mut proceed: P,
    mut on_tick: T,
) -> GateResult
where
    P: FnMut(u32) -> bool,
    T: FnMut(u32),
{
    if gate.state() == GateState::Idle && !proceed(gate.from) {
        let _ = gate.cancel();
        return GateResult::Cancelled;
    }
    let Some(mut current) = gate.start() else {
        return GateResult::Cancelled;
    };

    loop {
        debug!("Countdown: {}", current.remaining);
        on_tick(current.remaining);
        if current.fired {
            return GateResult::Fired;
        }

        clock.sleep(tick);
        let Some(next) = gate.peek_next() else {
            return GateResult::Cancelled;
        };
        if !proceed(next) {
            let _ = gate.cancel();
            return GateResult::Cancelled;
        }
        let Some(ticked) = gate.advance() else {
            return GateResult::Cancelled;
        };
        current = ticked;
    }
}
