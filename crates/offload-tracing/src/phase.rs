//! Timing guards for the phases of a kernel launch.
//!
//! ```rust
//! use offload_tracing::PhaseTimer;
//!
//! let timer = PhaseTimer::start("write");
//! // ... serialize ...
//! let elapsed = timer.finish();
//! println!("write took {elapsed:?}");
//! ```

use std::time::{Duration, Instant};

/// RAII guard that measures one launch phase.
///
/// The phase is logged at debug level when the guard is finished or dropped.
/// A guard dropped without [`finish`](PhaseTimer::finish) (an early `?`
/// return) is logged as aborted.
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
    span: tracing::Span,
    finished: bool,
}

impl PhaseTimer {
    /// Start timing `phase`.
    pub fn start(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
            span: tracing::debug_span!("phase", name = phase),
            finished: false,
        }
    }

    /// Name of the phase being timed.
    pub fn phase(&self) -> &'static str {
        self.phase
    }

    /// Time elapsed so far.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Enter the phase span so events emitted inside it are attributed to it.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    /// Stop the timer, log the phase and return its duration.
    pub fn finish(mut self) -> Duration {
        let elapsed = self.elapsed();
        self.finished = true;
        let _entered = self.span.enter();
        tracing::debug!(duration_us = elapsed.as_micros() as u64, "phase_complete");
        elapsed
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        if !self.finished {
            let _entered = self.span.enter();
            tracing::debug!(duration_us = self.elapsed().as_micros() as u64, "phase_aborted");
        }
    }
}
