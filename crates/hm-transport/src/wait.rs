//! Consumer wait strategies for the ring buffer.
//!
//! The strategy decides what a consumer does while the slot it wants has
//! not been published yet, trading latency against CPU:
//!
//! | Strategy          | Latency | CPU        |
//! |-------------------|---------|------------|
//! | `BusySpin`        | ns      | full core  |
//! | `Yielding`        | sub-µs  | high       |
//! | `Sleeping`        | µs–ms   | low        |
//! | `Blocking`        | ms      | minimal    |
//! | `TimeoutBlocking` | bounded | minimal    |

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Spin on the published sequence. Lowest latency, burns a core.
    BusySpin,
    /// Spin a few rounds, then yield the thread to the scheduler.
    Yielding,
    /// Spin briefly, then park for `idle` between checks.
    Sleeping { idle: Duration },
    /// Park on a condvar signalled by every publish.
    Blocking,
    /// Like `Blocking` but gives up after `timeout`.
    TimeoutBlocking { timeout: Duration },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Blocking
    }
}

impl WaitStrategy {
    /// Whether producers must signal the shared condvar on publish.
    pub(crate) fn needs_signal(&self) -> bool {
        matches!(
            self,
            WaitStrategy::Blocking | WaitStrategy::TimeoutBlocking { .. }
        )
    }
}
