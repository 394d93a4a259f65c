//! Injected time source.
//!
//! Every due-time comparison and backoff sleep in the workspace goes
//! through this port so tests can drive virtual time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let now = self.now();
        if deadline <= now {
            return;
        }
        let wait = (deadline - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.sleep(wait).await;
    }
}

/// Handle to a one-shot timer created with [`create_timer`]. Dropping the
/// handle does not cancel the timer; call [`TimerHandle::cancel`].
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Fire `callback` once `clock` reaches `due_at`, unless the returned
/// handle is cancelled first.
pub fn create_timer<F>(clock: Arc<dyn Clock>, due_at: DateTime<Utc>, callback: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let token = CancellationToken::new();
    let handle = TimerHandle {
        token: token.clone(),
    };
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = clock.sleep_until(due_at) => callback(),
        }
    });
    handle
}

/// Wall-clock time backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct Waiter {
    due: DateTime<Utc>,
    tx: oneshot::Sender<()>,
}

struct ManualState {
    now: DateTime<Utc>,
    waiters: Vec<Waiter>,
}

/// Virtual time for tests. `advance` moves the clock forward and wakes
/// every sleeper whose deadline has passed.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: start,
                waiters: Vec::new(),
            })),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, duration: Duration) {
        let woken = {
            let mut state = self.state.lock();
            state.now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
            let now = state.now;
            let (due, pending): (Vec<_>, Vec<_>) =
                state.waiters.drain(..).partition(|w| w.due <= now);
            state.waiters = pending;
            due
        };
        for waiter in woken {
            let _ = waiter.tx.send(());
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let behind = {
            let mut state = self.state.lock();
            state.now = now;
            let (due, pending): (Vec<_>, Vec<_>) =
                state.waiters.drain(..).partition(|w| w.due <= now);
            state.waiters = pending;
            due
        };
        for waiter in behind {
            let _ = waiter.tx.send(());
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let rx = {
            let mut state = self.state.lock();
            let due = state.now
                + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter { due, tx });
            rx
        };
        // Sender dropped means the clock itself was dropped; just return.
        let _ = rx.await;
    }
}
