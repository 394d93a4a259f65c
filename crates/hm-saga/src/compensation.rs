//! Per-execution compensation stack.
//!
//! Compensations unwind partially-done work within a single action, not
//! committed prior states. They run in LIFO order, best-effort: a failing
//! compensation is logged and the unwind continues, and it never masks
//! the action's original error.

use futures::future::BoxFuture;
use tracing::{debug, warn};

type CompensationFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Compensation {
    name: String,
    run: CompensationFn,
}

/// Result of one compensation during an unwind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationOutcome {
    pub name: String,
    /// `None` when the compensation succeeded.
    pub error: Option<String>,
}

#[derive(Default)]
pub struct CompensationContext {
    stack: Vec<Compensation>,
}

impl CompensationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a named compensating action. Compensations capture owned data
    /// (ids, handles); they run only if the action later fails.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stack.push(Compensation {
            name: name.into(),
            run: Box::new(move || Box::pin(action())),
        });
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Run every registered compensation in LIFO order.
    pub(crate) async fn unwind(mut self) -> Vec<CompensationOutcome> {
        let mut outcomes = Vec::with_capacity(self.stack.len());
        while let Some(compensation) = self.stack.pop() {
            debug!(compensation = %compensation.name, "Running compensation");
            let error = match (compensation.run)().await {
                Ok(()) => None,
                Err(err) => {
                    warn!(
                        compensation = %compensation.name,
                        error = %err,
                        "Compensation failed, continuing unwind"
                    );
                    Some(err.to_string())
                }
            };
            outcomes.push(CompensationOutcome {
                name: compensation.name,
                error,
            });
        }
        outcomes
    }
}
