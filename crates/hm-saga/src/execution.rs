//! Per-event execution context handed to actions.

use hm_core::DynMessage;

use crate::compensation::CompensationContext;

/// Scratch space for one transition's action: the compensation stack for
/// unwinding partially-done work, and the messages to dispatch after the
/// saga persists (state is saved before anything is sent).
#[derive(Default)]
pub struct SagaExecution {
    compensations: CompensationContext,
    emitted: Vec<DynMessage>,
}

impl SagaExecution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named compensating action, run in LIFO order if the
    /// action later fails.
    pub fn register_compensation<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.compensations.register(name, action);
    }

    /// Queue a follow-on message. The orchestrator hands emitted messages
    /// back to the caller only after the saga persisted successfully.
    pub fn emit(&mut self, message: DynMessage) {
        self.emitted.push(message);
    }

    pub fn compensation_count(&self) -> usize {
        self.compensations.len()
    }

    pub(crate) fn into_parts(self) -> (CompensationContext, Vec<DynMessage>) {
        (self.compensations, self.emitted)
    }
}
