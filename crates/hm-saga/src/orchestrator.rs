//! Saga orchestrator.

use std::sync::Arc;

use tracing::{debug, info, warn};

use hm_core::{Clock, DynMessage, HeroError, ProcessingContext, Result, SystemClock};

use crate::definition::StateMachineDefinition;
use crate::execution::SagaExecution;
use crate::instance::{SagaInstance, FAILED_STATE};
use crate::repository::SagaRepository;

/// What to do with an event no transition accepts in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownEventPolicy {
    /// Silently drop the event (the default).
    #[default]
    Drop,
    /// Surface a handler error to the caller.
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct SagaOrchestratorConfig {
    pub unknown_event: UnknownEventPolicy,
}

/// Outcome of feeding one event through the orchestrator.
#[derive(Debug)]
pub enum SagaProgress {
    /// A transition ran; the saga is now in `state`. Messages the action
    /// emitted are handed back for dispatch — the saga state was
    /// persisted before anything is sent.
    Applied {
        state: String,
        completed: bool,
        emitted: Vec<DynMessage>,
    },
    /// No saga existed and the event does not start one.
    DroppedNoInstance,
    /// No transition for (current state, event type).
    DroppedNoTransition { state: String },
    /// A guard rejected the event.
    DroppedByGuard { state: String },
}

pub struct SagaOrchestrator<S: Send + Sync + 'static> {
    definition: Arc<StateMachineDefinition<S>>,
    repository: Arc<dyn SagaRepository<S>>,
    config: SagaOrchestratorConfig,
    clock: Arc<dyn Clock>,
}

impl<S: Default + Clone + Send + Sync + 'static> SagaOrchestrator<S> {
    pub fn new(
        definition: StateMachineDefinition<S>,
        repository: Arc<dyn SagaRepository<S>>,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            repository,
            config: SagaOrchestratorConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: SagaOrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn definition(&self) -> &StateMachineDefinition<S> {
        &self.definition
    }

    /// Feed an event whose correlation id comes from its envelope.
    pub async fn handle(&self, event: &DynMessage, ctx: &ProcessingContext) -> Result<SagaProgress> {
        let correlation_id = event
            .envelope
            .correlation_id
            .clone()
            .ok_or_else(|| {
                HeroError::Validation(format!(
                    "event '{}' has no correlation id",
                    event.message_type()
                ))
            })?;
        self.handle_correlated(&correlation_id, event, ctx).await
    }

    /// Feed an event for an explicit correlation id.
    pub async fn handle_correlated(
        &self,
        correlation_id: &str,
        event: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<SagaProgress> {
        ctx.ensure_active()?;

        // 1. Load, or create a fresh instance when the initial state
        //    accepts this event type.
        let (mut saga, created) = match self.repository.find(correlation_id).await? {
            Some(saga) => (saga, false),
            None => {
                if !self.definition.accepts_in_initial(event.payload_type()) {
                    debug!(
                        correlation_id,
                        event = event.message_type(),
                        "No saga and event does not start one"
                    );
                    return self.unknown(event, SagaProgress::DroppedNoInstance);
                }
                (
                    SagaInstance::new(
                        self.definition.saga_type(),
                        correlation_id,
                        self.clock.now(),
                    ),
                    true,
                )
            }
        };

        // 2. Find the transition for (current state, event type).
        let Some(transition) = self
            .definition
            .transition_for(&saga.current_state, event.payload_type())
        else {
            debug!(
                correlation_id,
                state = %saga.current_state,
                event = event.message_type(),
                "No transition for event in current state"
            );
            return self.unknown(
                event,
                SagaProgress::DroppedNoTransition {
                    state: saga.current_state.clone(),
                },
            );
        };

        // 3. Guard.
        if !transition.guard_passes(&saga, event) {
            debug!(
                correlation_id,
                state = %saga.current_state,
                event = event.message_type(),
                "Guard rejected event"
            );
            return Ok(SagaProgress::DroppedByGuard {
                state: saga.current_state.clone(),
            });
        }

        // 4-5. Run the action with a fresh execution context; on failure
        //      unwind compensations LIFO, persist the saga as Failed, and
        //      re-raise.
        let state_before = saga.current_state.clone();
        let mut execution = SagaExecution::new();
        if let Err(action_err) = transition.run_action(&mut saga, event, &mut execution) {
            let (compensations, _emitted) = execution.into_parts();
            let unwound = compensations.unwind().await;
            warn!(
                correlation_id,
                state = %state_before,
                event = event.message_type(),
                compensations = unwound.len(),
                error = %action_err,
                "Saga action failed, compensations unwound"
            );
            metrics::counter!("heromessaging_saga_actions_failed_total").increment(1);

            saga.current_state = FAILED_STATE.to_string();
            saga.is_completed = true;
            saga.updated_at = self.clock.now();
            self.persist(&saga, created).await?;
            return Err(match action_err.downcast::<HeroError>() {
                Ok(hero) => hero,
                Err(other) => HeroError::Handler { source: other },
            });
        }

        // 6. Apply the declared target unless the action changed state.
        if saga.current_state == state_before {
            if let Some(target) = transition.target() {
                saga.current_state = target.to_string();
            }
        }
        if self.definition.is_terminal(&saga.current_state) {
            saga.is_completed = true;
        }

        // 7. Persist under the version check, then release any emitted
        //    messages to the caller.
        saga.updated_at = self.clock.now();
        let saga = self.persist(&saga, created).await?;
        let (_compensations, emitted) = execution.into_parts();

        info!(
            correlation_id,
            from = %state_before,
            to = %saga.current_state,
            event = event.message_type(),
            completed = saga.is_completed,
            "Saga transition applied"
        );
        metrics::counter!("heromessaging_saga_transitions_total").increment(1);

        Ok(SagaProgress::Applied {
            state: saga.current_state,
            completed: saga.is_completed,
            emitted,
        })
    }

    async fn persist(&self, saga: &SagaInstance<S>, created: bool) -> Result<SagaInstance<S>> {
        if created {
            self.repository.save(saga).await?;
            Ok(saga.clone())
        } else {
            self.repository.update(saga).await
        }
    }

    fn unknown(&self, event: &DynMessage, dropped: SagaProgress) -> Result<SagaProgress> {
        match self.config.unknown_event {
            UnknownEventPolicy::Drop => Ok(dropped),
            UnknownEventPolicy::Fail => Err(HeroError::handler(anyhow::anyhow!(
                "no transition accepts event '{}'",
                event.message_type()
            ))),
        }
    }
}
