//! Declarative state machine definition.
//!
//! A definition maps (state, event type) pairs to transitions. A
//! transition carries an optional guard, an action, and an optional
//! target state; a state the action sets explicitly wins over the
//! declared target.
//!
//! Actions are pure with respect to IO: they mutate the instance, emit
//! follow-on messages and register compensations through the execution
//! context, and the orchestrator performs the IO around them. Anything
//! the action cannot decide synchronously belongs in a handler feeding
//! events back in.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hm_core::{DynMessage, Event};

use crate::execution::SagaExecution;
use crate::instance::SagaInstance;

type ErasedAction<S> =
    dyn Fn(&mut SagaInstance<S>, &DynMessage, &mut SagaExecution) -> anyhow::Result<()>
        + Send
        + Sync;

type ErasedGuard<S> = dyn Fn(&SagaInstance<S>, &DynMessage) -> bool + Send + Sync;

pub struct Transition<S> {
    event_type: TypeId,
    event_name: &'static str,
    guard: Option<Arc<ErasedGuard<S>>>,
    action: Arc<ErasedAction<S>>,
    target: Option<String>,
}

impl<S: Send + Sync + 'static> Transition<S> {
    /// Transition handling event `E`. The action receives the instance,
    /// the typed event, and the execution context for compensations and
    /// outbound messages.
    pub fn on<E, F>(action: F) -> Self
    where
        E: Event,
        F: Fn(&mut SagaInstance<S>, &E, &mut SagaExecution) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let erased = move |saga: &mut SagaInstance<S>,
                           message: &DynMessage,
                           execution: &mut SagaExecution|
              -> anyhow::Result<()> {
            match message.payload_ref::<E>() {
                Some(event) => action(saga, event, execution),
                None => anyhow::bail!("event payload is not a {}", E::message_type()),
            }
        };
        Self {
            event_type: TypeId::of::<E>(),
            event_name: E::message_type(),
            guard: None,
            action: Arc::new(erased),
            target: None,
        }
    }

    /// Transition that only moves to the target state; the event carries
    /// no data worth applying.
    pub fn jump<E: Event>(state: &str) -> Self {
        Self::on::<E, _>(|_saga, _event, _execution| Ok(())).to(state)
    }

    /// Declare the state entered after a successful action (unless the
    /// action already changed state itself).
    pub fn to(mut self, state: &str) -> Self {
        self.target = Some(state.to_string());
        self
    }

    /// Guard predicate over the instance and the typed event; the
    /// transition is skipped when it returns false.
    pub fn guard<E, G>(mut self, guard: G) -> Self
    where
        E: Event,
        G: Fn(&SagaInstance<S>, &E) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(move |saga, message| {
            message
                .payload_ref::<E>()
                .map_or(false, |event| guard(saga, event))
        }));
        self
    }

    pub fn event_name(&self) -> &'static str {
        self.event_name
    }

    pub(crate) fn event_type(&self) -> TypeId {
        self.event_type
    }

    pub(crate) fn guard_passes(&self, saga: &SagaInstance<S>, message: &DynMessage) -> bool {
        self.guard.as_ref().map_or(true, |g| g(saga, message))
    }

    pub(crate) fn run_action(
        &self,
        saga: &mut SagaInstance<S>,
        message: &DynMessage,
        execution: &mut SagaExecution,
    ) -> anyhow::Result<()> {
        (self.action)(saga, message, execution)
    }

    pub(crate) fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

pub struct StateMachineDefinition<S> {
    saga_type: &'static str,
    transitions: HashMap<(String, TypeId), Transition<S>>,
    terminal_states: HashSet<String>,
    initial_events: HashSet<TypeId>,
}

impl<S: Send + Sync + 'static> StateMachineDefinition<S> {
    pub fn new(saga_type: &'static str) -> Self {
        Self {
            saga_type,
            transitions: HashMap::new(),
            terminal_states: HashSet::new(),
            initial_events: HashSet::new(),
        }
    }

    pub fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    /// Register a transition out of `state`.
    pub fn on(mut self, state: &str, transition: Transition<S>) -> Self {
        if state == crate::instance::INITIAL_STATE {
            self.initial_events.insert(transition.event_type());
        }
        self.transitions
            .insert((state.to_string(), transition.event_type()), transition);
        self
    }

    /// Mark `state` terminal: entering it completes the saga.
    pub fn terminal(mut self, state: &str) -> Self {
        self.terminal_states.insert(state.to_string());
        self
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal_states.contains(state)
    }

    /// Whether a new instance may be created for this event type.
    pub fn accepts_in_initial(&self, event_type: TypeId) -> bool {
        self.initial_events.contains(&event_type)
    }

    pub fn transition_for(&self, state: &str, event_type: TypeId) -> Option<&Transition<S>> {
        self.transitions.get(&(state.to_string(), event_type))
    }
}
