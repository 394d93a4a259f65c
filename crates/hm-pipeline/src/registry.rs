//! Type-keyed handler registry.
//!
//! Populated once at startup by explicit registration, read-only during
//! steady state. Commands and queries take exactly one handler per
//! concrete type; events take an ordered list. Handlers registered for
//! "any event" observe every published event regardless of type, which is
//! how cross-cutting subscribers (audit, projection) hook in.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use hm_core::{Command, DynMessage, Event, HeroError, ProcessingContext, Query, Result};

/// Handles one command type. Errors other than the core taxonomy are
/// wrapped as `HandlerError` by the dispatcher.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, command: &C, ctx: &ProcessingContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: &Q, ctx: &ProcessingContext) -> anyhow::Result<Q::Response>;
}

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: &E, ctx: &ProcessingContext) -> anyhow::Result<()>;
}

/// Map any handler error onto the core taxonomy: taxonomy errors pass
/// through untouched, everything else becomes `HandlerError`.
pub(crate) fn into_hero_error(err: anyhow::Error) -> HeroError {
    match err.downcast::<HeroError>() {
        Ok(hero) => hero,
        Err(other) => HeroError::Handler { source: other },
    }
}

// ============================================================================
// Type erasure
// ============================================================================

#[async_trait]
pub(crate) trait AnyCommandHandler: Send + Sync {
    async fn handle_dyn(&self, message: &DynMessage, ctx: &ProcessingContext) -> Result<()>;
}

#[async_trait]
pub(crate) trait AnyQueryHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<Arc<dyn std::any::Any + Send + Sync>>;
}

#[async_trait]
pub(crate) trait AnyEventHandler: Send + Sync {
    async fn handle_dyn(&self, message: &DynMessage, ctx: &ProcessingContext) -> Result<()>;

    fn handler_name(&self) -> &'static str;
}

struct CommandAdapter<C, H> {
    handler: H,
    _marker: PhantomData<fn(C)>,
}

#[async_trait]
impl<C: Command, H: CommandHandler<C>> AnyCommandHandler for CommandAdapter<C, H> {
    async fn handle_dyn(&self, message: &DynMessage, ctx: &ProcessingContext) -> Result<()> {
        let payload = message
            .payload_ref::<C>()
            .ok_or_else(|| HeroError::HandlerNotFound(message.message_type().to_string()))?;
        self.handler
            .handle(payload, ctx)
            .await
            .map_err(into_hero_error)
    }
}

struct QueryAdapter<Q, H> {
    handler: H,
    _marker: PhantomData<fn(Q)>,
}

#[async_trait]
impl<Q: Query, H: QueryHandler<Q>> AnyQueryHandler for QueryAdapter<Q, H> {
    async fn handle_dyn(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<Arc<dyn std::any::Any + Send + Sync>> {
        let payload = message
            .payload_ref::<Q>()
            .ok_or_else(|| HeroError::HandlerNotFound(message.message_type().to_string()))?;
        let response = self
            .handler
            .handle(payload, ctx)
            .await
            .map_err(into_hero_error)?;
        Ok(Arc::new(response))
    }
}

struct EventAdapter<E, H> {
    handler: H,
    name: &'static str,
    _marker: PhantomData<fn(E)>,
}

#[async_trait]
impl<E: Event, H: EventHandler<E>> AnyEventHandler for EventAdapter<E, H> {
    async fn handle_dyn(&self, message: &DynMessage, ctx: &ProcessingContext) -> Result<()> {
        let payload = message
            .payload_ref::<E>()
            .ok_or_else(|| HeroError::HandlerNotFound(message.message_type().to_string()))?;
        self.handler
            .handle(payload, ctx)
            .await
            .map_err(into_hero_error)
    }

    fn handler_name(&self) -> &'static str {
        self.name
    }
}

/// Handler subscribed to every event, invoked with the type-erased
/// message after the concrete-type handlers.
#[async_trait]
pub trait AnyEventSubscriber: Send + Sync {
    async fn handle(&self, message: &DynMessage, ctx: &ProcessingContext) -> anyhow::Result<()>;
}

struct SubscriberAdapter<S> {
    subscriber: S,
    name: &'static str,
}

#[async_trait]
impl<S: AnyEventSubscriber> AnyEventHandler for SubscriberAdapter<S> {
    async fn handle_dyn(&self, message: &DynMessage, ctx: &ProcessingContext) -> Result<()> {
        self.subscriber
            .handle(message, ctx)
            .await
            .map_err(into_hero_error)
    }

    fn handler_name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct HandlerRegistry {
    commands: HashMap<TypeId, Arc<dyn AnyCommandHandler>>,
    queries: HashMap<TypeId, Arc<dyn AnyQueryHandler>>,
    events: HashMap<TypeId, Vec<Arc<dyn AnyEventHandler>>>,
    event_subscribers: Vec<Arc<dyn AnyEventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single handler for command type `C`. Registering a
    /// second handler for the same type is a configuration error.
    pub fn register_command<C, H>(&mut self, handler: H) -> Result<()>
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let type_id = TypeId::of::<C>();
        if self.commands.contains_key(&type_id) {
            return Err(HeroError::Configuration(format!(
                "command handler already registered for '{}'",
                C::message_type()
            )));
        }
        self.commands.insert(
            type_id,
            Arc::new(CommandAdapter {
                handler,
                _marker: PhantomData,
            }),
        );
        Ok(())
    }

    pub fn register_query<Q, H>(&mut self, handler: H) -> Result<()>
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        let type_id = TypeId::of::<Q>();
        if self.queries.contains_key(&type_id) {
            return Err(HeroError::Configuration(format!(
                "query handler already registered for '{}'",
                Q::message_type()
            )));
        }
        self.queries.insert(
            type_id,
            Arc::new(QueryAdapter {
                handler,
                _marker: PhantomData,
            }),
        );
        Ok(())
    }

    /// Register an event handler. Dispatch order is registration order.
    pub fn register_event<E, H>(&mut self, handler: H)
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.events
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Arc::new(EventAdapter {
                handler,
                name: std::any::type_name::<H>(),
                _marker: PhantomData,
            }));
    }

    /// Subscribe a handler to every event type, invoked after the
    /// concrete-type handlers in registration order.
    pub fn register_event_subscriber<S>(&mut self, subscriber: S)
    where
        S: AnyEventSubscriber + 'static,
    {
        self.event_subscribers.push(Arc::new(SubscriberAdapter {
            name: std::any::type_name::<S>(),
            subscriber,
        }));
    }

    pub(crate) fn command_handler(&self, type_id: TypeId) -> Option<Arc<dyn AnyCommandHandler>> {
        self.commands.get(&type_id).cloned()
    }

    pub(crate) fn query_handler(&self, type_id: TypeId) -> Option<Arc<dyn AnyQueryHandler>> {
        self.queries.get(&type_id).cloned()
    }

    /// Every handler that should observe an event of `type_id`: concrete
    /// handlers first, then catch-all subscribers, each in registration
    /// order.
    pub(crate) fn event_handlers(&self, type_id: TypeId) -> Vec<Arc<dyn AnyEventHandler>> {
        let mut handlers = self.events.get(&type_id).cloned().unwrap_or_default();
        handlers.extend(self.event_subscribers.iter().cloned());
        handlers
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn event_handler_count(&self) -> usize {
        self.events.values().map(Vec::len).sum::<usize>() + self.event_subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_core::Message;

    struct CreateOrder;
    impl Message for CreateOrder {}
    impl Command for CreateOrder {}

    struct NoopHandler;

    #[async_trait]
    impl CommandHandler<CreateOrder> for NoopHandler {
        async fn handle(&self, _: &CreateOrder, _: &ProcessingContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_command_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register_command::<CreateOrder, _>(NoopHandler).unwrap();
        let err = registry.register_command::<CreateOrder, _>(NoopHandler);
        assert!(matches!(err, Err(HeroError::Configuration(_))));
    }

    #[test]
    fn taxonomy_errors_pass_through_unwrapped() {
        let err = into_hero_error(anyhow::Error::new(HeroError::Validation("bad".into())));
        assert!(matches!(err, HeroError::Validation(_)));

        let err = into_hero_error(anyhow::anyhow!("database exploded"));
        assert!(matches!(err, HeroError::Handler { .. }));
    }
}
