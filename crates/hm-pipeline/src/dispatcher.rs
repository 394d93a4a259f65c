//! Message dispatcher: the pipeline front door and terminal processor.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use hm_core::{
    Command, DynMessage, Envelope, Event, HeroError, Message, MessageKind, ProcessingContext,
    Query, Result,
};

use crate::registry::HandlerRegistry;
use crate::{MessageProcessor, ProcessingOutcome};

/// How event handlers within one publish run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDispatchMode {
    /// Handlers run one after another in registration order.
    Sequential,
    /// Handlers start in registration order but run concurrently, bounded
    /// by `max_in_flight`.
    Concurrent { max_in_flight: usize },
}

impl Default for EventDispatchMode {
    fn default() -> Self {
        EventDispatchMode::Sequential
    }
}

/// One handler's failure within a publish.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub message: String,
}

/// Aggregate result of an event publish; callers can enumerate partial
/// success.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub handled: usize,
    pub failures: Vec<HandlerFailure>,
}

impl PublishReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse into a single result, aggregating failure messages.
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let summary = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.handler, f.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(HeroError::handler(anyhow::anyhow!(
            "{} of {} event handlers failed: {summary}",
            self.failures.len(),
            self.handled + self.failures.len()
        )))
    }
}

async fn run_event_handler(
    handler: Arc<dyn crate::registry::AnyEventHandler>,
    message: DynMessage,
    handler_ctx: ProcessingContext,
) -> (&'static str, Result<()>) {
    let name = handler.handler_name();
    debug!(
        event = "handler.start",
        handler = name,
        message_id = %message.message_id(),
        "Invoking event handler"
    );
    let result = handler.handle_dyn(&message, &handler_ctx).await;
    match &result {
        Ok(()) => debug!(
            event = "handler.complete",
            handler = name,
            message_id = %message.message_id(),
            "Event handler complete"
        ),
        Err(err) => warn!(
            event = "handler.complete",
            handler = name,
            message_id = %message.message_id(),
            error = %err,
            "Event handler failed"
        ),
    }
    (name, result)
}

/// Terminal processor: routes a message to its registered handler(s).
pub struct DispatchProcessor {
    registry: Arc<HandlerRegistry>,
    event_mode: EventDispatchMode,
}

impl DispatchProcessor {
    pub fn new(registry: Arc<HandlerRegistry>, event_mode: EventDispatchMode) -> Self {
        Self {
            registry,
            event_mode,
        }
    }

    async fn dispatch_event(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<PublishReport> {
        let handlers = self.registry.event_handlers(message.payload_type());
        if handlers.is_empty() {
            debug!(message_type = message.message_type(), "No event handlers registered");
            return Ok(PublishReport::default());
        }

        let handler_ctx = ctx.child(&message.envelope);
        let mut report = PublishReport::default();

        match self.event_mode {
            EventDispatchMode::Sequential => {
                for handler in handlers {
                    handler_ctx.ensure_active()?;
                    debug!(
                        event = "handler.start",
                        handler = handler.handler_name(),
                        message_id = %message.message_id(),
                        "Invoking event handler"
                    );
                    match handler.handle_dyn(message, &handler_ctx).await {
                        Ok(()) => {
                            debug!(
                                event = "handler.complete",
                                handler = handler.handler_name(),
                                message_id = %message.message_id(),
                                "Event handler complete"
                            );
                            report.handled += 1;
                        }
                        Err(err) => {
                            warn!(
                                event = "handler.complete",
                                handler = handler.handler_name(),
                                message_id = %message.message_id(),
                                error = %err,
                                "Event handler failed"
                            );
                            report.failures.push(HandlerFailure {
                                handler: handler.handler_name(),
                                message: err.to_string(),
                            });
                        }
                    }
                }
            }
            EventDispatchMode::Concurrent { max_in_flight } => {
                let futures: Vec<_> = handlers
                    .into_iter()
                    .map(|handler| {
                        run_event_handler(handler, message.clone(), handler_ctx.clone())
                    })
                    .collect();
                let results: Vec<(&'static str, Result<()>)> = stream::iter(futures)
                    .buffer_unordered(max_in_flight.max(1))
                    .collect()
                    .await;
                for (name, result) in results {
                    match result {
                        Ok(()) => report.handled += 1,
                        Err(err) => report.failures.push(HandlerFailure {
                            handler: name,
                            message: err.to_string(),
                        }),
                    }
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl MessageProcessor for DispatchProcessor {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        ctx.ensure_active()?;
        match message.kind {
            MessageKind::Command | MessageKind::QueueMessage | MessageKind::ScheduledMessage => {
                let handler = self
                    .registry
                    .command_handler(message.payload_type())
                    .ok_or_else(|| {
                        HeroError::HandlerNotFound(message.message_type().to_string())
                    })?;
                let handler_ctx = ctx.child(&message.envelope);
                debug!(
                    event = "handler.start",
                    message_id = %message.message_id(),
                    message_type = message.message_type(),
                    "Invoking command handler"
                );
                let result = handler.handle_dyn(message, &handler_ctx).await;
                match &result {
                    Ok(()) => debug!(
                        event = "handler.complete",
                        message_id = %message.message_id(),
                        "Command handler complete"
                    ),
                    Err(err) => debug!(
                        event = "handler.complete",
                        message_id = %message.message_id(),
                        error = %err,
                        "Command handler failed"
                    ),
                }
                result?;
                Ok(ProcessingOutcome::done())
            }
            MessageKind::Query => {
                let handler = self
                    .registry
                    .query_handler(message.payload_type())
                    .ok_or_else(|| {
                        HeroError::HandlerNotFound(message.message_type().to_string())
                    })?;
                let handler_ctx = ctx.child(&message.envelope);
                debug!(
                    event = "handler.start",
                    message_id = %message.message_id(),
                    message_type = message.message_type(),
                    "Invoking query handler"
                );
                let result = handler.handle_dyn(message, &handler_ctx).await;
                match &result {
                    Ok(_) => debug!(
                        event = "handler.complete",
                        message_id = %message.message_id(),
                        "Query handler complete"
                    ),
                    Err(err) => debug!(
                        event = "handler.complete",
                        message_id = %message.message_id(),
                        error = %err,
                        "Query handler failed"
                    ),
                }
                Ok(ProcessingOutcome {
                    response: Some(result?),
                    replayed: false,
                })
            }
            MessageKind::Event => {
                let report = self.dispatch_event(message, ctx).await?;
                Ok(ProcessingOutcome::with_response(report))
            }
        }
    }

    fn name(&self) -> &'static str {
        "dispatch"
    }
}

/// Front door for commands, queries and events.
///
/// Cheap to clone; all clones share the same decorated processor chain.
#[derive(Clone)]
pub struct MessageDispatcher {
    processor: Arc<dyn MessageProcessor>,
}

impl MessageDispatcher {
    /// Dispatcher with no decorators: front door straight to the terminal.
    pub fn new(registry: HandlerRegistry, event_mode: EventDispatchMode) -> Self {
        Self {
            processor: Arc::new(DispatchProcessor::new(Arc::new(registry), event_mode)),
        }
    }

    /// Dispatcher over an already-composed processor chain.
    pub fn with_processor(processor: Arc<dyn MessageProcessor>) -> Self {
        Self { processor }
    }

    fn wrap<M: Message>(&self, kind: MessageKind, payload: M, ctx: &ProcessingContext) -> DynMessage {
        let mut envelope = Envelope::new();
        ctx.stamp(&mut envelope);
        DynMessage::with_envelope(envelope, kind, payload)
    }

    /// Dispatch a command to its single handler.
    pub async fn send_command<C: Command>(
        &self,
        command: C,
        ctx: &ProcessingContext,
    ) -> Result<()> {
        let message = self.wrap(MessageKind::Command, command, ctx);
        self.processor.process(&message, ctx).await.map(drop)
    }

    /// Dispatch a prepared message (outbox/scheduler delivery path).
    pub async fn deliver(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        self.processor.process(message, ctx).await
    }

    /// Dispatch a query and return its handler's response.
    pub async fn query<Q>(&self, query: Q, ctx: &ProcessingContext) -> Result<Q::Response>
    where
        Q: Query,
        Q::Response: Clone,
    {
        let message = self.wrap(MessageKind::Query, query, ctx);
        let outcome = self.processor.process(&message, ctx).await?;
        outcome
            .response_as::<Q::Response>()
            .map(|response| (*response).clone())
            .ok_or_else(|| {
                HeroError::handler(anyhow::anyhow!(
                    "query '{}' produced no response",
                    Q::message_type()
                ))
            })
    }

    /// Fan an event out to every registered handler. Handler failures are
    /// collected in the report, not raised.
    pub async fn publish<E: Event>(
        &self,
        event: E,
        ctx: &ProcessingContext,
    ) -> Result<PublishReport> {
        let message = self.wrap(MessageKind::Event, event, ctx);
        let outcome = self.processor.process(&message, ctx).await?;
        Ok(outcome
            .response_as::<PublishReport>()
            .map(|report| (*report).clone())
            .unwrap_or_default())
    }
}

/// Late-bound dispatcher reference for handlers that publish follow-on
/// messages. Breaks the handler → dispatcher → registry → handler cycle:
/// handlers capture the handle at registration time, the host binds the
/// dispatcher once wiring is complete.
#[derive(Clone, Default)]
pub struct DispatcherHandle {
    inner: Arc<OnceLock<MessageDispatcher>>,
}

impl DispatcherHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the dispatcher. Later binds are ignored.
    pub fn bind(&self, dispatcher: MessageDispatcher) {
        let _ = self.inner.set(dispatcher);
    }

    fn get(&self) -> Result<&MessageDispatcher> {
        self.inner
            .get()
            .ok_or_else(|| HeroError::Configuration("dispatcher handle not bound".into()))
    }

    pub async fn send_command<C: Command>(&self, command: C, ctx: &ProcessingContext) -> Result<()> {
        self.get()?.send_command(command, ctx).await
    }

    pub async fn publish<E: Event>(&self, event: E, ctx: &ProcessingContext) -> Result<PublishReport> {
        self.get()?.publish(event, ctx).await
    }

    pub async fn query<Q>(&self, query: Q, ctx: &ProcessingContext) -> Result<Q::Response>
    where
        Q: Query,
        Q::Response: Clone,
    {
        self.get()?.query(query, ctx).await
    }
}
