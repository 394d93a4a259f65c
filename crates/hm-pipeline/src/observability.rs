//! Observability decorator: spans, pipeline events and metrics.
//!
//! With no metrics recorder installed the `metrics` macros are no-ops, so
//! the undecorated behavior is identical — the no-op path is first-class.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, Instrument};

use hm_core::{DynMessage, MessageKind, ProcessingContext, Result};

use crate::{MessageProcessor, ProcessingOutcome};

pub struct ObservabilityProcessor<P> {
    inner: P,
    transport: &'static str,
    destination: String,
}

impl<P> ObservabilityProcessor<P> {
    pub fn new(inner: P, destination: impl Into<String>) -> Self {
        Self {
            inner,
            transport: "in-process",
            destination: destination.into(),
        }
    }

    fn operation(kind: MessageKind) -> &'static str {
        match kind {
            MessageKind::Command | MessageKind::Query => "send",
            MessageKind::Event => "publish",
            MessageKind::QueueMessage | MessageKind::ScheduledMessage => "receive",
        }
    }

    /// `<operation>.start` / `<operation>.complete` event names.
    fn event_names(kind: MessageKind) -> (&'static str, &'static str) {
        match kind {
            MessageKind::Command | MessageKind::Query => ("send.start", "send.complete"),
            MessageKind::Event => ("publish.start", "publish.complete"),
            MessageKind::QueueMessage | MessageKind::ScheduledMessage => {
                ("receive.start", "receive.complete")
            }
        }
    }
}

#[async_trait]
impl<P: MessageProcessor> MessageProcessor for ObservabilityProcessor<P> {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        let operation = Self::operation(message.kind);
        let span = tracing::info_span!(
            "message.process",
            "messaging.system" = "heromessaging",
            "messaging.destination" = %self.destination,
            "messaging.transport" = self.transport,
            "messaging.operation" = operation,
            message_id = %message.message_id(),
            message_type = message.message_type(),
        );

        let (start_event, complete_event) = Self::event_names(message.kind);
        let started = Instant::now();
        let result = async {
            debug!(event = start_event, message_id = %message.message_id(), "Processing started");
            let result = self.inner.process(message, ctx).await;
            match &result {
                Ok(outcome) => debug!(
                    event = complete_event,
                    message_id = %message.message_id(),
                    replayed = outcome.replayed,
                    "Processing complete"
                ),
                Err(err) => debug!(
                    event = complete_event,
                    message_id = %message.message_id(),
                    error = %err,
                    "Processing failed"
                ),
            }
            result
        }
        .instrument(span)
        .await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!(
            "heromessaging_pipeline_processing_latency_ms",
            "operation" => operation
        )
        .record(elapsed_ms);
        match &result {
            Ok(_) => {
                metrics::counter!(
                    "heromessaging_pipeline_messages_processed_total",
                    "operation" => operation
                )
                .increment(1);
            }
            Err(_) => {
                metrics::counter!(
                    "heromessaging_pipeline_messages_failed_total",
                    "operation" => operation
                )
                .increment(1);
            }
        }
        result
    }

    fn name(&self) -> &'static str {
        "observability"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_core::Message;

    struct Always;

    #[async_trait]
    impl MessageProcessor for Always {
        async fn process(
            &self,
            _message: &DynMessage,
            _ctx: &ProcessingContext,
        ) -> Result<ProcessingOutcome> {
            Ok(ProcessingOutcome::done())
        }

        fn name(&self) -> &'static str {
            "ok"
        }
    }

    struct Msg;
    impl Message for Msg {}

    #[tokio::test]
    async fn transparent_for_success_and_failure() {
        let obs = ObservabilityProcessor::new(Always, "orders");
        let outcome = obs
            .process(
                &DynMessage::new(MessageKind::Command, Msg),
                &ProcessingContext::new(),
            )
            .await
            .unwrap();
        assert!(!outcome.replayed);
    }
}
