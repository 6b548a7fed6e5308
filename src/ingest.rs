//! Event ingestion from the durable gateway stream
//!
//! Entries are read one at a time and each is handled in its own task. An entry
//! is acknowledged once its handler finishes, unless the handler failed on
//! storage; those stay pending and are re-claimed by the idle sweep.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};

use crate::config::QueueConfig;
use crate::db::{EventQueue, QueueEntry};
use crate::discord::{Message, ReactionAdd, WebhooksUpdate};
use crate::dispatch::{Dispatcher, ProxyOutcome};
use crate::{Error, Result};

/// Event types the worker handles
pub const HANDLED_EVENTS: [&str; 4] = [
    "MESSAGE_CREATE",
    "MESSAGE_UPDATE",
    "MESSAGE_REACTION_ADD",
    "WEBHOOKS_UPDATE",
];

/// Backoff after a failed stream read
const READ_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

/// A gateway dispatch as written to the stream: `{"t": ..., "d": ...}`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t", content = "d")]
pub enum GatewayEvent {
    #[serde(rename = "MESSAGE_CREATE")]
    MessageCreate(Box<Message>),
    #[serde(rename = "MESSAGE_UPDATE")]
    MessageUpdate(Box<Message>),
    #[serde(rename = "MESSAGE_REACTION_ADD")]
    ReactionAdd(ReactionAdd),
    #[serde(rename = "WEBHOOKS_UPDATE")]
    WebhooksUpdate(WebhooksUpdate),
}

impl GatewayEvent {
    /// Decode a stream payload; `None` for event types the worker ignores
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] if the payload is not JSON or a handled
    /// event does not match its schema
    pub fn parse(payload: &str) -> Result<Option<Self>> {
        let raw: Value =
            serde_json::from_str(payload).map_err(|e| Error::InvalidEvent(e.to_string()))?;

        let kind = raw.get("t").and_then(Value::as_str).unwrap_or_default();
        if !HANDLED_EVENTS.contains(&kind) {
            tracing::debug!(kind, "ignoring unhandled event type");
            return Ok(None);
        }

        let kind = kind.to_string();
        serde_json::from_value(raw)
            .map(Some)
            .map_err(|e| Error::InvalidEvent(format!("{kind}: {e}")))
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MessageCreate(_) => "MESSAGE_CREATE",
            Self::MessageUpdate(_) => "MESSAGE_UPDATE",
            Self::ReactionAdd(_) => "MESSAGE_REACTION_ADD",
            Self::WebhooksUpdate(_) => "WEBHOOKS_UPDATE",
        }
    }
}

/// Run the handler for one event
///
/// # Errors
///
/// Returns the handler's error
pub async fn handle_event(dispatcher: &Dispatcher, event: GatewayEvent) -> Result<()> {
    match event {
        GatewayEvent::MessageCreate(message) => {
            if message.is_proxy_candidate() {
                log_outcome(&message, &dispatcher.process(&message).await?);
            }
        }
        GatewayEvent::MessageUpdate(message) => {
            if message.is_proxy_candidate() {
                log_outcome(&message, &dispatcher.process_update(&message).await?);
            }
        }
        GatewayEvent::ReactionAdd(reaction) => {
            if dispatcher.delete_on_reaction(&reaction).await? {
                tracing::info!(
                    message = %reaction.message_id,
                    user = %reaction.user_id,
                    "deleted proxied message on reaction"
                );
            }
        }
        GatewayEvent::WebhooksUpdate(update) => {
            match dispatcher
                .webhooks()
                .refresh(update.channel_id, Some(update.guild_id))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_forbidden() => {
                    tracing::debug!(channel = %update.channel_id, "cannot list webhooks");
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(())
}

fn log_outcome(message: &Message, outcome: &ProxyOutcome) {
    if matches!(outcome, ProxyOutcome::Skipped) {
        tracing::debug!(message = %message.id, "message not proxied");
    }
}

/// Stream consumer
#[derive(Clone)]
pub struct Ingest {
    queue: EventQueue,
    dispatcher: Arc<Dispatcher>,
    config: Arc<QueueConfig>,
}

impl Ingest {
    #[must_use]
    pub fn new(queue: EventQueue, dispatcher: Arc<Dispatcher>, config: QueueConfig) -> Self {
        Self {
            queue,
            dispatcher,
            config: Arc::new(config),
        }
    }

    /// Create the consumer group if needed
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn init(&self) -> Result<()> {
        self.queue
            .create_group(&self.config.stream, &self.config.group)?;
        Ok(())
    }

    /// Handle one entry and acknowledge it unless the failure was fatal
    ///
    /// Returns whether the entry was acknowledged.
    #[must_use]
    pub async fn handle_entry(&self, entry: &QueueEntry) -> bool {
        let result = match GatewayEvent::parse(&entry.payload) {
            Ok(Some(event)) => {
                let name = event.name();
                handle_event(&self.dispatcher, event)
                    .await
                    .map_err(|e| (name, e))
            }
            Ok(None) => Ok(()),
            Err(e) => Err(("unknown", e)),
        };

        if let Err((event, e)) = result {
            if e.is_fatal() {
                tracing::error!(
                    entry = entry.id,
                    deliveries = entry.deliveries,
                    event,
                    error = %e,
                    "event handler failed on storage, leaving entry pending"
                );
                return false;
            }

            if matches!(e, Error::Critical(_)) {
                tracing::error!(entry = entry.id, event, error = %e, "critical proxy failure");
            } else {
                tracing::warn!(entry = entry.id, event, error = %e, "event handler failed");
            }
        }

        match self
            .queue
            .ack(&self.config.stream, &self.config.group, entry.id)
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(entry = entry.id, error = %e, "failed to acknowledge entry");
                false
            }
        }
    }

    /// Consume the stream until `shutdown` flips to `true`
    ///
    /// In-flight handlers are awaited before returning.
    ///
    /// # Errors
    ///
    /// Returns error if the consumer group cannot be created
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.init()?;

        let config = Arc::clone(&self.config);
        tracing::info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %config.consumer,
            "event consumer running"
        );

        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::new();

        let mut sweep = tokio::time::interval(config.claim_idle);
        sweep.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("shutdown requested, draining event handlers");
                        break;
                    }
                }
                _ = sweep.tick() => {
                    match self.queue.claim_idle(&config.stream, &config.group, &config.consumer, config.claim_idle) {
                        Ok(entries) => {
                            if !entries.is_empty() {
                                tracing::info!(count = entries.len(), "re-claimed idle entries");
                            }
                            for entry in entries {
                                self.spawn(&mut tasks, &mut in_flight, entry);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to claim idle entries"),
                    }
                }
                read = self.queue.read_group(&config.stream, &config.group, &config.consumer, 1, config.block) => {
                    match read {
                        Ok(entries) => {
                            for entry in entries {
                                self.spawn(&mut tasks, &mut in_flight, entry);
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to read event stream");
                            tokio::time::sleep(READ_BACKOFF).await;
                        }
                    }
                }
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    finish(&mut in_flight, joined);
                }
            }
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            finish(&mut in_flight, joined);
        }

        tracing::info!("event consumer stopped");
        Ok(())
    }

    fn spawn(&self, tasks: &mut JoinSet<()>, in_flight: &mut InFlight, entry: QueueEntry) {
        if in_flight.values().any(|id| *id == entry.id) {
            return;
        }

        let this = self.clone();
        let entry_id = entry.id;
        let task = tasks.spawn(async move {
            let acked = this.handle_entry(&entry).await;
            tracing::trace!(entry = entry.id, acked, "entry handled");
        });
        in_flight.insert(task.id(), entry_id);
    }
}

/// Stream entry ids keyed by the task handling them
type InFlight = HashMap<Id, i64>;

fn finish(in_flight: &mut InFlight, joined: std::result::Result<(Id, ()), JoinError>) {
    let task = match joined {
        Ok((task, ())) => task,
        Err(e) => {
            tracing::error!(error = %e, "event handler panicked");
            e.id()
        }
    };
    in_flight.remove(&task);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_create() {
        let payload = serde_json::json!({
            "t": "MESSAGE_CREATE",
            "d": {
                "id": "1", "channel_id": "2", "guild_id": "3", "type": 0,
                "content": "s;hi", "author": {"id": "4", "username": "alice"}
            }
        });

        let event = GatewayEvent::parse(&payload.to_string()).unwrap().unwrap();
        assert_eq!(event.name(), "MESSAGE_CREATE");
        let GatewayEvent::MessageCreate(message) = event else {
            panic!("wrong variant");
        };
        assert_eq!(message.content, "s;hi");
    }

    #[test]
    fn parses_reaction_and_webhooks_update() {
        let reaction = r#"{"t":"MESSAGE_REACTION_ADD","d":{"user_id":"1","channel_id":"2","message_id":"3","guild_id":"4","emoji":{"name":"❌"}}}"#;
        assert!(matches!(
            GatewayEvent::parse(reaction).unwrap(),
            Some(GatewayEvent::ReactionAdd(_))
        ));

        let update = r#"{"t":"WEBHOOKS_UPDATE","d":{"guild_id":"4","channel_id":"2"}}"#;
        assert!(matches!(
            GatewayEvent::parse(update).unwrap(),
            Some(GatewayEvent::WebhooksUpdate(_))
        ));
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let payload = r#"{"t":"TYPING_START","d":{}}"#;
        assert!(GatewayEvent::parse(payload).unwrap().is_none());
    }

    #[tokio::test]
    async fn panicked_handlers_leave_in_flight_set() {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut in_flight = InFlight::new();

        let task = tasks.spawn(async {
            panic!("handler bug");
        });
        in_flight.insert(task.id(), 7);
        let task = tasks.spawn(async {});
        in_flight.insert(task.id(), 8);

        while let Some(joined) = tasks.join_next_with_id().await {
            finish(&mut in_flight, joined);
        }
        assert!(in_flight.is_empty());
    }

    #[test]
    fn malformed_payloads_are_invalid() {
        assert!(matches!(
            GatewayEvent::parse("not json"),
            Err(Error::InvalidEvent(_))
        ));
        assert!(matches!(
            GatewayEvent::parse(r#"{"t":"MESSAGE_CREATE","d":{"content":"no ids"}}"#),
            Err(Error::InvalidEvent(_))
        ));
    }
}
