//! Webhook ingress: verify, dedup, persist raw, enqueue. Never maps or
//! writes canonical data itself, so it answers in bounded time.

use chrono::Utc;
use cs_channel::WebhookEnvelope;
use cs_core::store::Store;
use cs_core::types::{WebhookEvent, WebhookEventStatus};
use cs_telemetry::metrics::{global_metrics, names, record_webhook_event};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::signature::{content_hash, verify_signature};

/// Header carrying the source's delivery id.
pub const EVENT_ID_HEADER: &str = "x-channel-event-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    BadSignature,
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    Accepted { event_id: Uuid },
    Duplicate { dedup_key: String },
    Rejected(RejectReason),
}

/// One delivery as it arrived over HTTP.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub source_event_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct WebhookIngress {
    store: Store,
    queue: flume::Sender<Uuid>,
    secret: Option<Vec<u8>>,
}

impl WebhookIngress {
    /// `secret` enables signature verification; `None` accepts unsigned
    /// deliveries.
    pub fn new(store: Store, queue: flume::Sender<Uuid>, secret: Option<String>) -> Self {
        Self {
            store,
            queue,
            secret: secret.map(String::into_bytes),
        }
    }

    pub async fn receive(&self, delivery: Delivery<'_>) -> Result<IngressOutcome> {
        if let Some(secret) = &self.secret {
            let valid = delivery
                .signature
                .is_some_and(|sig| verify_signature(secret, delivery.body, sig));
            if !valid {
                warn!(bytes = delivery.body.len(), "webhook signature check failed");
                record_webhook_event("bad_signature");
                return Ok(IngressOutcome::Rejected(RejectReason::BadSignature));
            }
        }

        let raw_body = String::from_utf8_lossy(delivery.body).into_owned();
        let parsed: Option<Value> = serde_json::from_slice(delivery.body)
            .ok()
            .filter(Value::is_object);
        let envelope = parsed.as_ref().map(WebhookEnvelope::parse);

        let source_event_id = delivery
            .source_event_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| envelope.as_ref().and_then(|e| e.source_event_id.clone()))
            .or_else(|| {
                parsed
                    .as_ref()
                    .and_then(|p| p.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        let dedup_key = match &source_event_id {
            Some(id) => format!("event:{id}"),
            None => content_hash(delivery.body),
        };

        let problem = match &envelope {
            None => Some("body is not a JSON object".to_string()),
            Some(env) if env.kind.is_none() => Some(format!(
                "unrecognised entity type in action {:?}",
                env.action.as_deref().unwrap_or("<none>")
            )),
            Some(env) if env.external_id.is_none() => Some("record has no external id".into()),
            Some(_) => None,
        };

        // Rejected rows never claim the delivery's dedup key, so a corrected
        // retry with the same event id is still accepted.
        let id = Uuid::new_v4();
        let dedup_key = match &problem {
            Some(_) => format!("rejected:{id}"),
            None => dedup_key,
        };
        let event = WebhookEvent {
            id,
            dedup_key: dedup_key.clone(),
            source_event_id,
            action: envelope.as_ref().and_then(|e| e.action.clone()),
            entity_kind: envelope.as_ref().and_then(|e| e.kind),
            external_id: envelope.as_ref().and_then(|e| e.external_id.clone()),
            raw_body,
            status: if problem.is_some() {
                WebhookEventStatus::Rejected
            } else {
                WebhookEventStatus::Pending
            },
            error: problem.clone(),
            received_at: Utc::now(),
            processed_at: None,
        };

        if let Some(reason) = problem {
            warn!(dedup_key = %dedup_key, %reason, body = %event.raw_body, "webhook rejected");
            self.store.insert_webhook_event(&event).await?;
            record_webhook_event("rejected");
            return Ok(IngressOutcome::Rejected(RejectReason::Malformed(reason)));
        }

        if !self.store.insert_webhook_event(&event).await? {
            debug!(dedup_key = %dedup_key, "duplicate webhook delivery");
            record_webhook_event("duplicate");
            return Ok(IngressOutcome::Duplicate { dedup_key });
        }

        match self.queue.try_send(event.id) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                warn!(event_id = %event.id, "webhook queue full, left pending for the backlog sweep");
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                warn!(event_id = %event.id, "webhook workers stopped, left pending");
            }
        }
        global_metrics().set_gauge(names::WEBHOOK_QUEUE_DEPTH, self.queue.len() as i64);
        record_webhook_event("accepted");
        info!(
            event_id = %event.id,
            action = event.action.as_deref().unwrap_or(""),
            external_id = event.external_id.as_deref().unwrap_or(""),
            "webhook accepted"
        );
        Ok(IngressOutcome::Accepted { event_id: event.id })
    }
}
