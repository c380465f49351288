mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use cs_channel::Mapper;
use cs_core::store::Store;
use cs_core::types::{CancellationReason, ReservationStatus, WebhookEventStatus};
use cs_harness::shutdown::ShutdownSignal;
use cs_sync::signature::sign;
use cs_sync::{spawn_workers, Delivery, IncrementalSync, IngressOutcome, RejectReason, WebhookIngress};
use serde_json::{json, Value};
use uuid::Uuid;

struct Harness {
    store: Store,
    fake: Arc<FakeChannel>,
    ingress: WebhookIngress,
    sync: IncrementalSync,
    tx: flume::Sender<Uuid>,
    rx: flume::Receiver<Uuid>,
}

async fn harness(capacity: usize, secret: Option<&str>) -> Harness {
    let store = Store::new_in_memory().await.unwrap();
    let fake = Arc::new(FakeChannel::default());
    let (tx, rx) = flume::bounded(capacity);
    Harness {
        ingress: WebhookIngress::new(store.clone(), tx.clone(), secret.map(str::to_string)),
        sync: IncrementalSync::new(
            store.clone(),
            fake.clone(),
            Arc::new(Mapper::new()),
            guard(&fake),
        ),
        store,
        fake,
        tx,
        rx,
    }
}

fn event(action: &str, payload: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({"action": action, "payload": payload, "_dt": "2025-01-20T10:00:00Z"}))
        .unwrap()
}

fn delivery<'a>(body: &'a [u8], event_id: Option<&'a str>) -> Delivery<'a> {
    Delivery {
        body,
        signature: None,
        source_event_id: event_id,
    }
}

impl Harness {
    async fn deliver_and_process(&self, body: &[u8], event_id: &str) -> WebhookEventStatus {
        let outcome = self.ingress.receive(delivery(body, Some(event_id))).await.unwrap();
        let IngressOutcome::Accepted { event_id } = outcome else {
            panic!("expected accepted, got {outcome:?}");
        };
        assert_eq!(self.rx.recv_async().await.unwrap(), event_id);
        self.sync.process_event(event_id).await.unwrap().unwrap().status
    }
}

fn r1_booked() -> Value {
    json!({
        "_id": "R1",
        "_idlisting": "L1",
        "type": "booked",
        "checkInDate": "2025-02-01",
        "checkOutDate": "2025-02-05",
        "partner": {"name": "Booking.com"},
    })
}

#[tokio::test]
async fn status_only_cancellation_keeps_dates_and_frees_calendar() {
    let h = harness(16, None).await;
    let status = h
        .deliver_and_process(&event("reservation.created", r1_booked()), "evt-1")
        .await;
    assert_eq!(status, WebhookEventStatus::Processed);

    let r1 = h.store.get_reservation_by_external_id("R1").await.unwrap().unwrap();
    assert_eq!(r1.status, ReservationStatus::Confirmed);
    let blocks = h.store.blocks_for_property(r1.property_ref).await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].date_range, r1.stay());

    let status = h
        .deliver_and_process(
            &event("reservation.modified", json!({"_id": "R1", "type": "canceled"})),
            "evt-2",
        )
        .await;
    assert_eq!(status, WebhookEventStatus::Processed);

    let r1 = h.store.get_reservation_by_external_id("R1").await.unwrap().unwrap();
    assert_eq!(r1.status, ReservationStatus::Cancelled);
    assert_eq!(r1.cancellation_reason, Some(CancellationReason::RemoteCancelled));
    assert_eq!(r1.check_in.to_string(), "2025-02-01");
    assert_eq!(r1.check_out.to_string(), "2025-02-05");
    assert!(h.store.blocks_for_property(r1.property_ref).await.unwrap().is_empty());
    assert_eq!(h.fake.lookups_made(), 0);
}

#[tokio::test]
async fn cancellation_action_without_status_field_cancels() {
    let h = harness(16, None).await;
    h.deliver_and_process(&event("reservation.created", r1_booked()), "evt-1")
        .await;
    let status = h
        .deliver_and_process(&event("reservation.canceled", json!({"_id": "R1"})), "evt-2")
        .await;
    assert_eq!(status, WebhookEventStatus::Processed);
    let r1 = h.store.get_reservation_by_external_id("R1").await.unwrap().unwrap();
    assert_eq!(r1.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn redelivered_event_is_applied_once() {
    let h = harness(16, None).await;
    let body = event("reservation.created", r1_booked());
    h.deliver_and_process(&body, "evt-1").await;
    assert_eq!(h.store.count_change_log().await.unwrap(), 1);

    let again = h.ingress.receive(delivery(&body, Some("evt-1"))).await.unwrap();
    assert_eq!(
        again,
        IngressOutcome::Duplicate {
            dedup_key: "event:evt-1".into()
        }
    );
    assert!(h.rx.is_empty());
    assert_eq!(h.store.count_change_log().await.unwrap(), 1);
    let r1 = h.store.get_reservation_by_external_id("R1").await.unwrap().unwrap();
    assert_eq!(r1.version, 1);
}

#[tokio::test]
async fn bodies_without_event_id_dedup_on_content_hash() {
    let h = harness(16, None).await;
    let body = event("reservation.created", r1_booked());
    let first = h.ingress.receive(delivery(&body, None)).await.unwrap();
    assert!(matches!(first, IngressOutcome::Accepted { .. }));
    let second = h.ingress.receive(delivery(&body, None)).await.unwrap();
    let IngressOutcome::Duplicate { dedup_key } = second else {
        panic!("expected duplicate, got {second:?}");
    };
    assert!(dedup_key.starts_with("sha256:"));
}

#[tokio::test]
async fn processing_an_event_twice_is_a_no_op() {
    let h = harness(16, None).await;
    let body = event("reservation.created", r1_booked());
    let IngressOutcome::Accepted { event_id } =
        h.ingress.receive(delivery(&body, Some("evt-9"))).await.unwrap()
    else {
        panic!("not accepted");
    };
    assert!(h.sync.process_event(event_id).await.unwrap().is_some());
    assert!(h.sync.process_event(event_id).await.unwrap().is_none());
    let stored = h.store.get_webhook_event(event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, WebhookEventStatus::Processed);
    assert!(stored.processed_at.is_some());
}

#[tokio::test]
async fn signature_is_required_when_a_secret_is_set() {
    let h = harness(16, Some("topsecret")).await;
    let body = event("reservation.created", r1_booked());

    let unsigned = h.ingress.receive(delivery(&body, Some("evt-1"))).await.unwrap();
    assert_eq!(unsigned, IngressOutcome::Rejected(RejectReason::BadSignature));

    let forged = sign(b"wrong", &body);
    let bad = h
        .ingress
        .receive(Delivery {
            signature: Some(&forged),
            ..delivery(&body, Some("evt-1"))
        })
        .await
        .unwrap();
    assert_eq!(bad, IngressOutcome::Rejected(RejectReason::BadSignature));

    let signed = sign(b"topsecret", &body);
    let ok = h
        .ingress
        .receive(Delivery {
            signature: Some(&signed),
            ..delivery(&body, Some("evt-1"))
        })
        .await
        .unwrap();
    assert!(matches!(ok, IngressOutcome::Accepted { .. }));
}

#[tokio::test]
async fn malformed_payload_is_kept_for_audit() {
    let h = harness(16, None).await;
    let out = h
        .ingress
        .receive(delivery(br#"{"action":"invoice.paid","payload":{"_id":"X"}}"#, None))
        .await
        .unwrap();
    assert!(matches!(out, IngressOutcome::Rejected(RejectReason::Malformed(_))));

    let not_json = h.ingress.receive(delivery(b"<html>", None)).await.unwrap();
    assert!(matches!(not_json, IngressOutcome::Rejected(RejectReason::Malformed(_))));

    let rejected = h
        .store
        .list_webhook_events(WebhookEventStatus::Rejected, 10)
        .await
        .unwrap();
    assert_eq!(rejected.len(), 2);
    assert!(h.rx.is_empty());
}

#[tokio::test]
async fn rejected_delivery_does_not_block_a_corrected_retry() {
    let h = harness(16, None).await;
    let bad = h
        .ingress
        .receive(delivery(br#"{"action":"reservation.modified"}"#, Some("E1")))
        .await
        .unwrap();
    assert!(matches!(bad, IngressOutcome::Rejected(RejectReason::Malformed(_))));

    let status = h
        .deliver_and_process(&event("reservation.modified", r1_booked()), "E1")
        .await;
    assert_eq!(status, WebhookEventStatus::Processed);
    assert!(h.store.get_reservation_by_external_id("R1").await.unwrap().is_some());

    let rejected = h
        .store
        .list_webhook_events(WebhookEventStatus::Rejected, 10)
        .await
        .unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].source_event_id.as_deref(), Some("E1"));
    assert!(rejected[0].dedup_key.starts_with("rejected:"));

    // The accepted delivery now owns the key.
    let again = h
        .ingress
        .receive(delivery(&event("reservation.modified", r1_booked()), Some("E1")))
        .await
        .unwrap();
    assert!(matches!(again, IngressOutcome::Duplicate { .. }));
}

#[tokio::test]
async fn unmapped_status_fails_the_event() {
    let h = harness(16, None).await;
    let mut record = r1_booked();
    record["type"] = json!("waitlisted");
    let status = h
        .deliver_and_process(&event("reservation.created", record), "evt-1")
        .await;
    assert_eq!(status, WebhookEventStatus::Failed);

    let failed = h
        .store
        .list_webhook_events(WebhookEventStatus::Failed, 10)
        .await
        .unwrap();
    assert!(failed[0].error.as_deref().unwrap_or("").contains("waitlisted"));
    assert!(h.store.get_reservation_by_external_id("R1").await.unwrap().is_none());
}

#[tokio::test]
async fn owner_block_and_unknown_cancellation_are_ignored() {
    let h = harness(16, None).await;
    let mut block = r1_booked();
    block["type"] = json!("owner_block");
    let status = h
        .deliver_and_process(&event("reservation.created", block), "evt-1")
        .await;
    assert_eq!(status, WebhookEventStatus::Ignored);

    let status = h
        .deliver_and_process(&event("reservation.canceled", json!({"_id": "R404"})), "evt-2")
        .await;
    assert_eq!(status, WebhookEventStatus::Ignored);
    assert!(h.store.get_reservation_by_external_id("R404").await.unwrap().is_none());
}

#[tokio::test]
async fn listing_and_client_events_upsert() {
    let h = harness(16, None).await;
    let status = h
        .deliver_and_process(
            &event("listing.modified", json!({"_id": "L7", "internalName": "Casa Verde"})),
            "evt-1",
        )
        .await;
    assert_eq!(status, WebhookEventStatus::Processed);
    let p = h.store.get_property_by_external_id("L7").await.unwrap().unwrap();
    assert_eq!(p.name.as_deref(), Some("Casa Verde"));

    let status = h
        .deliver_and_process(
            &event("client.created", json!({"_id": "C7", "name": "Bia", "phone": "+55 11 99999-0000"})),
            "evt-2",
        )
        .await;
    assert_eq!(status, WebhookEventStatus::Processed);
    let g = h.store.get_guest_by_external_id("C7").await.unwrap().unwrap();
    assert_eq!(g.name.as_deref(), Some("Bia"));
}

#[tokio::test]
async fn reservation_for_unknown_listing_imports_it_first() {
    let h = harness(16, None).await;
    h.fake
        .listings
        .lock()
        .unwrap()
        .push(json!({"_id": "L1", "internalName": "Casa Azul", "amenities": ["wifi"]}));

    let status = h
        .deliver_and_process(&event("reservation.created", r1_booked()), "evt-1")
        .await;
    assert_eq!(status, WebhookEventStatus::Processed);
    let listing = h.store.get_property_by_external_id("L1").await.unwrap().unwrap();
    assert_eq!(listing.name.as_deref(), Some("Casa Azul"));
    let r1 = h.store.get_reservation_by_external_id("R1").await.unwrap().unwrap();
    assert_eq!(r1.property_ref, listing.internal_id);
    assert_eq!(h.fake.listing_lookups.load(Ordering::SeqCst), 1);

    // Known listings are not fetched again.
    let mut r2 = r1_booked();
    r2["_id"] = json!("R2");
    r2["checkInDate"] = json!("2025-03-01");
    r2["checkOutDate"] = json!("2025-03-04");
    h.deliver_and_process(&event("reservation.created", r2), "evt-2").await;
    assert_eq!(h.fake.listing_lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_listing_lookup_falls_back_to_placeholder() {
    let h = harness(16, None).await;
    h.fake.script_lookup("L1", Lookup::Transient);

    let status = h
        .deliver_and_process(&event("reservation.created", r1_booked()), "evt-1")
        .await;
    assert_eq!(status, WebhookEventStatus::Processed);
    let listing = h.store.get_property_by_external_id("L1").await.unwrap().unwrap();
    assert!(listing.name.is_none());
    assert_eq!(h.fake.listing_lookups.load(Ordering::SeqCst), 1);
    assert!(h.store.get_reservation_by_external_id("R1").await.unwrap().is_some());
}

#[tokio::test]
async fn full_queue_leaves_event_pending_for_sweep() {
    let h = harness(1, None).await;
    let a = h
        .ingress
        .receive(delivery(&event("reservation.created", r1_booked()), Some("evt-1")))
        .await
        .unwrap();
    let mut second = r1_booked();
    second["_id"] = json!("R2");
    second["_idlisting"] = json!("L2");
    let b = h
        .ingress
        .receive(delivery(&event("reservation.created", second), Some("evt-2")))
        .await
        .unwrap();
    assert!(matches!(a, IngressOutcome::Accepted { .. }));
    assert!(matches!(b, IngressOutcome::Accepted { .. }));
    assert_eq!(h.rx.len(), 1);

    let first = h.rx.recv_async().await.unwrap();
    h.sync.process_event(first).await.unwrap();
    let queued = h.sync.sweep_backlog(&h.tx).await.unwrap();
    assert_eq!(queued, 1);
    let left = h.rx.recv_async().await.unwrap();
    h.sync.process_event(left).await.unwrap();
    assert!(h.store.get_reservation_by_external_id("R2").await.unwrap().is_some());
}

#[tokio::test]
async fn workers_drain_queue_and_stop_on_shutdown() {
    let h = harness(16, None).await;
    let mut shutdown = ShutdownSignal::new();
    let handles = spawn_workers(h.sync.clone(), h.rx.clone(), 2, &shutdown);

    h.ingress
        .receive(delivery(&event("reservation.created", r1_booked()), Some("evt-1")))
        .await
        .unwrap();

    let mut applied = false;
    for _ in 0..100 {
        if h.store.get_reservation_by_external_id("R1").await.unwrap().is_some() {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(applied, "worker never applied the event");

    shutdown.trigger();
    assert!(shutdown.wait_for_drain(2, Duration::from_secs(2)).await.is_complete());
    for handle in handles {
        handle.await.unwrap();
    }
}
