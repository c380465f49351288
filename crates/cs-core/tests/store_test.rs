use chrono::NaiveDate;
use cs_core::calendar;
use cs_core::config::DateType;
use cs_core::store::{Store, StoreError};
use cs_core::types::*;
use serde_json::json;
use uuid::Uuid;

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn booking(id: &str, listing: &str, check_in: &str, check_out: &str) -> ReservationPatch {
    ReservationPatch {
        property_external_id: Some(listing.into()),
        guest_external_id: Some("C1".into()),
        check_in: Some(d(check_in)),
        check_out: Some(d(check_out)),
        status: Some(ReservationStatus::Confirmed),
        channel: Some(Channel::Airbnb),
        price: Some(Price {
            amount_minor: 150_000,
            currency: "BRL".into(),
        }),
        raw_payload: Some(json!({"_id": id, "type": "booked", "_idlisting": listing})),
        ..ReservationPatch::new(id)
    }
}

fn absent_permit(id: &str) -> TransitionPermit {
    TransitionPermit::issue(
        id,
        ReservationStatus::Cancelled,
        Some(CancellationReason::VerifiedAbsent),
    )
}

#[tokio::test]
async fn reservation_create_writes_block_and_placeholder_property() {
    let store = Store::new_in_memory().await.unwrap();
    let out = store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();
    assert!(out.created);
    assert_eq!(out.entity.status, ReservationStatus::Confirmed);

    let property = store
        .get_property_by_external_id("L1")
        .await
        .unwrap()
        .expect("placeholder property");
    assert_eq!(property.internal_id, out.entity.property_ref);

    let blocks = store.blocks_for_property(property.internal_id).await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].source_reservation_ref, out.entity.internal_id);
    assert_eq!(blocks[0].date_range, out.entity.stay());
}

#[tokio::test]
async fn same_idempotency_key_applies_once() {
    let store = Store::new_in_memory().await.unwrap();
    let patch = booking("R1", "L1", "2025-02-01", "2025-02-05");

    let first = store
        .upsert_reservation(patch.clone(), Some("evt-1"), None)
        .await
        .unwrap();
    assert!(first.created);
    assert!(!first.replayed);

    let second = store
        .upsert_reservation(patch, Some("evt-1"), None)
        .await
        .unwrap();
    assert!(second.replayed);
    assert!(!second.changed);
    assert_eq!(second.entity.internal_id, first.entity.internal_id);
    assert_eq!(second.entity.version, 1);

    assert_eq!(store.count_change_log().await.unwrap(), 1);
}

#[tokio::test]
async fn partial_patch_does_not_blank_existing_fields() {
    let store = Store::new_in_memory().await.unwrap();
    store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();

    let patch = ReservationPatch {
        check_out: Some(d("2025-02-06")),
        raw_payload: Some(json!({"checkOutDate": "2025-02-06"})),
        ..ReservationPatch::new("R1")
    };
    let out = store.upsert_reservation(patch, None, None).await.unwrap();
    assert!(out.changed);
    assert_eq!(out.entity.version, 2);
    assert_eq!(out.entity.check_in, d("2025-02-01"));
    assert_eq!(out.entity.check_out, d("2025-02-06"));
    assert_eq!(out.entity.guest_external_id.as_deref(), Some("C1"));
    assert_eq!(out.entity.channel, Channel::Airbnb);
    assert_eq!(out.entity.price.as_ref().map(|p| p.amount_minor), Some(150_000));
    assert_eq!(out.entity.raw_origin_payload["type"], "booked");
    assert_eq!(out.entity.raw_origin_payload["checkOutDate"], "2025-02-06");

    let blocks = store.blocks_for_property(out.entity.property_ref).await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].date_range.end, d("2025-02-06"));
}

#[tokio::test]
async fn unchanged_patch_is_not_a_mutation() {
    let store = Store::new_in_memory().await.unwrap();
    store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();
    let out = store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();
    assert!(!out.changed);
    assert_eq!(out.entity.version, 1);
    assert_eq!(store.count_change_log().await.unwrap(), 1);
}

#[tokio::test]
async fn cancellation_without_permit_is_refused() {
    let store = Store::new_in_memory().await.unwrap();
    store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();

    let err = store
        .upsert_reservation(
            ReservationPatch::status_only("R1", ReservationStatus::Cancelled),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::CancellationRequiresVerification { .. }
    ));

    let r = store.get_reservation_by_external_id("R1").await.unwrap().unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(store.blocks_for_property(r.property_ref).await.unwrap().len(), 1);
}

#[tokio::test]
async fn permit_for_another_reservation_does_not_apply() {
    let store = Store::new_in_memory().await.unwrap();
    store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();
    let err = store
        .upsert_reservation(
            ReservationPatch::status_only("R1", ReservationStatus::Cancelled),
            None,
            Some(&absent_permit("R2")),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::CancellationRequiresVerification { .. }
    ));
}

#[tokio::test]
async fn permitted_cancellation_releases_block_atomically() {
    let store = Store::new_in_memory().await.unwrap();
    let created = store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();

    let out = store
        .upsert_reservation(
            ReservationPatch::status_only("R1", ReservationStatus::Cancelled),
            Some("reconcile:R1"),
            Some(&absent_permit("R1")),
        )
        .await
        .unwrap();
    assert_eq!(out.entity.status, ReservationStatus::Cancelled);
    assert_eq!(
        out.entity.cancellation_reason,
        Some(CancellationReason::VerifiedAbsent)
    );
    assert!(out.entity.cancelled_at.is_some());
    assert!(store
        .blocks_for_property(created.entity.property_ref)
        .await
        .unwrap()
        .is_empty());

    let log = store.change_log_for(created.entity.internal_id).await.unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().any(|e| e.idempotency_key == "reconcile:R1"));
}

#[tokio::test]
async fn booked_to_canceled_round_trip_restores_block() {
    // Confirmed, then reported cancelled by the source, then restored.
    let store = Store::new_in_memory().await.unwrap();
    let created = store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();

    let remote_cancel = TransitionPermit::issue(
        "R1",
        ReservationStatus::Cancelled,
        Some(CancellationReason::RemoteCancelled),
    );
    store
        .upsert_reservation(
            ReservationPatch {
                raw_payload: Some(json!({"type": "canceled"})),
                ..ReservationPatch::status_only("R1", ReservationStatus::Cancelled)
            },
            None,
            Some(&remote_cancel),
        )
        .await
        .unwrap();

    let cancelled = store
        .list_cancelled_by_reason(&[CancellationReason::RemoteCancelled])
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);

    let restored = store
        .restore_reservation(
            ReservationPatch::status_only("R1", ReservationStatus::Confirmed),
            None,
        )
        .await
        .unwrap();
    assert!(restored.changed);
    assert_eq!(restored.entity.status, ReservationStatus::Confirmed);
    assert!(restored.entity.cancelled_at.is_none());
    assert!(restored.entity.cancellation_reason.is_none());
    assert_eq!(
        store
            .blocks_for_property(created.entity.property_ref)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn restore_of_active_reservation_is_a_no_op() {
    let store = Store::new_in_memory().await.unwrap();
    store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();
    let out = store
        .restore_reservation(
            ReservationPatch::status_only("R1", ReservationStatus::Pending),
            None,
        )
        .await
        .unwrap();
    assert!(!out.changed);
    assert_eq!(out.entity.status, ReservationStatus::Confirmed);

    let missing = store
        .restore_reservation(
            ReservationPatch::status_only("R404", ReservationStatus::Confirmed),
            None,
        )
        .await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn overlapping_occupying_stays_are_rejected() {
    let store = Store::new_in_memory().await.unwrap();
    store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();

    let err = store
        .upsert_reservation(booking("R2", "L1", "2025-02-04", "2025-02-07"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CalendarOverlap { .. }), "{err}");
    assert!(store.get_reservation_by_external_id("R2").await.unwrap().is_none());

    // Back-to-back stays share the boundary day.
    store
        .upsert_reservation(booking("R3", "L1", "2025-02-05", "2025-02-07"), None, None)
        .await
        .unwrap();
    // A different property is unaffected.
    store
        .upsert_reservation(booking("R4", "L2", "2025-02-02", "2025-02-03"), None, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn blocks_match_occupying_reservations_after_mixed_changes() {
    let store = Store::new_in_memory().await.unwrap();
    let r1 = store
        .upsert_reservation(booking("R1", "L1", "2025-03-01", "2025-03-04"), None, None)
        .await
        .unwrap();
    store
        .upsert_reservation(
            ReservationPatch {
                status: Some(ReservationStatus::Pending),
                ..booking("R2", "L1", "2025-03-10", "2025-03-12")
            },
            None,
            None,
        )
        .await
        .unwrap();
    store
        .upsert_reservation(booking("R3", "L1", "2025-03-20", "2025-03-25"), None, None)
        .await
        .unwrap();
    store
        .upsert_reservation(
            ReservationPatch::status_only("R2", ReservationStatus::Confirmed),
            None,
            None,
        )
        .await
        .unwrap();
    store
        .upsert_reservation(
            ReservationPatch::status_only("R3", ReservationStatus::Cancelled),
            None,
            Some(&absent_permit("R3")),
        )
        .await
        .unwrap();

    let property_ref = r1.entity.property_ref;
    let reservations = store.list_reservations_for_property(property_ref).await.unwrap();
    let blocks = store.blocks_for_property(property_ref).await.unwrap();

    let mut expected: Vec<_> = reservations
        .iter()
        .filter(|r| r.status.is_occupying())
        .map(|r| (r.internal_id, r.stay()))
        .collect();
    let mut actual: Vec<_> = blocks
        .iter()
        .map(|b| (b.source_reservation_ref, b.date_range))
        .collect();
    expected.sort_by_key(|(_, r)| r.start);
    actual.sort_by_key(|(_, r)| r.start);
    assert_eq!(actual, expected);
    assert_eq!(actual.len(), 2);

    let ranges: Vec<_> = blocks.iter().map(|b| b.date_range).collect();
    assert!(calendar::non_overlapping(&ranges));
}

#[tokio::test]
async fn create_needs_dates_property_and_status() {
    let store = Store::new_in_memory().await.unwrap();
    let err = store
        .upsert_reservation(
            ReservationPatch::status_only("R9", ReservationStatus::Confirmed),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Incomplete { field: "property", .. }));

    let err = store
        .upsert_reservation(booking("R9", "L1", "2025-02-05", "2025-02-05"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRange { .. }));
}

#[tokio::test]
async fn reservation_first_seen_cancelled_has_no_block() {
    let store = Store::new_in_memory().await.unwrap();
    let out = store
        .upsert_reservation(
            ReservationPatch {
                status: Some(ReservationStatus::Cancelled),
                ..booking("R1", "L1", "2025-02-01", "2025-02-05")
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert!(out.created);
    assert_eq!(
        out.entity.cancellation_reason,
        Some(CancellationReason::RemoteCancelled)
    );
    assert!(store
        .blocks_for_property(out.entity.property_ref)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn guest_is_linked_when_imported_after_reservation() {
    let store = Store::new_in_memory().await.unwrap();
    let r = store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();
    assert!(r.entity.guest_ref.is_none());

    let guest = store
        .upsert_guest(
            GuestPatch {
                name: Some("Ana Souza".into()),
                ..GuestPatch::new("C1")
            },
            None,
        )
        .await
        .unwrap();

    let again = store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();
    assert_eq!(again.entity.guest_ref, Some(guest.entity.internal_id));
}

#[tokio::test]
async fn guest_matches_local_record_by_contact() {
    let store = Store::new_in_memory().await.unwrap();
    let local = store
        .insert_local_guest(
            Some("Ana".into()),
            ContactInfo {
                email: Some("Ana@Example.com".into()),
                phone: None,
            },
        )
        .await
        .unwrap();

    let out = store
        .upsert_guest(
            GuestPatch {
                email: Some(" ana@example.COM".into()),
                phone: Some("+55 11 98888-7777".into()),
                ..GuestPatch::new("C1")
            },
            None,
        )
        .await
        .unwrap();
    assert!(!out.created);
    assert_eq!(out.entity.internal_id, local.internal_id);
    assert_eq!(out.entity.external_id.as_deref(), Some("C1"));
    assert_eq!(out.entity.name.as_deref(), Some("Ana"));

    // A guest that already belongs to another external id is never taken over.
    let other = store
        .upsert_guest(
            GuestPatch {
                email: Some("ana@example.com".into()),
                ..GuestPatch::new("C2")
            },
            None,
        )
        .await
        .unwrap();
    assert!(other.created);
    assert_ne!(other.entity.internal_id, local.internal_id);
}

#[tokio::test]
async fn property_upsert_merges() {
    let store = Store::new_in_memory().await.unwrap();
    let first = store
        .upsert_property(
            PropertyPatch {
                name: Some("Apto Copacabana".into()),
                amenities: Some(vec!["wifi".into()]),
                ..PropertyPatch::new("L1")
            },
            None,
        )
        .await
        .unwrap();
    assert!(first.created);

    let second = store
        .upsert_property(
            PropertyPatch {
                address: Some(json!({"city": "Rio de Janeiro"})),
                ..PropertyPatch::new("L1")
            },
            None,
        )
        .await
        .unwrap();
    assert!(second.changed);
    assert_eq!(second.entity.name.as_deref(), Some("Apto Copacabana"));
    assert_eq!(second.entity.amenities, vec!["wifi".to_string()]);
    assert_eq!(second.entity.version, 2);
}

#[tokio::test]
async fn active_ids_follow_window_and_date_type() {
    let store = Store::new_in_memory().await.unwrap();
    store
        .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
        .await
        .unwrap();
    store
        .upsert_reservation(booking("R2", "L1", "2025-04-01", "2025-04-05"), None, None)
        .await
        .unwrap();
    store
        .upsert_reservation(
            ReservationPatch {
                status: Some(ReservationStatus::Cancelled),
                ..booking("R3", "L2", "2025-02-10", "2025-02-12")
            },
            None,
            None,
        )
        .await
        .unwrap();

    let window = DateRange::new(d("2025-01-15"), d("2025-03-01")).unwrap();
    let ids = store
        .list_active_reservation_ids(window, DateType::Arrival)
        .await
        .unwrap();
    assert_eq!(ids, vec!["R1".to_string()]);

    let by_departure = store
        .list_active_reservation_ids(
            DateRange::new(d("2025-04-05"), d("2025-04-06")).unwrap(),
            DateType::Departure,
        )
        .await
        .unwrap();
    assert_eq!(by_departure, vec!["R2".to_string()]);
}

#[tokio::test]
async fn creation_window_uses_channel_booking_date() {
    let store = Store::new_in_memory().await.unwrap();
    store
        .upsert_reservation(
            ReservationPatch {
                booked_on: Some(d("2025-01-10")),
                ..booking("R1", "L1", "2025-06-01", "2025-06-05")
            },
            None,
            None,
        )
        .await
        .unwrap();
    store
        .upsert_reservation(
            ReservationPatch {
                booked_on: Some(d("2024-11-20")),
                ..booking("R2", "L1", "2025-06-10", "2025-06-12")
            },
            None,
            None,
        )
        .await
        .unwrap();
    // No booking date from the channel: the local import day stands in.
    store
        .upsert_reservation(booking("R3", "L1", "2025-07-01", "2025-07-03"), None, None)
        .await
        .unwrap();

    let january = DateRange::new(d("2025-01-01"), d("2025-02-01")).unwrap();
    let ids = store
        .list_active_reservation_ids(january, DateType::Creation)
        .await
        .unwrap();
    assert_eq!(ids, vec!["R1".to_string()]);

    let today = chrono::Utc::now().date_naive();
    let around_today = DateRange::new(today, today.succ_opt().unwrap()).unwrap();
    let ids = store
        .list_active_reservation_ids(around_today, DateType::Creation)
        .await
        .unwrap();
    assert_eq!(ids, vec!["R3".to_string()]);

    let stored = store.get_reservation_by_external_id("R2").await.unwrap().unwrap();
    assert_eq!(stored.booked_on, Some(d("2024-11-20")));
}

#[tokio::test]
async fn webhook_events_dedup_and_status() {
    let store = Store::new_in_memory().await.unwrap();
    let event = WebhookEvent {
        id: Uuid::new_v4(),
        dedup_key: "evt-1".into(),
        source_event_id: Some("evt-1".into()),
        action: Some("reservation.modified".into()),
        entity_kind: Some(EntityKind::Reservation),
        external_id: Some("R1".into()),
        raw_body: r#"{"action":"reservation.modified"}"#.into(),
        status: WebhookEventStatus::Pending,
        error: None,
        received_at: chrono::Utc::now(),
        processed_at: None,
    };
    assert!(store.insert_webhook_event(&event).await.unwrap());

    let dup = WebhookEvent {
        id: Uuid::new_v4(),
        ..event.clone()
    };
    assert!(!store.insert_webhook_event(&dup).await.unwrap());

    let pending = store
        .list_webhook_events(WebhookEventStatus::Pending, 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    store
        .mark_webhook_event(event.id, WebhookEventStatus::Failed, Some("boom".into()))
        .await
        .unwrap();
    let stored = store.get_webhook_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WebhookEventStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("boom"));
    assert!(stored.processed_at.is_some());
}

#[tokio::test]
async fn runs_and_cursors_persist() {
    let store = Store::new_in_memory().await.unwrap();
    let mut run = ReconciliationRun::start(RunMode::Full, false);
    store.save_run(&run).await.unwrap();

    run.status = RunStatus::Partial;
    run.stats.reservations.skipped_as_unverified = 1;
    run.errors.push("R1: lookup failed".into());
    run.finished_at = Some(chrono::Utc::now());
    store.save_run(&run).await.unwrap();

    let loaded = store.get_run(run.run_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, RunStatus::Partial);
    assert_eq!(loaded.stats.reservations.skipped_as_unverified, 1);
    assert_eq!(loaded.errors.len(), 1);
    assert_eq!(store.list_runs(10).await.unwrap().len(), 1);

    assert_eq!(store.get_cursor("reservations:w").await.unwrap(), None);
    store.set_cursor("reservations:w", 40).await.unwrap();
    store.set_cursor("reservations:w", 60).await.unwrap();
    assert_eq!(store.get_cursor("reservations:w").await.unwrap(), Some(60));
    store.clear_cursor("reservations:w").await.unwrap();
    assert_eq!(store.get_cursor("reservations:w").await.unwrap(), None);
}

#[tokio::test]
async fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    {
        let store = Store::new(&path).await.unwrap();
        store
            .upsert_reservation(booking("R1", "L1", "2025-02-01", "2025-02-05"), None, None)
            .await
            .unwrap();
    }
    let store = Store::new(&path).await.unwrap();
    let r = store.get_reservation_by_external_id("R1").await.unwrap();
    assert!(r.is_some());
}
