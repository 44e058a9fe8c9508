use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;

use quotedesk_core::{
    Actor, ApplicationError, AuditAction, AuditFilter, Capability, Clock, DomainError, ErrorKind,
    ListParams, ManualClock, NewQuote, NewQuoteItem, Quote, QuoteItemPatch, QuoteService,
    QuoteStatus, QuoteStore, ServiceSettings, TransitionRejection, SYSTEM_ACTOR_ID,
};
use quotedesk_db::{connect_with_settings, migrations, InMemoryQuoteStore, SqlQuoteStore};

type MemoryService = QuoteService<InMemoryQuoteStore, ManualClock>;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).single().expect("valid start time")
}

fn freelancer() -> Actor {
    Actor::new("u-freelancer", "freelancer", [Capability::Read, Capability::Write])
        .with_origin(Some("10.0.0.8".to_string()), Some("quotedesk-tests".to_string()))
}

fn client() -> Actor {
    Actor::new("u-client", "client", [Capability::Read, Capability::Approve])
}

fn admin() -> Actor {
    Actor::new("u-admin", "admin", [Capability::Read, Capability::Write, Capability::Approve])
}

fn design_item() -> NewQuoteItem {
    NewQuoteItem {
        description: "Brand design".to_string(),
        quantity: Decimal::new(2, 0),
        unit_price: Decimal::new(100, 0),
        discount: Some(Decimal::new(1, 1)),
        tax: Some(Decimal::new(2, 1)),
        service_id: Some("svc-design".to_string()),
    }
}

fn hosting_item() -> NewQuoteItem {
    NewQuoteItem {
        description: "Hosting".to_string(),
        quantity: Decimal::ONE,
        unit_price: Decimal::new(1999, 2),
        ..NewQuoteItem::default()
    }
}

fn new_quote(now: DateTime<Utc>, valid_for: Duration, items: Vec<NewQuoteItem>) -> NewQuote {
    NewQuote {
        contact_id: "contact-42".to_string(),
        freelancer_id: "u-freelancer".to_string(),
        valid_until: now + valid_for,
        notes: Some("Spring rebrand".to_string()),
        folder: Some("2026".to_string()),
        items,
    }
}

fn memory_service(
    settings: ServiceSettings,
) -> (Arc<InMemoryQuoteStore>, Arc<ManualClock>, MemoryService) {
    let store = Arc::new(InMemoryQuoteStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let service = QuoteService::new(Arc::clone(&store), Arc::clone(&clock), settings);
    (store, clock, service)
}

async fn quote_in(service: &MemoryService, clock: &ManualClock, status: QuoteStatus) -> Quote {
    let valid_for =
        if status == QuoteStatus::Expired { Duration::hours(1) } else { Duration::days(30) };
    let quote = service
        .create_quote(&freelancer(), new_quote(clock.now(), valid_for, vec![design_item()]))
        .await
        .expect("create quote");

    match status {
        QuoteStatus::Draft => quote,
        QuoteStatus::Expired => {
            clock.advance(Duration::hours(2));
            service.expire_quote(&quote.id).await.expect("expire")
        }
        QuoteStatus::Pending | QuoteStatus::Accepted | QuoteStatus::Rejected => {
            let pending = service
                .transition(&freelancer(), &quote.id, QuoteStatus::Pending, None)
                .await
                .expect("submit");
            if status == QuoteStatus::Pending {
                return pending;
            }
            service.transition(&admin(), &quote.id, status, None).await.expect("decide")
        }
    }
}

#[tokio::test]
async fn priced_quote_moves_through_submission_and_approval() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());

    let quote = service
        .create_quote(&freelancer(), new_quote(clock.now(), Duration::days(14), vec![design_item()]))
        .await
        .expect("create quote");
    assert_eq!(quote.total_amount().expect("total").to_string(), "216.00");

    let pending = service
        .transition(&freelancer(), &quote.id, QuoteStatus::Pending, Some(quote.version))
        .await
        .expect("submit");
    assert_eq!(pending.status, QuoteStatus::Pending);

    let error = service
        .transition(&freelancer(), &quote.id, QuoteStatus::Accepted, None)
        .await
        .expect_err("freelancer cannot approve");
    match error {
        ApplicationError::Domain(DomainError::InvalidQuoteTransition { reason, .. }) => {
            assert_eq!(reason, TransitionRejection::MissingCapability(Capability::Approve));
            assert!(reason.is_authorization());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let accepted = service
        .transition(&client(), &quote.id, QuoteStatus::Accepted, None)
        .await
        .expect("client approves");
    assert_eq!(accepted.status, QuoteStatus::Accepted);
    assert_eq!(accepted.version, 3);
}

#[tokio::test]
async fn empty_draft_cannot_be_submitted() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());
    let quote = service
        .create_quote(&freelancer(), new_quote(clock.now(), Duration::days(14), Vec::new()))
        .await
        .expect("create quote");

    let error = service
        .transition(&freelancer(), &quote.id, QuoteStatus::Pending, None)
        .await
        .expect_err("no items");
    assert!(matches!(
        error,
        ApplicationError::Domain(DomainError::InvalidQuoteTransition {
            reason: TransitionRejection::NoItems,
            ..
        })
    ));
}

#[tokio::test]
async fn item_mutations_on_terminal_quotes_leave_them_untouched() {
    let (store, clock, service) = memory_service(ServiceSettings::default());

    for status in [QuoteStatus::Accepted, QuoteStatus::Rejected, QuoteStatus::Expired] {
        let quote = quote_in(&service, &clock, status).await;
        let item_id = quote.items[0].id.clone();
        let audit_before = store.audit_len().await;

        let added = service.add_item(&admin(), &quote.id, hosting_item(), None).await;
        let patched = service
            .update_item(
                &admin(),
                &quote.id,
                &item_id,
                QuoteItemPatch { quantity: Some(Decimal::TEN), ..QuoteItemPatch::default() },
                None,
            )
            .await;
        let removed = service.remove_item(&admin(), &quote.id, &item_id, None).await;

        assert_eq!(added.expect_err("locked").kind(), ErrorKind::QuoteLocked);
        assert_eq!(patched.expect_err("locked").kind(), ErrorKind::QuoteLocked);
        assert_eq!(removed.expect_err("locked").kind(), ErrorKind::QuoteLocked);

        let stored = store.load_quote(&quote.id).await.expect("load").expect("present");
        assert_eq!(stored, quote, "{status} quote must be unchanged");
        assert_eq!(store.audit_len().await, audit_before);
    }
}

#[tokio::test]
async fn each_table_transition_commits_exactly_one_audit_record() {
    let (store, clock, service) = memory_service(ServiceSettings::default());

    let draft = quote_in(&service, &clock, QuoteStatus::Draft).await;
    let before = store.audit_len().await;
    service.transition(&freelancer(), &draft.id, QuoteStatus::Pending, None).await.expect("submit");
    assert_eq!(store.audit_len().await, before + 1);

    for decision in [QuoteStatus::Accepted, QuoteStatus::Rejected] {
        let pending = quote_in(&service, &clock, QuoteStatus::Pending).await;
        let before = store.audit_len().await;
        service.transition(&admin(), &pending.id, decision, None).await.expect("decide");
        assert_eq!(store.audit_len().await, before + 1);
    }

    let due_draft = service
        .create_quote(&freelancer(), new_quote(clock.now(), Duration::hours(1), vec![design_item()]))
        .await
        .expect("create");
    let due_pending = service
        .create_quote(&freelancer(), new_quote(clock.now(), Duration::hours(1), vec![design_item()]))
        .await
        .expect("create");
    service
        .transition(&freelancer(), &due_pending.id, QuoteStatus::Pending, None)
        .await
        .expect("submit");
    clock.advance(Duration::hours(2));

    for id in [&due_draft.id, &due_pending.id] {
        let before = store.audit_len().await;
        let expired = service.expire_quote(id).await.expect("expire");
        assert_eq!(expired.status, QuoteStatus::Expired);
        assert_eq!(store.audit_len().await, before + 1);
    }
}

#[tokio::test]
async fn transitions_outside_the_table_are_rejected() {
    let (store, clock, service) = memory_service(ServiceSettings::default());

    for from in QuoteStatus::ALL {
        for to in QuoteStatus::ALL {
            let in_table = matches!(
                (from, to),
                (QuoteStatus::Draft, QuoteStatus::Pending)
                    | (QuoteStatus::Pending, QuoteStatus::Accepted)
                    | (QuoteStatus::Pending, QuoteStatus::Rejected)
                    | (QuoteStatus::Draft, QuoteStatus::Expired)
                    | (QuoteStatus::Pending, QuoteStatus::Expired)
            );
            if in_table {
                continue;
            }

            let quote = quote_in(&service, &clock, from).await;
            let error = service
                .transition(&admin(), &quote.id, to, None)
                .await
                .expect_err("outside the table");
            assert_eq!(error.kind(), ErrorKind::InvalidTransition, "{from} -> {to}");

            let stored = store.load_quote(&quote.id).await.expect("load").expect("present");
            assert_eq!(stored, quote);
        }
    }
}

#[tokio::test]
async fn actors_cannot_expire_and_early_expiry_is_refused() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());
    let quote = quote_in(&service, &clock, QuoteStatus::Pending).await;

    let by_actor = service
        .transition(&admin(), &quote.id, QuoteStatus::Expired, None)
        .await
        .expect_err("system only");
    assert!(matches!(
        by_actor,
        ApplicationError::Domain(DomainError::InvalidQuoteTransition {
            reason: TransitionRejection::SystemOnly,
            ..
        })
    ));

    let early = service.expire_quote(&quote.id).await.expect_err("not yet due");
    assert!(matches!(
        early,
        ApplicationError::Domain(DomainError::InvalidQuoteTransition {
            reason: TransitionRejection::NotYetDue,
            ..
        })
    ));
}

#[tokio::test]
async fn expiry_sweep_expires_only_overdue_open_quotes() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());
    let now = clock.now();

    let soon_draft = service
        .create_quote(&freelancer(), new_quote(now, Duration::days(1), vec![design_item()]))
        .await
        .expect("create");
    let soon_pending = service
        .create_quote(&freelancer(), new_quote(now, Duration::days(1), vec![design_item()]))
        .await
        .expect("create");
    service
        .transition(&freelancer(), &soon_pending.id, QuoteStatus::Pending, None)
        .await
        .expect("submit");
    let later = service
        .create_quote(&freelancer(), new_quote(now, Duration::days(10), vec![design_item()]))
        .await
        .expect("create");
    let empty_draft = service
        .create_quote(&freelancer(), new_quote(now, Duration::days(1), Vec::new()))
        .await
        .expect("create");

    clock.advance(Duration::days(2));
    let sweep = service.expire_overdue().await.expect("sweep");

    assert_eq!(sweep.expired.len(), 2);
    assert!(sweep.failed.is_empty());
    assert!(sweep.expired.contains(&soon_draft.id));
    assert!(sweep.expired.contains(&soon_pending.id));
    let untouched = service.get_quote(&freelancer(), &later.id).await.expect("get");
    assert_eq!(untouched.status, QuoteStatus::Draft);
    assert!(!sweep.expired.contains(&empty_draft.id));
    let empty = service.get_quote(&freelancer(), &empty_draft.id).await.expect("get");
    assert_eq!(empty.status, QuoteStatus::Draft);

    let error = service.expire_quote(&empty_draft.id).await.expect_err("empty draft");
    assert!(matches!(
        error,
        ApplicationError::Domain(DomainError::InvalidQuoteTransition {
            reason: TransitionRejection::NoItems,
            ..
        })
    ));

    let expiries = service
        .query_audit(
            &freelancer(),
            AuditFilter { action: Some(AuditAction::Expire), ..AuditFilter::default() },
        )
        .expect("cursor")
        .collect_all()
        .await
        .expect("collect");
    assert_eq!(expiries.len(), 2);
    assert!(expiries.iter().all(|log| log.actor_id.as_deref() == Some(SYSTEM_ACTOR_ID)));

    let again = service.expire_overdue().await.expect("second sweep");
    assert!(again.expired.is_empty());
    assert!(again.failed.is_empty());
}

#[tokio::test]
async fn replayed_record_calls_produce_distinct_entries() {
    let (store, _clock, service) = memory_service(ServiceSettings::default());
    let actor = freelancer();

    let first = service
        .audit()
        .record(&actor, AuditAction::Read, "quotes", "Viewed quote list", None)
        .await
        .expect("first record");
    let second = service
        .audit()
        .record(&actor, AuditAction::Read, "quotes", "Viewed quote list", None)
        .await
        .expect("second record");

    assert_ne!(first.id, second.id);
    assert!(second.timestamp > first.timestamp);
    assert_eq!(first.ip_address.as_deref(), Some("10.0.0.8"));
    assert_eq!(store.audit_len().await, 2);
}

#[tokio::test]
async fn audit_failure_rolls_back_the_mutation() {
    let (store, clock, service) = memory_service(ServiceSettings::default());
    let quote = quote_in(&service, &clock, QuoteStatus::Draft).await;

    store.fail_audit_writes(true);
    let error = service
        .add_item(&freelancer(), &quote.id, hosting_item(), None)
        .await
        .expect_err("audit unavailable");
    assert_eq!(error.kind(), ErrorKind::AuditWrite);
    assert!(error.is_retryable());

    let stored = store.load_quote(&quote.id).await.expect("load").expect("present");
    assert_eq!(stored, quote);

    store.fail_audit_writes(false);
    let (updated, _item_id) =
        service.add_item(&freelancer(), &quote.id, hosting_item(), None).await.expect("retry");
    assert_eq!(updated.items.len(), 2);
}

#[tokio::test]
async fn stale_expected_version_is_a_concurrent_modification() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());
    let quote = quote_in(&service, &clock, QuoteStatus::Draft).await;

    service
        .add_item(&freelancer(), &quote.id, hosting_item(), Some(quote.version))
        .await
        .expect("first writer wins");

    let error = service
        .add_item(&freelancer(), &quote.id, hosting_item(), Some(quote.version))
        .await
        .expect_err("second writer is stale");
    assert!(matches!(
        error,
        ApplicationError::ConcurrentModification { expected: 1, actual: 2, .. }
    ));
    assert!(error.is_retryable());
}

#[tokio::test]
async fn interleaved_writers_without_pinned_versions_both_land() {
    let store = Arc::new(InMemoryQuoteStore::new().with_latency(StdDuration::from_millis(5)));
    let clock = Arc::new(ManualClock::new(start()));
    let service = QuoteService::new(Arc::clone(&store), Arc::clone(&clock), ServiceSettings::default());
    let quote = quote_in(&service, &clock, QuoteStatus::Draft).await;

    let actor = freelancer();
    let (left, right) = tokio::join!(
        service.add_item(&actor, &quote.id, hosting_item(), None),
        service.add_item(&actor, &quote.id, hosting_item(), None),
    );
    left.expect("left writer");
    right.expect("right writer");

    let stored = store.load_quote(&quote.id).await.expect("load").expect("present");
    assert_eq!(stored.items.len(), 3);
    assert_eq!(stored.version, 3);
}

#[tokio::test]
async fn slow_store_surfaces_a_retryable_timeout() {
    let store = Arc::new(InMemoryQuoteStore::new().with_latency(StdDuration::from_millis(200)));
    let clock = Arc::new(ManualClock::new(start()));
    let patient = QuoteService::new(Arc::clone(&store), Arc::clone(&clock), ServiceSettings::default());
    let hasty = QuoteService::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        ServiceSettings { store_timeout: StdDuration::from_millis(20), ..ServiceSettings::default() },
    );

    let quote = quote_in(&patient, &clock, QuoteStatus::Draft).await;

    let error = hasty
        .add_item(&freelancer(), &quote.id, hosting_item(), None)
        .await
        .expect_err("store too slow");
    assert!(matches!(error, ApplicationError::StoreTimeout { timeout_ms: 20, .. }));
    assert!(error.is_retryable());

    let stored = patient.get_quote(&freelancer(), &quote.id).await.expect("get");
    assert_eq!(stored, quote);
}

#[tokio::test]
async fn missing_capabilities_are_unauthorized() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());
    let quote = quote_in(&service, &clock, QuoteStatus::Draft).await;
    let viewer = Actor::new("u-viewer", "viewer", [Capability::Read]);
    let nobody = Actor::new("u-nobody", "guest", Vec::<Capability>::new());

    service.get_quote(&viewer, &quote.id).await.expect("viewer can read");

    let write = service.add_item(&viewer, &quote.id, hosting_item(), None).await;
    assert_eq!(write.expect_err("read only").kind(), ErrorKind::Unauthorized);

    let create = service
        .create_quote(&viewer, new_quote(clock.now(), Duration::days(3), Vec::new()))
        .await;
    assert_eq!(create.expect_err("read only").kind(), ErrorKind::Unauthorized);

    let list = service.list(&nobody, ListParams::new(1, 10)).await;
    assert_eq!(list.expect_err("no read").kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn deletion_is_limited_to_drafts() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());
    let pending = quote_in(&service, &clock, QuoteStatus::Pending).await;
    let draft = quote_in(&service, &clock, QuoteStatus::Draft).await;

    let locked = service.delete_quote(&freelancer(), &pending.id, None).await;
    assert_eq!(locked.expect_err("pending").kind(), ErrorKind::QuoteLocked);

    service.delete_quote(&freelancer(), &draft.id, None).await.expect("delete draft");
    let gone = service.get_quote(&freelancer(), &draft.id).await;
    assert_eq!(gone.expect_err("deleted").kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn pending_quote_keeps_its_last_item() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());
    let pending = quote_in(&service, &clock, QuoteStatus::Pending).await;

    let error = service
        .remove_item(&freelancer(), &pending.id, &pending.items[0].id, None)
        .await
        .expect_err("last item");
    assert_eq!(error.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn listing_pages_through_twenty_five_quotes() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());
    for _ in 0..25 {
        service
            .create_quote(&freelancer(), new_quote(clock.now(), Duration::days(5), Vec::new()))
            .await
            .expect("create");
        clock.advance(Duration::seconds(1));
    }
    let actor = freelancer();

    let first = service.list(&actor, ListParams::new(1, 10)).await.expect("page 1");
    assert_eq!(first.data.len(), 10);
    assert!(first.has_more);
    assert_eq!(first.total_count, 25);
    assert!(first.data.windows(2).all(|pair| pair[0].updated_at >= pair[1].updated_at));

    let third = service.list(&actor, ListParams::new(3, 10)).await.expect("page 3");
    assert_eq!(third.data.len(), 5);
    assert!(!third.has_more);

    let fourth = service.list(&actor, ListParams::new(4, 10)).await.expect("page 4");
    assert!(fourth.data.is_empty());
    assert!(!fourth.has_more);

    let oversized = service.list(&actor, ListParams::new(1, 10_000)).await;
    assert_eq!(oversized.expect_err("too large").kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn audit_cursor_streams_newest_first_in_batches() {
    let (_store, clock, service) = memory_service(ServiceSettings {
        audit_batch_size: 2,
        ..ServiceSettings::default()
    });
    let quote = quote_in(&service, &clock, QuoteStatus::Draft).await;
    let actor = freelancer();
    service.add_item(&actor, &quote.id, hosting_item(), None).await.expect("add");
    service.add_item(&actor, &quote.id, hosting_item(), None).await.expect("add");
    service.transition(&actor, &quote.id, QuoteStatus::Pending, None).await.expect("submit");

    let all = service
        .query_audit(&actor, AuditFilter::default())
        .expect("cursor")
        .collect_all()
        .await
        .expect("collect");
    assert_eq!(all.len(), 4);
    assert!(all.windows(2).all(|pair| pair[0].timestamp > pair[1].timestamp));
    assert_eq!(all[0].action, AuditAction::Update);
    assert_eq!(all[3].action, AuditAction::Create);

    let mut items_only = service
        .query_audit(
            &actor,
            AuditFilter {
                module: Some("quote_items".to_string()),
                search_term: Some("HOSTING".to_string()),
                ..AuditFilter::default()
            },
        )
        .expect("cursor");
    let mut count = 0;
    while let Some(log) = items_only.next().await.expect("next") {
        assert_eq!(log.module, "quote_items");
        count += 1;
    }
    assert_eq!(count, 2);
}

#[tokio::test]
async fn sqlite_store_honours_the_same_contract() {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    let store = Arc::new(SqlQuoteStore::new(pool));
    let clock = Arc::new(ManualClock::new(start()));
    let service = QuoteService::new(Arc::clone(&store), Arc::clone(&clock), ServiceSettings::default());
    let actor = freelancer();

    let quote = service
        .create_quote(&actor, new_quote(clock.now(), Duration::days(14), vec![design_item()]))
        .await
        .expect("create");
    let (with_hosting, _) =
        service.add_item(&actor, &quote.id, hosting_item(), None).await.expect("add");
    assert_eq!(with_hosting.total_amount().expect("total").to_string(), "235.99");

    service.transition(&actor, &quote.id, QuoteStatus::Pending, None).await.expect("submit");
    let accepted =
        service.transition(&client(), &quote.id, QuoteStatus::Accepted, None).await.expect("accept");

    let stored = service.get_quote(&actor, &quote.id).await.expect("get");
    assert_eq!(stored, accepted);

    let locked = service.add_item(&actor, &quote.id, hosting_item(), None).await;
    assert_eq!(locked.expect_err("locked").kind(), ErrorKind::QuoteLocked);

    let stale = service.update_details(&actor, &quote.id, Default::default(), Some(1)).await;
    assert_eq!(stale.expect_err("stale").kind(), ErrorKind::ConcurrentModification);

    let history = service
        .query_audit(&actor, AuditFilter::default())
        .expect("cursor")
        .collect_all()
        .await
        .expect("collect");
    let actions: Vec<AuditAction> = history.iter().map(|log| log.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::Approve, AuditAction::Update, AuditAction::Create, AuditAction::Create]
    );

    let mut params = ListParams::new(1, 10);
    params.filters.statuses.insert(QuoteStatus::Accepted);
    let page = service.list(&actor, params).await.expect("list");
    assert_eq!(page.total_count, 1);
    assert_eq!(page.data[0].id, quote.id);
}

#[tokio::test]
async fn empty_details_patch_writes_nothing() {
    let (_store, clock, service) = memory_service(ServiceSettings::default());
    let actor = freelancer();
    let quote = quote_in(&service, &clock, QuoteStatus::Draft).await;

    let error = service
        .update_details(&actor, &quote.id, Default::default(), None)
        .await
        .expect_err("empty patch");
    assert_eq!(error.kind(), ErrorKind::Validation);

    let stored = service.get_quote(&actor, &quote.id).await.expect("get");
    assert_eq!(stored, quote);
    let history = service
        .query_audit(&actor, AuditFilter::default())
        .expect("cursor")
        .collect_all()
        .await
        .expect("collect");
    assert_eq!(history.len(), 1, "only the create record");
}
