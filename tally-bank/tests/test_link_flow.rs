use chrono::{Duration, NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use tally_bank::testing::FakeAggregator;
use tally_bank::{
    BankError, BankSync, BankSyncConfig, InstitutionMap, LinkSettings, ManualClock, MemoryStore,
    ResumeOutcome, ResumePolicy, Storage,
};
use tally_core::{LinkStatus, SyncStatus, TransactionSnapshot};

fn config() -> BankSyncConfig {
    BankSyncConfig {
        link: LinkSettings {
            redirect_url: "tally://bank-return".to_string(),
            language: "DA".to_string(),
            policy: ResumePolicy {
                first_delay: std::time::Duration::ZERO,
                retry_delay: std::time::Duration::ZERO,
            },
        },
        institutions: [("nordea", "NORDEA_NDEADKKK")].into_iter().collect::<InstitutionMap>(),
        stale_after: Duration::hours(6),
        ..BankSyncConfig::default()
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()))
}

fn service(fake: &Arc<FakeAggregator>, store: &Arc<MemoryStore>) -> BankSync {
    BankSync::new(fake.clone(), store.clone(), clock(), config())
}

fn setup() -> (Arc<FakeAggregator>, Arc<MemoryStore>, BankSync) {
    let fake = Arc::new(FakeAggregator::new());
    fake.add_institution("NORDEA_NDEADKKK", "Nordea", Some(365));
    let store = Arc::new(MemoryStore::new());
    let bank = service(&fake, &store);
    (fake, store, bank)
}

fn salary() -> TransactionSnapshot {
    TransactionSnapshot {
        external_transaction_id: "t-1".to_string(),
        date: NaiveDate::from_ymd_opt(2026, 2, 27).unwrap(),
        amount: 25000.0,
        currency: "DKK".to_string(),
        description: "Løn februar".to_string(),
        creditor_name: None,
        debtor_name: Some("Arbejdsgiver ApS".to_string()),
    }
}

#[tokio::test]
async fn test_start_link_records_pending_return() {
    let (_fake, store, bank) = setup();
    let start = bank.start_link("u1", "Nordea", None).await.unwrap();
    assert!(start.redirect_url.starts_with("https://fake.bank/auth/"));
    assert!(start.reference.starts_with("u1-nordea-"));

    let links = store.get_links("u1").await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].status, LinkStatus::AwaitingAuthentication);
    assert_eq!(links[0].institution_id, "NORDEA_NDEADKKK");
}

#[tokio::test]
async fn test_unknown_institution_is_rejected() {
    let (fake, _store, bank) = setup();
    let err = bank.start_link("u1", "jyske", None).await.unwrap_err();
    assert!(matches!(err, BankError::UnknownInstitution(_)));
    assert_eq!(fake.link_count(), 0);
}

#[tokio::test]
async fn test_reference_survives_restart() {
    let (fake, store, bank) = setup();
    let start = bank.start_link("u1", "nordea", Some("link-42")).await.unwrap();
    drop(bank);

    // Same store, fresh process
    let restarted = service(&fake, &store);
    let found = restarted.find_link_by_reference("u1", "link-42").await.unwrap().unwrap();
    assert_eq!(found.link_id, start.link_id);

    let again = restarted.start_link("u1", "nordea", Some("link-42")).await.unwrap();
    assert_eq!(again.link_id, start.link_id);
    assert_eq!(fake.link_count(), 1);
}

#[tokio::test]
async fn test_reference_found_upstream_when_local_state_is_lost() {
    let (fake, _store, bank) = setup();
    let start = bank.start_link("u1", "nordea", Some("link-42")).await.unwrap();

    let empty = Arc::new(MemoryStore::new());
    let fresh = service(&fake, &empty);
    let found = fresh.find_link_by_reference("u1", "link-42").await.unwrap().unwrap();
    assert_eq!(found.link_id, start.link_id);
    assert_eq!(empty.get_links("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_resume_with_data_settles_linked() {
    let (fake, store, bank) = setup();
    fake.add_account("acc-1", "Lønkonto", "DKK", 500.0);
    fake.push_transactions("acc-1", vec![salary()]);
    let start = bank.start_link("u1", "nordea", None).await.unwrap();
    fake.set_link_status(&start.link_id, "LN", &["acc-1"]);

    let outcome = bank.on_app_foreground_after_link("u1").await.unwrap();
    match outcome {
        ResumeOutcome::Linked(summary) => assert_eq!(summary.new_transactions, 1),
        other => panic!("expected Linked, got {other:?}"),
    }
    assert_eq!(fake.transaction_calls(), 1);

    let link = &store.get_links("u1").await.unwrap()[0];
    assert_eq!(link.status, LinkStatus::Linked);
    assert_eq!(link.accounts, vec!["acc-1".to_string()]);
}

#[tokio::test]
async fn test_resume_without_data_retries_once_then_settles() {
    let (fake, store, bank) = setup();
    fake.add_account("acc-1", "Lønkonto", "DKK", 500.0);
    let start = bank.start_link("u1", "nordea", None).await.unwrap();
    fake.set_link_status(&start.link_id, "LN", &["acc-1"]);

    let outcome = bank.on_app_foreground_after_link("u1").await.unwrap();
    assert!(matches!(outcome, ResumeOutcome::LinkedAwaitingData(_)));
    assert_eq!(fake.transaction_calls(), 2);
    let log = store.get_last_sync_log("u1").await.unwrap().unwrap();
    assert_eq!(log.status, SyncStatus::Success);
}

#[tokio::test]
async fn test_resume_before_bank_auth_finishes() {
    let (fake, store, bank) = setup();
    let start = bank.start_link("u1", "nordea", None).await.unwrap();
    fake.set_link_status(&start.link_id, "UA", &[]);

    let outcome = bank.on_app_foreground_after_link("u1").await.unwrap();
    assert_eq!(outcome, ResumeOutcome::StillAwaiting);
    assert_eq!(fake.transaction_calls(), 0);
    assert_eq!(
        store.get_links("u1").await.unwrap()[0].status,
        LinkStatus::AwaitingAuthentication
    );
}

#[tokio::test]
async fn test_expired_link_is_terminal() {
    let (fake, store, bank) = setup();
    let start = bank.start_link("u1", "nordea", None).await.unwrap();
    fake.set_link_status(&start.link_id, "EX", &[]);

    let err = bank.on_app_foreground_after_link("u1").await.unwrap_err();
    assert!(matches!(err, BankError::LinkExpired(_)));
    assert!(err.needs_reconnect());
    assert_eq!(store.get_links("u1").await.unwrap()[0].status, LinkStatus::Expired);

    // Not retried on the next return
    fake.set_link_status(&start.link_id, "LN", &["acc-1"]);
    let outcome = bank.on_app_foreground_after_link("u1").await.unwrap();
    assert_eq!(outcome, ResumeOutcome::NoPendingLinks);
}

#[tokio::test]
async fn test_rejected_link_is_an_error() {
    let (fake, _store, bank) = setup();
    let start = bank.start_link("u1", "nordea", None).await.unwrap();
    fake.set_link_status(&start.link_id, "RJ", &[]);

    let err = bank.on_app_foreground_after_link("u1").await.unwrap_err();
    assert!(matches!(err, BankError::LinkError(_)));
}

#[tokio::test]
async fn test_status_falls_back_to_reference_lookup() {
    let (fake, store, bank) = setup();
    fake.add_account("acc-1", "Lønkonto", "DKK", 500.0);
    fake.push_transactions("acc-1", vec![salary()]);
    let start = bank.start_link("u1", "nordea", Some("link-7")).await.unwrap();
    fake.set_link_status(&start.link_id, "LN", &["acc-1"]);
    fake.rekey_link(&start.link_id, "req-99");

    let outcome = bank.on_app_foreground_after_link("u1").await.unwrap();
    assert!(matches!(outcome, ResumeOutcome::Linked(_)));
    let links = store.get_links("u1").await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].status, LinkStatus::Linked);
}

#[tokio::test]
async fn test_manual_sync_on_abandoned_link_is_a_no_op() {
    let (_fake, store, bank) = setup();
    bank.start_link("u1", "nordea", None).await.unwrap();

    let summary = bank.sync("u1").await.unwrap();
    assert_eq!(summary.accounts_seen, 0);
    assert!(summary.errors.is_empty());
    assert_eq!(
        store.get_links("u1").await.unwrap()[0].status,
        LinkStatus::AwaitingAuthentication
    );
}

#[tokio::test]
async fn test_reference_is_private_to_its_user() {
    let (fake, store, bank) = setup();
    let alice = bank.start_link("alice", "nordea", Some("shared-ref")).await.unwrap();

    assert!(bank.find_link_by_reference("bob", "shared-ref").await.unwrap().is_none());
    let err = bank.start_link("bob", "nordea", Some("shared-ref")).await.unwrap_err();
    assert!(matches!(err, BankError::InvalidInput(_)));
    assert_eq!(fake.link_count(), 1);
    assert!(store.get_links("bob").await.unwrap().is_empty());

    let own = bank.find_link_by_reference("alice", "shared-ref").await.unwrap().unwrap();
    assert_eq!(own.link_id, alice.link_id);
    assert_eq!(own.user_id, "alice");
}

#[tokio::test]
async fn test_reference_of_finished_link_is_not_reused() {
    let (fake, _store, bank) = setup();
    let start = bank.start_link("u1", "nordea", Some("link-9")).await.unwrap();
    fake.set_link_status(&start.link_id, "EX", &[]);
    bank.on_app_foreground_after_link("u1").await.unwrap_err();

    let err = bank.start_link("u1", "nordea", Some("link-9")).await.unwrap_err();
    assert!(matches!(err, BankError::InvalidInput(_)));
    assert_eq!(fake.link_count(), 1);
}

#[tokio::test]
async fn test_unreadable_link_status_keeps_waiting() {
    let (fake, store, bank) = setup();
    let start = bank.start_link("u1", "nordea", None).await.unwrap();
    fake.fail_link(&start.link_id);

    let outcome = bank.on_app_foreground_after_link("u1").await.unwrap();
    assert_eq!(outcome, ResumeOutcome::StillAwaiting);
    assert_eq!(
        store.get_links("u1").await.unwrap()[0].status,
        LinkStatus::AwaitingAuthentication
    );
}
