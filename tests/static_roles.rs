mod common;

use chrono::TimeDelta;
use common::{string, t0, Harness};
use credvault::{
    error::Error,
    framework::{Operation, Request},
    iam::IamClient,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn static_role(h: &Harness, name: &str, username: &str, period: &str) {
    h.write(
        &format!("static-roles/{name}"),
        json!({ "username": username, "rotation_period": period }),
    )
    .await
    .unwrap()
    .unwrap();
}

async fn secret_len(h: &Harness, name: &str) -> usize {
    let resp = h.read(&format!("static-creds/{name}")).await.unwrap().unwrap();
    string(&resp, "secret_access_key").len()
}

#[tokio::test]
async fn test_bootstrap_creates_credential_and_queues_role() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");
    h.iam.queue_access_key("AKIA16", "SEC16");

    h.write(
        "static-roles/test",
        json!({ "name": "test", "username": "jane-doe", "rotation_period": "2s" }),
    )
    .await
    .unwrap();

    let creds = h.read("static-creds/test").await.unwrap().unwrap();
    assert_eq!(creds.get("access_key_id"), Some(&json!("AKIA16")));
    assert_eq!(creds.get("secret_access_key"), Some(&json!("SEC16")));

    let queued = h.engine.queued_rotations();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].key, "test");
    assert_eq!(queued[0].priority, t0().timestamp() + 2);

    let role = h.read("static-roles/test").await.unwrap().unwrap();
    assert_eq!(role.get("username"), Some(&json!("jane-doe")));
    assert_eq!(role.get("rotation_period"), Some(&json!(2)));
}

#[tokio::test]
async fn test_only_due_roles_rotate() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");
    h.iam.add_user("john-doe");
    h.iam.set_key_length(16);

    static_role(&h, "test", "jane-doe", "60s").await;
    static_role(&h, "toast", "john-doe", "1s").await;

    h.advance(TimeDelta::seconds(5));
    h.iam.set_key_length(17);
    h.rollback().await.unwrap();

    assert_eq!(secret_len(&h, "toast").await, 17);
    assert_eq!(secret_len(&h, "test").await, 16);

    let queued = h
        .engine
        .queued_rotations()
        .into_iter()
        .map(|i| (i.key, i.priority))
        .collect::<Vec<_>>();
    assert_eq!(
        queued,
        [
            ("toast".to_owned(), t0().timestamp() + 6),
            ("test".to_owned(), t0().timestamp() + 60),
        ]
    );
}

#[tokio::test]
async fn test_user_never_holds_more_than_two_keys() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");

    static_role(&h, "test", "jane-doe", "1s").await;

    for _ in 0..10 {
        h.advance(TimeDelta::seconds(2));
        h.rollback().await.unwrap();

        let keys = h.iam.access_key_ids("jane-doe");
        assert!((1..=2).contains(&keys.len()), "{keys:?}");
    }

    let current = h.read("static-creds/test").await.unwrap().unwrap();
    let current_id = string(&current, "access_key_id");
    assert!(h.iam.access_key_ids("jane-doe").contains(&current_id));
    assert!(h
        .iam
        .key_secret_matches(&current_id, &string(&current, "secret_access_key")));
}

#[tokio::test]
async fn test_oldest_key_is_replaced() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");

    let first = h.iam.create_access_key(Some("jane-doe")).await.unwrap();
    let second = h.iam.create_access_key(Some("jane-doe")).await.unwrap();

    static_role(&h, "test", "jane-doe", "1h").await;

    let keys = h.iam.access_key_ids("jane-doe");
    assert_eq!(keys.len(), 2);
    assert!(!keys.contains(&first.access_key_id));
    assert!(keys.contains(&second.access_key_id));
}

#[tokio::test]
async fn test_update_keeps_credential_and_schedule() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");

    static_role(&h, "test", "jane-doe", "1m").await;
    let before = h.read("static-creds/test").await.unwrap().unwrap();
    h.iam.clear_calls();

    static_role(&h, "test", "jane-doe", "1h").await;

    assert_eq!(h.iam.call_count("CreateAccessKey"), 0);
    assert_eq!(h.read("static-creds/test").await.unwrap().unwrap(), before);

    let queued = h.engine.queued_rotations();
    assert_eq!(queued[0].priority, t0().timestamp() + 60);
    assert_eq!(queued[0].value.rotation_period, 3600);
}

#[tokio::test]
async fn test_write_validation() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");

    let resp = h
        .write("static-roles/test", json!({ "rotation_period": "1h" }))
        .await
        .unwrap()
        .unwrap();
    assert!(resp.is_error());

    let err = h
        .write(
            "static-roles/test",
            json!({ "username": "nobody", "rotation_period": "1h" }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CloudApi { .. }), "{err:?}");
    assert!(h.read("static-roles/test").await.unwrap().is_none());

    static_role(&h, "test", "jane-doe", "1h").await;

    let err = h
        .write("static-roles/test", json!({ "username": "john-doe" }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CredentialInUse { .. }), "{err:?}");

    let err = h
        .write("static-roles/test", json!({ "rotation_period": "0s" }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CredentialInUse { .. }), "{err:?}");
}

#[tokio::test]
async fn test_zero_period_rejected_without_configured_minimum() {
    let h = Harness::with_min_rotation_period(TimeDelta::zero()).await;
    h.iam.add_user("jane-doe");

    let err = h
        .write(
            "static-roles/test",
            json!({ "username": "jane-doe", "rotation_period": "0s" }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CredentialInUse { .. }), "{err:?}");
    assert!(h.read("static-roles/test").await.unwrap().is_none());
    assert!(h.engine.queued_rotations().is_empty());
}

#[tokio::test]
async fn test_failed_bootstrap_is_retried_by_next_drain() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");
    h.iam.fail("CreateAccessKey", "LimitExceeded", "");

    let err = h
        .write(
            "static-roles/test",
            json!({ "username": "jane-doe", "rotation_period": "1s" }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CloudApi { .. }), "{err:?}");
    assert!(h.read("static-creds/test").await.unwrap().is_none());

    let queued = h.engine.queued_rotations();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].priority, t0().timestamp());

    h.iam.clear_failures();
    h.rollback().await.unwrap();

    let creds = h.read("static-creds/test").await.unwrap().unwrap();
    assert!(h.iam.access_key_ids("jane-doe").contains(&string(&creds, "access_key_id")));
}

#[tokio::test]
async fn test_delete_drops_credential_and_queue_item() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");
    static_role(&h, "test", "jane-doe", "1s").await;
    assert_eq!(h.list("static-roles/").await, ["test"]);

    h.delete("static-roles/test").await.unwrap();
    assert!(h.read("static-creds/test").await.unwrap().is_none());
    assert!(h.read("static-roles/test").await.unwrap().is_none());
    assert!(h.list("static-roles/").await.is_empty());
    assert!(h.engine.queued_rotations().is_empty());

    h.iam.clear_calls();
    h.advance(TimeDelta::seconds(5));
    h.rollback().await.unwrap();

    assert_eq!(h.iam.call_count("CreateAccessKey"), 0);
    assert!(h.engine.queued_rotations().is_empty());
}

#[tokio::test]
async fn test_rotation_failure_does_not_stop_drain() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");
    h.iam.add_user("john-doe");
    static_role(&h, "a", "jane-doe", "1s").await;
    static_role(&h, "b", "john-doe", "1s").await;

    h.iam.fail("ListAccessKeys", "ServiceFailure", "");
    h.advance(TimeDelta::seconds(2));

    let err = h.rollback().await.unwrap_err();
    assert!(matches!(err, Error::Multiple { ref errors } if errors.len() == 2), "{err:?}");

    // Both were rescheduled before their rotation was attempted.
    assert!(h
        .engine
        .queued_rotations()
        .iter()
        .all(|i| i.priority == t0().timestamp() + 3));
}

#[tokio::test]
async fn test_cancelled_drain_rotates_nothing() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");
    static_role(&h, "test", "jane-doe", "1s").await;
    h.advance(TimeDelta::seconds(5));
    h.iam.clear_calls();

    let cancel = CancellationToken::new();
    cancel.cancel();
    h.backend
        .handle_request(Request::new(Operation::Rollback, "", h.storage.clone()).with_cancel(cancel))
        .await
        .unwrap();

    assert_eq!(h.iam.call_count("CreateAccessKey"), 0);
    assert_eq!(h.engine.queued_rotations()[0].priority, t0().timestamp() + 1);
}

#[tokio::test]
async fn test_restart_requeues_and_repairs_missing_credentials() {
    let h = Harness::new().await;
    h.iam.add_user("jane-doe");
    h.iam.add_user("john-doe");
    static_role(&h, "kept", "jane-doe", "1h").await;
    static_role(&h, "lost", "john-doe", "1h").await;

    let kept = h.read("static-creds/kept").await.unwrap().unwrap();
    h.storage.delete("static-creds/lost").await.unwrap();
    h.advance(TimeDelta::minutes(1));

    let restarted = h.restart().await;

    assert_eq!(restarted.read("static-creds/kept").await.unwrap().unwrap(), kept);
    assert!(restarted.read("static-creds/lost").await.unwrap().is_some());

    let queued = restarted
        .engine
        .queued_rotations()
        .into_iter()
        .map(|i| (i.key, i.priority))
        .collect::<Vec<_>>();
    let restart_time = t0().timestamp() + 60;
    assert_eq!(
        queued,
        [
            ("kept".to_owned(), restart_time + 3600),
            ("lost".to_owned(), restart_time + 3600),
        ]
    );
}
