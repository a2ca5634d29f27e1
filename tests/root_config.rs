mod common;

use common::{string, Harness, ROOT_USER};
use credvault::{engine::RootConfig, framework::Operation, iam::IamClient};
use secrecy::ExposeSecret;
use serde_json::json;

#[tokio::test]
async fn test_secret_key_is_never_read_back() {
    let h = Harness::new().await;

    let resp = h.read("config/root").await.unwrap().unwrap();
    assert_eq!(resp.get("access_key"), Some(&json!("AKIAROOT")));
    assert_eq!(resp.get("region"), Some(&json!("us-east-1")));
    assert_eq!(resp.get("max_retries"), Some(&json!(-1)));
    assert!(resp.get("secret_key").is_none());

    let stored = RootConfig::load(&*h.storage).await.unwrap().unwrap();
    assert_eq!(stored.secret_key.expose_secret(), "rootsecret");
}

#[tokio::test]
async fn test_partial_update_keeps_other_fields() {
    let h = Harness::new().await;

    h.write("config/root", json!({ "sts_region": "eu-west-1" }))
        .await
        .unwrap();

    let stored = RootConfig::load(&*h.storage).await.unwrap().unwrap();
    assert_eq!(stored.access_key, "AKIAROOT");
    assert_eq!(stored.region, "us-east-1");
    assert_eq!(stored.sts_region(), "eu-west-1");
}

#[tokio::test]
async fn test_invalid_root_config_is_rejected() {
    let h = Harness::new().await;

    let resp = h
        .write(
            "config/root",
            json!({
                "sts_fallback_endpoints": "https://sts.us-west-2.amazonaws.com,https://sts.eu-west-1.amazonaws.com",
                "sts_fallback_regions": "us-west-2",
            }),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        resp.error_message(),
        Some("number of regions does not match number of endpoints")
    );

    let resp = h
        .write("config/root", json!({ "username_template": "{{nope}}" }))
        .await
        .unwrap()
        .unwrap();
    assert!(resp.is_error());

    let stored = RootConfig::load(&*h.storage).await.unwrap().unwrap();
    assert!(stored.sts_fallback_endpoints.is_empty());
    assert!(stored.username_template.is_empty());
}

#[tokio::test]
async fn test_username_template_is_used() {
    let h = Harness::new().await;
    h.write(
        "config/root",
        json!({ "username_template": "svc-{{role_name}}-{{random 4}}" }),
    )
    .await
    .unwrap();
    h.write("roles/ci", json!({ "credential_type": "iam_user" }))
        .await
        .unwrap();

    h.read("creds/ci").await.unwrap().unwrap();

    let users = h
        .iam
        .user_names()
        .into_iter()
        .filter(|u| u.starts_with("svc-ci-"))
        .collect::<Vec<_>>();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].len(), "svc-ci-".len() + 4);
}

#[tokio::test]
async fn test_rotate_root_replaces_key() {
    let h = Harness::new().await;
    h.iam.queue_access_key("AKIAROOT", "rootsecret");
    h.iam.create_access_key(None).await.unwrap();

    let resp = h
        .request(Operation::Update, "config/rotate-root", json!({}))
        .await
        .unwrap()
        .unwrap();
    let new_key = string(&resp, "access_key");
    assert_ne!(new_key, "AKIAROOT");

    assert_eq!(h.iam.access_key_ids(ROOT_USER), [new_key.clone()]);

    let stored = RootConfig::load(&*h.storage).await.unwrap().unwrap();
    assert_eq!(stored.access_key, new_key);
    assert!(h
        .iam
        .key_secret_matches(&new_key, stored.secret_key.expose_secret()));
}

#[tokio::test]
async fn test_rotate_root_masks_cloud_errors() {
    let h = Harness::new().await;
    h.iam
        .fail("CreateAccessKey", "InvalidClientTokenId", "key rootsecret is not valid");

    let err = h
        .request(Operation::Update, "config/rotate-root", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "error calling CreateAccessKey");

    let stored = RootConfig::load(&*h.storage).await.unwrap().unwrap();
    assert_eq!(stored.access_key, "AKIAROOT");
    assert_eq!(stored.secret_key.expose_secret(), "rootsecret");
}

#[tokio::test]
async fn test_rotate_root_requires_keys() {
    let h = Harness::new().await;
    h.write("config/root", json!({ "access_key": "", "secret_key": "" }))
        .await
        .unwrap();

    assert!(h
        .request(Operation::Update, "config/rotate-root", json!({}))
        .await
        .is_err());
}

#[tokio::test]
async fn test_root_help_lists_paths() {
    let h = Harness::new().await;

    let resp = h
        .request(Operation::Help, "", json!({}))
        .await
        .unwrap()
        .unwrap();
    let help = string(&resp, "help");
    assert!(help.contains("config/rotate-root"));
    assert!(help.contains("static-creds/"));
}
