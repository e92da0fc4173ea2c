#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App};
use kin::auth::{create_session, roles_for};
use kin::models::{SsoIdentity, User};
use kin::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use kin::repo::inmem::InMemRepo;
use kin::repo::{DisabilityRepo, UserRepo};
use kin::routes::{config, AppState};
use kin::security::SecurityHeaders;
use serial_test::serial;
use std::sync::Arc;

fn setup_env() {
    std::env::set_var("SESSION_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("KIN_DATA_DIR", tmp.path().to_str().unwrap());
}

async fn mint_user(repo: &InMemRepo, email: &str, name: &str) -> User {
    repo.upsert_sso_user(SsoIdentity {
        external_id: format!("idp|{email}"),
        email: email.to_string(),
        display_name: name.to_string(),
    })
    .await
    .unwrap()
}

fn token_for(user: &User) -> String {
    create_session(user.id, &user.display_name, roles_for(user.is_admin)).unwrap()
}

fn state(repo: &InMemRepo) -> AppState {
    AppState {
        repo: Arc::new(repo.clone()),
        mailer: None,
        rate_limiter: RateLimiterFacade::new(
            InMemoryRateLimiter::new(false),
            RateLimitConfig::from_env(),
        ),
    }
}

#[actix_web::test]
#[serial]
async fn test_profile_update_and_public_view() {
    setup_env();
    let repo = InMemRepo::new();
    let alice = mint_user(&repo, "alice@example.org", "Alice Park").await;
    let bob = mint_user(&repo, "bob@example.org", "Bob Lin").await;
    let down = repo.create_disability("Down Syndrome").await.unwrap();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::put()
        .uri("/api/v1/profile")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .set_json(&serde_json::json!({
            "display_name": "Alice P.",
            "bio": "Parent of two, mostly here for outings.",
            "profile_color": "amber",
            "digest_opt_in": false,
            "tag_ids": [down.id]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["display_name"], "Alice P.");
    assert_eq!(me["profile_color"], "amber");
    assert_eq!(me["digest_opt_in"], false);
    assert_eq!(me["tags"][0]["name"], "Down Syndrome");

    // bob sees the public view, including post count
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .set_json(&serde_json::json!({"title": "Hello", "body": "from alice", "expiry": "never"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/users/{}/profile", alice.id))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let profile: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(profile["display_name"], "Alice P.");
    assert_eq!(profile["post_count"].as_i64().unwrap(), 1);
    assert_eq!(profile["tags"][0]["id"].as_i64().unwrap(), down.id);
    // the public view never carries the email
    assert!(profile.get("email").is_none());

    // partial update leaves other fields alone
    let req = test::TestRequest::put()
        .uri("/api/v1/profile")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .set_json(&serde_json::json!({"bio": "Updated bio."}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["bio"], "Updated bio.");
    assert_eq!(me["display_name"], "Alice P.");
    assert_eq!(me["profile_color"], "amber");
}

#[actix_web::test]
#[serial]
async fn test_profile_validation() {
    setup_env();
    let repo = InMemRepo::new();
    let alice = mint_user(&repo, "alice@example.org", "Alice Park").await;
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    // bio over the cap
    let req = test::TestRequest::put()
        .uri("/api/v1/profile")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .set_json(&serde_json::json!({"bio": "x".repeat(501)}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // empty display name
    let req = test::TestRequest::put()
        .uri("/api/v1/profile")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .set_json(&serde_json::json!({"display_name": ""}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // unknown tag
    let req = test::TestRequest::put()
        .uri("/api/v1/profile")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .set_json(&serde_json::json!({"tag_ids": [777]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    // profile of a member that does not exist
    let req = test::TestRequest::get()
        .uri("/api/v1/users/555/profile")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}
