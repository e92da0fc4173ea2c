#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App};
use kin::auth::{create_session, roles_for};
use kin::models::{SsoIdentity, User};
use kin::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use kin::repo::inmem::InMemRepo;
use kin::repo::UserRepo;
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
async fn test_me_reflects_the_stored_user() {
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

    let req = test::TestRequest::get()
        .uri("/api/v1/auth/me")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["id"].as_i64().unwrap(), alice.id);
    assert_eq!(me["email"], "alice@example.org");
    assert_eq!(me["display_name"], "Alice Park");
    assert_eq!(me["is_admin"], false);
    assert_eq!(me["digest_opt_in"], true);
    assert_eq!(me["profile_color"], "sky");
    assert_eq!(me["tags"].as_array().unwrap().len(), 0);
}

#[actix_web::test]
#[serial]
async fn test_me_requires_a_valid_token() {
    setup_env();
    let repo = InMemRepo::new();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/auth/me").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::get()
        .uri("/api/v1/auth/me")
        .insert_header(("Authorization", "Bearer not-a-real-token"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
#[serial]
async fn test_refresh_picks_up_role_changes() {
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

    // token minted before the promotion
    let stale = token_for(&alice);
    repo.set_admin(alice.id, true).await.unwrap();

    // admin-only routes still reject the stale token
    let req = test::TestRequest::get()
        .uri("/api/v1/admin/reports")
        .insert_header(("Authorization", format!("Bearer {stale}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // refresh hands back a token with the new role
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/refresh")
        .insert_header(("Authorization", format!("Bearer {stale}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let fresh = v["token"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri("/api/v1/admin/reports")
        .insert_header(("Authorization", format!("Bearer {fresh}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}

#[actix_web::test]
#[serial]
async fn test_banned_member_cannot_refresh() {
    setup_env();
    let repo = InMemRepo::new();
    let alice = mint_user(&repo, "alice@example.org", "Alice Park").await;
    let token = token_for(&alice);
    repo.set_banned(alice.id, true).await.unwrap();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/auth/refresh")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
}
