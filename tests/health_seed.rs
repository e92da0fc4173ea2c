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
    std::env::remove_var("SEED_TOKEN");
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
async fn test_health_answers_without_a_session() {
    setup_env();
    let repo = InMemRepo::new();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["status"], "ok");
}

#[actix_web::test]
#[serial]
async fn test_seed_is_gated_by_the_token() {
    setup_env();
    let repo = InMemRepo::new();
    let member = mint_user(&repo, "member@example.org", "Member One").await;
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    // disabled entirely without SEED_TOKEN
    let req = test::TestRequest::post().uri("/api/v1/seed").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["error"], "seeding_disabled");

    std::env::set_var("SEED_TOKEN", "let-me-in");

    // wrong or missing header
    let req = test::TestRequest::post().uri("/api/v1/seed").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    let req = test::TestRequest::post()
        .uri("/api/v1/seed")
        .insert_header(("X-Seed-Token", "guess"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // correct token seeds the starter lists
    let req = test::TestRequest::post()
        .uri("/api/v1/seed")
        .insert_header(("X-Seed-Token", "let-me-in"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let summary: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(summary["disabilities_added"].as_u64().unwrap(), 14);
    assert_eq!(summary["profanities_added"].as_u64().unwrap(), 10);

    // running it again adds nothing
    let req = test::TestRequest::post()
        .uri("/api/v1/seed")
        .insert_header(("X-Seed-Token", "let-me-in"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let summary: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(summary["disabilities_added"].as_u64().unwrap(), 0);
    assert_eq!(summary["profanities_added"].as_u64().unwrap(), 0);

    // members can browse the seeded taxonomy
    let req = test::TestRequest::get()
        .uri("/api/v1/disabilities")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&member))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let list: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 14);

    std::env::remove_var("SEED_TOKEN");
}
