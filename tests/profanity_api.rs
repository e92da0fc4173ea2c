#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App};
use kin::auth::{create_session, roles_for};
use kin::models::{CreatePost, Id, PostExpiry, SsoIdentity, User};
use kin::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use kin::repo::inmem::InMemRepo;
use kin::repo::{PostRepo, UserRepo};
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

async fn mint_admin(repo: &InMemRepo, email: &str, name: &str) -> User {
    let user = mint_user(repo, email, name).await;
    repo.set_admin(user.id, true).await.unwrap()
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

async fn seed_post(repo: &InMemRepo, author: Id, title: &str) -> Id {
    let new = CreatePost {
        title: title.to_string(),
        body: "body".to_string(),
        expiry: PostExpiry::Never,
        tag_ids: vec![],
    };
    repo.create_post(author, &new).await.unwrap().id
}

#[actix_web::test]
#[serial]
async fn test_blocked_words_screen_posts_and_comments() {
    setup_env();
    let repo = InMemRepo::new();
    let member = mint_user(&repo, "member@example.org", "Member One").await;
    let admin = mint_admin(&repo, "mod@example.org", "Morgan Reed").await;
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    // only admins manage the list; words are stored lowercase
    let req = test::TestRequest::post()
        .uri("/api/v1/admin/profanities")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&member))))
        .set_json(&serde_json::json!({"word": "jerk"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    let req = test::TestRequest::post()
        .uri("/api/v1/admin/profanities")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&admin))))
        .set_json(&serde_json::json!({"word": "  Jerk "}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let word: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(word["word"], "jerk");
    let word_id = word["id"].as_i64().unwrap();
    let req = test::TestRequest::post()
        .uri("/api/v1/admin/profanities")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&admin))))
        .set_json(&serde_json::json!({"word": "JERK"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    // a post tripping the screen is rejected, case and punctuation aside
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&member))))
        .set_json(&serde_json::json!({
            "title": "Watch out", "body": "That guy is a JERK.", "expiry": "never"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let err: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(err["error"].as_str().unwrap().contains("blocked"));

    // whole tokens only: "jerky" passes
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&member))))
        .set_json(&serde_json::json!({
            "title": "Snack swap", "body": "Homemade jerky for the picnic.", "expiry": "never"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    // comments are screened too
    let post_id = seed_post(&repo, admin.id, "A clean post").await;
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&member))))
        .set_json(&serde_json::json!({"post_id": post_id, "body": "what a jerk"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // and profile text
    let req = test::TestRequest::put()
        .uri("/api/v1/profile")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&member))))
        .set_json(&serde_json::json!({"bio": "Resident jerk."}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // removing the word opens the door again
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/admin/profanities/{word_id}"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&admin))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&member))))
        .set_json(&serde_json::json!({"post_id": post_id, "body": "what a jerk"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
}

#[actix_web::test]
#[serial]
async fn test_admin_profanity_listing() {
    setup_env();
    let repo = InMemRepo::new();
    let admin = mint_admin(&repo, "mod@example.org", "Morgan Reed").await;
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    for word in ["alpha", "bravo"] {
        let req = test::TestRequest::post()
            .uri("/api/v1/admin/profanities")
            .insert_header(("Authorization", format!("Bearer {}", token_for(&admin))))
            .set_json(&serde_json::json!({"word": word}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/admin/profanities")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&admin))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let list: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let words: Vec<&str> =
        list.as_array().unwrap().iter().map(|p| p["word"].as_str().unwrap()).collect();
    assert_eq!(words, vec!["alpha", "bravo"]);

    // deleting something unknown is a 404
    let req = test::TestRequest::delete()
        .uri("/api/v1/admin/profanities/999")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&admin))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}
