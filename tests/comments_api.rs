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
async fn test_comment_thread_and_notifications() {
    setup_env();
    let repo = InMemRepo::new();
    let alice = mint_user(&repo, "alice@example.org", "Alice Park").await;
    let bob = mint_user(&repo, "bob@example.org", "Bob Lin").await;
    let carol = mint_user(&repo, "carol@example.org", "Carol Diaz").await;
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    let post_id = seed_post(&repo, alice.id, "Sensory-friendly movie night").await;

    // bob comments at top level
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .set_json(&serde_json::json!({"post_id": post_id, "body": "We will be there!"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let top: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let top_id = top["id"].as_i64().unwrap();
    assert!(top["parent_id"].is_null());
    assert_eq!(top["author"]["display_name"], "Bob Lin");

    // carol replies to bob
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&carol))))
        .set_json(&serde_json::json!({
            "post_id": post_id, "parent_id": top_id, "body": "Same, see you there."
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let reply: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(reply["parent_id"].as_i64().unwrap(), top_id);

    // listing is oldest first with threading intact
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/posts/{post_id}/comments"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let list: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let items = list.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"].as_i64().unwrap(), top_id);
    assert!(items[1]["parent_id"].as_i64().is_some());

    // the post's comment_count tracks
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/posts/{post_id}"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let post: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(post["comment_count"].as_i64().unwrap(), 2);

    // alice was notified twice (one per comment on her post)
    let req = test::TestRequest::get()
        .uri("/api/v1/notifications")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let notes: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let notes = notes.as_array().unwrap();
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|n| n["kind"] == "post_comment"));
    assert!(notes.iter().all(|n| n["read"] == false));
    assert_eq!(notes[0]["post_title"], "Sensory-friendly movie night");

    // bob got a reply notification
    let req = test::TestRequest::get()
        .uri("/api/v1/notifications")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let notes: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let notes = notes.as_array().unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0]["kind"], "comment_reply");
    assert_eq!(notes[0]["actor"]["display_name"], "Carol Diaz");
    let note_id = notes[0]["id"].as_i64().unwrap();

    // carol has none; she only wrote, never received
    let req = test::TestRequest::get()
        .uri("/api/v1/notifications")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&carol))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let notes: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(notes.as_array().unwrap().len(), 0);

    // bob marks his single notification read; alice uses read-all
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/notifications/{note_id}/read"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let req = test::TestRequest::post()
        .uri("/api/v1/notifications/read-all")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["updated"].as_u64().unwrap(), 2);

    // someone else's notification cannot be marked
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/notifications/{note_id}/read"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&carol))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn test_commenting_on_own_post_stays_quiet() {
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

    let post_id = seed_post(&repo, alice.id, "Talking to myself").await;
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .set_json(&serde_json::json!({"post_id": post_id, "body": "First!"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let notes: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(notes.as_array().unwrap().len(), 0);
}

#[actix_web::test]
#[serial]
async fn test_comment_parent_checks() {
    setup_env();
    let repo = InMemRepo::new();
    let alice = mint_user(&repo, "alice@example.org", "Alice Park").await;
    let bob = mint_user(&repo, "bob@example.org", "Bob Lin").await;
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    let first = seed_post(&repo, alice.id, "First post").await;
    let second = seed_post(&repo, alice.id, "Second post").await;

    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .set_json(&serde_json::json!({"post_id": first, "body": "on the first"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let top: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let top_id = top["id"].as_i64().unwrap();

    // parent from a different post
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .set_json(&serde_json::json!({
            "post_id": second, "parent_id": top_id, "body": "crossed wires"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // parent that does not exist
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .set_json(&serde_json::json!({
            "post_id": first, "parent_id": 9999, "body": "orphan"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // comment on a post that does not exist
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .set_json(&serde_json::json!({"post_id": 9999, "body": "into the void"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    // empty body fails validation
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .set_json(&serde_json::json!({"post_id": first, "body": ""}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
#[serial]
async fn test_comment_likes() {
    setup_env();
    let repo = InMemRepo::new();
    let alice = mint_user(&repo, "alice@example.org", "Alice Park").await;
    let bob = mint_user(&repo, "bob@example.org", "Bob Lin").await;
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(web::Data::new(state(&repo)))
            .configure(config),
    )
    .await;

    let post_id = seed_post(&repo, alice.id, "Likable post").await;
    let req = test::TestRequest::post()
        .uri("/api/v1/comments")
        .insert_header(("Authorization", format!("Bearer {}", token_for(&bob))))
        .set_json(&serde_json::json!({"post_id": post_id, "body": "nice one"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let comment: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let comment_id = comment["id"].as_i64().unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/comments/{comment_id}/like"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["like_count"].as_i64().unwrap(), 1);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/comments/{comment_id}/like"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    // the viewer flag shows up in the listing
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/posts/{post_id}/comments"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let list: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(list[0]["liked"], true);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/comments/{comment_id}/like"))
        .insert_header(("Authorization", format!("Bearer {}", token_for(&alice))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["like_count"].as_i64().unwrap(), 0);
}
