use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use metrics::counter;
use validator::Validate;

use crate::auth::{roles_for, Auth};
use crate::error::ApiError;
use crate::models::*;
use crate::notify::{run_digest, DigestOutcome, Mailer};
use crate::profanity::find_blocked_in;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::Repo;
use crate::saml::{self, SamlConfig};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health)))
            .service(web::resource("/seed").route(web::post().to(seed)))
            .service(web::resource("/auth/login").route(web::get().to(auth_login)))
            .service(web::resource("/auth/acs").route(web::post().to(auth_acs)))
            .service(web::resource("/auth/me").route(web::get().to(auth_me)))
            .service(web::resource("/auth/refresh").route(web::post().to(auth_refresh)))
            .service(web::resource("/profile").route(web::put().to(update_profile)))
            .service(web::resource("/users/{id}/profile").route(web::get().to(get_profile)))
            .service(web::resource("/disabilities").route(web::get().to(list_disabilities)))
            .service(
                web::resource("/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            .service(
                web::resource("/posts/{id}")
                    .route(web::get().to(get_post))
                    .route(web::patch().to(update_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(
                web::resource("/posts/{id}/like")
                    .route(web::post().to(like_post))
                    .route(web::delete().to(unlike_post)),
            )
            .service(
                web::resource("/posts/{id}/save")
                    .route(web::post().to(save_post))
                    .route(web::delete().to(unsave_post)),
            )
            .service(web::resource("/posts/{id}/comments").route(web::get().to(list_comments)))
            .service(web::resource("/comments").route(web::post().to(create_comment)))
            .service(web::resource("/comments/{id}").route(web::delete().to(delete_comment)))
            .service(
                web::resource("/comments/{id}/like")
                    .route(web::post().to(like_comment))
                    .route(web::delete().to(unlike_comment)),
            )
            .service(web::resource("/reports").route(web::post().to(create_report)))
            .service(web::resource("/notifications").route(web::get().to(list_notifications)))
            .service(
                web::resource("/notifications/read-all")
                    .route(web::post().to(read_all_notifications)),
            )
            .service(
                web::resource("/notifications/{id}/read").route(web::post().to(read_notification)),
            )
            // Admin: taxonomy and screening words
            .service(
                web::resource("/admin/disabilities").route(web::post().to(admin_create_disability)),
            )
            .service(
                web::resource("/admin/disabilities/{id}")
                    .route(web::put().to(admin_rename_disability))
                    .route(web::delete().to(admin_delete_disability)),
            )
            .service(
                web::resource("/admin/profanities")
                    .route(web::get().to(admin_list_profanities))
                    .route(web::post().to(admin_add_profanity)),
            )
            .service(
                web::resource("/admin/profanities/{id}")
                    .route(web::delete().to(admin_delete_profanity)),
            )
            // Admin: report queue
            .service(web::resource("/admin/reports").route(web::get().to(admin_list_reports)))
            .service(
                web::resource("/admin/reports/{id}/resolve")
                    .route(web::post().to(admin_resolve_report)),
            )
            .service(
                web::resource("/admin/reports/{id}/dismiss")
                    .route(web::post().to(admin_dismiss_report)),
            )
            // Admin: membership lists
            .service(
                web::resource("/admin/users/admins")
                    .route(web::get().to(admin_list_admins))
                    .route(web::post().to(admin_grant_admin)),
            )
            .service(
                web::resource("/admin/users/admins/{id}")
                    .route(web::delete().to(admin_revoke_admin)),
            )
            .service(web::resource("/admin/users/banned").route(web::get().to(admin_list_banned)))
            .service(web::resource("/admin/users/ban").route(web::post().to(admin_ban_user)))
            .service(web::resource("/admin/users/unban").route(web::post().to(admin_unban_user)))
            // Admin: moderation
            .service(
                web::resource("/admin/posts/{id}/restore")
                    .route(web::post().to(admin_restore_post)),
            )
            .service(
                web::resource("/admin/posts/{id}").route(web::delete().to(admin_hard_delete_post)),
            )
            .service(
                web::resource("/admin/comments/{id}")
                    .route(web::delete().to(admin_hard_delete_comment)),
            )
            .service(web::resource("/admin/digest/run").route(web::post().to(admin_run_digest))),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub mailer: Option<Arc<Mailer>>,
    pub rate_limiter: RateLimiterFacade,
}

/// Starter taxonomy for a fresh deployment; admins extend it from there.
const DEFAULT_DISABILITIES: &[&str] = &[
    "Autism",
    "ADHD",
    "Cerebral Palsy",
    "Cystic Fibrosis",
    "Down Syndrome",
    "Epilepsy",
    "Hearing Loss",
    "Intellectual Disability",
    "Muscular Dystrophy",
    "Rare Genetic Condition",
    "Sensory Processing Disorder",
    "Spina Bifida",
    "Speech Delay",
    "Vision Impairment",
];

const DEFAULT_PROFANITIES: &[&str] = &[
    "ass", "bastard", "bitch", "crap", "damn", "dick", "piss", "prick", "slut", "whore",
];

macro_rules! ensure_admin { ($auth:expr) => { if !$auth.0.is_admin() { return Err(ApiError::Forbidden); } }; }

async fn screen(repo: &dyn Repo, fields: &[&str]) -> Result<(), ApiError> {
    let blocked = repo.blocked_words().await?;
    if let Some(word) = find_blocked_in(fields, &blocked) {
        return Err(ApiError::BadRequest(format!("text contains a blocked word: {word}")));
    }
    Ok(())
}

/// Notification inserts must never fail the request that triggered them.
async fn notify_quiet(repo: &dyn Repo, n: NewNotification) {
    if let Err(e) = repo.notify(n).await {
        log::warn!("notification insert failed: {e}");
    }
}

// ---------------- System -----------------------------------------

pub async fn health(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    data.repo.ping().await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "ok"})))
}

pub async fn seed(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let expected = match std::env::var("SEED_TOKEN") {
        Ok(v) if !v.is_empty() => v,
        _ => {
            return Ok(HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": "seeding_disabled",
                "message": "Set SEED_TOKEN to enable the seed endpoint"
            })));
        }
    };
    let provided = req
        .headers()
        .get("X-Seed-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided != expected {
        return Err(ApiError::Forbidden);
    }
    let summary = data.repo.seed(DEFAULT_DISABILITIES, DEFAULT_PROFANITIES).await?;
    Ok(HttpResponse::Ok().json(summary))
}

// ---------------- Auth -------------------------------------------

#[derive(serde::Deserialize)]
pub struct LoginQuery {
    next: Option<String>,
}

pub async fn auth_login(query: web::Query<LoginQuery>) -> Result<HttpResponse, ApiError> {
    // Graceful degradation: return 503 JSON if SSO isn't configured
    let cfg = match SamlConfig::from_env() {
        Some(cfg) => cfg,
        None => {
            return Ok(HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": "sso_not_configured",
                "message": "Set SAML_IDP_SSO_URL / SAML_IDP_CERT to enable member sign-in"
            })));
        }
    };
    let url = cfg.login_url(query.next.as_deref());
    Ok(HttpResponse::Found().insert_header(("Location", url)).finish())
}

#[derive(serde::Deserialize)]
pub struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
}

fn is_bootstrap_admin(email: &str) -> bool {
    let bootstrap = std::env::var("BOOTSTRAP_ADMIN_EMAILS").unwrap_or_default();
    bootstrap
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .any(|s| s.trim().eq_ignore_ascii_case(email))
}

pub async fn auth_acs(
    data: web::Data<AppState>,
    form: web::Form<AcsForm>,
) -> Result<HttpResponse, ApiError> {
    let cfg = match SamlConfig::from_env() {
        Some(cfg) => cfg,
        None => {
            return Ok(HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": "sso_not_configured",
                "message": "Set SAML_IDP_SSO_URL / SAML_IDP_CERT to enable member sign-in"
            })));
        }
    };
    let identity = saml::validate_response(&form.saml_response, &cfg, Utc::now()).map_err(|e| {
        log::warn!("rejected SAML response: {e}");
        ApiError::Unauthorized
    })?;

    let mut user = data.repo.upsert_sso_user(identity).await?;
    if user.is_banned {
        return Err(ApiError::Forbidden);
    }
    if !user.is_admin && is_bootstrap_admin(&user.email) {
        user = data.repo.set_admin(user.id, true).await?;
    }

    let token = crate::auth::create_session(user.id, &user.display_name, roles_for(user.is_admin))
        .map_err(|_| ApiError::Internal)?;
    counter!("kin_sessions_issued_total", 1);

    let frontend_url =
        std::env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:5173".to_string());
    let mut location = format!("{frontend_url}/?token={token}");
    if let Some(next) = form.relay_state.as_deref().and_then(saml::safe_next) {
        location.push_str("&next=");
        location.push_str(&urlencoding::encode(next));
    }
    Ok(HttpResponse::Found().insert_header(("Location", location)).finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "Current member", body = MeResponse),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn auth_me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user(auth.0.uid).await?;
    let tags = data.repo.user_tags(user.id).await?;
    Ok(HttpResponse::Ok().json(MeResponse {
        id: user.id,
        email: user.email,
        display_name: user.display_name,
        profile_color: user.profile_color,
        bio: user.bio,
        is_admin: user.is_admin,
        digest_opt_in: user.digest_opt_in,
        tags,
        created_at: user.created_at,
    }))
}

pub async fn auth_refresh(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    // Re-read the user so role changes and bans take effect on refresh.
    let user = data.repo.get_user(auth.0.uid).await?;
    if user.is_banned {
        return Err(ApiError::Forbidden);
    }
    let token = crate::auth::create_session(user.id, &user.display_name, roles_for(user.is_admin))
        .map_err(|_| ApiError::Internal)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "token": token })))
}

// ---------------- Profiles ---------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/users/{id}/profile",
    params(("id" = Id, Path, description = "Member id")),
    responses(
        (status = 200, description = "Public profile", body = ProfileView),
        (status = 404, description = "Member not found")
    )
)]
pub async fn get_profile(
    _auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let profile = data.repo.profile_view(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(profile))
}

#[utoipa::path(
    put,
    path = "/api/v1/profile",
    request_body = UpdateProfile,
    responses(
        (status = 200, description = "Profile updated", body = MeResponse),
        (status = 400, description = "Validation failed or blocked word"),
        (status = 404, description = "Unknown disability tag")
    )
)]
pub async fn update_profile(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<UpdateProfile>,
) -> Result<HttpResponse, ApiError> {
    payload.validate()?;
    let mut fields: Vec<&str> = Vec::new();
    if let Some(ref name) = payload.display_name {
        fields.push(name);
    }
    if let Some(ref bio) = payload.bio {
        fields.push(bio);
    }
    if !fields.is_empty() {
        screen(&*data.repo, &fields).await?;
    }
    let user = data.repo.update_profile(auth.0.uid, payload.into_inner()).await?;
    let tags = data.repo.user_tags(user.id).await?;
    Ok(HttpResponse::Ok().json(MeResponse {
        id: user.id,
        email: user.email,
        display_name: user.display_name,
        profile_color: user.profile_color,
        bio: user.bio,
        is_admin: user.is_admin,
        digest_opt_in: user.digest_opt_in,
        tags,
        created_at: user.created_at,
    }))
}

// ---------------- Taxonomy ---------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/disabilities",
    responses((status = 200, description = "All disability tags, sorted by name", body = [Disability]))
)]
pub async fn list_disabilities(
    _auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let disabilities = data.repo.list_disabilities().await?;
    Ok(HttpResponse::Ok().json(disabilities))
}

// ---------------- Posts ------------------------------------------

#[derive(Debug, serde::Deserialize, utoipa::IntoParams)]
pub struct PostListQuery {
    /// Only posts tagged with this disability id.
    pub tag: Option<Id>,
    /// Only posts by this author.
    pub author: Option<Id>,
    /// `1`: only posts the caller saved.
    pub saved: Option<u8>,
    /// `1`: only the caller's own posts.
    pub mine: Option<u8>,
    /// Case-insensitive search over title and body.
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    /// Admin only: `1` includes soft-deleted posts.
    pub include_deleted: Option<u8>,
}

#[utoipa::path(
    get,
    path = "/api/v1/posts",
    params(PostListQuery),
    responses((status = 200, description = "Feed page, newest first", body = PostPage))
)]
pub async fn list_posts(
    auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<PostListQuery>,
) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner();
    let mut filter = PostFilter::for_viewer(auth.0.uid);
    filter.tag = q.tag;
    filter.author = q.author;
    if q.mine.unwrap_or(0) == 1 {
        filter.author = Some(auth.0.uid);
    }
    if q.saved.unwrap_or(0) == 1 {
        filter.saved_by = Some(auth.0.uid);
    }
    filter.search = q.search.filter(|s| !s.trim().is_empty());
    filter.include_deleted = auth.0.is_admin() && q.include_deleted.unwrap_or(0) == 1;
    filter.page = q.page.unwrap_or(1).max(1);
    filter.per_page = q.per_page.unwrap_or(PER_PAGE_DEFAULT).clamp(1, PER_PAGE_MAX);
    let page = data.repo.list_posts(&filter).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    request_body = CreatePost,
    responses(
        (status = 201, description = "Post created", body = PostView),
        (status = 400, description = "Validation failed or blocked word"),
        (status = 404, description = "Unknown disability tag"),
        (status = 429, description = "Too many posts")
    )
)]
pub async fn create_post(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<CreatePost>,
) -> Result<HttpResponse, ApiError> {
    payload.validate()?;
    if !data.rate_limiter.allow_post(auth.0.uid) {
        return Err(ApiError::RateLimited);
    }
    screen(&*data.repo, &[&payload.title, &payload.body]).await?;
    let view = data.repo.create_post(auth.0.uid, &payload).await?;
    counter!("kin_posts_created_total", 1);
    Ok(HttpResponse::Created().json(view))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(
        ("id" = Id, Path, description = "Post id"),
        ("include_deleted" = Option<bool>, Query, description = "Admin only: include soft-deleted")
    ),
    responses(
        (status = 200, description = "Post with viewer flags", body = PostView),
        (status = 404, description = "Post not found")
    )
)]
pub async fn get_post(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let want_deleted = req.query_string().contains("include_deleted=1");
    let include = auth.0.is_admin() && want_deleted;
    let view = data.repo.get_post_view(path.into_inner(), auth.0.uid, include).await?;
    Ok(HttpResponse::Ok().json(view))
}

#[utoipa::path(
    patch,
    path = "/api/v1/posts/{id}",
    request_body = UpdatePost,
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post updated", body = PostView),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn update_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdatePost>,
) -> Result<HttpResponse, ApiError> {
    payload.validate()?;
    let id = path.into_inner();
    let post = data.repo.get_post(id).await?;
    if post.deleted_at.is_some() || post.expires_at.map_or(false, |t| t <= Utc::now()) {
        return Err(ApiError::NotFound);
    }
    if post.author_id != auth.0.uid {
        return Err(ApiError::Forbidden);
    }
    let mut fields: Vec<&str> = Vec::new();
    if let Some(ref title) = payload.title {
        fields.push(title);
    }
    if let Some(ref body) = payload.body {
        fields.push(body);
    }
    if !fields.is_empty() {
        screen(&*data.repo, &fields).await?;
    }
    let view = data.repo.update_post(id, &payload).await?;
    Ok(HttpResponse::Ok().json(view))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post soft-deleted"),
        (status = 403, description = "Not the author or an admin"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn delete_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let post = data.repo.get_post(id).await?;
    if post.author_id != auth.0.uid && !auth.0.is_admin() {
        return Err(ApiError::Forbidden);
    }
    let was_live = post.deleted_at.is_none();
    data.repo.soft_delete_post(id).await?;
    counter!("kin_content_removed_total", 1);
    if was_live && post.author_id != auth.0.uid {
        // Unlinked on purpose so the notice survives a later hard delete.
        notify_quiet(
            &*data.repo,
            NewNotification {
                user_id: post.author_id,
                kind: NotificationKind::ContentRemoved,
                actor_id: None,
                post_id: None,
                comment_id: None,
            },
        )
        .await;
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "ok"})))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/like",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Like recorded", body = serde_json::Value),
        (status = 404, description = "Post not found"),
        (status = 409, description = "Already liked")
    )
)]
pub async fn like_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let count = data.repo.like_post(path.into_inner(), auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "like_count": count })))
}

pub async fn unlike_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let count = data.repo.unlike_post(path.into_inner(), auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "like_count": count })))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/save",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Saved for later"),
        (status = 404, description = "Post not found"),
        (status = 409, description = "Already saved")
    )
)]
pub async fn save_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    data.repo.save_post(path.into_inner(), auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "ok"})))
}

pub async fn unsave_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    data.repo.unsave_post(path.into_inner(), auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "ok"})))
}

// ---------------- Comments ---------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}/comments",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Comments oldest first; clients thread via parent_id", body = [CommentView]),
        (status = 404, description = "Post not found")
    )
)]
pub async fn list_comments(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let comments = data.repo.list_comments(path.into_inner(), auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(comments))
}

#[utoipa::path(
    post,
    path = "/api/v1/comments",
    request_body = CreateComment,
    responses(
        (status = 201, description = "Comment created", body = CommentView),
        (status = 400, description = "Validation failed, blocked word, or bad parent"),
        (status = 404, description = "Post not found"),
        (status = 429, description = "Too many comments")
    )
)]
pub async fn create_comment(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<CreateComment>,
) -> Result<HttpResponse, ApiError> {
    payload.validate()?;
    if !data.rate_limiter.allow_comment(auth.0.uid) {
        return Err(ApiError::RateLimited);
    }
    let post = data.repo.get_post(payload.post_id).await?;
    if post.deleted_at.is_some() || post.expires_at.map_or(false, |t| t <= Utc::now()) {
        return Err(ApiError::NotFound);
    }
    // Replies must stay inside the thread they answer.
    let parent = match payload.parent_id {
        Some(pid) => {
            let parent = data
                .repo
                .get_comment(pid)
                .await
                .map_err(|_| ApiError::BadRequest("parent comment does not exist".into()))?;
            if parent.post_id != payload.post_id {
                return Err(ApiError::BadRequest(
                    "parent comment belongs to a different post".into(),
                ));
            }
            Some(parent)
        }
        None => None,
    };
    screen(&*data.repo, &[&payload.body]).await?;

    let view = data.repo.create_comment(auth.0.uid, &payload).await?;
    counter!("kin_comments_created_total", 1);

    let actor = auth.0.uid;
    if post.author_id != actor {
        notify_quiet(
            &*data.repo,
            NewNotification {
                user_id: post.author_id,
                kind: NotificationKind::PostComment,
                actor_id: Some(actor),
                post_id: Some(post.id),
                comment_id: Some(view.id),
            },
        )
        .await;
    }
    if let Some(parent) = parent {
        // Skip when the reply target is the post author; they were notified above.
        if parent.author_id != actor && parent.author_id != post.author_id {
            notify_quiet(
                &*data.repo,
                NewNotification {
                    user_id: parent.author_id,
                    kind: NotificationKind::CommentReply,
                    actor_id: Some(actor),
                    post_id: Some(post.id),
                    comment_id: Some(view.id),
                },
            )
            .await;
        }
    }
    Ok(HttpResponse::Created().json(view))
}

#[utoipa::path(
    post,
    path = "/api/v1/comments/{id}/like",
    params(("id" = Id, Path, description = "Comment id")),
    responses(
        (status = 200, description = "Like recorded", body = serde_json::Value),
        (status = 404, description = "Comment not found"),
        (status = 409, description = "Already liked")
    )
)]
pub async fn like_comment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let count = data.repo.like_comment(path.into_inner(), auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "like_count": count })))
}

pub async fn unlike_comment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let count = data.repo.unlike_comment(path.into_inner(), auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "like_count": count })))
}

#[utoipa::path(
    delete,
    path = "/api/v1/comments/{id}",
    params(("id" = Id, Path, description = "Comment id")),
    responses(
        (status = 200, description = "Comment soft-deleted"),
        (status = 403, description = "Not the author or an admin"),
        (status = 404, description = "Comment not found")
    )
)]
pub async fn delete_comment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let comment = data.repo.get_comment(id).await?;
    if comment.author_id != auth.0.uid && !auth.0.is_admin() {
        return Err(ApiError::Forbidden);
    }
    let was_live = comment.deleted_at.is_none();
    data.repo.soft_delete_comment(id).await?;
    counter!("kin_content_removed_total", 1);
    if was_live && comment.author_id != auth.0.uid {
        notify_quiet(
            &*data.repo,
            NewNotification {
                user_id: comment.author_id,
                kind: NotificationKind::ContentRemoved,
                actor_id: None,
                post_id: None,
                comment_id: None,
            },
        )
        .await;
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "ok"})))
}

// ---------------- Reports ----------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/reports",
    request_body = CreateReport,
    responses(
        (status = 201, description = "Report filed", body = Report),
        (status = 404, description = "Target not found"),
        (status = 409, description = "Already reported by you"),
        (status = 429, description = "Too many reports")
    )
)]
pub async fn create_report(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<CreateReport>,
) -> Result<HttpResponse, ApiError> {
    payload.validate()?;
    if !data.rate_limiter.allow_report(auth.0.uid) {
        return Err(ApiError::RateLimited);
    }
    let report = data.repo.create_report(auth.0.uid, &payload).await?;
    counter!("kin_reports_created_total", 1);
    Ok(HttpResponse::Created().json(report))
}

// ---------------- Notifications ----------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/notifications",
    responses((status = 200, description = "Latest notifications, newest first", body = [NotificationView]))
)]
pub async fn list_notifications(
    auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let notifications = data.repo.list_notifications(auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(notifications))
}

pub async fn read_notification(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    data.repo.mark_notification_read(path.into_inner(), auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "ok"})))
}

pub async fn read_all_notifications(
    auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let updated = data.repo.mark_all_read(auth.0.uid).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "updated": updated })))
}

// ---------------- Admin: taxonomy and screening words -------------

#[utoipa::path(
    post,
    path = "/api/v1/admin/disabilities",
    request_body = NewDisability,
    responses(
        (status = 201, description = "Disability created", body = Disability),
        (status = 403, description = "Forbidden - Admins only"),
        (status = 409, description = "Name already exists")
    )
)]
pub async fn admin_create_disability(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewDisability>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    payload.validate()?;
    let d = data.repo.create_disability(payload.name.trim()).await?;
    Ok(HttpResponse::Created().json(d))
}

pub async fn admin_rename_disability(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewDisability>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    payload.validate()?;
    let d = data.repo.rename_disability(path.into_inner(), payload.name.trim()).await?;
    Ok(HttpResponse::Ok().json(d))
}

pub async fn admin_delete_disability(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    data.repo.delete_disability(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/profanities",
    responses(
        (status = 200, description = "Blocked words", body = [Profanity]),
        (status = 403, description = "Forbidden - Admins only")
    )
)]
pub async fn admin_list_profanities(
    auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let words = data.repo.list_profanities().await?;
    Ok(HttpResponse::Ok().json(words))
}

pub async fn admin_add_profanity(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewProfanity>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    payload.validate()?;
    let p = data.repo.add_profanity(&payload.word).await?;
    Ok(HttpResponse::Created().json(p))
}

pub async fn admin_delete_profanity(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    data.repo.delete_profanity(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- Admin: report queue ----------------------------

#[derive(Debug, serde::Deserialize, utoipa::IntoParams)]
pub struct ReportQuery {
    /// Filter by status; omit for all reports.
    pub status: Option<ReportStatus>,
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/reports",
    params(ReportQuery),
    responses(
        (status = 200, description = "Reports, newest first", body = [Report]),
        (status = 403, description = "Forbidden - Admins only")
    )
)]
pub async fn admin_list_reports(
    auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<ReportQuery>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let reports = data.repo.list_reports(query.status).await?;
    Ok(HttpResponse::Ok().json(reports))
}

pub async fn admin_resolve_report(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let report = data.repo.close_report(path.into_inner(), auth.0.uid, ReportStatus::Resolved).await?;
    Ok(HttpResponse::Ok().json(report))
}

pub async fn admin_dismiss_report(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let report = data.repo.close_report(path.into_inner(), auth.0.uid, ReportStatus::Dismissed).await?;
    Ok(HttpResponse::Ok().json(report))
}

// ---------------- Admin: membership lists ------------------------

pub async fn admin_list_admins(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    Ok(HttpResponse::Ok().json(data.repo.list_admins().await?))
}

pub async fn admin_grant_admin(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<UserIdPayload>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let user = data.repo.set_admin(payload.user_id, true).await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn admin_revoke_admin(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let id = path.into_inner();
    if id == auth.0.uid {
        // No demoting yourself; another admin has to do it.
        return Err(ApiError::Conflict);
    }
    let user = data.repo.set_admin(id, false).await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn admin_list_banned(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    Ok(HttpResponse::Ok().json(data.repo.list_banned().await?))
}

pub async fn admin_ban_user(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<UserIdPayload>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    if payload.user_id == auth.0.uid {
        return Err(ApiError::Conflict);
    }
    let user = data.repo.set_banned(payload.user_id, true).await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn admin_unban_user(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<UserIdPayload>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let user = data.repo.set_banned(payload.user_id, false).await?;
    Ok(HttpResponse::Ok().json(user))
}

// ---------------- Admin: moderation ------------------------------

pub async fn admin_restore_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    data.repo.restore_post(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "ok"})))
}

pub async fn admin_hard_delete_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    data.repo.hard_delete_post(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// No comment restore: soft deletion overwrites the body, so there is
// nothing left to bring back.

pub async fn admin_hard_delete_comment(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    data.repo.hard_delete_comment(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- Admin: digest ----------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/admin/digest/run",
    responses(
        (status = 200, description = "Digest pass finished", body = DigestOutcome),
        (status = 403, description = "Forbidden - Admins only"),
        (status = 503, description = "Mail API not configured")
    )
)]
pub async fn admin_run_digest(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let mailer = match &data.mailer {
        Some(m) => m.clone(),
        None => {
            return Ok(HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": "mail_not_configured",
                "message": "Set MAIL_API_URL / MAIL_API_KEY to enable digest email"
            })));
        }
    };
    let outcome = run_digest(&*data.repo, &mailer).await.map_err(|e| {
        log::error!("digest run failed: {e}");
        ApiError::Internal
    })?;
    Ok(HttpResponse::Ok().json(outcome))
}
