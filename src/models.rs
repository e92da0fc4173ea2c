use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

// Always Postgres backed in production
pub type Id = i64;

/// Palette offered by the profile editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "profile_color", rename_all = "snake_case")]
pub enum ProfileColor {
    Sky,
    Rose,
    Amber,
    Emerald,
    Violet,
    Slate,
}

impl Default for ProfileColor {
    fn default() -> Self {
        ProfileColor::Sky
    }
}

/// Post lifetime picked by the author at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "post_expiry", rename_all = "snake_case")]
pub enum PostExpiry {
    OneWeek,
    OneMonth,
    ThreeMonths,
    Never,
}

impl PostExpiry {
    /// Absolute deadline for a post written at `from`, `None` for `Never`.
    pub fn deadline(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            PostExpiry::OneWeek => Some(from + Duration::days(7)),
            PostExpiry::OneMonth => Some(from + Duration::days(30)),
            PostExpiry::ThreeMonths => Some(from + Duration::days(90)),
            PostExpiry::Never => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "report_target", rename_all = "snake_case")]
pub enum ReportTargetKind {
    Post,
    Comment,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "report_reason", rename_all = "snake_case")]
pub enum ReportReason {
    Spam,
    Harassment,
    Inappropriate,
    Misinformation,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "report_status", rename_all = "snake_case")]
pub enum ReportStatus {
    Open,
    Resolved,
    Dismissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "notification_kind", rename_all = "snake_case")]
pub enum NotificationKind {
    PostComment,
    CommentReply,
    ContentRemoved,
}

// ---------------- Entities ----------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct User {
    pub id: Id,
    pub external_id: Option<String>, // SSO subject; NULL until first login links it
    pub email: String,
    pub display_name: String,
    pub profile_color: ProfileColor,
    pub bio: Option<String>,
    pub is_admin: bool,
    pub is_banned: bool,
    pub digest_opt_in: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Disability {
    pub id: Id,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Post {
    pub id: Id,
    pub author_id: Id,
    pub title: String,
    pub body: String,
    pub expiry: PostExpiry,
    pub expires_at: Option<DateTime<Utc>>,
    pub like_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>, // soft delete marker
}

/// Body text written into a comment row on soft deletion.
pub const REMOVED_BODY: &str = "[removed]";

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Comment {
    pub id: Id,
    pub post_id: Id,
    pub author_id: Id,
    pub parent_id: Option<Id>, // top-level when NULL
    pub body: String,
    pub like_count: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>, // soft delete: body overwritten with REMOVED_BODY
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Report {
    pub id: Id,
    pub reporter_id: Id,
    pub target_kind: ReportTargetKind,
    pub target_id: Id,
    pub reason: ReportReason,
    pub detail: Option<String>,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Notification {
    pub id: Id,
    pub user_id: Id,
    pub kind: NotificationKind,
    pub actor_id: Option<Id>,
    pub post_id: Option<Id>,
    pub comment_id: Option<Id>,
    pub read: bool,
    pub emailed_at: Option<DateTime<Utc>>, // NULL = still pending for the digest
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Profanity {
    pub id: Id,
    pub word: String, // stored lowercase
    pub created_at: DateTime<Utc>,
}

// ---------------- Assembled views ----------------

/// Author fields embedded into post/comment/notification views.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthorRef {
    pub id: Id,
    pub display_name: String,
    pub profile_color: ProfileColor,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct TagRef {
    pub id: Id,
    pub name: String,
}

/// A post as the feed and detail pages consume it: author, tags and the
/// viewer-specific like/save flags folded in.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostView {
    pub id: Id,
    pub author: AuthorRef,
    pub title: String,
    pub body: String,
    pub expiry: PostExpiry,
    pub tags: Vec<TagRef>,
    pub like_count: i64,
    pub comment_count: i64,
    pub liked: bool,
    pub saved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>, // only ever populated for admin reads
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommentView {
    pub id: Id,
    pub post_id: Id,
    pub author: AuthorRef,
    pub parent_id: Option<Id>,
    pub body: String,
    pub like_count: i64,
    pub liked: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProfileView {
    pub id: Id,
    pub display_name: String,
    pub profile_color: ProfileColor,
    pub bio: Option<String>,
    pub tags: Vec<TagRef>,
    pub post_count: i64,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NotificationView {
    pub id: Id,
    pub kind: NotificationKind,
    pub actor: Option<AuthorRef>,
    pub post_id: Option<Id>,
    pub post_title: Option<String>,
    pub comment_id: Option<Id>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// What `/auth/me` hands the signed-in member about themselves.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MeResponse {
    pub id: Id,
    pub email: String,
    pub display_name: String,
    pub profile_color: ProfileColor,
    pub bio: Option<String>,
    pub is_admin: bool,
    pub digest_opt_in: bool,
    pub tags: Vec<TagRef>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the seeding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SeedSummary {
    pub disabilities_added: u64,
    pub profanities_added: u64,
}

/// Row queued by a handler for the notification fan-out.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Id,
    pub kind: NotificationKind,
    pub actor_id: Option<Id>,
    pub post_id: Option<Id>,
    pub comment_id: Option<Id>,
}

/// One line of a digest email.
#[derive(Debug, Clone)]
pub struct DigestItem {
    pub notification_id: Id,
    pub kind: NotificationKind,
    pub actor_name: Option<String>,
    pub post_title: Option<String>,
}

/// Everything needed to email one member their pending notifications.
#[derive(Debug, Clone)]
pub struct DigestBatch {
    pub user_id: Id,
    pub email: String,
    pub display_name: String,
    pub items: Vec<DigestItem>,
}

/// Paged envelope returned by list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[aliases(PostPage = Paged<PostView>)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub has_more: bool,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, per_page: i64) -> Self {
        let has_more = page * per_page < total;
        Self { items, total, page, per_page, has_more }
    }
}

// ---------------- Requests ----------------

pub const PER_PAGE_DEFAULT: i64 = 20;
pub const PER_PAGE_MAX: i64 = 50;

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct CreatePost {
    #[validate(length(min = 1, max = 200, message = "title must be 1-200 characters"))]
    pub title: String,
    #[validate(length(min = 1, max = 10000, message = "body must be 1-10000 characters"))]
    pub body: String,
    pub expiry: PostExpiry,
    #[serde(default)]
    #[validate(length(max = 8, message = "at most 8 tags"))]
    pub tag_ids: Vec<Id>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema, Validate)]
pub struct UpdatePost {
    #[validate(length(min = 1, max = 200, message = "title must be 1-200 characters"))]
    pub title: Option<String>,
    #[validate(length(min = 1, max = 10000, message = "body must be 1-10000 characters"))]
    pub body: Option<String>,
    pub expiry: Option<PostExpiry>,
    #[validate(length(max = 8, message = "at most 8 tags"))]
    pub tag_ids: Option<Vec<Id>>,
}

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct CreateComment {
    pub post_id: Id,
    pub parent_id: Option<Id>,
    #[validate(length(min = 1, max = 4000, message = "body must be 1-4000 characters"))]
    pub body: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct CreateReport {
    pub target_kind: ReportTargetKind,
    pub target_id: Id,
    pub reason: ReportReason,
    #[validate(length(max = 1000, message = "detail must be at most 1000 characters"))]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema, Validate)]
pub struct UpdateProfile {
    #[validate(length(min = 1, max = 80, message = "display_name must be 1-80 characters"))]
    pub display_name: Option<String>,
    #[validate(length(max = 500, message = "bio must be at most 500 characters"))]
    pub bio: Option<String>,
    pub profile_color: Option<ProfileColor>,
    pub digest_opt_in: Option<bool>,
    #[validate(length(max = 8, message = "at most 8 tags"))]
    pub tag_ids: Option<Vec<Id>>,
}

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct NewDisability {
    #[validate(length(min = 1, max = 80, message = "name must be 1-80 characters"))]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct NewProfanity {
    #[validate(length(min = 1, max = 64, message = "word must be 1-64 characters"))]
    pub word: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UserIdPayload {
    pub user_id: Id,
}

/// Identity delivered by the SAML assertion, fed to the login upsert.
#[derive(Debug, Clone)]
pub struct SsoIdentity {
    pub external_id: String,
    pub email: String,
    pub display_name: String,
}

/// Everything the feed query filters on. Built by the handler from the
/// query string; `include_deleted` is only honored for admins upstream.
#[derive(Debug, Clone)]
pub struct PostFilter {
    pub viewer: Id,
    pub tag: Option<Id>,
    pub author: Option<Id>,
    pub saved_by: Option<Id>,
    pub search: Option<String>,
    pub include_deleted: bool,
    pub page: i64,
    pub per_page: i64,
}

impl PostFilter {
    pub fn for_viewer(viewer: Id) -> Self {
        Self {
            viewer,
            tag: None,
            author: None,
            saved_by: None,
            search: None,
            include_deleted: false,
            page: 1,
            per_page: PER_PAGE_DEFAULT,
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }
}
