use crate::models::{
    AuthorRef, Comment, CommentView, CreateComment, CreatePost, CreateReport, Disability,
    MeResponse, NewDisability, NewProfanity, Notification, NotificationKind, NotificationView,
    Post, PostExpiry, PostPage, PostView, Profanity, ProfileColor, ProfileView, Report,
    ReportReason, ReportStatus, ReportTargetKind, SeedSummary, TagRef, UpdatePost, UpdateProfile,
    UserIdPayload,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::auth_me,
        crate::routes::get_profile,
        crate::routes::update_profile,
        crate::routes::list_disabilities,
        crate::routes::list_posts,
        crate::routes::create_post,
        crate::routes::get_post,
        crate::routes::update_post,
        crate::routes::delete_post,
        crate::routes::like_post,
        crate::routes::save_post,
        crate::routes::list_comments,
        crate::routes::create_comment,
        crate::routes::delete_comment,
        crate::routes::like_comment,
        crate::routes::create_report,
        crate::routes::list_notifications,
        crate::routes::admin_create_disability,
        crate::routes::admin_list_profanities,
        crate::routes::admin_list_reports,
        crate::routes::admin_run_digest,
    ),
    components(schemas(
        MeResponse, ProfileView, UpdateProfile, AuthorRef, TagRef, ProfileColor,
        Disability, NewDisability, Profanity, NewProfanity,
        Post, PostView, PostPage, CreatePost, UpdatePost, PostExpiry,
        Comment, CommentView, CreateComment,
        Report, CreateReport, ReportTargetKind, ReportReason, ReportStatus,
        Notification, NotificationView, NotificationKind,
        UserIdPayload, SeedSummary, crate::notify::DigestOutcome
    )),
    tags(
        (name = "posts", description = "Member posts and the community feed"),
        (name = "comments", description = "Threaded comments"),
        (name = "admin", description = "Moderation and configuration"),
    )
)]
pub struct ApiDoc;
