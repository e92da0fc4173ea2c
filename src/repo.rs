use chrono::{DateTime, Utc};

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Login upsert. Matches by SSO subject first, then links by email,
    /// then creates a fresh member row.
    async fn upsert_sso_user(&self, identity: SsoIdentity) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    async fn update_profile(&self, id: Id, upd: UpdateProfile) -> RepoResult<User>;
    async fn profile_view(&self, id: Id) -> RepoResult<ProfileView>;
    async fn user_tags(&self, id: Id) -> RepoResult<Vec<TagRef>>;
    async fn set_admin(&self, id: Id, grant: bool) -> RepoResult<User>;
    /// Banning an admin is refused with `Conflict`; demote first.
    async fn set_banned(&self, id: Id, banned: bool) -> RepoResult<User>;
    async fn list_admins(&self) -> RepoResult<Vec<User>>;
    async fn list_banned(&self) -> RepoResult<Vec<User>>;
}

#[async_trait]
pub trait DisabilityRepo: Send + Sync {
    async fn list_disabilities(&self) -> RepoResult<Vec<Disability>>;
    async fn create_disability(&self, name: &str) -> RepoResult<Disability>;
    async fn rename_disability(&self, id: Id, name: &str) -> RepoResult<Disability>;
    async fn delete_disability(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn list_posts(&self, filter: &PostFilter) -> RepoResult<Paged<PostView>>;
    async fn get_post_view(&self, id: Id, viewer: Id, include_deleted: bool) -> RepoResult<PostView>;
    /// Raw row, soft-deleted included. For authorization checks.
    async fn get_post(&self, id: Id) -> RepoResult<Post>;
    async fn create_post(&self, author: Id, new: &CreatePost) -> RepoResult<PostView>;
    async fn update_post(&self, id: Id, upd: &UpdatePost) -> RepoResult<PostView>;
    async fn soft_delete_post(&self, id: Id) -> RepoResult<()>;
    async fn restore_post(&self, id: Id) -> RepoResult<()>;
    async fn hard_delete_post(&self, id: Id) -> RepoResult<()>;
    /// `Conflict` on a second like; returns the new counter.
    async fn like_post(&self, id: Id, user: Id) -> RepoResult<i64>;
    async fn unlike_post(&self, id: Id, user: Id) -> RepoResult<i64>;
    async fn save_post(&self, id: Id, user: Id) -> RepoResult<()>;
    async fn unsave_post(&self, id: Id, user: Id) -> RepoResult<()>;
    /// Removes every post whose deadline has passed; returns the count.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> RepoResult<u64>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn list_comments(&self, post_id: Id, viewer: Id) -> RepoResult<Vec<CommentView>>;
    async fn get_comment(&self, id: Id) -> RepoResult<Comment>;
    async fn create_comment(&self, author: Id, new: &CreateComment) -> RepoResult<CommentView>;
    /// Overwrites the body with [`REMOVED_BODY`]; the row stays for threading.
    async fn soft_delete_comment(&self, id: Id) -> RepoResult<()>;
    async fn hard_delete_comment(&self, id: Id) -> RepoResult<()>;
    async fn like_comment(&self, id: Id, user: Id) -> RepoResult<i64>;
    async fn unlike_comment(&self, id: Id, user: Id) -> RepoResult<i64>;
}

#[async_trait]
pub trait ReportRepo: Send + Sync {
    /// `Conflict` when the reporter already has an open report on the target.
    async fn create_report(&self, reporter: Id, new: &CreateReport) -> RepoResult<Report>;
    async fn list_reports(&self, status: Option<ReportStatus>) -> RepoResult<Vec<Report>>;
    /// Only open reports can be closed; anything else is `Conflict`.
    async fn close_report(&self, id: Id, admin: Id, status: ReportStatus) -> RepoResult<Report>;
}

#[async_trait]
pub trait NotificationRepo: Send + Sync {
    async fn notify(&self, new: NewNotification) -> RepoResult<Notification>;
    async fn list_notifications(&self, user: Id) -> RepoResult<Vec<NotificationView>>;
    async fn mark_notification_read(&self, id: Id, user: Id) -> RepoResult<()>;
    async fn mark_all_read(&self, user: Id) -> RepoResult<u64>;
    /// Unemailed notifications grouped per opted-in member.
    async fn pending_digests(&self) -> RepoResult<Vec<DigestBatch>>;
    async fn mark_emailed(&self, ids: &[Id], at: DateTime<Utc>) -> RepoResult<()>;
}

#[async_trait]
pub trait ProfanityRepo: Send + Sync {
    async fn list_profanities(&self) -> RepoResult<Vec<Profanity>>;
    async fn add_profanity(&self, word: &str) -> RepoResult<Profanity>;
    async fn delete_profanity(&self, id: Id) -> RepoResult<()>;
    async fn blocked_words(&self) -> RepoResult<Vec<String>>;
}

#[async_trait]
pub trait SystemRepo: Send + Sync {
    async fn ping(&self) -> RepoResult<()>;
    async fn seed(&self, disabilities: &[&str], profanities: &[&str]) -> RepoResult<SeedSummary>;
}

pub trait Repo:
    UserRepo
    + DisabilityRepo
    + PostRepo
    + CommentRepo
    + ReportRepo
    + NotificationRepo
    + ProfanityRepo
    + SystemRepo
{
}

impl<T> Repo for T where
    T: UserRepo
        + DisabilityRepo
        + PostRepo
        + CommentRepo
        + ReportRepo
        + NotificationRepo
        + ProfanityRepo
        + SystemRepo
{
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, User>,
        disabilities: HashMap<Id, Disability>,
        posts: HashMap<Id, Post>,
        post_tags: HashMap<Id, Vec<Id>>,
        user_tags: HashMap<Id, Vec<Id>>,
        comments: HashMap<Id, Comment>,
        post_likes: HashSet<(Id, Id)>,    // (post, user)
        post_saves: HashSet<(Id, Id)>,    // (post, user)
        comment_likes: HashSet<(Id, Id)>, // (comment, user)
        reports: HashMap<Id, Report>,
        notifications: HashMap<Id, Notification>,
        profanities: HashMap<Id, Profanity>,
        next_id: Id,
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("KIN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn snapshot_path() -> PathBuf {
            if std::env::var("KIN_DATA_DIR").is_ok() {
                let mut p = Self::data_dir();
                p.push("state.json");
                p
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        log::info!("[inmem] loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        log::warn!(
                            "[inmem] failed to parse snapshot '{}': {e}. Starting empty.",
                            path.display()
                        );
                        State::default()
                    }
                },
                Err(e) => {
                    log::info!("[inmem] no snapshot at '{}': {e}. Starting empty.", path.display());
                    State::default()
                }
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    log::error!("[inmem] failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    fn author_ref(s: &State, id: Id) -> AuthorRef {
        s.users
            .get(&id)
            .map(|u| AuthorRef {
                id: u.id,
                display_name: u.display_name.clone(),
                profile_color: u.profile_color,
            })
            .unwrap_or(AuthorRef {
                id,
                display_name: "unknown".to_string(),
                profile_color: ProfileColor::Slate,
            })
    }

    fn tag_refs(s: &State, ids: &[Id]) -> Vec<TagRef> {
        let mut tags: Vec<TagRef> = ids
            .iter()
            .filter_map(|id| s.disabilities.get(id))
            .map(|d| TagRef { id: d.id, name: d.name.clone() })
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    fn post_view(s: &State, p: &Post, viewer: Id) -> PostView {
        let tag_ids = s.post_tags.get(&p.id).cloned().unwrap_or_default();
        PostView {
            id: p.id,
            author: author_ref(s, p.author_id),
            title: p.title.clone(),
            body: p.body.clone(),
            expiry: p.expiry,
            tags: tag_refs(s, &tag_ids),
            like_count: p.like_count,
            comment_count: s.comments.values().filter(|c| c.post_id == p.id).count() as i64,
            liked: s.post_likes.contains(&(p.id, viewer)),
            saved: s.post_saves.contains(&(p.id, viewer)),
            created_at: p.created_at,
            updated_at: p.updated_at,
            deleted_at: p.deleted_at,
        }
    }

    fn comment_view(s: &State, c: &Comment, viewer: Id) -> CommentView {
        CommentView {
            id: c.id,
            post_id: c.post_id,
            author: author_ref(s, c.author_id),
            parent_id: c.parent_id,
            body: c.body.clone(),
            like_count: c.like_count,
            liked: s.comment_likes.contains(&(c.id, viewer)),
            deleted: c.deleted_at.is_some(),
            created_at: c.created_at,
        }
    }

    fn tags_exist(s: &State, ids: &[Id]) -> bool {
        ids.iter().all(|id| s.disabilities.contains_key(id))
    }

    fn dedup_tags(ids: &[Id]) -> Vec<Id> {
        let mut v = ids.to_vec();
        v.sort_unstable();
        v.dedup();
        v
    }

    /// Comment plus all of its descendants, breadth first.
    fn comment_tree(s: &State, root: Id) -> Vec<Id> {
        let mut acc = vec![root];
        let mut i = 0;
        while i < acc.len() {
            let parent = acc[i];
            acc.extend(
                s.comments
                    .values()
                    .filter(|c| c.parent_id == Some(parent))
                    .map(|c| c.id),
            );
            i += 1;
        }
        acc
    }

    fn remove_post_cascade(s: &mut State, id: Id) {
        let comment_ids: Vec<Id> =
            s.comments.values().filter(|c| c.post_id == id).map(|c| c.id).collect();
        for cid in &comment_ids {
            s.comments.remove(cid);
        }
        s.comment_likes.retain(|(cid, _)| !comment_ids.contains(cid));
        s.post_likes.retain(|(pid, _)| *pid != id);
        s.post_saves.retain(|(pid, _)| *pid != id);
        s.post_tags.remove(&id);
        s.notifications.retain(|_, n| {
            n.post_id != Some(id)
                && !n.comment_id.map_or(false, |c| comment_ids.contains(&c))
        });
        s.posts.remove(&id);
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn upsert_sso_user(&self, identity: SsoIdentity) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            let by_subject = s
                .users
                .values()
                .find(|u| u.external_id.as_deref() == Some(identity.external_id.as_str()))
                .map(|u| u.id);
            if let Some(uid) = by_subject {
                // Refresh the email unless another account already holds it.
                let email_taken = s.users.values().any(|o| {
                    o.id != uid && o.email.eq_ignore_ascii_case(&identity.email)
                });
                let user = s.users.get_mut(&uid).ok_or(RepoError::NotFound)?;
                if !email_taken && !user.email.eq_ignore_ascii_case(&identity.email) {
                    user.email = identity.email.clone();
                }
                let out = user.clone();
                drop(s);
                self.persist();
                return Ok(out);
            }
            let by_email = s
                .users
                .values()
                .find(|u| u.email.eq_ignore_ascii_case(&identity.email))
                .map(|u| u.id);
            let out = if let Some(uid) = by_email {
                let user = s.users.get_mut(&uid).ok_or(RepoError::NotFound)?;
                user.external_id = Some(identity.external_id.clone());
                user.clone()
            } else {
                let id = Self::next_id(&mut s);
                let user = User {
                    id,
                    external_id: Some(identity.external_id.clone()),
                    email: identity.email.clone(),
                    display_name: identity.display_name.clone(),
                    profile_color: ProfileColor::default(),
                    bio: None,
                    is_admin: false,
                    is_banned: false,
                    digest_opt_in: true,
                    created_at: Utc::now(),
                };
                s.users.insert(id, user.clone());
                user
            };
            drop(s);
            self.persist();
            Ok(out)
        }

        async fn get_user(&self, id: Id) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn update_profile(&self, id: Id, upd: UpdateProfile) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            if let Some(ref tag_ids) = upd.tag_ids {
                if !tags_exist(&s, tag_ids) {
                    return Err(RepoError::NotFound);
                }
            }
            if !s.users.contains_key(&id) {
                return Err(RepoError::NotFound);
            }
            if let Some(tag_ids) = &upd.tag_ids {
                s.user_tags.insert(id, dedup_tags(tag_ids));
            }
            let user = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(name) = upd.display_name {
                user.display_name = name;
            }
            if let Some(bio) = upd.bio {
                user.bio = Some(bio);
            }
            if let Some(color) = upd.profile_color {
                user.profile_color = color;
            }
            if let Some(opt) = upd.digest_opt_in {
                user.digest_opt_in = opt;
            }
            let out = user.clone();
            drop(s);
            self.persist();
            Ok(out)
        }

        async fn profile_view(&self, id: Id) -> RepoResult<ProfileView> {
            let s = self.state.read().unwrap();
            let user = s.users.get(&id).ok_or(RepoError::NotFound)?;
            let tag_ids = s.user_tags.get(&id).cloned().unwrap_or_default();
            Ok(ProfileView {
                id: user.id,
                display_name: user.display_name.clone(),
                profile_color: user.profile_color,
                bio: user.bio.clone(),
                tags: tag_refs(&s, &tag_ids),
                post_count: s
                    .posts
                    .values()
                    .filter(|p| p.author_id == id && p.deleted_at.is_none())
                    .count() as i64,
                joined_at: user.created_at,
            })
        }

        async fn user_tags(&self, id: Id) -> RepoResult<Vec<TagRef>> {
            let s = self.state.read().unwrap();
            if !s.users.contains_key(&id) {
                return Err(RepoError::NotFound);
            }
            let tag_ids = s.user_tags.get(&id).cloned().unwrap_or_default();
            Ok(tag_refs(&s, &tag_ids))
        }

        async fn set_admin(&self, id: Id, grant: bool) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            let user = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
            user.is_admin = grant;
            let out = user.clone();
            drop(s);
            self.persist();
            Ok(out)
        }

        async fn set_banned(&self, id: Id, banned: bool) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            let user = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
            if banned && user.is_admin {
                return Err(RepoError::Conflict);
            }
            user.is_banned = banned;
            let out = user.clone();
            drop(s);
            self.persist();
            Ok(out)
        }

        async fn list_admins(&self) -> RepoResult<Vec<User>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<User> = s.users.values().filter(|u| u.is_admin).cloned().collect();
            v.sort_by(|a, b| a.display_name.cmp(&b.display_name));
            Ok(v)
        }

        async fn list_banned(&self) -> RepoResult<Vec<User>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<User> = s.users.values().filter(|u| u.is_banned).cloned().collect();
            v.sort_by(|a, b| a.display_name.cmp(&b.display_name));
            Ok(v)
        }
    }

    #[async_trait]
    impl DisabilityRepo for InMemRepo {
        async fn list_disabilities(&self) -> RepoResult<Vec<Disability>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<Disability> = s.disabilities.values().cloned().collect();
            v.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(v)
        }

        async fn create_disability(&self, name: &str) -> RepoResult<Disability> {
            let mut s = self.state.write().unwrap();
            if s.disabilities.values().any(|d| d.name.eq_ignore_ascii_case(name)) {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let d = Disability { id, name: name.to_string(), created_at: Utc::now() };
            s.disabilities.insert(id, d.clone());
            drop(s);
            self.persist();
            Ok(d)
        }

        async fn rename_disability(&self, id: Id, name: &str) -> RepoResult<Disability> {
            let mut s = self.state.write().unwrap();
            if s
                .disabilities
                .values()
                .any(|d| d.id != id && d.name.eq_ignore_ascii_case(name))
            {
                return Err(RepoError::Conflict);
            }
            let d = s.disabilities.get_mut(&id).ok_or(RepoError::NotFound)?;
            d.name = name.to_string();
            let out = d.clone();
            drop(s);
            self.persist();
            Ok(out)
        }

        async fn delete_disability(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            if s.disabilities.remove(&id).is_none() {
                return Err(RepoError::NotFound);
            }
            // Detach from every post and profile that carried the tag.
            for tags in s.post_tags.values_mut() {
                tags.retain(|t| *t != id);
            }
            for tags in s.user_tags.values_mut() {
                tags.retain(|t| *t != id);
            }
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn list_posts(&self, filter: &PostFilter) -> RepoResult<Paged<PostView>> {
            let s = self.state.read().unwrap();
            let now = Utc::now();
            let needle = filter.search.as_deref().map(|q| q.to_lowercase());
            let mut rows: Vec<&Post> = s
                .posts
                .values()
                .filter(|p| {
                    (filter.include_deleted || p.deleted_at.is_none())
                        && (filter.include_deleted || p.expires_at.map_or(true, |t| t > now))
                        && filter.author.map_or(true, |a| p.author_id == a)
                        && filter.tag.map_or(true, |t| {
                            s.post_tags.get(&p.id).map_or(false, |v| v.contains(&t))
                        })
                        && filter.saved_by.map_or(true, |u| s.post_saves.contains(&(p.id, u)))
                        && needle.as_deref().map_or(true, |q| {
                            p.title.to_lowercase().contains(q)
                                || p.body.to_lowercase().contains(q)
                        })
                })
                .collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            let total = rows.len() as i64;
            let items: Vec<PostView> = rows
                .into_iter()
                .skip(filter.offset() as usize)
                .take(filter.per_page as usize)
                .map(|p| post_view(&s, p, filter.viewer))
                .collect();
            Ok(Paged::new(items, total, filter.page, filter.per_page))
        }

        async fn get_post_view(
            &self,
            id: Id,
            viewer: Id,
            include_deleted: bool,
        ) -> RepoResult<PostView> {
            let s = self.state.read().unwrap();
            let p = s.posts.get(&id).ok_or(RepoError::NotFound)?;
            if p.deleted_at.is_some() && !include_deleted {
                return Err(RepoError::NotFound);
            }
            // Expired posts drop out of view before the sweep removes them.
            if !include_deleted && p.expires_at.map_or(false, |t| t <= Utc::now()) {
                return Err(RepoError::NotFound);
            }
            Ok(post_view(&s, p, viewer))
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let s = self.state.read().unwrap();
            s.posts.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn create_post(&self, author: Id, new: &CreatePost) -> RepoResult<PostView> {
            let mut s = self.state.write().unwrap();
            let tags = dedup_tags(&new.tag_ids);
            if !tags_exist(&s, &tags) {
                return Err(RepoError::NotFound);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let post = Post {
                id,
                author_id: author,
                title: new.title.clone(),
                body: new.body.clone(),
                expiry: new.expiry,
                expires_at: new.expiry.deadline(now),
                like_count: 0,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            s.posts.insert(id, post.clone());
            s.post_tags.insert(id, tags);
            let view = post_view(&s, &post, author);
            drop(s);
            self.persist();
            Ok(view)
        }

        async fn update_post(&self, id: Id, upd: &UpdatePost) -> RepoResult<PostView> {
            let mut s = self.state.write().unwrap();
            if let Some(ref tag_ids) = upd.tag_ids {
                if !tags_exist(&s, tag_ids) {
                    return Err(RepoError::NotFound);
                }
            }
            {
                let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
                if post.deleted_at.is_some() {
                    return Err(RepoError::NotFound);
                }
                if let Some(ref title) = upd.title {
                    post.title = title.clone();
                }
                if let Some(ref body) = upd.body {
                    post.body = body.clone();
                }
                if let Some(expiry) = upd.expiry {
                    post.expiry = expiry;
                    // Deadline stays anchored to creation time.
                    post.expires_at = expiry.deadline(post.created_at);
                }
                post.updated_at = Utc::now();
            }
            if let Some(tag_ids) = &upd.tag_ids {
                s.post_tags.insert(id, dedup_tags(tag_ids));
            }
            let post = s.posts.get(&id).ok_or(RepoError::NotFound)?.clone();
            let view = post_view(&s, &post, post.author_id);
            drop(s);
            self.persist();
            Ok(view)
        }

        async fn soft_delete_post(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            if post.deleted_at.is_none() {
                post.deleted_at = Some(Utc::now());
            }
            drop(s);
            self.persist();
            Ok(())
        }

        async fn restore_post(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            if post.deleted_at.is_none() {
                return Err(RepoError::Conflict);
            }
            post.deleted_at = None;
            drop(s);
            self.persist();
            Ok(())
        }

        async fn hard_delete_post(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&id) {
                return Err(RepoError::NotFound);
            }
            remove_post_cascade(&mut s, id);
            drop(s);
            self.persist();
            Ok(())
        }

        async fn like_post(&self, id: Id, user: Id) -> RepoResult<i64> {
            let mut s = self.state.write().unwrap();
            let live = s.posts.get(&id).map_or(false, |p| p.deleted_at.is_none());
            if !live {
                return Err(RepoError::NotFound);
            }
            if !s.post_likes.insert((id, user)) {
                return Err(RepoError::Conflict);
            }
            let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            post.like_count += 1;
            let count = post.like_count;
            drop(s);
            self.persist();
            Ok(count)
        }

        async fn unlike_post(&self, id: Id, user: Id) -> RepoResult<i64> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&id) {
                return Err(RepoError::NotFound);
            }
            if !s.post_likes.remove(&(id, user)) {
                return Err(RepoError::Conflict);
            }
            let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            post.like_count = (post.like_count - 1).max(0);
            let count = post.like_count;
            drop(s);
            self.persist();
            Ok(count)
        }

        async fn save_post(&self, id: Id, user: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let live = s.posts.get(&id).map_or(false, |p| p.deleted_at.is_none());
            if !live {
                return Err(RepoError::NotFound);
            }
            if !s.post_saves.insert((id, user)) {
                return Err(RepoError::Conflict);
            }
            drop(s);
            self.persist();
            Ok(())
        }

        async fn unsave_post(&self, id: Id, user: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&id) {
                return Err(RepoError::NotFound);
            }
            if !s.post_saves.remove(&(id, user)) {
                return Err(RepoError::Conflict);
            }
            drop(s);
            self.persist();
            Ok(())
        }

        async fn sweep_expired(&self, now: DateTime<Utc>) -> RepoResult<u64> {
            let mut s = self.state.write().unwrap();
            let doomed: Vec<Id> = s
                .posts
                .values()
                .filter(|p| p.expires_at.map_or(false, |e| e <= now))
                .map(|p| p.id)
                .collect();
            for id in &doomed {
                remove_post_cascade(&mut s, *id);
            }
            let n = doomed.len() as u64;
            drop(s);
            if n > 0 {
                self.persist();
            }
            Ok(n)
        }
    }

    #[async_trait]
    impl CommentRepo for InMemRepo {
        async fn list_comments(&self, post_id: Id, viewer: Id) -> RepoResult<Vec<CommentView>> {
            let s = self.state.read().unwrap();
            if !s.posts.contains_key(&post_id) {
                return Err(RepoError::NotFound);
            }
            let mut v: Vec<&Comment> =
                s.comments.values().filter(|c| c.post_id == post_id).collect();
            v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(v.into_iter().map(|c| comment_view(&s, c, viewer)).collect())
        }

        async fn get_comment(&self, id: Id) -> RepoResult<Comment> {
            let s = self.state.read().unwrap();
            s.comments.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn create_comment(&self, author: Id, new: &CreateComment) -> RepoResult<CommentView> {
            let mut s = self.state.write().unwrap();
            let live = s.posts.get(&new.post_id).map_or(false, |p| p.deleted_at.is_none());
            if !live {
                return Err(RepoError::NotFound);
            }
            if let Some(pid) = new.parent_id {
                let parent_ok =
                    s.comments.get(&pid).map_or(false, |p| p.post_id == new.post_id);
                if !parent_ok {
                    return Err(RepoError::Conflict);
                }
            }
            let id = Self::next_id(&mut s);
            let comment = Comment {
                id,
                post_id: new.post_id,
                author_id: author,
                parent_id: new.parent_id,
                body: new.body.clone(),
                like_count: 0,
                created_at: Utc::now(),
                deleted_at: None,
            };
            s.comments.insert(id, comment.clone());
            let view = comment_view(&s, &comment, author);
            drop(s);
            self.persist();
            Ok(view)
        }

        async fn soft_delete_comment(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let comment = s.comments.get_mut(&id).ok_or(RepoError::NotFound)?;
            if comment.deleted_at.is_none() {
                comment.deleted_at = Some(Utc::now());
                comment.body = REMOVED_BODY.to_string();
            }
            drop(s);
            self.persist();
            Ok(())
        }

        async fn hard_delete_comment(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            if !s.comments.contains_key(&id) {
                return Err(RepoError::NotFound);
            }
            let doomed = comment_tree(&s, id);
            for cid in &doomed {
                s.comments.remove(cid);
            }
            s.comment_likes.retain(|(cid, _)| !doomed.contains(cid));
            s.notifications
                .retain(|_, n| !n.comment_id.map_or(false, |c| doomed.contains(&c)));
            drop(s);
            self.persist();
            Ok(())
        }

        async fn like_comment(&self, id: Id, user: Id) -> RepoResult<i64> {
            let mut s = self.state.write().unwrap();
            let live = s.comments.get(&id).map_or(false, |c| c.deleted_at.is_none());
            if !live {
                return Err(RepoError::NotFound);
            }
            if !s.comment_likes.insert((id, user)) {
                return Err(RepoError::Conflict);
            }
            let comment = s.comments.get_mut(&id).ok_or(RepoError::NotFound)?;
            comment.like_count += 1;
            let count = comment.like_count;
            drop(s);
            self.persist();
            Ok(count)
        }

        async fn unlike_comment(&self, id: Id, user: Id) -> RepoResult<i64> {
            let mut s = self.state.write().unwrap();
            if !s.comments.contains_key(&id) {
                return Err(RepoError::NotFound);
            }
            if !s.comment_likes.remove(&(id, user)) {
                return Err(RepoError::Conflict);
            }
            let comment = s.comments.get_mut(&id).ok_or(RepoError::NotFound)?;
            comment.like_count = (comment.like_count - 1).max(0);
            let count = comment.like_count;
            drop(s);
            self.persist();
            Ok(count)
        }
    }

    #[async_trait]
    impl ReportRepo for InMemRepo {
        async fn create_report(&self, reporter: Id, new: &CreateReport) -> RepoResult<Report> {
            let mut s = self.state.write().unwrap();
            let target_exists = match new.target_kind {
                ReportTargetKind::Post => s.posts.contains_key(&new.target_id),
                ReportTargetKind::Comment => s.comments.contains_key(&new.target_id),
                ReportTargetKind::User => s.users.contains_key(&new.target_id),
            };
            if !target_exists {
                return Err(RepoError::NotFound);
            }
            let duplicate = s.reports.values().any(|r| {
                r.reporter_id == reporter
                    && r.target_kind == new.target_kind
                    && r.target_id == new.target_id
                    && r.status == ReportStatus::Open
            });
            if duplicate {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let report = Report {
                id,
                reporter_id: reporter,
                target_kind: new.target_kind,
                target_id: new.target_id,
                reason: new.reason,
                detail: new.detail.clone(),
                status: ReportStatus::Open,
                created_at: Utc::now(),
                resolved_at: None,
                resolved_by: None,
            };
            s.reports.insert(id, report.clone());
            drop(s);
            self.persist();
            Ok(report)
        }

        async fn list_reports(&self, status: Option<ReportStatus>) -> RepoResult<Vec<Report>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<Report> = s
                .reports
                .values()
                .filter(|r| status.map_or(true, |st| r.status == st))
                .cloned()
                .collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(v)
        }

        async fn close_report(
            &self,
            id: Id,
            admin: Id,
            status: ReportStatus,
        ) -> RepoResult<Report> {
            let mut s = self.state.write().unwrap();
            let report = s.reports.get_mut(&id).ok_or(RepoError::NotFound)?;
            if report.status != ReportStatus::Open {
                return Err(RepoError::Conflict);
            }
            report.status = status;
            report.resolved_at = Some(Utc::now());
            report.resolved_by = Some(admin);
            let out = report.clone();
            drop(s);
            self.persist();
            Ok(out)
        }
    }

    #[async_trait]
    impl NotificationRepo for InMemRepo {
        async fn notify(&self, new: NewNotification) -> RepoResult<Notification> {
            let mut s = self.state.write().unwrap();
            if !s.users.contains_key(&new.user_id) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let n = Notification {
                id,
                user_id: new.user_id,
                kind: new.kind,
                actor_id: new.actor_id,
                post_id: new.post_id,
                comment_id: new.comment_id,
                read: false,
                emailed_at: None,
                created_at: Utc::now(),
            };
            s.notifications.insert(id, n.clone());
            drop(s);
            self.persist();
            Ok(n)
        }

        async fn list_notifications(&self, user: Id) -> RepoResult<Vec<NotificationView>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<&Notification> =
                s.notifications.values().filter(|n| n.user_id == user).collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(v
                .into_iter()
                .take(100)
                .map(|n| NotificationView {
                    id: n.id,
                    kind: n.kind,
                    actor: n.actor_id.map(|a| author_ref(&s, a)),
                    post_id: n.post_id,
                    post_title: n
                        .post_id
                        .and_then(|p| s.posts.get(&p))
                        .map(|p| p.title.clone()),
                    comment_id: n.comment_id,
                    read: n.read,
                    created_at: n.created_at,
                })
                .collect())
        }

        async fn mark_notification_read(&self, id: Id, user: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let n = s
                .notifications
                .get_mut(&id)
                .filter(|n| n.user_id == user)
                .ok_or(RepoError::NotFound)?;
            n.read = true;
            drop(s);
            self.persist();
            Ok(())
        }

        async fn mark_all_read(&self, user: Id) -> RepoResult<u64> {
            let mut s = self.state.write().unwrap();
            let mut n = 0;
            for notif in s.notifications.values_mut() {
                if notif.user_id == user && !notif.read {
                    notif.read = true;
                    n += 1;
                }
            }
            drop(s);
            if n > 0 {
                self.persist();
            }
            Ok(n)
        }

        async fn pending_digests(&self) -> RepoResult<Vec<DigestBatch>> {
            let s = self.state.read().unwrap();
            let mut grouped: BTreeMap<Id, Vec<&Notification>> = BTreeMap::new();
            for n in s.notifications.values().filter(|n| n.emailed_at.is_none()) {
                let eligible = s
                    .users
                    .get(&n.user_id)
                    .map_or(false, |u| u.digest_opt_in && !u.is_banned);
                if eligible {
                    grouped.entry(n.user_id).or_default().push(n);
                }
            }
            let mut out = Vec::with_capacity(grouped.len());
            for (user_id, mut items) in grouped {
                let user = match s.users.get(&user_id) {
                    Some(u) => u,
                    None => continue,
                };
                items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                out.push(DigestBatch {
                    user_id,
                    email: user.email.clone(),
                    display_name: user.display_name.clone(),
                    items: items
                        .into_iter()
                        .map(|n| DigestItem {
                            notification_id: n.id,
                            kind: n.kind,
                            actor_name: n
                                .actor_id
                                .and_then(|a| s.users.get(&a))
                                .map(|u| u.display_name.clone()),
                            post_title: n
                                .post_id
                                .and_then(|p| s.posts.get(&p))
                                .map(|p| p.title.clone()),
                        })
                        .collect(),
                });
            }
            Ok(out)
        }

        async fn mark_emailed(&self, ids: &[Id], at: DateTime<Utc>) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            for id in ids {
                if let Some(n) = s.notifications.get_mut(id) {
                    n.emailed_at = Some(at);
                }
            }
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl ProfanityRepo for InMemRepo {
        async fn list_profanities(&self) -> RepoResult<Vec<Profanity>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<Profanity> = s.profanities.values().cloned().collect();
            v.sort_by(|a, b| a.word.cmp(&b.word));
            Ok(v)
        }

        async fn add_profanity(&self, word: &str) -> RepoResult<Profanity> {
            let word = word.trim().to_lowercase();
            let mut s = self.state.write().unwrap();
            if s.profanities.values().any(|p| p.word == word) {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let p = Profanity { id, word, created_at: Utc::now() };
            s.profanities.insert(id, p.clone());
            drop(s);
            self.persist();
            Ok(p)
        }

        async fn delete_profanity(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            if s.profanities.remove(&id).is_none() {
                return Err(RepoError::NotFound);
            }
            drop(s);
            self.persist();
            Ok(())
        }

        async fn blocked_words(&self) -> RepoResult<Vec<String>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<String> = s.profanities.values().map(|p| p.word.clone()).collect();
            v.sort();
            Ok(v)
        }
    }

    #[async_trait]
    impl SystemRepo for InMemRepo {
        async fn ping(&self) -> RepoResult<()> {
            Ok(())
        }

        async fn seed(&self, disabilities: &[&str], profanities: &[&str]) -> RepoResult<SeedSummary> {
            let mut s = self.state.write().unwrap();
            let mut disabilities_added = 0u64;
            for name in disabilities {
                if !s.disabilities.values().any(|d| d.name.eq_ignore_ascii_case(name)) {
                    let id = Self::next_id(&mut s);
                    s.disabilities
                        .insert(id, Disability { id, name: name.to_string(), created_at: Utc::now() });
                    disabilities_added += 1;
                }
            }
            let mut profanities_added = 0u64;
            for word in profanities {
                let word = word.trim().to_lowercase();
                if !word.is_empty() && !s.profanities.values().any(|p| p.word == word) {
                    let id = Self::next_id(&mut s);
                    s.profanities.insert(id, Profanity { id, word, created_at: Utc::now() });
                    profanities_added += 1;
                }
            }
            drop(s);
            self.persist();
            Ok(SeedSummary { disabilities_added, profanities_added })
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres, QueryBuilder};

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }
    }

    fn internal(e: sqlx::Error) -> RepoError {
        RepoError::Internal(e.to_string())
    }

    fn map_row(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            other => internal(other),
        }
    }

    /// Unique violations become `Conflict`, broken references `NotFound`.
    fn map_constraint(e: sqlx::Error) -> RepoError {
        if let sqlx::Error::Database(db) = &e {
            match db.code().as_deref() {
                Some("23505") => return RepoError::Conflict,
                Some("23503") => return RepoError::NotFound,
                _ => {}
            }
        }
        internal(e)
    }

    fn escape_like(s: &str) -> String {
        s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
    }

    #[derive(sqlx::FromRow)]
    struct PostViewRow {
        id: Id,
        author_id: Id,
        author_name: String,
        author_color: ProfileColor,
        title: String,
        body: String,
        expiry: PostExpiry,
        like_count: i64,
        comment_count: i64,
        liked: bool,
        saved: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
        tag_ids: Vec<Id>,
        tag_names: Vec<String>,
    }

    impl PostViewRow {
        fn into_view(self) -> PostView {
            let tags = self
                .tag_ids
                .into_iter()
                .zip(self.tag_names)
                .map(|(id, name)| TagRef { id, name })
                .collect();
            PostView {
                id: self.id,
                author: AuthorRef {
                    id: self.author_id,
                    display_name: self.author_name,
                    profile_color: self.author_color,
                },
                title: self.title,
                body: self.body,
                expiry: self.expiry,
                tags,
                like_count: self.like_count,
                comment_count: self.comment_count,
                liked: self.liked,
                saved: self.saved,
                created_at: self.created_at,
                updated_at: self.updated_at,
                deleted_at: self.deleted_at,
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct CommentViewRow {
        id: Id,
        post_id: Id,
        author_id: Id,
        author_name: String,
        author_color: ProfileColor,
        parent_id: Option<Id>,
        body: String,
        like_count: i64,
        liked: bool,
        deleted: bool,
        created_at: DateTime<Utc>,
    }

    impl CommentViewRow {
        fn into_view(self) -> CommentView {
            CommentView {
                id: self.id,
                post_id: self.post_id,
                author: AuthorRef {
                    id: self.author_id,
                    display_name: self.author_name,
                    profile_color: self.author_color,
                },
                parent_id: self.parent_id,
                body: self.body,
                like_count: self.like_count,
                liked: self.liked,
                deleted: self.deleted,
                created_at: self.created_at,
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct NotificationViewRow {
        id: Id,
        kind: NotificationKind,
        actor_id: Option<Id>,
        actor_name: Option<String>,
        actor_color: Option<ProfileColor>,
        post_id: Option<Id>,
        post_title: Option<String>,
        comment_id: Option<Id>,
        read: bool,
        created_at: DateTime<Utc>,
    }

    impl NotificationViewRow {
        fn into_view(self) -> NotificationView {
            let actor = match (self.actor_id, self.actor_name, self.actor_color) {
                (Some(id), Some(display_name), Some(profile_color)) => {
                    Some(AuthorRef { id, display_name, profile_color })
                }
                _ => None,
            };
            NotificationView {
                id: self.id,
                kind: self.kind,
                actor,
                post_id: self.post_id,
                post_title: self.post_title,
                comment_id: self.comment_id,
                read: self.read,
                created_at: self.created_at,
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct DigestRow {
        notification_id: Id,
        user_id: Id,
        email: String,
        display_name: String,
        kind: NotificationKind,
        actor_name: Option<String>,
        post_title: Option<String>,
    }

    /// SELECT portion of every post view query. Viewer id feeds the
    /// liked/saved EXISTS probes.
    fn push_post_view_select(qb: &mut QueryBuilder<'_, Postgres>, viewer: Id) {
        qb.push(
            "SELECT p.id, p.author_id, u.display_name AS author_name, \
             u.profile_color AS author_color, p.title, p.body, p.expiry, p.like_count, \
             (SELECT COUNT(*) FROM comments c WHERE c.post_id = p.id) AS comment_count, \
             EXISTS(SELECT 1 FROM post_likes pl WHERE pl.post_id = p.id AND pl.user_id = ",
        );
        qb.push_bind(viewer);
        qb.push(") AS liked, EXISTS(SELECT 1 FROM post_saves ps WHERE ps.post_id = p.id AND ps.user_id = ");
        qb.push_bind(viewer);
        qb.push(
            ") AS saved, p.created_at, p.updated_at, p.deleted_at, \
             tags.ids AS tag_ids, tags.names AS tag_names \
             FROM posts p \
             JOIN users u ON u.id = p.author_id \
             LEFT JOIN LATERAL ( \
                SELECT COALESCE(array_agg(d.id ORDER BY d.name), '{}') AS ids, \
                       COALESCE(array_agg(d.name ORDER BY d.name), '{}') AS names \
                FROM post_disabilities pd \
                JOIN disabilities d ON d.id = pd.disability_id \
                WHERE pd.post_id = p.id \
             ) tags ON TRUE",
        );
    }

    fn push_post_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &PostFilter) {
        qb.push(" WHERE TRUE");
        if !filter.include_deleted {
            qb.push(" AND p.deleted_at IS NULL");
            qb.push(" AND (p.expires_at IS NULL OR p.expires_at > now())");
        }
        if let Some(author) = filter.author {
            qb.push(" AND p.author_id = ");
            qb.push_bind(author);
        }
        if let Some(tag) = filter.tag {
            qb.push(
                " AND EXISTS(SELECT 1 FROM post_disabilities fpd WHERE fpd.post_id = p.id AND fpd.disability_id = ",
            );
            qb.push_bind(tag);
            qb.push(")");
        }
        if let Some(saver) = filter.saved_by {
            qb.push(
                " AND EXISTS(SELECT 1 FROM post_saves fps WHERE fps.post_id = p.id AND fps.user_id = ",
            );
            qb.push_bind(saver);
            qb.push(")");
        }
        if let Some(ref q) = filter.search {
            let pattern = format!("%{}%", escape_like(q));
            qb.push(" AND (p.title ILIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" ESCAPE '\\' OR p.body ILIKE ");
            qb.push_bind(pattern);
            qb.push(" ESCAPE '\\')");
        }
    }

    const COMMENT_VIEW_SELECT: &str =
        "SELECT c.id, c.post_id, c.author_id, u.display_name AS author_name, \
         u.profile_color AS author_color, c.parent_id, c.body, c.like_count, \
         EXISTS(SELECT 1 FROM comment_likes cl WHERE cl.comment_id = c.id AND cl.user_id = $2) AS liked, \
         (c.deleted_at IS NOT NULL) AS deleted, c.created_at \
         FROM comments c JOIN users u ON u.id = c.author_id";

    impl PgRepo {
        async fn fetch_post_view(
            &self,
            id: Id,
            viewer: Id,
            include_deleted: bool,
        ) -> RepoResult<PostView> {
            let mut qb = QueryBuilder::new("");
            push_post_view_select(&mut qb, viewer);
            qb.push(" WHERE p.id = ");
            qb.push_bind(id);
            if !include_deleted {
                // Expired posts drop out of view before the sweep removes them.
                qb.push(" AND p.deleted_at IS NULL");
                qb.push(" AND (p.expires_at IS NULL OR p.expires_at > now())");
            }
            let row: Option<PostViewRow> = qb
                .build_query_as()
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
            row.map(PostViewRow::into_view).ok_or(RepoError::NotFound)
        }

        async fn verify_tags(
            tx: &mut sqlx::Transaction<'_, Postgres>,
            tags: &[Id],
        ) -> RepoResult<()> {
            if tags.is_empty() {
                return Ok(());
            }
            let found: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM disabilities WHERE id = ANY($1)")
                    .bind(tags)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(internal)?;
            if found as usize != tags.len() {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        fn dedup_tags(ids: &[Id]) -> Vec<Id> {
            let mut v = ids.to_vec();
            v.sort_unstable();
            v.dedup();
            v
        }
    }

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn upsert_sso_user(&self, identity: SsoIdentity) -> RepoResult<User> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let existing: Option<User> =
                sqlx::query_as("SELECT * FROM users WHERE external_id = $1")
                    .bind(&identity.external_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(internal)?;
            let user = if let Some(u) = existing {
                // Refresh the email unless another account already holds it.
                sqlx::query(
                    "UPDATE users SET email = $2 WHERE id = $1 AND NOT EXISTS \
                     (SELECT 1 FROM users o WHERE lower(o.email) = lower($2) AND o.id <> $1)",
                )
                .bind(u.id)
                .bind(&identity.email)
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
                sqlx::query_as("SELECT * FROM users WHERE id = $1")
                    .bind(u.id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(internal)?
            } else {
                let by_email: Option<User> =
                    sqlx::query_as("SELECT * FROM users WHERE lower(email) = lower($1)")
                        .bind(&identity.email)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(internal)?;
                match by_email {
                    Some(u) => sqlx::query_as(
                        "UPDATE users SET external_id = $2 WHERE id = $1 RETURNING *",
                    )
                    .bind(u.id)
                    .bind(&identity.external_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(internal)?,
                    None => sqlx::query_as(
                        "INSERT INTO users (external_id, email, display_name) \
                         VALUES ($1, $2, $3) RETURNING *",
                    )
                    .bind(&identity.external_id)
                    .bind(&identity.email)
                    .bind(&identity.display_name)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(map_constraint)?,
                }
            };
            tx.commit().await.map_err(internal)?;
            Ok(user)
        }

        async fn get_user(&self, id: Id) -> RepoResult<User> {
            sqlx::query_as("SELECT * FROM users WHERE id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_row)
        }

        async fn update_profile(&self, id: Id, upd: UpdateProfile) -> RepoResult<User> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            if let Some(ref tag_ids) = upd.tag_ids {
                let tags = Self::dedup_tags(tag_ids);
                Self::verify_tags(&mut tx, &tags).await?;
                sqlx::query("DELETE FROM user_disabilities WHERE user_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(internal)?;
                if !tags.is_empty() {
                    sqlx::query(
                        "INSERT INTO user_disabilities (user_id, disability_id) \
                         SELECT $1, x FROM UNNEST($2::bigint[]) AS x",
                    )
                    .bind(id)
                    .bind(&tags)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_constraint)?;
                }
            }
            let user: User = sqlx::query_as(
                "UPDATE users SET \
                 display_name = COALESCE($2, display_name), \
                 bio = COALESCE($3, bio), \
                 profile_color = COALESCE($4, profile_color), \
                 digest_opt_in = COALESCE($5, digest_opt_in) \
                 WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(upd.display_name)
            .bind(upd.bio)
            .bind(upd.profile_color)
            .bind(upd.digest_opt_in)
            .fetch_optional(&mut *tx)
            .await
            .map_err(internal)?
            .ok_or(RepoError::NotFound)?;
            tx.commit().await.map_err(internal)?;
            Ok(user)
        }

        async fn profile_view(&self, id: Id) -> RepoResult<ProfileView> {
            #[derive(sqlx::FromRow)]
            struct Row {
                id: Id,
                display_name: String,
                profile_color: ProfileColor,
                bio: Option<String>,
                post_count: i64,
                joined_at: DateTime<Utc>,
            }
            let row: Row = sqlx::query_as(
                "SELECT u.id, u.display_name, u.profile_color, u.bio, \
                 (SELECT COUNT(*) FROM posts p WHERE p.author_id = u.id AND p.deleted_at IS NULL) AS post_count, \
                 u.created_at AS joined_at \
                 FROM users u WHERE u.id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_row)?;
            let tags = self.user_tags(id).await?;
            Ok(ProfileView {
                id: row.id,
                display_name: row.display_name,
                profile_color: row.profile_color,
                bio: row.bio,
                tags,
                post_count: row.post_count,
                joined_at: row.joined_at,
            })
        }

        async fn user_tags(&self, id: Id) -> RepoResult<Vec<TagRef>> {
            sqlx::query_as(
                "SELECT d.id, d.name FROM user_disabilities ud \
                 JOIN disabilities d ON d.id = ud.disability_id \
                 WHERE ud.user_id = $1 ORDER BY d.name",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)
        }

        async fn set_admin(&self, id: Id, grant: bool) -> RepoResult<User> {
            sqlx::query_as("UPDATE users SET is_admin = $2 WHERE id = $1 RETURNING *")
                .bind(id)
                .bind(grant)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?
                .ok_or(RepoError::NotFound)
        }

        async fn set_banned(&self, id: Id, banned: bool) -> RepoResult<User> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let target: User = sqlx::query_as("SELECT * FROM users WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(internal)?
                .ok_or(RepoError::NotFound)?;
            if banned && target.is_admin {
                return Err(RepoError::Conflict);
            }
            let user: User =
                sqlx::query_as("UPDATE users SET is_banned = $2 WHERE id = $1 RETURNING *")
                    .bind(id)
                    .bind(banned)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            Ok(user)
        }

        async fn list_admins(&self) -> RepoResult<Vec<User>> {
            sqlx::query_as("SELECT * FROM users WHERE is_admin ORDER BY display_name, id")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }

        async fn list_banned(&self) -> RepoResult<Vec<User>> {
            sqlx::query_as("SELECT * FROM users WHERE is_banned ORDER BY display_name, id")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }
    }

    #[async_trait]
    impl DisabilityRepo for PgRepo {
        async fn list_disabilities(&self) -> RepoResult<Vec<Disability>> {
            sqlx::query_as("SELECT * FROM disabilities ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }

        async fn create_disability(&self, name: &str) -> RepoResult<Disability> {
            sqlx::query_as("INSERT INTO disabilities (name) VALUES ($1) RETURNING *")
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .map_err(map_constraint)
        }

        async fn rename_disability(&self, id: Id, name: &str) -> RepoResult<Disability> {
            sqlx::query_as("UPDATE disabilities SET name = $2 WHERE id = $1 RETURNING *")
                .bind(id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_constraint)?
                .ok_or(RepoError::NotFound)
        }

        async fn delete_disability(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM disabilities WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn list_posts(&self, filter: &PostFilter) -> RepoResult<Paged<PostView>> {
            let mut qb = QueryBuilder::new("");
            push_post_view_select(&mut qb, filter.viewer);
            push_post_filters(&mut qb, filter);
            qb.push(" ORDER BY p.created_at DESC, p.id DESC LIMIT ");
            qb.push_bind(filter.per_page);
            qb.push(" OFFSET ");
            qb.push_bind(filter.offset());
            let rows: Vec<PostViewRow> = qb
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;

            let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM posts p");
            push_post_filters(&mut count_qb, filter);
            let total: i64 = count_qb
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;

            Ok(Paged::new(
                rows.into_iter().map(PostViewRow::into_view).collect(),
                total,
                filter.page,
                filter.per_page,
            ))
        }

        async fn get_post_view(
            &self,
            id: Id,
            viewer: Id,
            include_deleted: bool,
        ) -> RepoResult<PostView> {
            self.fetch_post_view(id, viewer, include_deleted).await
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            sqlx::query_as("SELECT * FROM posts WHERE id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_row)
        }

        async fn create_post(&self, author: Id, new: &CreatePost) -> RepoResult<PostView> {
            let tags = Self::dedup_tags(&new.tag_ids);
            let mut tx = self.pool.begin().await.map_err(internal)?;
            Self::verify_tags(&mut tx, &tags).await?;
            let now = Utc::now();
            let post: Post = sqlx::query_as(
                "INSERT INTO posts (author_id, title, body, expiry, expires_at) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING *",
            )
            .bind(author)
            .bind(&new.title)
            .bind(&new.body)
            .bind(new.expiry)
            .bind(new.expiry.deadline(now))
            .fetch_one(&mut *tx)
            .await
            .map_err(map_constraint)?;
            if !tags.is_empty() {
                sqlx::query(
                    "INSERT INTO post_disabilities (post_id, disability_id) \
                     SELECT $1, x FROM UNNEST($2::bigint[]) AS x",
                )
                .bind(post.id)
                .bind(&tags)
                .execute(&mut *tx)
                .await
                .map_err(map_constraint)?;
            }
            tx.commit().await.map_err(internal)?;
            self.fetch_post_view(post.id, author, false).await
        }

        async fn update_post(&self, id: Id, upd: &UpdatePost) -> RepoResult<PostView> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let post: Post = sqlx::query_as(
                "SELECT * FROM posts WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(internal)?
            .ok_or(RepoError::NotFound)?;

            let expiry = upd.expiry.unwrap_or(post.expiry);
            // Deadline stays anchored to creation time.
            let expires_at = expiry.deadline(post.created_at);
            sqlx::query(
                "UPDATE posts SET title = $2, body = $3, expiry = $4, expires_at = $5, \
                 updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(upd.title.as_deref().unwrap_or(&post.title))
            .bind(upd.body.as_deref().unwrap_or(&post.body))
            .bind(expiry)
            .bind(expires_at)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;

            if let Some(ref tag_ids) = upd.tag_ids {
                let tags = Self::dedup_tags(tag_ids);
                Self::verify_tags(&mut tx, &tags).await?;
                sqlx::query("DELETE FROM post_disabilities WHERE post_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(internal)?;
                if !tags.is_empty() {
                    sqlx::query(
                        "INSERT INTO post_disabilities (post_id, disability_id) \
                         SELECT $1, x FROM UNNEST($2::bigint[]) AS x",
                    )
                    .bind(id)
                    .bind(&tags)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_constraint)?;
                }
            }
            tx.commit().await.map_err(internal)?;
            self.fetch_post_view(id, post.author_id, false).await
        }

        async fn soft_delete_post(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query(
                "UPDATE posts SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            if res.rows_affected() == 0 {
                // Already soft deleted is fine; missing is not.
                let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1)")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(internal)?;
                if !exists {
                    return Err(RepoError::NotFound);
                }
            }
            Ok(())
        }

        async fn restore_post(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query(
                "UPDATE posts SET deleted_at = NULL WHERE id = $1 AND deleted_at IS NOT NULL",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            if res.rows_affected() == 0 {
                let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1)")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(internal)?;
                return Err(if exists { RepoError::Conflict } else { RepoError::NotFound });
            }
            Ok(())
        }

        async fn hard_delete_post(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM posts WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn like_post(&self, id: Id, user: Id) -> RepoResult<i64> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let live: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1 AND deleted_at IS NULL)",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            if !live {
                return Err(RepoError::NotFound);
            }
            let inserted = sqlx::query(
                "INSERT INTO post_likes (post_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(user)
            .execute(&mut *tx)
            .await
            .map_err(map_constraint)?;
            if inserted.rows_affected() == 0 {
                return Err(RepoError::Conflict);
            }
            let count: i64 = sqlx::query_scalar(
                "UPDATE posts SET like_count = like_count + 1 WHERE id = $1 RETURNING like_count",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            Ok(count)
        }

        async fn unlike_post(&self, id: Id, user: Id) -> RepoResult<i64> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1)")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(internal)?;
            if !exists {
                return Err(RepoError::NotFound);
            }
            let removed = sqlx::query("DELETE FROM post_likes WHERE post_id = $1 AND user_id = $2")
                .bind(id)
                .bind(user)
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
            if removed.rows_affected() == 0 {
                return Err(RepoError::Conflict);
            }
            let count: i64 = sqlx::query_scalar(
                "UPDATE posts SET like_count = GREATEST(like_count - 1, 0) WHERE id = $1 \
                 RETURNING like_count",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            Ok(count)
        }

        async fn save_post(&self, id: Id, user: Id) -> RepoResult<()> {
            let live: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1 AND deleted_at IS NULL)",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)?;
            if !live {
                return Err(RepoError::NotFound);
            }
            let inserted = sqlx::query(
                "INSERT INTO post_saves (post_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(user)
            .execute(&self.pool)
            .await
            .map_err(map_constraint)?;
            if inserted.rows_affected() == 0 {
                return Err(RepoError::Conflict);
            }
            Ok(())
        }

        async fn unsave_post(&self, id: Id, user: Id) -> RepoResult<()> {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            if !exists {
                return Err(RepoError::NotFound);
            }
            let removed = sqlx::query("DELETE FROM post_saves WHERE post_id = $1 AND user_id = $2")
                .bind(id)
                .bind(user)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if removed.rows_affected() == 0 {
                return Err(RepoError::Conflict);
            }
            Ok(())
        }

        async fn sweep_expired(&self, now: DateTime<Utc>) -> RepoResult<u64> {
            let res = sqlx::query(
                "DELETE FROM posts WHERE expires_at IS NOT NULL AND expires_at <= $1",
            )
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            Ok(res.rows_affected())
        }
    }

    #[async_trait]
    impl CommentRepo for PgRepo {
        async fn list_comments(&self, post_id: Id, viewer: Id) -> RepoResult<Vec<CommentView>> {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1)")
                .bind(post_id)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            if !exists {
                return Err(RepoError::NotFound);
            }
            let rows: Vec<CommentViewRow> = sqlx::query_as(&format!(
                "{COMMENT_VIEW_SELECT} WHERE c.post_id = $1 ORDER BY c.created_at ASC, c.id ASC"
            ))
            .bind(post_id)
            .bind(viewer)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            Ok(rows.into_iter().map(CommentViewRow::into_view).collect())
        }

        async fn get_comment(&self, id: Id) -> RepoResult<Comment> {
            sqlx::query_as("SELECT * FROM comments WHERE id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_row)
        }

        async fn create_comment(&self, author: Id, new: &CreateComment) -> RepoResult<CommentView> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let live: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1 AND deleted_at IS NULL)",
            )
            .bind(new.post_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            if !live {
                return Err(RepoError::NotFound);
            }
            if let Some(parent_id) = new.parent_id {
                let parent_post: Option<Id> =
                    sqlx::query_scalar("SELECT post_id FROM comments WHERE id = $1")
                        .bind(parent_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(internal)?;
                if parent_post != Some(new.post_id) {
                    return Err(RepoError::Conflict);
                }
            }
            let comment: Comment = sqlx::query_as(
                "INSERT INTO comments (post_id, author_id, parent_id, body) \
                 VALUES ($1, $2, $3, $4) RETURNING *",
            )
            .bind(new.post_id)
            .bind(author)
            .bind(new.parent_id)
            .bind(&new.body)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_constraint)?;
            tx.commit().await.map_err(internal)?;

            let row: CommentViewRow =
                sqlx::query_as(&format!("{COMMENT_VIEW_SELECT} WHERE c.id = $1"))
                    .bind(comment.id)
                    .bind(author)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(internal)?;
            Ok(row.into_view())
        }

        async fn soft_delete_comment(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query(
                "UPDATE comments SET deleted_at = now(), body = $2 \
                 WHERE id = $1 AND deleted_at IS NULL",
            )
            .bind(id)
            .bind(REMOVED_BODY)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            if res.rows_affected() == 0 {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM comments WHERE id = $1)")
                        .bind(id)
                        .fetch_one(&self.pool)
                        .await
                        .map_err(internal)?;
                if !exists {
                    return Err(RepoError::NotFound);
                }
            }
            Ok(())
        }

        async fn hard_delete_comment(&self, id: Id) -> RepoResult<()> {
            // Children ride along through the self-referencing cascade.
            let res = sqlx::query("DELETE FROM comments WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn like_comment(&self, id: Id, user: Id) -> RepoResult<i64> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let live: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM comments WHERE id = $1 AND deleted_at IS NULL)",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            if !live {
                return Err(RepoError::NotFound);
            }
            let inserted = sqlx::query(
                "INSERT INTO comment_likes (comment_id, user_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(user)
            .execute(&mut *tx)
            .await
            .map_err(map_constraint)?;
            if inserted.rows_affected() == 0 {
                return Err(RepoError::Conflict);
            }
            let count: i64 = sqlx::query_scalar(
                "UPDATE comments SET like_count = like_count + 1 WHERE id = $1 \
                 RETURNING like_count",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            Ok(count)
        }

        async fn unlike_comment(&self, id: Id, user: Id) -> RepoResult<i64> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM comments WHERE id = $1)")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(internal)?;
            if !exists {
                return Err(RepoError::NotFound);
            }
            let removed =
                sqlx::query("DELETE FROM comment_likes WHERE comment_id = $1 AND user_id = $2")
                    .bind(id)
                    .bind(user)
                    .execute(&mut *tx)
                    .await
                    .map_err(internal)?;
            if removed.rows_affected() == 0 {
                return Err(RepoError::Conflict);
            }
            let count: i64 = sqlx::query_scalar(
                "UPDATE comments SET like_count = GREATEST(like_count - 1, 0) WHERE id = $1 \
                 RETURNING like_count",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            Ok(count)
        }
    }

    #[async_trait]
    impl ReportRepo for PgRepo {
        async fn create_report(&self, reporter: Id, new: &CreateReport) -> RepoResult<Report> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let probe = match new.target_kind {
                ReportTargetKind::Post => "SELECT EXISTS(SELECT 1 FROM posts WHERE id = $1)",
                ReportTargetKind::Comment => "SELECT EXISTS(SELECT 1 FROM comments WHERE id = $1)",
                ReportTargetKind::User => "SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)",
            };
            let exists: bool = sqlx::query_scalar(probe)
                .bind(new.target_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(internal)?;
            if !exists {
                return Err(RepoError::NotFound);
            }
            // The partial unique index turns duplicate open reports into 23505.
            let report: Report = sqlx::query_as(
                "INSERT INTO reports (reporter_id, target_kind, target_id, reason, detail) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING *",
            )
            .bind(reporter)
            .bind(new.target_kind)
            .bind(new.target_id)
            .bind(new.reason)
            .bind(&new.detail)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_constraint)?;
            tx.commit().await.map_err(internal)?;
            Ok(report)
        }

        async fn list_reports(&self, status: Option<ReportStatus>) -> RepoResult<Vec<Report>> {
            match status {
                Some(st) => sqlx::query_as(
                    "SELECT * FROM reports WHERE status = $1 ORDER BY created_at DESC, id DESC",
                )
                .bind(st)
                .fetch_all(&self.pool)
                .await
                .map_err(internal),
                None => sqlx::query_as("SELECT * FROM reports ORDER BY created_at DESC, id DESC")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(internal),
            }
        }

        async fn close_report(
            &self,
            id: Id,
            admin: Id,
            status: ReportStatus,
        ) -> RepoResult<Report> {
            let updated: Option<Report> = sqlx::query_as(
                "UPDATE reports SET status = $2, resolved_at = now(), resolved_by = $3 \
                 WHERE id = $1 AND status = 'open' RETURNING *",
            )
            .bind(id)
            .bind(status)
            .bind(admin)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
            match updated {
                Some(r) => Ok(r),
                None => {
                    let exists: bool =
                        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM reports WHERE id = $1)")
                            .bind(id)
                            .fetch_one(&self.pool)
                            .await
                            .map_err(internal)?;
                    Err(if exists { RepoError::Conflict } else { RepoError::NotFound })
                }
            }
        }
    }

    #[async_trait]
    impl NotificationRepo for PgRepo {
        async fn notify(&self, new: NewNotification) -> RepoResult<Notification> {
            sqlx::query_as(
                "INSERT INTO notifications (user_id, kind, actor_id, post_id, comment_id) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING *",
            )
            .bind(new.user_id)
            .bind(new.kind)
            .bind(new.actor_id)
            .bind(new.post_id)
            .bind(new.comment_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_constraint)
        }

        async fn list_notifications(&self, user: Id) -> RepoResult<Vec<NotificationView>> {
            let rows: Vec<NotificationViewRow> = sqlx::query_as(
                "SELECT n.id, n.kind, n.actor_id, a.display_name AS actor_name, \
                 a.profile_color AS actor_color, n.post_id, p.title AS post_title, \
                 n.comment_id, n.read, n.created_at \
                 FROM notifications n \
                 LEFT JOIN users a ON a.id = n.actor_id \
                 LEFT JOIN posts p ON p.id = n.post_id \
                 WHERE n.user_id = $1 \
                 ORDER BY n.created_at DESC, n.id DESC LIMIT 100",
            )
            .bind(user)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            Ok(rows.into_iter().map(NotificationViewRow::into_view).collect())
        }

        async fn mark_notification_read(&self, id: Id, user: Id) -> RepoResult<()> {
            let res =
                sqlx::query("UPDATE notifications SET read = TRUE WHERE id = $1 AND user_id = $2")
                    .bind(id)
                    .bind(user)
                    .execute(&self.pool)
                    .await
                    .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn mark_all_read(&self, user: Id) -> RepoResult<u64> {
            let res = sqlx::query(
                "UPDATE notifications SET read = TRUE WHERE user_id = $1 AND read = FALSE",
            )
            .bind(user)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            Ok(res.rows_affected())
        }

        async fn pending_digests(&self) -> RepoResult<Vec<DigestBatch>> {
            let rows: Vec<DigestRow> = sqlx::query_as(
                "SELECT n.id AS notification_id, n.user_id, u.email, u.display_name, n.kind, \
                 a.display_name AS actor_name, p.title AS post_title \
                 FROM notifications n \
                 JOIN users u ON u.id = n.user_id \
                 LEFT JOIN users a ON a.id = n.actor_id \
                 LEFT JOIN posts p ON p.id = n.post_id \
                 WHERE n.emailed_at IS NULL AND u.digest_opt_in AND NOT u.is_banned \
                 ORDER BY n.user_id, n.created_at ASC, n.id ASC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;

            let mut out: Vec<DigestBatch> = Vec::new();
            for row in rows {
                let item = DigestItem {
                    notification_id: row.notification_id,
                    kind: row.kind,
                    actor_name: row.actor_name,
                    post_title: row.post_title,
                };
                match out.last_mut() {
                    Some(batch) if batch.user_id == row.user_id => batch.items.push(item),
                    _ => out.push(DigestBatch {
                        user_id: row.user_id,
                        email: row.email,
                        display_name: row.display_name,
                        items: vec![item],
                    }),
                }
            }
            Ok(out)
        }

        async fn mark_emailed(&self, ids: &[Id], at: DateTime<Utc>) -> RepoResult<()> {
            if ids.is_empty() {
                return Ok(());
            }
            sqlx::query("UPDATE notifications SET emailed_at = $2 WHERE id = ANY($1)")
                .bind(ids.to_vec())
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(())
        }
    }

    #[async_trait]
    impl ProfanityRepo for PgRepo {
        async fn list_profanities(&self) -> RepoResult<Vec<Profanity>> {
            sqlx::query_as("SELECT * FROM profanities ORDER BY word")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }

        async fn add_profanity(&self, word: &str) -> RepoResult<Profanity> {
            sqlx::query_as("INSERT INTO profanities (word) VALUES (lower(trim($1))) RETURNING *")
                .bind(word)
                .fetch_one(&self.pool)
                .await
                .map_err(map_constraint)
        }

        async fn delete_profanity(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM profanities WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn blocked_words(&self) -> RepoResult<Vec<String>> {
            sqlx::query_scalar("SELECT word FROM profanities ORDER BY word")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)
        }
    }

    #[async_trait]
    impl SystemRepo for PgRepo {
        async fn ping(&self) -> RepoResult<()> {
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            Ok(())
        }

        async fn seed(&self, disabilities: &[&str], profanities: &[&str]) -> RepoResult<SeedSummary> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let d: Vec<String> = disabilities.iter().map(|s| s.to_string()).collect();
            let added_d = sqlx::query(
                "INSERT INTO disabilities (name) \
                 SELECT x FROM UNNEST($1::text[]) AS x \
                 WHERE NOT EXISTS (SELECT 1 FROM disabilities d WHERE lower(d.name) = lower(x))",
            )
            .bind(&d)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
            let p: Vec<String> = profanities.iter().map(|s| s.to_string()).collect();
            let added_p = sqlx::query(
                "INSERT INTO profanities (word) \
                 SELECT DISTINCT lower(trim(x)) FROM UNNEST($1::text[]) AS x \
                 WHERE length(trim(x)) > 0 \
                 ON CONFLICT (word) DO NOTHING",
            )
            .bind(&p)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            Ok(SeedSummary {
                disabilities_added: added_d.rows_affected(),
                profanities_added: added_p.rows_affected(),
            })
        }
    }
}
