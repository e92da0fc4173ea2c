//! Email digests. Notifications accumulate in the store; a scheduler (or an
//! admin hitting the trigger endpoint) flushes them through a JSON mail API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use utoipa::ToSchema;

use crate::models::{DigestBatch, DigestItem, NotificationKind};
use crate::repo::Repo;

const DEFAULT_FROM: &str = "Kin Community <no-reply@kin.example>";
const DEFAULT_INTERVAL_SECS: u64 = 86_400;

/// Thin client for a transactional mail provider. One POST per message:
/// `{"from": .., "to": [..], "subject": .., "text": ..}` with a bearer key.
pub struct Mailer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl Mailer {
    /// `None` unless both `MAIL_API_URL` and `MAIL_API_KEY` are set.
    pub fn from_env() -> Option<Self> {
        let api_url = std::env::var("MAIL_API_URL").ok()?;
        let api_key = std::env::var("MAIL_API_KEY").ok()?;
        let from = std::env::var("MAIL_FROM").unwrap_or_else(|_| DEFAULT_FROM.to_string());
        Some(Self { client: reqwest::Client::new(), api_url, api_key, from })
    }

    pub async fn send(&self, to: &str, subject: &str, text: &str) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "from": self.from,
            "to": [to],
            "subject": subject,
            "text": text,
        });
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("mail API returned {}", resp.status());
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct DigestOutcome {
    pub users_emailed: u64,
    pub notifications_flushed: u64,
    pub posts_expired: u64,
}

fn digest_line(item: &DigestItem) -> String {
    let actor = item.actor_name.as_deref().unwrap_or("Someone");
    match item.kind {
        NotificationKind::PostComment => match &item.post_title {
            Some(title) => format!("- {actor} commented on your post \"{title}\""),
            None => format!("- {actor} commented on one of your posts"),
        },
        NotificationKind::CommentReply => match &item.post_title {
            Some(title) => format!("- {actor} replied to you on \"{title}\""),
            None => format!("- {actor} replied to one of your comments"),
        },
        NotificationKind::ContentRemoved => {
            "- A moderator removed one of your posts or comments".to_string()
        }
    }
}

/// Subject and plain-text body for one member's digest.
pub fn compose_digest(batch: &DigestBatch) -> (String, String) {
    let n = batch.items.len();
    let subject = if n == 1 {
        "You have 1 new notification".to_string()
    } else {
        format!("You have {n} new notifications")
    };
    let lines: Vec<String> = batch.items.iter().map(digest_line).collect();
    let body = format!(
        "Hi {},\n\nWhile you were away:\n\n{}\n\nYou can turn these emails off from your profile page.\n",
        batch.display_name,
        lines.join("\n"),
    );
    (subject, body)
}

/// One digest pass: expire overdue posts, then send every pending batch.
/// A failed send leaves that member's notifications queued for the next run.
pub async fn run_digest(repo: &dyn Repo, mailer: &Mailer) -> anyhow::Result<DigestOutcome> {
    let posts_expired = repo.sweep_expired(Utc::now()).await?;
    if posts_expired > 0 {
        counter!("kin_posts_expired_total", posts_expired);
        log::info!("expired {posts_expired} overdue post(s)");
    }
    let mut outcome = DigestOutcome { posts_expired, ..Default::default() };

    let batches = repo.pending_digests().await?;
    for batch in &batches {
        let (subject, body) = compose_digest(batch);
        match mailer.send(&batch.email, &subject, &body).await {
            Ok(()) => {
                let ids: Vec<_> = batch.items.iter().map(|i| i.notification_id).collect();
                repo.mark_emailed(&ids, Utc::now()).await?;
                outcome.users_emailed += 1;
                outcome.notifications_flushed += ids.len() as u64;
                counter!("kin_digest_emails_total", 1);
            }
            Err(e) => {
                log::warn!("digest for user {} failed: {e}", batch.user_id);
                counter!("kin_digest_failures_total", 1);
            }
        }
    }
    Ok(outcome)
}

/// Background loop driving [`run_digest`]. Interval comes from
/// `DIGEST_INTERVAL_SECS` (default one day). Without a configured mailer the
/// loop still sweeps expired posts.
pub fn spawn_scheduler(repo: Arc<dyn Repo>, mailer: Option<Arc<Mailer>>) {
    let secs = std::env::var("DIGEST_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_INTERVAL_SECS);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        interval.tick().await; // first tick is immediate; skip it
        loop {
            interval.tick().await;
            match &mailer {
                Some(m) => match run_digest(repo.as_ref(), m).await {
                    Ok(outcome) => log::info!(
                        "digest run: {} user(s), {} notification(s), {} expired post(s)",
                        outcome.users_emailed,
                        outcome.notifications_flushed,
                        outcome.posts_expired
                    ),
                    Err(e) => log::error!("digest run failed: {e}"),
                },
                None => match repo.sweep_expired(Utc::now()).await {
                    Ok(n) if n > 0 => {
                        counter!("kin_posts_expired_total", n);
                        log::info!("expired {n} overdue post(s)");
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("expiry sweep failed: {e}"),
                },
            }
        }
    });
}
