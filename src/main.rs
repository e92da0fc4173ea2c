use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer, Responder};
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod error;
mod models;
mod notify;
mod openapi;
mod profanity;
mod rate_limit;
mod repo;
mod routes;
mod saml;
mod security;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use openapi::ApiDoc;
use rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
use repo::inmem::InMemRepo;
use routes::{config, AppState};
use security::SecurityHeaders;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()

async fn metrics_endpoint(handle: web::Data<PrometheusHandle>) -> impl Responder {
    handle.render()
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Environment variables must be set externally (shell, systemd, Docker, etc.)
    // Load .env automatically only in debug builds to reduce manual setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    // Validate required environment variables
    validate_env_vars();

    // Structured logging initialisation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping Kin community server");

    // Log loaded configuration (non-sensitive)
    info!("SAML SSO configured: {}", std::env::var("SAML_IDP_SSO_URL").is_ok());
    info!("Mail API configured: {}", std::env::var("MAIL_API_URL").is_ok());
    info!(
        "Frontend URL: {}",
        std::env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:5173".to_string())
    );

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo = InMemRepo::new();
    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    info!("Using in-memory repository backend");

    #[cfg(feature = "postgres-store")]
    let repo = {
        use sqlx::postgres::PgPoolOptions;
        let db_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres-store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&db_url)
            .expect("Failed to create Pg pool");
        run_migrations(&pool).await;
        info!("Using Postgres repository backend");
        repo::pg::PgRepo::new(pool)
    };

    let repo: Arc<dyn repo::Repo> = Arc::new(repo);
    let mailer = notify::Mailer::from_env().map(Arc::new);
    if mailer.is_none() {
        info!("Mail API not configured; digest email disabled");
    }
    let rate_limit_enabled = std::env::var("RATE_LIMIT_DISABLED")
        .map(|v| !(v == "1" || v.eq_ignore_ascii_case("true")))
        .unwrap_or(true);
    let rate_limiter = RateLimiterFacade::new(
        InMemoryRateLimiter::new(rate_limit_enabled),
        RateLimitConfig::from_env(),
    );

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // Daily digest + expiry sweep in the background
    notify::spawn_scheduler(repo.clone(), mailer.clone());

    let openapi = ApiDoc::openapi();
    info!("OpenAPI spec generated");

    let port: u16 = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8080);

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                // during local dev allow the Vite default ports
                .allowed_origin("http://localhost:5173")
                .allowed_origin("http://127.0.0.1:5173")
                // containerized nginx frontend (served on 3000)
                .allowed_origin("http://localhost:3000")
                .allowed_origin("http://127.0.0.1:3000")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
                .supports_credentials()
                .max_age(3600);
            // If FRONTEND_URL env var is provided and not already covered, add it.
            if let Ok(front) = std::env::var("FRONTEND_URL") {
                c = c.allowed_origin(&front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(SecurityHeaders::from_env())
            .wrap(cors)
            .configure(config)
            .service(SwaggerUi::new("/docs").url("/docs/openapi.json", openapi.clone()))
            .route("/metrics", web::get().to(metrics_endpoint))
            .app_data(web::Data::new(metrics_handle.clone()))
            .app_data(web::Data::new(AppState {
                repo: repo.clone(),
                mailer: mailer.clone(),
                rate_limiter: rate_limiter.clone(),
            }))
    })
    .bind(("0.0.0.0", port))?; // listen on all interfaces so a frontend container can reach it

    info!("Listening on http://0.0.0.0:{port}");

    server.run().await
}

#[cfg(feature = "postgres-store")]
async fn run_migrations(pool: &sqlx::PgPool) {
    static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();
    const ATTEMPTS: u32 = 5;
    for attempt in 1..=ATTEMPTS {
        match MIGRATOR.run(pool).await {
            Ok(()) => {
                info!("database migrations applied");
                return;
            }
            Err(e) if attempt < ATTEMPTS => {
                // quadratic backoff; the database may still be coming up
                let wait = u64::from(attempt * attempt);
                tracing::warn!("migration attempt {attempt} failed: {e}; retrying in {wait}s");
                tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
            }
            Err(e) => {
                eprintln!("database migrations failed after {ATTEMPTS} attempts: {e}");
                std::process::exit(1);
            }
        }
    }
}

/// Validate that required environment variables are set
fn validate_env_vars() {
    use std::env;

    let required = vec!["SESSION_SECRET"];

    let mut missing = Vec::new();
    for var in required {
        if env::var(var).is_err() {
            missing.push(var);
        }
    }

    if !missing.is_empty() {
        eprintln!("Missing required environment variables: {:?}", missing);
        eprintln!("Please copy .env.example to .env and configure it");
        std::process::exit(1);
    }

    if let Ok(secret) = env::var("SESSION_SECRET") {
        if secret.len() < 32 {
            eprintln!("SESSION_SECRET must be at least 32 characters long for security");
            std::process::exit(1);
        }
    }

    if env::var("SAML_IDP_SSO_URL").is_err() || env::var("SAML_IDP_CERT").is_err() {
        eprintln!("Warning: SAML SSO not configured (SAML_IDP_SSO_URL/SAML_IDP_CERT missing)");
        eprintln!("Member sign-in will not work without these variables");
    }

    if env::var("MAIL_API_URL").is_err() || env::var("MAIL_API_KEY").is_err() {
        eprintln!("Warning: mail API not configured (MAIL_API_URL/MAIL_API_KEY missing)");
        eprintln!("Notification digest email will be disabled");
    }
}
