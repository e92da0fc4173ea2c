pub mod auth;
pub mod error;
pub mod models;
pub mod notify;
pub mod openapi;
pub mod profanity;
pub mod rate_limit;
pub mod repo;
pub mod routes;
pub mod saml;
pub mod security;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
pub use security::SecurityHeaders;
