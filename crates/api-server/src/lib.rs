pub mod auth;
pub mod campaign_rest;
pub mod rest;
pub mod server;

pub use auth::{AuthClaims, StaticTokenVerifier, TokenVerifier};
pub use rest::AppState;
pub use server::ApiServer;
