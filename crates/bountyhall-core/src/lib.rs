//! Core library for the bountyhall marketplace client.
//!
//! The heart of the crate is [`api::AuthGateway`]: every request to the
//! backend goes through it so that an expired token is refreshed once,
//! shared by all requests rejected meanwhile, and replayed transparently.
//! Credentials live in an [`auth::CredentialStore`] over a durable
//! storage medium.

pub mod api;
pub mod auth;
pub mod config;
pub mod single_flight;

pub use api::{ApiError, AuthGateway, MarketClient, ReqwestTransport};
pub use auth::{CredentialStore, StoreError};
pub use config::Config;
