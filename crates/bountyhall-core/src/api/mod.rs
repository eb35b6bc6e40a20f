//! HTTP layer for the marketplace backend.
//!
//! This module provides:
//! - `AuthGateway`: bearer-token attachment with single-flight refresh on 401
//! - `Transport`: the seam to the network, with a `reqwest` implementation
//! - `MarketClient`: typed entry points for the `/api/v1` routes
//!
//! The backend issues JWT bearer tokens from the verification-code login
//! and rotates them through `POST /auth/refresh`.

pub mod client;
pub mod error;
pub mod gateway;
pub mod request;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{LoginOutcome, MarketClient, Page, SearchParams, SortOption};
pub use error::ApiError;
pub use gateway::{AuthGateway, AuthGatewayBuilder, GatewayError, SessionInvalidHandler};
pub use request::{Body, ContentType, HttpRequest, HttpResponse, MultipartForm, RequestOptions};
pub use transport::{ReqwestTransport, Transport, TransportError};
