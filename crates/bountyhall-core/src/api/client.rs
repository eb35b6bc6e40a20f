//! API client for the marketplace REST API.
//!
//! This module provides the `MarketClient` struct for the login flow and
//! for browsing bounties, bidding and searching. Every call goes through
//! the `AuthGateway`, so expired tokens are refreshed transparently.
//! Bounty and bid payloads are passed through as opaque JSON.

use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::auth::CredentialField;

use super::gateway::{AuthGateway, GatewayError};
use super::request::{HttpResponse, MultipartForm, RequestOptions};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Default page size for listings
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Default page size for search results
pub const DEFAULT_SEARCH_SIZE: u32 = 20;

/// Multipart field carrying the business license upload
const LICENSE_FIELD: &str = "license";

/// One page of a listing. Items are opaque to the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Page {
    pub data: Vec<Value>,
    pub total: u64,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    data: Option<Vec<Value>>,
    #[serde(default)]
    total: Option<u64>,
}

impl From<PageResponse> for Page {
    fn from(raw: PageResponse) -> Self {
        Self {
            data: raw.data.unwrap_or_default(),
            total: raw.total.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DataResponse {
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyCodeResponse {
    token: Option<String>,
    account_id: Option<u64>,
    #[serde(default)]
    is_new_user: bool,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Result of a successful verification-code login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginOutcome {
    pub account_id: Option<u64>,
    pub is_new_user: bool,
    pub username: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOption {
    pub field: String,
    pub order: String,
}

/// Body of the unified search endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchParams {
    pub index: String,
    pub query: String,
    pub filters: Map<String, Value>,
    pub sort: Option<SortOption>,
    pub page: u32,
    pub size: u32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            index: "bounty".to_string(),
            query: String::new(),
            filters: Map::new(),
            sort: None,
            page: 1,
            size: DEFAULT_SEARCH_SIZE,
        }
    }
}

impl SearchParams {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

/// API client for the marketplace.
/// Clone is cheap - the gateway shares its transport and credential store.
#[derive(Clone, Debug)]
pub struct MarketClient {
    gateway: AuthGateway,
    api_base: String,
}

impl MarketClient {
    pub fn new(gateway: AuthGateway, api_base: impl Into<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self { gateway, api_base }
    }

    pub fn gateway(&self) -> &AuthGateway {
        &self.gateway
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn url_with_query(&self, path: &str, params: &[(&str, String)]) -> Result<String, ApiError> {
        let url = Url::parse_with_params(&self.url(path), params)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        Ok(url.into())
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: HttpResponse) -> Result<HttpResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status(), &response.text()))
        }
    }

    async fn call<T: DeserializeOwned>(&self, url: &str, options: RequestOptions) -> Result<T, ApiError> {
        let response = self.gateway.request(url, options).await?;
        let response = Self::check_response(response)?;
        Ok(response.json()?)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        self.call(url, RequestOptions::get()).await
    }

    // ===== Auth =====

    /// Ask the backend to text a verification code to `phone`
    pub async fn send_code(&self, phone: &str) -> Result<Option<String>, ApiError> {
        let options = RequestOptions::post().json(&serde_json::json!({ "phone": phone }))?;
        let response = self
            .gateway
            .request_anonymous(&self.url("/auth/send-code"), options)
            .await?;
        let response = Self::check_response(response)?;
        let body: MessageResponse = response.json()?;
        Ok(body.message)
    }

    /// Log in (or register) with a verification code and store the
    /// resulting credentials.
    pub async fn verify_code(&self, phone: &str, code: &str) -> Result<LoginOutcome, ApiError> {
        let options =
            RequestOptions::post().json(&serde_json::json!({ "phone": phone, "code": code }))?;
        let response = self
            .gateway
            .request_anonymous(&self.url("/auth/verify-code"), options)
            .await?;
        let response = Self::check_response(response)?;
        let body: VerifyCodeResponse = response.json()?;

        let token = body
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("login response carried no token".to_string()))?;

        let credentials = self.gateway.credentials();
        credentials.set_token(&token).map_err(GatewayError::from)?;
        credentials.set_phone(phone).map_err(GatewayError::from)?;
        let stored = match body.username.as_deref().filter(|u| !u.is_empty()) {
            Some(username) => credentials.set_username(username),
            None => credentials.clear(CredentialField::Username),
        };
        stored.map_err(GatewayError::from)?;

        info!(account_id = ?body.account_id, new_user = body.is_new_user, "Logged in");
        Ok(LoginOutcome {
            account_id: body.account_id,
            is_new_user: body.is_new_user,
            username: body.username,
            message: body.message,
        })
    }

    pub fn logout(&self) -> Result<(), ApiError> {
        self.gateway
            .credentials()
            .clear_all()
            .map_err(GatewayError::from)?;
        info!("Logged out");
        Ok(())
    }

    // ===== Bounties =====

    pub async fn list_bounties(&self, page: u32, page_size: u32) -> Result<Page, ApiError> {
        let url = self.url_with_query(
            "/bounties",
            &[("page", page.to_string()), ("page_size", page_size.to_string())],
        )?;
        let raw: PageResponse = self.get(&url).await?;
        Ok(raw.into())
    }

    pub async fn bounty_detail(&self, id: u64) -> Result<Value, ApiError> {
        let raw: DataResponse = self.get(&self.url(&format!("/bounties/{}", id))).await?;
        Ok(raw.data)
    }

    // ===== Bids =====

    pub async fn list_bids(&self, bounty_id: u64, page: u32, page_size: u32) -> Result<Page, ApiError> {
        let url = self.url_with_query(
            "/bids",
            &[
                ("bounty_id", bounty_id.to_string()),
                ("page", page.to_string()),
                ("page_size", page_size.to_string()),
            ],
        )?;
        let raw: PageResponse = self.get(&url).await?;
        Ok(raw.into())
    }

    /// Bids placed by the logged-in account, optionally filtered by status
    pub async fn my_bids(&self, status: Option<&str>, page: u32, page_size: u32) -> Result<Page, ApiError> {
        let url = self.url_with_query(
            "/bids/my",
            &[
                ("status", status.unwrap_or_default().to_string()),
                ("page", page.to_string()),
                ("page_size", page_size.to_string()),
            ],
        )?;
        let raw: PageResponse = self.get(&url).await?;
        Ok(raw.into())
    }

    pub async fn place_bid(&self, bid: &Value) -> Result<Value, ApiError> {
        let options = RequestOptions::post().json(bid)?;
        let raw: DataResponse = self.call(&self.url("/bids"), options).await?;
        Ok(raw.data)
    }

    pub async fn delete_bid(&self, bid_id: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("/bids/{}", bid_id));
        let response = self.gateway.request(&url, RequestOptions::delete()).await?;
        Self::check_response(response)?;
        debug!(bid_id = bid_id, "Deleted bid");
        Ok(())
    }

    // ===== Search =====

    pub async fn search(&self, params: &SearchParams) -> Result<Value, ApiError> {
        let options = RequestOptions::post().json(params)?;
        let raw: SearchResponse = self.call(&self.url("/search"), options).await?;
        if raw.code != i64::from(StatusCode::OK.as_u16()) {
            return Err(ApiError::InvalidResponse(
                raw.message.unwrap_or_else(|| "Search failed".to_string()),
            ));
        }
        Ok(raw.data)
    }

    // ===== Companies =====

    /// Upload a business license image for recognition
    pub async fn recognize_license(&self, file_name: &str, data: Vec<u8>) -> Result<Value, ApiError> {
        let form = MultipartForm::new().file(LICENSE_FIELD, file_name, None, data);
        let options = RequestOptions::post().multipart(form);
        let raw: DataResponse = self.call(&self.url("/companies/recognize"), options).await?;
        Ok(raw.data)
    }

    pub async fn my_company_status(&self) -> Result<Value, ApiError> {
        let raw: DataResponse = self.get(&self.url("/companies/my")).await?;
        Ok(raw.data)
    }
}
