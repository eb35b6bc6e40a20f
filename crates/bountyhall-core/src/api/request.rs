//! Request and response types shared by the gateway and transports.
//!
//! Bodies are owned and cloneable so a request rejected with 401 can be
//! replayed after a token refresh.

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

/// How the caller wants the `Content-Type` header handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ContentType {
    /// Nothing said: JSON unless the body is multipart or `headers`
    /// already carries one
    #[default]
    Default,
    Explicit(String),
    /// Send no `Content-Type` header at all
    Suppressed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    Json(Vec<u8>),
    Text(String),
    Bytes(Vec<u8>),
    Multipart(MultipartForm),
}

impl Body {
    pub fn is_multipart(&self) -> bool {
        matches!(self, Body::Multipart(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartValue {
    Text(String),
    File {
        file_name: String,
        mime: Option<String>,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub value: PartValue,
}

/// A multipart form the transport turns into a boundary-delimited body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    pub parts: Vec<Part>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part {
            name: name.into(),
            value: PartValue::Text(value.into()),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime: Option<String>,
        data: Vec<u8>,
    ) -> Self {
        self.parts.push(Part {
            name: name.into(),
            value: PartValue::File {
                file_name: file_name.into(),
                mime,
                data,
            },
        });
        self
    }

    pub(crate) fn to_reqwest(&self) -> Result<reqwest::multipart::Form, reqwest::Error> {
        let mut form = reqwest::multipart::Form::new();
        for part in &self.parts {
            form = match &part.value {
                PartValue::Text(value) => form.text(part.name.clone(), value.clone()),
                PartValue::File {
                    file_name,
                    mime,
                    data,
                } => {
                    let mut file = reqwest::multipart::Part::bytes(data.clone())
                        .file_name(file_name.clone());
                    if let Some(mime) = mime {
                        file = file.mime_str(mime)?;
                    }
                    form.part(part.name.clone(), file)
                }
            };
        }
        Ok(form)
    }
}

/// What a caller passes to `AuthGateway::request`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub content_type: ContentType,
    pub body: Body,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.body = Body::Json(serde_json::to_vec(value)?);
        Ok(self)
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Body::Text(text.into());
        self
    }

    pub fn bytes(mut self, data: Vec<u8>) -> Self {
        self.body = Body::Bytes(data);
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = Body::Multipart(form);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = ContentType::Explicit(value.into());
        self
    }

    pub fn without_content_type(mut self) -> Self {
        self.content_type = ContentType::Suppressed;
        self
    }
}

/// A fully described outbound request as handed to a `Transport`.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Body,
}

/// A buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
