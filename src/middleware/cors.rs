//! CORS stage driven by a list of allowed-origin patterns.

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use regex::Regex;
use std::sync::Arc;

use crate::core::error::{ApiServerError, ApiServerResult};
use crate::responses;

const ALLOWED_METHODS: &str = "POST, GET, OPTIONS, PUT, DELETE, PATCH";
const ALLOWED_HEADERS: &str = "Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization, X-Requested-With, If-Modified-Since";
const EXPOSED_HEADERS: &str = "Date";

#[derive(Debug, Clone, Default)]
pub struct CorsStage {
    allowed_origins: Vec<Regex>,
}

impl CorsStage {
    pub fn new(patterns: &[String]) -> ApiServerResult<Self> {
        let allowed_origins = patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| ApiServerError::config(format!("Invalid CORS origin pattern '{}': {}", p, e)))
            })
            .collect::<ApiServerResult<Vec<_>>>()?;
        Ok(Self { allowed_origins })
    }

    pub fn is_enabled(&self) -> bool {
        !self.allowed_origins.is_empty()
    }

    fn allows(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|re| re.is_match(origin))
    }
}

/// Adds CORS headers for allowed origins and answers their preflight requests.
/// With no configured origins the stage does nothing.
pub async fn cors_stage(
    State(stage): State<Arc<CorsStage>>,
    request: Request,
    next: Next,
) -> Response {
    if !stage.is_enabled() {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|origin| stage.allows(origin))
        .and_then(|origin| HeaderValue::from_str(origin).ok());

    let Some(origin) = origin else {
        return next.run(request).await;
    };

    let mut response = if request.method() == Method::OPTIONS {
        responses::status_only(StatusCode::NO_CONTENT)
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    response
}
