//! API key authentication middleware
//!
//! Resolves every request to a [`Caller`] and stores it in the request
//! extensions. With keys configured, the key decides owner and tier; without
//! them the owner comes from the `X-User-Id` header and the tier is free.

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    collections::HashMap,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

use crate::config::AuthConfig;
use crate::error::AppError;
use crate::queue::Tier;

/// Header naming the caller when keys are not in use
pub const USER_ID_HEADER: &str = "x-user-id";

/// Owner used when no identity is supplied
pub const ANONYMOUS: &str = "anonymous";

/// The authenticated identity behind a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub owner: String,
    pub tier: Tier,
}

/// Authentication layer
#[derive(Clone)]
pub struct AuthLayer {
    api_keys: Arc<HashMap<String, Caller>>,
    enabled: bool,
}

impl AuthLayer {
    pub fn new(config: &AuthConfig) -> Self {
        let api_keys = config
            .api_keys
            .iter()
            .map(|k| {
                (
                    k.key.clone(),
                    Caller {
                        owner: k.owner.clone(),
                        tier: k.tier,
                    },
                )
            })
            .collect();

        Self {
            api_keys: Arc::new(api_keys),
            enabled: config.enabled,
        }
    }

    /// Identify the caller, or explain why not
    fn identify(&self, headers: &HeaderMap) -> Result<Caller, AppError> {
        if !self.enabled || self.api_keys.is_empty() {
            let owner = headers
                .get(USER_ID_HEADER)
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .unwrap_or(ANONYMOUS);
            return Ok(Caller {
                owner: owner.to_string(),
                tier: Tier::Free,
            });
        }

        let api_key = headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.strip_prefix("Bearer ").unwrap_or(h).trim());

        match api_key {
            Some(key) => self.api_keys.get(key).cloned().ok_or_else(|| {
                warn!("Invalid API key provided");
                AppError::AuthenticationFailed("Invalid API key".to_string())
            }),
            None => {
                warn!("No API key provided");
                Err(AppError::AuthenticationFailed(
                    "API key required. Provide via Authorization header: 'Bearer YOUR_API_KEY'"
                        .to_string(),
                ))
            }
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            auth: self.clone(),
        }
    }
}

/// Authentication middleware service
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    auth: AuthLayer,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        if request.uri().path() == "/health" {
            let future = self.inner.call(request);
            return Box::pin(future);
        }

        match self.auth.identify(request.headers()) {
            Ok(caller) => {
                request.extensions_mut().insert(caller);
                let future = self.inner.call(request);
                Box::pin(future)
            }
            Err(e) => Box::pin(async move { Ok(e.into_response()) }),
        }
    }
}
