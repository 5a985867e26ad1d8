//! The HTTP connection to the api.
//!
//! `ApiConnection` owns the base url, the credentials, the retry policy and
//! the middleware stack. Verbs take a path relative to the base url and the
//! already-compiled query parameters. Timeouts and connection errors are
//! retried, any other transport failure is not.

pub mod middleware;

use std::{cell::Cell, sync::Arc, time::Duration, time::Instant};

use indexmap::IndexMap;
use reqwest::{
    blocking::{multipart, Client},
    Method, StatusCode, Url,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{compiler::predicate::Params, error::RestError, query::FilePayload};

use self::middleware::{
    ApiResponse, Middleware, MiddlewareGuard, MiddlewareStack, RequestContext,
};

const DEFAULT_RETRY: u32 = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The credentials attached to every request.
#[derive(Debug, Clone)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl Auth {
    /// the identity named in permission errors.
    fn principal(&self) -> String {
        match self {
            Auth::Basic { username, .. } => username.clone(),
            Auth::Bearer { .. } => "token".to_owned(),
        }
    }
}

pub struct ApiConnection {
    url: Url,
    auth: Option<Auth>,
    retry: u32,
    timeout: Duration,
    client: Client,
    middlewares: MiddlewareStack,
    request_id: Cell<u64>,
}

impl ApiConnection {
    pub fn new(url: &str) -> Result<Self, RestError> {
        // a base url without a trailing slash would swallow its last
        // segment on join
        let normalized = if url.ends_with('/') {
            url.to_owned()
        } else {
            format!("{}/", url)
        };
        let url = Url::parse(&normalized).map_err(|_| RestError::InvalidUrl(normalized))?;
        Ok(ApiConnection {
            url,
            auth: None,
            retry: DEFAULT_RETRY,
            timeout: DEFAULT_TIMEOUT,
            client: Client::new(),
            middlewares: MiddlewareStack::default(),
            request_id: Cell::new(0),
        })
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.url
    }

    pub fn middlewares(&self) -> &MiddlewareStack {
        &self.middlewares
    }

    /// install a middleware for the lifetime of the returned guard.
    pub fn with_middleware(
        &self,
        priority: u8,
        middleware: Arc<dyn Middleware>,
    ) -> MiddlewareGuard<'_> {
        MiddlewareGuard::new(&self.middlewares, priority, middleware)
    }

    pub fn get(&self, path: &str, params: &Params) -> Result<ApiResponse, RestError> {
        self.request(Method::GET, path, params, None, None)
    }

    pub fn post(
        &self,
        path: &str,
        params: &Params,
        json: &Value,
    ) -> Result<ApiResponse, RestError> {
        self.request(Method::POST, path, params, Some(json), None)
    }

    pub fn post_multipart(
        &self,
        path: &str,
        params: &Params,
        files: &IndexMap<String, FilePayload>,
    ) -> Result<ApiResponse, RestError> {
        self.request(Method::POST, path, params, None, Some(files))
    }

    pub fn patch(
        &self,
        path: &str,
        params: &Params,
        json: &Value,
    ) -> Result<ApiResponse, RestError> {
        self.request(Method::PATCH, path, params, Some(json), None)
    }

    pub fn patch_multipart(
        &self,
        path: &str,
        params: &Params,
        files: &IndexMap<String, FilePayload>,
    ) -> Result<ApiResponse, RestError> {
        self.request(Method::PATCH, path, params, None, Some(files))
    }

    pub fn delete(&self, path: &str, params: &Params) -> Result<ApiResponse, RestError> {
        self.request(Method::DELETE, path, params, None, None)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &Params,
        json: Option<&Value>,
        files: Option<&IndexMap<String, FilePayload>>,
    ) -> Result<ApiResponse, RestError> {
        let request_id = self.request_id.get();
        self.request_id.set(request_id + 1);

        let url = self
            .url
            .join(path)
            .map_err(|_| RestError::InvalidUrl(format!("{}{}", self.url, path)))?;
        let mut ctx = RequestContext {
            method: method.to_string(),
            url: url.to_string(),
            params: flatten_params(params),
            json: json.cloned(),
        };

        // middlewares run in order until one serves the response itself.
        // every middleware that saw the request, the serving one included,
        // sees the response on the way back
        let mut executed: Vec<Arc<dyn Middleware>> = Vec::new();
        let mut served = None;
        for mw in self.middlewares.ordered() {
            executed.push(Arc::clone(&mw));
            if let Some(response) = mw.process_request(&mut ctx, request_id) {
                served = Some(response);
                break;
            }
        }

        let mut response = match served {
            Some(response) => response,
            None => self.send(&method, &url, &ctx, files)?,
        };
        for mw in executed.iter().rev() {
            response = mw.process_response(&ctx, response, request_id);
        }

        if response.status == 401 || response.status == 403 {
            let principal = self
                .auth
                .as_ref()
                .map(Auth::principal)
                .unwrap_or_else(|| "<anonymous>".to_owned());
            return Err(RestError::AccessDenied {
                principal,
                message: response_message(&response),
            });
        }
        Ok(response)
    }

    fn send(
        &self,
        method: &Method,
        url: &Url,
        ctx: &RequestContext,
        files: Option<&IndexMap<String, FilePayload>>,
    ) -> Result<ApiResponse, RestError> {
        let mut tries = 0;
        loop {
            tries += 1;
            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .timeout(self.timeout)
                .header(reqwest::header::ACCEPT, "application/json")
                .query(&ctx.params);
            builder = match &self.auth {
                Some(Auth::Basic { username, password }) => {
                    builder.basic_auth(username, Some(password))
                }
                Some(Auth::Bearer { token }) => builder.bearer_auth(token),
                None => builder,
            };
            if let Some(json) = &ctx.json {
                builder = builder.json(json);
            }
            if let Some(files) = files {
                builder = builder.multipart(build_form(files)?);
            }

            let started = Instant::now();
            match builder.send() {
                Ok(response) => {
                    let status = response.status().as_u16();
                    debug!(
                        method = %ctx.method,
                        url = %ctx.url,
                        status,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "api request"
                    );
                    let body = response.text().map_err(|err| RestError::ExecutionFailed {
                        method: ctx.method.clone(),
                        url: ctx.url.clone(),
                        message: err.to_string(),
                    })?;
                    return Ok(ApiResponse { status, body });
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    if tries >= self.retry {
                        return Err(RestError::RetriesExhausted {
                            url: ctx.url.clone(),
                            tries,
                            last_error: err.to_string(),
                        });
                    }
                    warn!(
                        url = %ctx.url,
                        tries,
                        error = %err,
                        "api request failed, retrying"
                    );
                }
                Err(err) => {
                    return Err(RestError::ExecutionFailed {
                        method: ctx.method.clone(),
                        url: ctx.url.clone(),
                        message: err.to_string(),
                    })
                }
            }
        }
    }
}

fn flatten_params(params: &Params) -> Vec<(String, String)> {
    params
        .iter()
        .flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.clone(), value.clone()))
        })
        .collect()
}

fn build_form(files: &IndexMap<String, FilePayload>) -> Result<multipart::Form, RestError> {
    let mut form = multipart::Form::new();
    for (name, file) in files {
        let part = multipart::Part::bytes(file.content.clone())
            .file_name(file.filename.clone())
            .mime_str(&file.content_type)
            .map_err(|err| {
                RestError::Internal(format!(
                    "invalid content type {}: {}",
                    file.content_type, err
                ))
            })?;
        form = form.part(name.clone(), part);
    }
    Ok(form)
}

/// human-readable message for a failed response. html error pages degrade
/// to the canonical status reason.
pub fn response_message(response: &ApiResponse) -> String {
    let head: String = response.body.chars().take(30).collect();
    if head.contains("<!DOCTYPE html>") {
        let reason = StatusCode::from_u16(response.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("");
        format!("[{}]{}", response.status, reason)
    } else {
        format!("[{}]{}", response.status, response.body)
    }
}

/// the url with its query string, for error messages.
pub fn url_with_params(url: &str, params: &Params) -> String {
    if params.is_empty() {
        return url.to_owned();
    }
    let query: Vec<String> = flatten_params(params)
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    format!("{}?{}", url, query.join("&"))
}
