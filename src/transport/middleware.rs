//! The request middleware pipeline.
//!
//! Middlewares observe or short-circuit requests before they reach the
//! network. They run in priority order on the way out and in reverse order
//! on the way back, and only the middlewares that actually saw a request see
//! its response. The main consumer is testing: a middleware can serve canned
//! responses without a server.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    sync::Arc,
};

use serde_json::Value;

/// A response as the pipeline sees it, either from the network or from a
/// short-circuiting middleware.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn empty(status: u16) -> Self {
        ApiResponse {
            status,
            body: String::new(),
        }
    }

    pub fn from_json(status: u16, body: &Value) -> Self {
        ApiResponse {
            status,
            body: body.to_string(),
        }
    }

    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}

/// Everything a middleware may inspect or rewrite about a pending request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub json: Option<Value>,
}

pub trait Middleware {
    /// called before the request goes out. returning a response
    /// short-circuits the rest of the pipeline and the network.
    fn process_request(&self, _ctx: &mut RequestContext, _request_id: u64) -> Option<ApiResponse> {
        None
    }

    /// called with the response, innermost middleware first.
    fn process_response(
        &self,
        _ctx: &RequestContext,
        response: ApiResponse,
        _request_id: u64,
    ) -> ApiResponse {
        response
    }
}

/// Priority-bucketed middleware registry. Lower priorities run first, and
/// within one priority the most recently pushed middleware runs first.
#[derive(Default)]
pub struct MiddlewareStack {
    buckets: RefCell<BTreeMap<u8, Vec<Arc<dyn Middleware>>>>,
}

impl MiddlewareStack {
    pub fn push(&self, priority: u8, middleware: Arc<dyn Middleware>) {
        self.buckets
            .borrow_mut()
            .entry(priority)
            .or_default()
            .insert(0, middleware);
    }

    pub fn pop(&self, priority: u8, middleware: &Arc<dyn Middleware>) {
        let mut buckets = self.buckets.borrow_mut();
        if let Some(bucket) = buckets.get_mut(&priority) {
            bucket.retain(|m| !Arc::ptr_eq(m, middleware));
            if bucket.is_empty() {
                buckets.remove(&priority);
            }
        }
    }

    /// the middlewares in execution order.
    pub fn ordered(&self) -> Vec<Arc<dyn Middleware>> {
        self.buckets
            .borrow()
            .values()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }
}

/// Removes its middleware from the stack when dropped, so a temporarily
/// installed middleware does not outlive its scope even on panic.
pub struct MiddlewareGuard<'s> {
    stack: &'s MiddlewareStack,
    priority: u8,
    middleware: Arc<dyn Middleware>,
}

impl<'s> MiddlewareGuard<'s> {
    pub fn new(stack: &'s MiddlewareStack, priority: u8, middleware: Arc<dyn Middleware>) -> Self {
        stack.push(priority, Arc::clone(&middleware));
        MiddlewareGuard {
            stack,
            priority,
            middleware,
        }
    }
}

impl Drop for MiddlewareGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop(self.priority, &self.middleware);
    }
}
