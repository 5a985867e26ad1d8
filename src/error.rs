use std::{
    error::Error,
    fmt::{Display, Formatter},
};

/// The error taxonomy exposed to callers.
///
/// Compilation errors (`UnsupportedQuery`, `Resolution`, `Schema`) are raised
/// before any network call. Structural errors (`MissingResourceKey`,
/// `MissingId`, `UnsupportedShape`) are raised while reassembling a response.
/// The transport raises `AccessDenied`, `ExecutionFailed` and
/// `RetriesExhausted`.
#[derive(Debug)]
pub enum RestError {
    /// the query uses a construct outside the supported algebra
    UnsupportedQuery(String),
    /// the join graph could not be topologically resolved, carries the
    /// aliases left unresolved
    Resolution(Vec<String>),
    /// the schema catalog is missing or inconsistent for the requested model
    Schema(String),
    /// the response does not contain the expected resource key, probably a
    /// resource name mismatch between the client catalog and the server
    MissingResourceKey { resource: String, keys: Vec<String> },
    /// a referenced primary key is absent from the embedded collections of
    /// the response
    MissingId { model: String, pk: String },
    /// a value in the response has a shape the declared field cannot accept
    UnsupportedShape {
        model: String,
        column: String,
        value: String,
    },
    /// HTTP 401/403 from the server
    AccessDenied { principal: String, message: String },
    /// any other non-success status
    ExecutionFailed {
        method: String,
        url: String,
        message: String,
    },
    /// every configured retry was consumed against timeouts or connection
    /// errors
    RetriesExhausted {
        url: String,
        tries: u32,
        last_error: String,
    },
    /// the configured base url or a derived url could not be parsed
    InvalidUrl(String),
    /// the response body was expected to be JSON but did not decode
    InvalidJson { url: String, message: String },
    Internal(String),
}

impl Display for RestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RestError::UnsupportedQuery(message) => {
                write!(f, "{} is not supported", message)
            }
            RestError::Resolution(aliases) => write!(
                f,
                "impossible to resolve the join hierarchy, unresolved aliases: {:?}",
                aliases
            ),
            RestError::Schema(message) => write!(f, "schema error: {}", message),
            RestError::MissingResourceKey { resource, keys } => write!(
                f,
                "the response does not contain the result for {}. maybe the resource name \
                 does not match the one on the api. had {:?} in result",
                resource, keys
            ),
            RestError::MissingId { model, pk } => write!(
                f,
                "the response from the server does not contain the ID {} for the model {}",
                pk, model
            ),
            RestError::UnsupportedShape {
                model,
                column,
                value,
            } => write!(
                f,
                "the result from the api for {}.{} is not supported: {}",
                model, column, value
            ),
            RestError::AccessDenied { principal, message } => write!(
                f,
                "access to the database is forbidden for user {}.\n{}",
                principal, message
            ),
            RestError::ExecutionFailed {
                method,
                url,
                message,
            } => write!(
                f,
                "the query to the api has failed: {} {}\n=> {}",
                method, url, message
            ),
            RestError::RetriesExhausted {
                url,
                tries,
                last_error,
            } => write!(
                f,
                "could not connect to server: {}\nis the api running on {}? tried {} times",
                last_error, url, tries
            ),
            RestError::InvalidUrl(url) => write!(f, "invalid url: {}", url),
            RestError::InvalidJson { url, message } => {
                write!(f, "invalid json response from {}: {}", url, message)
            }
            RestError::Internal(message) => write!(f, "internal error: {}", message),
        }
    }
}

impl Error for RestError {}
