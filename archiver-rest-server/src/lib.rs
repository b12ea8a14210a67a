//! HTTP server for dir-archiver
//!
//! Requests are offered to a chain of [RequestHandler]s first. When no handler claims a
//! request, it is answered from the static file directory configured in [ApiConfig].

use std::future::Future;
use std::pin::Pin;

use anyhow::{bail, Error};
use hyper::http::request::Parts;
use hyper::{Body, Response, StatusCode};

mod state;
pub use state::*;

mod file_logger;
pub use file_logger::FileLogger;

mod api_config;
pub use api_config::ApiConfig;

mod compression;
pub use compression::*;

mod rest;
pub use rest::{ApiService, RestServer};

/// Error with an attached HTTP status code
///
/// The server answers requests failing with this error using `code`, all other errors are
/// reported as `400 Bad Request`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HttpError {
    pub code: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(code: StatusCode, message: String) -> Self {
        HttpError { code, message }
    }
}

/// Create an [anyhow::Error] wrapping a [HttpError], `format!` like.
///
/// ```
/// # use archiver_rest_server::http_err;
/// let err = http_err!(NOT_FOUND, "no such file '{}'", "a.txt");
/// ```
#[macro_export]
macro_rules! http_err {
    ($status:ident, $($fmt:tt)+) => {{
        ::anyhow::Error::from($crate::HttpError::new(
            ::hyper::StatusCode::$status,
            format!($($fmt)+),
        ))
    }};
}

/// Result of a [RequestHandler]: `Ok(None)` passes the request on.
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Response<Body>>, Error>> + Send + 'a>>;

/// A request handler inside the server's handler chain
///
/// Handlers only see the request head. Returning `Ok(None)` hands the request to the next
/// handler, errors are turned into error responses by the server.
pub trait RequestHandler: Send + Sync {
    fn handle<'a>(&'a self, parts: &'a Parts) -> HandlerFuture<'a>;
}

/// Split a URI path into its components.
///
/// Empty components are dropped, components starting with a dot (hidden files, `.`, `..`)
/// are refused.
pub fn normalize_uri_path(path: &str) -> Result<(String, Vec<&str>), Error> {
    let items = path.split('/');

    let mut path = String::new();
    let mut components = vec![];

    for name in items {
        if name.is_empty() {
            continue;
        }
        if name.starts_with('.') {
            bail!("Path contains illegal components.");
        }
        path.push('/');
        path.push_str(name);
        components.push(name);
    }

    Ok((path, components))
}
