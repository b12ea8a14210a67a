use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use anyhow::{bail, Error};
use async_compression::tokio::bufread::DeflateEncoder;
use futures::future::{self, FutureExt};
use hyper::body::HttpBody;
use hyper::header::{self, HeaderMap};
use hyper::http::request::Parts;
use hyper::{Body, Request, Response, StatusCode};
use lazy_static::lazy_static;
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tower_service::Service;

use archiver_tools::stream::AsyncReaderStream;

use crate::{
    extract_compression_method, http_err, normalize_uri_path, ApiConfig, CompressionMethod,
    FileLogger, HttpError,
};

/// REST server implementation (configured with [ApiConfig])
///
/// This struct implements the [Service] trait in order to use it with
/// [hyper::server::Builder::serve].
pub struct RestServer {
    api_config: Arc<ApiConfig>,
}

const MAX_URI_QUERY_LENGTH: usize = 3072;
const CHUNK_SIZE_LIMIT: u64 = 32 * 1024;

impl RestServer {
    /// Creates a new instance.
    pub fn new(api_config: ApiConfig) -> Self {
        Self {
            api_config: Arc::new(api_config),
        }
    }
}

impl Service<&hyper::server::conn::AddrStream> for RestServer {
    type Response = ApiService;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<ApiService, Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: &hyper::server::conn::AddrStream) -> Self::Future {
        let peer = ctx.remote_addr();
        future::ok(ApiService {
            peer,
            api_config: self.api_config.clone(),
        })
        .boxed()
    }
}

/// Per connection [Service] containing the peer address
///
/// The connection level [Service] implementation on [RestServer] extracts the peer address
/// and returns an [ApiService].
pub struct ApiService {
    pub peer: SocketAddr,
    pub api_config: Arc<ApiConfig>,
}

impl ApiService {
    /// Create a service for requests coming from `peer`, mostly useful without a listener.
    pub fn new(peer: SocketAddr, api_config: Arc<ApiConfig>) -> Self {
        Self { peer, api_config }
    }
}

/// Message of a failed request, used for logging
struct ErrorMessageExtension(String);

fn log_response(
    logfile: Option<&Arc<Mutex<FileLogger>>>,
    peer: &SocketAddr,
    method: hyper::Method,
    path_query: &str,
    resp: &Response<Body>,
    user_agent: Option<String>,
) {
    // we also log URL-to-long requests, so avoid message bigger than PIPE_BUF (4k on Linux)
    // to profit from atomicty guarantees for O_APPEND opened logfiles
    let path = match path_query.char_indices().nth(MAX_URI_QUERY_LENGTH) {
        Some((end, _)) => &path_query[..end],
        None => path_query,
    };

    let status = resp.status();
    if !(status.is_success() || status.is_informational()) {
        let reason = status.canonical_reason().unwrap_or("unknown reason");

        let message = match resp.extensions().get::<ErrorMessageExtension>() {
            Some(data) => &data.0,
            None => "request failed",
        };

        log::error!(
            "{} {}: {} {}: [client {}] {}",
            method.as_str(),
            path,
            status.as_str(),
            reason,
            peer,
            message
        );
    }
    if let Some(logfile) = logfile {
        let now = proxmox_time::epoch_i64();
        // time format which apache/nginx use (by default)
        let datetime = proxmox_time::strftime_local("%d/%m/%Y:%H:%M:%S %z", now)
            .unwrap_or_else(|_| "-".to_string());

        let line = format!(
            "{} - - [{}] \"{} {}\" {} {} {}",
            peer.ip(),
            datetime,
            method.as_str(),
            path,
            status.as_str(),
            resp.body().size_hint().lower(),
            user_agent.unwrap_or_else(|| "-".to_string()),
        );
        match logfile.lock() {
            Ok(mut logger) => logger.log(line),
            Err(poisoned) => poisoned.into_inner().log(line),
        }
    }
}

fn get_proxied_peer(headers: &HeaderMap) -> Option<SocketAddr> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r#"for="([^"]+)""#).unwrap();
    }
    let forwarded = headers.get(header::FORWARDED)?.to_str().ok()?;
    let capture = RE.captures(forwarded)?;
    let rhost = capture.get(1)?.as_str();

    rhost.parse().ok()
}

fn get_user_agent(headers: &HeaderMap) -> Option<String> {
    let agent = headers.get(header::USER_AGENT)?.to_str();
    agent
        .map(|s| {
            let mut s = s.to_owned();
            s.truncate(128);
            s
        })
        .ok()
}

fn error_response(err: Error) -> Result<Response<Body>, Error> {
    let (message, code) = match err.downcast_ref::<HttpError>() {
        Some(apierr) => (apierr.message.clone(), apierr.code),
        _ => (err.to_string(), StatusCode::BAD_REQUEST),
    };
    Ok(Response::builder()
        .status(code)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .extension(ErrorMessageExtension(message.clone()))
        .body(message.into())?)
}

impl Service<Request<Body>> for ApiService {
    type Response = Response<Body>;
    type Error = Error;
    #[allow(clippy::type_complexity)]
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let path = match req.uri().path_and_query() {
            Some(path_query) => path_query.as_str().to_owned(),
            None => req.uri().path().to_owned(),
        };
        let method = req.method().clone();
        let user_agent = get_user_agent(req.headers());

        let config = Arc::clone(&self.api_config);
        let peer = match get_proxied_peer(req.headers()) {
            Some(proxied_peer) => proxied_peer,
            None => self.peer,
        };
        async move {
            let response = match handle_request(Arc::clone(&config), req).await {
                Ok(response) => response,
                Err(err) => error_response(err)?,
            };
            let logger = config.get_access_log();
            log_response(logger, &peer, method, &path, &response, user_agent);
            Ok(response)
        }
        .boxed()
    }
}

fn extension_to_content_type(filename: &Path) -> (&'static str, bool) {
    if let Some(ext) = filename.extension().and_then(|osstr| osstr.to_str()) {
        return match ext {
            "css" => ("text/css", false),
            "html" | "htm" => ("text/html", false),
            "js" => ("application/javascript", false),
            "json" | "map" => ("application/json", false),
            "txt" | "md" => ("text/plain", false),
            "xml" => ("application/xml", false),
            "svg" => ("image/svg+xml", false),
            "png" => ("image/png", true),
            "ico" => ("image/x-icon", true),
            "gif" => ("image/gif", true),
            "jpg" | "jpeg" => ("image/jpeg", true),
            "webp" => ("image/webp", true),
            "woff" => ("application/font-woff", true),
            "woff2" => ("application/font-woff2", true),
            "pdf" => ("application/pdf", true),
            "mp3" => ("audio/mpeg", true),
            "mp4" => ("video/mp4", true),
            "zip" => ("application/zip", true),
            "tar" => ("application/x-tar", false),
            "gz" | "tgz" => ("application/gzip", true),
            _ => ("application/octet-stream", false),
        };
    }

    ("application/octet-stream", false)
}

async fn simple_static_file_download(
    filename: PathBuf,
    content_type: &'static str,
    compression: Option<CompressionMethod>,
) -> Result<Response<Body>, Error> {
    let mut file = BufReader::new(
        File::open(filename)
            .await
            .map_err(|err| http_err!(BAD_REQUEST, "File open failed: {}", err))?,
    );

    let mut data = Vec::new();
    let read_result = match compression {
        Some(CompressionMethod::Deflate) => {
            DeflateEncoder::new(file).read_to_end(&mut data).await
        }
        None => file.read_to_end(&mut data).await,
    };
    read_result.map_err(|err| http_err!(BAD_REQUEST, "File read failed: {}", err))?;

    let mut response = Response::new(data.into());
    if let Some(method) = compression {
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, method.content_encoding());
    }
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type),
    );

    Ok(response)
}

async fn chunked_static_file_download(
    filename: PathBuf,
    content_type: &'static str,
    compression: Option<CompressionMethod>,
) -> Result<Response<Body>, Error> {
    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);

    let file = File::open(filename)
        .await
        .map_err(|err| http_err!(BAD_REQUEST, "File open failed: {}", err))?;

    let body = match compression {
        Some(CompressionMethod::Deflate) => {
            resp = resp.header(
                header::CONTENT_ENCODING,
                CompressionMethod::Deflate.content_encoding(),
            );
            let encoder = DeflateEncoder::new(BufReader::new(file));
            Body::wrap_stream(AsyncReaderStream::new(encoder))
        }
        None => Body::wrap_stream(AsyncReaderStream::new(file)),
    };

    Ok(resp.body(body)?)
}

async fn handle_static_file_download(
    path: &str,
    filename: PathBuf,
    compression: Option<CompressionMethod>,
) -> Result<Response<Body>, Error> {
    let metadata = tokio::fs::metadata(filename.clone())
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => http_err!(NOT_FOUND, "Path '{}' not found.", path),
            _ => http_err!(BAD_REQUEST, "File access problems: {}", err),
        })
        .await?;

    if !metadata.is_file() {
        return Err(http_err!(NOT_FOUND, "Path '{}' not found.", path));
    }

    let (content_type, nocomp) = extension_to_content_type(&filename);
    let compression = if nocomp { None } else { compression };

    if metadata.len() < CHUNK_SIZE_LIMIT {
        simple_static_file_download(filename, content_type, compression).await
    } else {
        chunked_static_file_download(filename, content_type, compression).await
    }
}

async fn handle_request(api: Arc<ApiConfig>, req: Request<Body>) -> Result<Response<Body>, Error> {
    let (parts, _body) = req.into_parts();

    let query = parts.uri.query().unwrap_or_default();
    if parts.uri.path().len() + query.len() > MAX_URI_QUERY_LENGTH {
        return Ok(Response::builder()
            .status(StatusCode::URI_TOO_LONG)
            .body("".into())?);
    }

    for handler in api.handlers() {
        if let Some(response) = handler.handle(&parts).await? {
            return Ok(response);
        }
    }

    serve_static_file(&api, &parts).await
}

async fn serve_static_file(api: &ApiConfig, parts: &Parts) -> Result<Response<Body>, Error> {
    let method = &parts.method;
    if method != hyper::Method::GET {
        bail!("Unsupported HTTP method {}", method);
    }

    let (path, components) = normalize_uri_path(parts.uri.path())?;
    if components.is_empty() {
        return Err(http_err!(NOT_FOUND, "Path '/' not found."));
    }

    let filename = api.static_file_path(&components);
    let compression = extract_compression_method(&parts.headers);
    handle_static_file_download(&path, filename, compression).await
}
