//! Archive downloads of directories below the served root
//!
//! A request is answered with an archive if one of its `Accept` headers names a supported
//! archive content type and its path stays inside the root. Everything else is left to the
//! next handler.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use anyhow::Error;
use hyper::http::request::Parts;
use hyper::{Body, Response};
use percent_encoding::percent_decode_str;

use archiver_rest_server::{http_err, HandlerFuture, RequestHandler};

use crate::config::ArchiverConfig;

pub mod confine;
pub mod format;
pub mod negotiate;
pub mod stream;

use confine::Confinement;
use format::ArchiveFormat;
use negotiate::negotiate;
use stream::{stream_directory_as_archive, ArchiveOptions};

// top level folder name if the root has no name (served root is "/")
const FALLBACK_FOLDER_NAME: &str = "archive";

/// Request handler answering archive requests
pub struct ArchiveHandler {
    confinement: Confinement,
    formats: Vec<ArchiveFormat>,
    options: ArchiveOptions,
}

impl ArchiveHandler {
    pub fn new(config: &ArchiverConfig) -> Result<Self, Error> {
        Ok(Self {
            confinement: Confinement::new(config.root()?, config.strict_confinement),
            formats: config.enabled_formats(),
            options: config.archive_options(),
        })
    }

    /// Returns `Ok(None)` for requests which are no archive requests.
    pub async fn handle_request(&self, parts: &Parts) -> Result<Option<Response<Body>>, Error> {
        let negotiation = negotiate(&parts.headers, &self.formats);
        if !negotiation.matched {
            return Ok(None);
        }

        let raw_path = parts.uri.path();
        let path = match String::from_utf8(percent_decode_str(raw_path).collect()) {
            Ok(path) => path,
            Err(_) => {
                log::debug!("path {} is not valid utf-8, passing on", raw_path);
                return Ok(None);
            }
        };

        log::info!("downloading {} as {}", path, negotiation.content_type);

        let check = self.confinement.check(&path);
        if !check.confined {
            log::info!(
                "path {} is not inside root {:?}",
                path,
                self.confinement.root()
            );
            return Ok(None);
        }

        let target = check.resolved_absolute_path;
        match self.confinement.parent_within_root(&target).await {
            Ok(true) => (),
            Ok(false) => {
                log::info!(
                    "path {} leaves root {:?} through a symlink",
                    path,
                    self.confinement.root()
                );
                return Ok(None);
            }
            Err(err) => {
                return Err(http_err!(
                    INTERNAL_SERVER_ERROR,
                    "unable to resolve root {:?} - {}",
                    self.confinement.root(),
                    err
                ))
            }
        }

        let folder_name = target
            .file_name()
            .map(OsStr::as_bytes)
            .map(String::from_utf8_lossy)
            .map(|name| name.into_owned())
            .unwrap_or_else(|| FALLBACK_FOLDER_NAME.to_string());

        stream_directory_as_archive(target, &folder_name, negotiation.content_type, self.options)
            .await
            .map(Some)
    }
}

impl RequestHandler for ArchiveHandler {
    fn handle<'a>(&'a self, parts: &'a Parts) -> HandlerFuture<'a> {
        Box::pin(self.handle_request(parts))
    }
}
