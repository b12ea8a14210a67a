use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use crate::{FileLogger, RequestHandler};

/// REST server configuration
pub struct ApiConfig {
    basedir: PathBuf,
    handlers: Vec<Box<dyn RequestHandler>>,
    request_log: Option<Arc<Mutex<FileLogger>>>,
}

impl ApiConfig {
    /// Creates a new instance
    ///
    /// `basedir` - Static file lookups are relative to this directory.
    pub fn new<B: Into<PathBuf>>(basedir: B) -> Self {
        Self {
            basedir: basedir.into(),
            handlers: Vec::new(),
            request_log: None,
        }
    }

    /// Append a handler to the request handler chain
    ///
    /// Handlers are asked in registration order, the static file lookup runs after all of
    /// them declined the request.
    pub fn add_handler(&mut self, handler: impl RequestHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub(crate) fn handlers(&self) -> &[Box<dyn RequestHandler>] {
        &self.handlers
    }

    /// File below the base directory addressed by the URI path `components`
    pub(crate) fn static_file_path(&self, components: &[&str]) -> PathBuf {
        let mut filename = self.basedir.clone();
        filename.extend(components);
        filename
    }

    /// Enable the access log feature
    ///
    /// When enabled, all requests are logged to the specified file.
    pub fn enable_access_log<P>(&mut self, path: P) -> Result<(), Error>
    where
        P: Into<PathBuf>,
    {
        let path: PathBuf = path.into();
        if let Some(base) = path.parent() {
            if !base.as_os_str().is_empty() && !base.exists() {
                std::fs::create_dir_all(base)
                    .map_err(|err| format_err!("unable to create {:?} - {}", base, err))?;
            }
        }

        let request_log = Arc::new(Mutex::new(FileLogger::open(&path)?));
        self.request_log = Some(request_log);

        Ok(())
    }

    pub(crate) fn get_access_log(&self) -> Option<&Arc<Mutex<FileLogger>>> {
        self.request_log.as_ref()
    }
}
