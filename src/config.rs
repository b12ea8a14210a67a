//! Daemon configuration
//!
//! Read from a JSON file with kebab-case keys, e.g.
//!
//! ```json
//! {
//!     "root": "/srv/data",
//!     "listen": "0.0.0.0:8080",
//!     "access-log": "/var/log/dir-archiver/access.log",
//!     "gzip-compression-level": 6,
//!     "formats": ["zip", "tar.gz"],
//!     "strict-confinement": false
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use serde::Deserialize;

use async_compression::Level;

use crate::archive::confine::absolute_path;
use crate::archive::format::{validate_archive_selection, ArchiveFormat};
use crate::archive::stream::ArchiveOptions;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ArchiverConfig {
    /// Directory which is served and archived
    pub root: Option<PathBuf>,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub access_log: Option<PathBuf>,
    /// Compression level (1-9) of tar.gz downloads, the encoder default if unset
    pub gzip_compression_level: Option<u32>,
    /// Extensions of the formats offered, all formats if unset
    pub formats: Option<Vec<String>>,
    #[serde(default)]
    pub strict_confinement: bool,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            root: None,
            listen: default_listen(),
            access_log: None,
            gzip_compression_level: None,
            formats: None,
            strict_confinement: false,
        }
    }
}

impl ArchiverConfig {
    pub fn parse(data: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {:?}", path))?;
        Self::parse(&data).with_context(|| format!("unable to parse config file {:?}", path))
    }

    /// Validate the settings and make the root path absolute.
    pub fn provision(&mut self) -> Result<(), Error> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| format_err!("missing 'root' setting"))?;

        let metadata = std::fs::metadata(root)
            .map_err(|err| format_err!("error opening root folder {:?} - {}", root, err))?;
        if !metadata.is_dir() {
            bail!("the specified root is not a valid directory {:?}", root);
        }
        self.root = Some(absolute_path(root));

        if let Some(formats) = &self.formats {
            validate_archive_selection(formats)?;
            if formats.is_empty() {
                bail!("'formats' must name at least one archive format");
            }
        }

        if let Some(level) = self.gzip_compression_level {
            if !(1..=9).contains(&level) {
                bail!("invalid gzip compression level {}, expected 1-9", level);
            }
        }

        log::debug!("provisioning done, serving {:?}", self.root);

        Ok(())
    }

    pub fn root(&self) -> Result<&Path, Error> {
        self.root
            .as_deref()
            .ok_or_else(|| format_err!("missing 'root' setting"))
    }

    pub fn enabled_formats(&self) -> Vec<ArchiveFormat> {
        match &self.formats {
            Some(formats) => formats
                .iter()
                .filter_map(|ext| ArchiveFormat::from_extension(ext))
                .collect(),
            None => ArchiveFormat::all().to_vec(),
        }
    }

    pub fn archive_options(&self) -> ArchiveOptions {
        match self.gzip_compression_level {
            Some(level) => ArchiveOptions {
                gzip_level: Level::Precise(level as i32),
            },
            None => ArchiveOptions::default(),
        }
    }
}
