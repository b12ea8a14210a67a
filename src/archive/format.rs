//! Supported archive formats and their negotiable content types.

use std::fmt;

use anyhow::{bail, Error};

/// Container formats an archive download can be encoded in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

const FORMATS: [ArchiveFormat; 3] = [ArchiveFormat::Zip, ArchiveFormat::Tar, ArchiveFormat::TarGz];

impl ArchiveFormat {
    pub fn all() -> &'static [ArchiveFormat] {
        &FORMATS
    }

    /// File name extension, without the leading dot
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "application/zip",
            ArchiveFormat::Tar => "application/tar",
            ArchiveFormat::TarGz => "application/tar+gzip",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        FORMATS
            .iter()
            .copied()
            .find(|format| format.extension() == extension)
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        FORMATS
            .iter()
            .copied()
            .find(|format| format.content_type() == content_type)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.extension())
    }
}

pub fn extension_for(content_type: &str) -> Option<&'static str> {
    ArchiveFormat::from_content_type(content_type).map(ArchiveFormat::extension)
}

pub fn content_type_for(extension: &str) -> Option<&'static str> {
    ArchiveFormat::from_extension(extension).map(ArchiveFormat::content_type)
}

pub fn is_supported_extension(extension: &str) -> bool {
    ArchiveFormat::from_extension(extension).is_some()
}

pub fn validate_extension(extension: &str) -> Result<(), Error> {
    if !is_supported_extension(extension) {
        bail!("A file format with extension {} is not supported", extension);
    }
    Ok(())
}

/// Check a list of extensions, reporting all unsupported ones at once.
pub fn validate_archive_selection<S: AsRef<str>>(extensions: &[S]) -> Result<(), Error> {
    let invalid: Vec<&str> = extensions
        .iter()
        .map(|ext| ext.as_ref())
        .filter(|ext| !is_supported_extension(ext))
        .collect();

    if !invalid.is_empty() {
        bail!("these extensions are not valid choices [{}]", invalid.join(" "));
    }
    Ok(())
}
