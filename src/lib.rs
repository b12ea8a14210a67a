//! Serve directory trees as streamed zip/tar/tar.gz archives.

pub mod archive;
pub mod config;
