//! Async I/O helpers shared by the dir-archiver crates.

pub mod async_channel_writer;
pub mod sized_reader;
pub mod stream;
