//! Streams a directory tree into an archive response body.

use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use async_compression::tokio::write::GzipEncoder;
use async_compression::Level;
use hyper::header::{self, HeaderValue};
use hyper::{Body, Response, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use walkdir::WalkDir;

use proxmox_compression::tar::Builder as TarBuilder;
use proxmox_compression::zip::{ZipEncoder, ZipEntry};

use archiver_rest_server::http_err;
use archiver_tools::async_channel_writer::{AsyncChannelWriter, ChunkSender};
use archiver_tools::sized_reader::SizedReader;

use super::format::ArchiveFormat;

// chunks in flight between the encoder task and the response body
const CHANNEL_CAPACITY: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;

/// Encoder settings for archive downloads
#[derive(Clone, Copy, Debug)]
pub struct ArchiveOptions {
    /// Compression level of `tar.gz` archives
    pub gzip_level: Level,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            gzip_level: Level::Default,
        }
    }
}

/// Encodes `target` as archive of the given content type into a streamed response.
///
/// Unknown content types yield a `415 Unsupported Media Type` response. A missing target is
/// reported as not found error. All entries are named below a top level folder called
/// `folder_name`. Encoding runs in a separate task which aborts the response body on the
/// first error.
pub async fn stream_directory_as_archive(
    target: PathBuf,
    folder_name: &str,
    content_type: &str,
    options: ArchiveOptions,
) -> Result<Response<Body>, Error> {
    let format = match ArchiveFormat::from_content_type(content_type) {
        Some(format) => format,
        None => {
            return unsupported_media_type(format!(
                "A file format with content type {} is not supported",
                content_type
            ))
        }
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, format.content_type())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(folder_name, format.extension())?,
        );

    // a symlinked target is archived as link, so it must not be followed here either
    if let Err(err) = tokio::fs::symlink_metadata(&target).await {
        return Err(match err.kind() {
            std::io::ErrorKind::NotFound => {
                http_err!(NOT_FOUND, "Path '{}' not found.", target.display())
            }
            _ => http_err!(
                INTERNAL_SERVER_ERROR,
                "unable to access {:?} - {}",
                target,
                err
            ),
        });
    }

    let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
    spawn_encoder(format, options, target, PathBuf::from(folder_name), sender);

    Ok(response.body(Body::wrap_stream(ReceiverStream::new(receiver)))?)
}

/// Walks `target` in a new task and sends the encoded archive through `sender`.
///
/// The encoder is finished even after a failed walk. Failures are logged and sent as final
/// error item, which aborts the response body. A closed receiver fails the next write and
/// ends the task.
fn spawn_encoder(
    format: ArchiveFormat,
    options: ArchiveOptions,
    target: PathBuf,
    folder_name: PathBuf,
    sender: ChunkSender,
) -> JoinHandle<()> {
    let error_sender = sender.clone();
    let writer = AsyncChannelWriter::new(sender, CHUNK_SIZE);

    tokio::spawn(async move {
        let mut encoder = ArchiveEncoder::new(format, writer, options);

        let walk_result = write_tree(&mut encoder, &target, &folder_name)
            .await
            .with_context(|| format!("walking {:?}", target));
        let finish_result = encoder.finish().await;

        if let Err(err) = walk_result.and(finish_result) {
            log::error!("streaming {:?} as {} failed - {:#}", target, format, err);
            // an error item aborts the body, the client sees a broken transfer
            let _ = error_sender.send(Err(err)).await;
        }
    })
}

fn unsupported_media_type(message: String) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(message.into())?)
}

fn content_disposition(folder_name: &str, extension: &str) -> Result<HeaderValue, Error> {
    let name = folder_name.replace('\\', "\\\\").replace('"', "\\\"");
    HeaderValue::from_str(&format!("attachment; filename=\"{}.{}\"", name, extension))
        .map_err(|err| format_err!("invalid archive name {:?} - {}", folder_name, err))
}

async fn write_tree<W>(
    encoder: &mut ArchiveEncoder<W>,
    target: &Path,
    folder_name: &Path,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send,
{
    let walker = WalkDir::new(target)
        .follow_links(false)
        .follow_root_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;
        let path = entry.path();

        let relative = path.strip_prefix(target)?;
        let name = if relative.as_os_str().is_empty() {
            folder_name.to_path_buf()
        } else {
            folder_name.join(relative)
        };

        let metadata = entry
            .metadata()
            .with_context(|| format!("unable to stat {:?}", path))?;
        let file_type = metadata.file_type();

        let result = if file_type.is_dir() {
            encoder.add_directory(&name, &metadata).await
        } else if file_type.is_file() {
            let file = File::open(path)
                .await
                .with_context(|| format!("unable to open {:?}", path))?;
            encoder.add_file(&name, &metadata, file).await
        } else if file_type.is_symlink() {
            let link_target = tokio::fs::read_link(path)
                .await
                .with_context(|| format!("unable to read link {:?}", path))?;
            encoder.add_symlink(&name, &metadata, &link_target).await
        } else {
            log::debug!("skipping special file {:?}", path);
            continue;
        };
        result.with_context(|| format!("unable to add {:?} to archive", path))?;
    }

    Ok(())
}

/// Format specific encoder writing into the response body
enum ArchiveEncoder<W: AsyncWrite + Unpin + Send> {
    Zip(ZipEncoder<W>),
    Tar(TarBuilder<W>),
    TarGz(TarBuilder<GzipEncoder<W>>),
}

impl<W: AsyncWrite + Unpin + Send> ArchiveEncoder<W> {
    fn new(format: ArchiveFormat, writer: W, options: ArchiveOptions) -> Self {
        match format {
            ArchiveFormat::Zip => ArchiveEncoder::Zip(ZipEncoder::new(writer)),
            ArchiveFormat::Tar => ArchiveEncoder::Tar(TarBuilder::new(writer)),
            ArchiveFormat::TarGz => ArchiveEncoder::TarGz(TarBuilder::new(
                GzipEncoder::with_quality(writer, options.gzip_level),
            )),
        }
    }

    async fn add_directory(&mut self, name: &Path, metadata: &Metadata) -> Result<(), Error> {
        match self {
            ArchiveEncoder::Zip(zip) => {
                let entry = ZipEntry::new(name, metadata.mtime(), metadata.mode() as u16, false);
                zip.add_entry::<File>(entry, None).await
            }
            ArchiveEncoder::Tar(builder) => {
                let mut header = tar_header(tar::EntryType::Directory, metadata, 0);
                Ok(builder
                    .add_entry(&mut header, name, tokio::io::empty())
                    .await?)
            }
            ArchiveEncoder::TarGz(builder) => {
                let mut header = tar_header(tar::EntryType::Directory, metadata, 0);
                Ok(builder
                    .add_entry(&mut header, name, tokio::io::empty())
                    .await?)
            }
        }
    }

    async fn add_file(&mut self, name: &Path, metadata: &Metadata, file: File) -> Result<(), Error> {
        let size = metadata.len();
        match self {
            ArchiveEncoder::Zip(zip) => {
                let entry = ZipEntry::new(name, metadata.mtime(), metadata.mode() as u16, true);
                zip.add_entry(entry, Some(file)).await
            }
            // the size is part of the header, the content has to match it
            ArchiveEncoder::Tar(builder) => {
                let mut header = tar_header(tar::EntryType::Regular, metadata, size);
                Ok(builder
                    .add_entry(&mut header, name, SizedReader::new(file, size))
                    .await?)
            }
            ArchiveEncoder::TarGz(builder) => {
                let mut header = tar_header(tar::EntryType::Regular, metadata, size);
                Ok(builder
                    .add_entry(&mut header, name, SizedReader::new(file, size))
                    .await?)
            }
        }
    }

    async fn add_symlink(
        &mut self,
        name: &Path,
        metadata: &Metadata,
        link_target: &Path,
    ) -> Result<(), Error> {
        match self {
            ArchiveEncoder::Zip(zip) => {
                // zip stores the link target as content, the mode marks the entry as link
                let entry = ZipEntry::new(name, metadata.mtime(), metadata.mode() as u16, true);
                zip.add_entry(entry, Some(link_target.as_os_str().as_bytes()))
                    .await
            }
            ArchiveEncoder::Tar(builder) => {
                let mut header = tar_header(tar::EntryType::Symlink, metadata, 0);
                Ok(builder.add_link(&mut header, name, link_target).await?)
            }
            ArchiveEncoder::TarGz(builder) => {
                let mut header = tar_header(tar::EntryType::Symlink, metadata, 0);
                Ok(builder.add_link(&mut header, name, link_target).await?)
            }
        }
    }

    /// Writes the container trailer and closes the body sink.
    async fn finish(self) -> Result<(), Error> {
        match self {
            // drops the sink after flushing the central directory
            ArchiveEncoder::Zip(mut zip) => zip.finish().await,
            ArchiveEncoder::Tar(builder) => {
                let mut writer = builder.finish().await?;
                Ok(writer.shutdown().await?)
            }
            // shutdown writes the gzip trailer
            ArchiveEncoder::TarGz(builder) => {
                let mut writer = builder.finish().await?;
                Ok(writer.shutdown().await?)
            }
        }
    }
}

fn tar_header(entry_type: tar::EntryType, metadata: &Metadata, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(metadata.mode() & 0o7777);
    header.set_mtime(metadata.mtime().max(0) as u64);
    header.set_uid(metadata.uid() as u64);
    header.set_gid(metadata.gid() as u64);
    header.set_size(size);
    header
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use hyper::body::HttpBody;

    use super::*;

    #[test]
    fn disposition_quotes_name() -> Result<(), Error> {
        assert_eq!(
            content_disposition("photos", "tar.gz")?,
            "attachment; filename=\"photos.tar.gz\""
        );
        assert_eq!(
            content_disposition("say \"hi\"", "zip")?,
            "attachment; filename=\"say \\\"hi\\\".zip\""
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_content_type_is_unsupported() -> Result<(), Error> {
        let resp = stream_directory_as_archive(
            PathBuf::from("/nonexistent"),
            "nonexistent",
            "application/wrong",
            ArchiveOptions::default(),
        )
        .await?;
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(resp.headers().get(header::CONTENT_DISPOSITION).is_none());

        let body = hyper::body::to_bytes(resp.into_body()).await?;
        assert_eq!(
            &body[..],
            b"A file format with content type application/wrong is not supported"
        );
        Ok(())
    }

    #[tokio::test]
    async fn closed_receiver_ends_the_walk() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        // far more than the channel holds, the walk blocks until the receiver goes away
        let data = vec![b'x'; 4 * 1024 * 1024];
        for name in ["a.bin", "b.bin", "c.bin"] {
            std::fs::write(dir.path().join(name), &data)?;
        }

        let (sender, mut receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let task = spawn_encoder(
            ArchiveFormat::Tar,
            ArchiveOptions::default(),
            dir.path().to_path_buf(),
            PathBuf::from("data"),
            sender,
        );

        assert!(matches!(receiver.recv().await, Some(Ok(_))));
        drop(receiver);

        tokio::time::timeout(Duration::from_secs(10), task).await??;
        Ok(())
    }

    #[tokio::test]
    async fn shrinking_file_aborts_the_body() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![b'x'; 8 * 1024 * 1024])?;

        let resp = stream_directory_as_archive(
            dir.path().to_path_buf(),
            "data",
            "application/tar",
            ArchiveOptions::default(),
        )
        .await?;
        let mut body = resp.into_body();

        // the first chunk already carries the header with the full size
        let mut received = body
            .data()
            .await
            .ok_or_else(|| format_err!("empty body"))??
            .to_vec();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_len(0)?;

        let mut aborted = false;
        while let Some(chunk) = body.data().await {
            match chunk {
                Ok(chunk) => received.extend_from_slice(&chunk),
                Err(_) => {
                    aborted = true;
                    break;
                }
            }
        }
        assert!(aborted, "body ended without error");

        // the end-of-archive blocks were written before the abort
        assert!(received.len() > 1024);
        assert!(received[received.len() - 1024..].iter().all(|b| *b == 0));
        Ok(())
    }
}
