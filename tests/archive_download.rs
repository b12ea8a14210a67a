use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::Error;
use hyper::header::{ACCEPT, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::service::Service;
use hyper::{Body, Request, Response, StatusCode};
use tempfile::TempDir;

use archiver_rest_server::{ApiConfig, ApiService, HttpError};
use dir_archiver::archive::stream::{stream_directory_as_archive, ArchiveOptions};
use dir_archiver::archive::ArchiveHandler;
use dir_archiver::config::ArchiverConfig;

/// root with `photos/a.jpg` (10 bytes) and `photos/2023/b.jpg` (20 bytes)
fn photo_root() -> Result<TempDir, Error> {
    let dir = tempfile::tempdir()?;
    let photos = dir.path().join("photos");
    std::fs::create_dir_all(photos.join("2023"))?;
    std::fs::write(photos.join("a.jpg"), [b'a'; 10])?;
    std::fs::write(photos.join("2023").join("b.jpg"), [b'b'; 20])?;
    Ok(dir)
}

fn config_for(root: &Path) -> Result<ArchiverConfig, Error> {
    let mut config = ArchiverConfig {
        root: Some(root.to_path_buf()),
        ..Default::default()
    };
    config.provision()?;
    Ok(config)
}

fn request_parts(path: &str, accept: &[&str]) -> Result<Parts, Error> {
    let mut builder = Request::builder().uri(path);
    for value in accept {
        builder = builder.header(ACCEPT, *value);
    }
    Ok(builder.body(())?.into_parts().0)
}

async fn body_bytes(response: Response<Body>) -> Result<Vec<u8>, Error> {
    Ok(hyper::body::to_bytes(response.into_body()).await?.to_vec())
}

#[derive(Debug, PartialEq)]
enum Entry {
    Dir,
    File(Vec<u8>),
    Link(String),
}

fn zip_entries(data: Vec<u8>) -> Result<BTreeMap<String, Entry>, Error> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    let mut entries = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        if file.is_dir() {
            entries.insert(name.trim_end_matches('/').to_string(), Entry::Dir);
        } else {
            let mut content = Vec::new();
            file.read_to_end(&mut content)?;
            entries.insert(name, Entry::File(content));
        }
    }
    Ok(entries)
}

fn tar_entries<R: Read>(reader: R) -> Result<BTreeMap<String, Entry>, Error> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
        let kind = entry.header().entry_type();
        let value = if kind.is_dir() {
            Entry::Dir
        } else if kind.is_symlink() {
            let target = entry.link_name()?.map(|t| t.to_string_lossy().into_owned());
            Entry::Link(target.unwrap_or_default())
        } else {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            Entry::File(content)
        };
        entries.insert(name, value);
    }
    Ok(entries)
}

fn expected_photos() -> BTreeMap<String, Entry> {
    let mut expected = BTreeMap::new();
    expected.insert("photos".to_string(), Entry::Dir);
    expected.insert("photos/2023".to_string(), Entry::Dir);
    expected.insert("photos/2023/b.jpg".to_string(), Entry::File(vec![b'b'; 20]));
    expected.insert("photos/a.jpg".to_string(), Entry::File(vec![b'a'; 10]));
    expected
}

async fn download(
    handler: &ArchiveHandler,
    path: &str,
    accept: &str,
) -> Result<Response<Body>, Error> {
    let parts = request_parts(path, &[accept])?;
    match handler.handle_request(&parts).await? {
        Some(response) => Ok(response),
        None => anyhow::bail!("archive handler declined {}", path),
    }
}

#[tokio::test]
async fn photos_as_zip() -> Result<(), Error> {
    let root = photo_root()?;
    let handler = ArchiveHandler::new(&config_for(root.path())?)?;

    let response = download(&handler, "/photos", "application/zip").await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "application/zip");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"photos.zip\""
    );

    let entries = zip_entries(body_bytes(response).await?)?;
    assert_eq!(entries, expected_photos());

    let files: Vec<&String> = entries
        .iter()
        .filter(|(_, entry)| matches!(entry, Entry::File(_)))
        .map(|(name, _)| name)
        .collect();
    assert_eq!(files, ["photos/2023/b.jpg", "photos/a.jpg"]);
    Ok(())
}

#[tokio::test]
async fn photos_as_tar() -> Result<(), Error> {
    let root = photo_root()?;
    let handler = ArchiveHandler::new(&config_for(root.path())?)?;

    let response = download(&handler, "/photos", "application/tar").await?;
    assert_eq!(response.headers()[CONTENT_TYPE], "application/tar");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"photos.tar\""
    );

    let data = body_bytes(response).await?;
    assert_eq!(data.len() % 512, 0);
    assert_eq!(tar_entries(&data[..])?, expected_photos());
    Ok(())
}

#[tokio::test]
async fn photos_as_tar_gz() -> Result<(), Error> {
    let root = photo_root()?;
    let handler = ArchiveHandler::new(&config_for(root.path())?)?;

    let response = download(&handler, "/photos/", "application/tar+gzip").await?;
    assert_eq!(response.headers()[CONTENT_TYPE], "application/tar+gzip");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"photos.tar.gz\""
    );

    let data = body_bytes(response).await?;
    let entries = tar_entries(flate2::read::GzDecoder::new(&data[..]))?;
    assert_eq!(entries, expected_photos());
    Ok(())
}

#[tokio::test]
async fn last_accept_value_selects_format() -> Result<(), Error> {
    let root = photo_root()?;
    let handler = ArchiveHandler::new(&config_for(root.path())?)?;

    let parts = request_parts(
        "/photos/2023",
        &["application/zip", "text/html", "application/tar"],
    )?;
    let response = handler
        .handle_request(&parts)
        .await?
        .expect("archive response");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"2023.tar\""
    );

    let mut expected = BTreeMap::new();
    expected.insert("2023".to_string(), Entry::Dir);
    expected.insert("2023/b.jpg".to_string(), Entry::File(vec![b'b'; 20]));
    assert_eq!(tar_entries(&body_bytes(response).await?[..])?, expected);
    Ok(())
}

#[tokio::test]
async fn root_request_uses_root_name() -> Result<(), Error> {
    let root = photo_root()?;
    let config = config_for(root.path())?;
    let handler = ArchiveHandler::new(&config)?;
    let root_name = root
        .path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();

    let response = download(&handler, "/", "application/zip").await?;
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION].to_str()?,
        format!("attachment; filename=\"{}.zip\"", root_name)
    );

    let entries = zip_entries(body_bytes(response).await?)?;
    assert_eq!(entries.get(&root_name), Some(&Entry::Dir));
    assert_eq!(
        entries.get(&format!("{}/photos/a.jpg", root_name)),
        Some(&Entry::File(vec![b'a'; 10]))
    );
    Ok(())
}

#[tokio::test]
async fn symlinks_are_stored_as_links() -> Result<(), Error> {
    let root = photo_root()?;
    std::os::unix::fs::symlink("a.jpg", root.path().join("photos").join("latest"))?;
    let handler = ArchiveHandler::new(&config_for(root.path())?)?;

    let response = download(&handler, "/photos", "application/tar").await?;
    let entries = tar_entries(&body_bytes(response).await?[..])?;
    assert_eq!(
        entries.get("photos/latest"),
        Some(&Entry::Link("a.jpg".to_string()))
    );
    assert_eq!(entries.len(), 5);
    Ok(())
}

#[tokio::test]
async fn symlinked_directories_are_not_followed() -> Result<(), Error> {
    let outside = tempfile::tempdir()?;
    std::fs::create_dir(outside.path().join("sub"))?;
    std::fs::write(outside.path().join("secret.txt"), b"secret")?;
    std::fs::write(outside.path().join("sub").join("secret.txt"), b"secret")?;

    let root = photo_root()?;
    std::os::unix::fs::symlink(outside.path(), root.path().join("link"))?;
    let handler = ArchiveHandler::new(&config_for(root.path())?)?;
    let outside_name = outside.path().to_string_lossy().into_owned();

    // the requested directory itself is a link
    let response = download(&handler, "/link", "application/tar").await?;
    let entries = tar_entries(&body_bytes(response).await?[..])?;
    let mut expected = BTreeMap::new();
    expected.insert("link".to_string(), Entry::Link(outside_name.clone()));
    assert_eq!(entries, expected);

    // a link below the requested directory
    let root_name = root
        .path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let response = download(&handler, "/", "application/tar").await?;
    let entries = tar_entries(&body_bytes(response).await?[..])?;
    assert_eq!(
        entries.get(&format!("{}/link", root_name)),
        Some(&Entry::Link(outside_name))
    );
    assert!(entries.keys().all(|name| !name.contains("secret")));

    // paths through the link resolve outside the root
    let parts = request_parts("/link/sub", &["application/tar"])?;
    assert!(handler.handle_request(&parts).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn percent_encoded_paths_are_decoded() -> Result<(), Error> {
    let root = photo_root()?;
    std::fs::create_dir(root.path().join("summer trip"))?;
    std::fs::write(root.path().join("summer trip").join("c.txt"), b"c")?;
    let handler = ArchiveHandler::new(&config_for(root.path())?)?;

    let response = download(&handler, "/summer%20trip", "application/zip").await?;
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"summer trip.zip\""
    );
    let entries = zip_entries(body_bytes(response).await?)?;
    assert_eq!(
        entries.get("summer trip/c.txt"),
        Some(&Entry::File(b"c".to_vec()))
    );
    Ok(())
}

#[tokio::test]
async fn requests_are_passed_on() -> Result<(), Error> {
    let root = photo_root()?;
    let handler = ArchiveHandler::new(&config_for(root.path())?)?;

    let cases: [(&str, &[&str]); 5] = [
        ("/photos", &[]),
        ("/photos", &["text/html"]),
        ("/photos", &["application/zip, text/html"]),
        ("/../../etc", &["application/zip"]),
        ("/photos/%2e%2e/%2e%2e/etc", &["application/tar"]),
    ];

    for (path, accept) in cases {
        let parts = request_parts(path, accept)?;
        assert!(
            handler.handle_request(&parts).await?.is_none(),
            "{} {:?} was not passed on",
            path,
            accept
        );
    }
    Ok(())
}

#[tokio::test]
async fn disabled_format_is_passed_on() -> Result<(), Error> {
    let root = photo_root()?;
    let mut config = config_for(root.path())?;
    config.formats = Some(vec!["zip".to_string()]);
    let handler = ArchiveHandler::new(&config)?;

    let parts = request_parts("/photos", &["application/tar"])?;
    assert!(handler.handle_request(&parts).await?.is_none());

    let parts = request_parts("/photos", &["application/zip"])?;
    assert!(handler.handle_request(&parts).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn missing_directory_is_not_found() -> Result<(), Error> {
    let root = photo_root()?;
    let handler = ArchiveHandler::new(&config_for(root.path())?)?;

    let parts = request_parts("/videos", &["application/zip"])?;
    let err = handler.handle_request(&parts).await.unwrap_err();
    let http_err = err.downcast_ref::<HttpError>().expect("http error");
    assert_eq!(http_err.code, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn unsupported_content_type_is_415() -> Result<(), Error> {
    let root = photo_root()?;
    let response = stream_directory_as_archive(
        root.path().join("photos"),
        "photos",
        "application/x-rar",
        ArchiveOptions::default(),
    )
    .await?;

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(response.headers().get(CONTENT_DISPOSITION).is_none());
    assert_eq!(
        body_bytes(response).await?,
        b"A file format with content type application/x-rar is not supported"
    );
    Ok(())
}

fn service_for(root: &Path) -> Result<ApiService, Error> {
    let config = config_for(root)?;
    let mut api_config = ApiConfig::new(config.root()?);
    api_config.add_handler(ArchiveHandler::new(&config)?);
    Ok(ApiService::new(
        "127.0.0.1:4711".parse()?,
        Arc::new(api_config),
    ))
}

#[tokio::test]
async fn server_serves_archives_and_files() -> Result<(), Error> {
    let root = photo_root()?;
    let mut service = service_for(root.path())?;

    let request = Request::builder()
        .uri("/photos")
        .header(ACCEPT, "application/zip")
        .body(Body::empty())?;
    let response = service.call(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(zip_entries(body_bytes(response).await?)?, expected_photos());

    // no archive requested, the static file fallback answers
    let request = Request::builder().uri("/photos/a.jpg").body(Body::empty())?;
    let response = service.call(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "image/jpeg");
    assert_eq!(body_bytes(response).await?, vec![b'a'; 10]);

    let request = Request::builder().uri("/photos").body(Body::empty())?;
    let response = service.call(request).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .uri("/videos")
        .header(ACCEPT, "application/tar")
        .body(Body::empty())?;
    let response = service.call(request).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .uri(format!("/{}", "x".repeat(4000)))
        .body(Body::empty())?;
    let response = service.call(request).await?;
    assert_eq!(response.status(), StatusCode::URI_TOO_LONG);

    Ok(())
}
