use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{format_err, Error};
use clap::Parser;

use archiver_rest_server::{ApiConfig, RestServer};

use dir_archiver::archive::ArchiveHandler;
use dir_archiver::config::ArchiverConfig;

#[derive(Parser)]
#[command(name = "dir-archiver")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "DIR_ARCHIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to serve, overrides the configuration file
    #[arg(short, long, env = "DIR_ARCHIVER_ROOT")]
    root: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Never)
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ArchiverConfig::load(path)?,
        None => ArchiverConfig::default(),
    };
    if let Some(root) = cli.root {
        config.root = Some(root);
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    config.provision()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

async fn run(config: ArchiverConfig) -> Result<(), Error> {
    let mut api_config = ApiConfig::new(config.root()?);
    api_config.add_handler(ArchiveHandler::new(&config)?);
    if let Some(path) = &config.access_log {
        api_config.enable_access_log(path)?;
    }
    let rest_server = RestServer::new(api_config);

    archiver_rest_server::catch_shutdown_signal()?;

    let server = hyper::Server::try_bind(&config.listen)
        .map_err(|err| format_err!("unable to listen on {} - {}", config.listen, err))?
        .serve(rest_server);

    log::info!("serving {:?} on http://{}", config.root()?, server.local_addr());

    server
        .with_graceful_shutdown(archiver_rest_server::shutdown_future())
        .await
        .map_err(|err| format_err!("hyper finished with error: {}", err))?;

    log::info!("server shut down");

    Ok(())
}
