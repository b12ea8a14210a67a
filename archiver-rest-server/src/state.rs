use std::sync::Mutex;

use anyhow::Error;
use futures::future::{self, FutureExt};
use lazy_static::lazy_static;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

#[derive(PartialEq, Copy, Clone, Debug)]
enum ServerMode {
    Normal,
    Shutdown,
}

struct ServerState {
    mode: ServerMode,
    shutdown_sender: watch::Sender<bool>,
    // keeps the channel open, so sending never fails
    shutdown_receiver: watch::Receiver<bool>,
}

lazy_static! {
    static ref SERVER_STATE: Mutex<ServerState> = {
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        Mutex::new(ServerState {
            mode: ServerMode::Normal,
            shutdown_sender,
            shutdown_receiver,
        })
    };
}

/// Listen to ``SIGINT`` and ``SIGTERM`` for server shutdown
///
/// This calls [request_shutdown] when receiving one of the signals.
pub fn catch_shutdown_signal() -> Result<(), Error> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let future = async move {
        loop {
            let name = tokio::select! {
                res = interrupt.recv() => res.map(|_| "SIGINT"),
                res = terminate.recv() => res.map(|_| "SIGTERM"),
            };
            match name {
                Some(name) => {
                    log::info!("got shutdown request ({})", name);
                    request_shutdown();
                }
                None => break,
            }
        }
    }
    .boxed();

    let task = future::select(future, shutdown_future().boxed());
    tokio::spawn(task.map(|_| ()));

    Ok(())
}

/// Switch the server into shutdown mode and notify all [shutdown_future]s.
pub fn request_shutdown() {
    let mut data = match SERVER_STATE.lock() {
        Ok(data) => data,
        Err(poisoned) => poisoned.into_inner(),
    };

    if data.mode == ServerMode::Shutdown {
        return;
    }

    log::info!("request_shutdown");
    data.mode = ServerMode::Shutdown;
    let _ = data.shutdown_sender.send(true);
}

/// Future to signal server shutdown
pub async fn shutdown_future() {
    let mut receiver = match SERVER_STATE.lock() {
        Ok(data) => data.shutdown_receiver.clone(),
        Err(poisoned) => poisoned.into_inner().shutdown_receiver.clone(),
    };

    while !*receiver.borrow_and_update() {
        if receiver.changed().await.is_err() {
            break;
        }
    }
}
