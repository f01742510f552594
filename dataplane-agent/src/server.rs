use std::{
    fs, io,
    os::unix::{fs::FileTypeExt, net::UnixStream as StdUnixStream},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    daemon::{Daemon, Request},
    error::BootstrapError,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of the request-serving side of the agent.
#[async_trait]
pub trait Service: Send + Sync {
    /// Serves until `stop` is called.
    async fn start(&self) -> Result<()>;

    /// Releases the listening resource. Safe to call more than once.
    fn stop(&self);
}

/// Control socket server. Requests and responses are JSON, one per line.
pub struct Server {
    path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
    daemon: Arc<Daemon>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Server {
    /// Binds the control socket. Must be called from within a tokio runtime.
    pub fn new(path: &Path, daemon: Daemon) -> Result<Self, BootstrapError> {
        let server_error = |source: io::Error| BootstrapError::Server {
            path: path.to_path_buf(),
            source,
        };

        clear_stale_socket(path).map_err(server_error)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(server_error)?;
        }
        let listener = UnixListener::bind(path).map_err(server_error)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            path: path.to_path_buf(),
            listener: Mutex::new(Some(listener)),
            daemon: Arc::new(daemon),
            shutdown,
            stopped: AtomicBool::new(false),
        })
    }
}

fn clear_stale_socket(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        ));
    }
    if StdUnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "socket is already served by another process",
        ));
    }
    debug!(socket = %path.display(), "removing stale socket");
    fs::remove_file(path)
}

#[async_trait]
impl Service for Server {
    async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .expect("listener mutex poisoned")
            .take()
            .ok_or_else(|| anyhow!("server on {} is not bound", self.path.display()))?;
        let mut shutdown = self.shutdown.subscribe();
        let stopped = *shutdown.borrow();
        if stopped {
            return Ok(());
        }

        info!(socket = %self.path.display(), "serving control socket");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let daemon = self.daemon.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, daemon).await {
                                warn!(error = %format!("{err:#}"), "control connection failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept error");
                        accept_backoff(&mut shutdown).await;
                    }
                },
            }
        }
        Ok(())
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        drop(
            self.listener
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(socket = %self.path.display(), error = %err, "failed to remove socket"),
        }
        info!(socket = %self.path.display(), "server stopped");
    }
}

/// Pause after a failed accept so a persistent error (fd exhaustion, say)
/// does not spin. Returns early on shutdown.
async fn accept_backoff(shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown.changed() => {}
        () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
    }
}

async fn handle_connection(stream: UnixStream, daemon: Arc<Daemon>) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await.context("failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = respond(&daemon, &line);
        let mut encoded = serde_json::to_vec(&response).context("failed to encode response")?;
        encoded.push(b'\n');
        write
            .write_all(&encoded)
            .await
            .context("failed to write response")?;
    }
    Ok(())
}

fn respond(daemon: &Daemon, line: &str) -> Value {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(err) => return json!({ "ok": false, "error": format!("invalid request: {err}") }),
    };
    match daemon.handle(request) {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(err) => json!({ "ok": false, "error": err.to_string() }),
    }
}
