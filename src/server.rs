//! Server side: accept loop, listing producer and download producer.
//!
//! Each connection carries exactly one call. The client sends LIST_REQ or
//! DOWNLOAD_REQ, the server answers with a stream of ENTRY or CHUNK frames and
//! closes it with END, or aborts it with a single ERROR frame.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, StatusCode};
use crate::fs_enum::TreeWalk;
use crate::protocol::{frame, timeouts, DirEntry, DownloadRequest, CHUNK_SIZE};
use crate::protocol_core::{decode, encode, normalize_under_root, read_frame, write_frame};

pub struct Server {
    root: Arc<PathBuf>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Serve the tree under `root`, which must be an existing directory
    pub fn new(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            bail!("root is not a directory: {}", root.display());
        }
        let canonical = root
            .canonicalize()
            .with_context(|| format!("canonicalize root {}", root.display()))?;
        Ok(Self {
            root: Arc::new(canonical),
            tls: None,
        })
    }

    pub fn with_tls(mut self, config: rustls::ServerConfig) -> Self {
        self.tls = Some(TlsAcceptor::from(Arc::new(config)));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn bind(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {}", addr))?;
        self.serve(listener).await
    }

    /// Accept connections forever; each one is handled on its own task
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            root = %self.root.display(),
            tls = self.tls.is_some(),
            "server started"
        );
        loop {
            let (stream, peer) = listener.accept().await.context("accept")?;
            let _ = stream.set_nodelay(true);
            debug!(%peer, "connection");
            let root = Arc::clone(&self.root);
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let res = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(s) => handle_connection(&root, s).await,
                        Err(e) => Err(anyhow::Error::new(e).context("tls handshake")),
                    },
                    None => handle_connection(&root, stream).await,
                };
                if let Err(e) = res {
                    warn!(%peer, "connection error: {:#}", e);
                }
            });
        }
    }
}

/// Answer the single call carried by one connection
pub async fn handle_connection<S>(root: &Path, mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (typ, payload) = match timeout(
        Duration::from_millis(timeouts::REQUEST_MS),
        read_frame(&mut stream),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => bail!("request timeout ({} ms)", timeouts::REQUEST_MS),
    };
    match typ {
        frame::LIST_REQ => list_files(root, &mut stream).await?,
        frame::DOWNLOAD_REQ => match decode::<DownloadRequest>(&payload) {
            Ok(req) => download(root, &req, &mut stream).await?,
            Err(e) => {
                let err = RemoteError::new(StatusCode::Protocol, format!("{:#}", e));
                send_error(&mut stream, &err).await?
            }
        },
        other => {
            let err = RemoteError::new(
                StatusCode::Protocol,
                format!("unexpected request frame {}", frame::name(other)),
            );
            send_error(&mut stream, &err).await?
        }
    }
    stream.shutdown().await.ok();
    Ok(())
}

async fn send_error<S>(stream: &mut S, err: &RemoteError) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_frame(stream, frame::ERROR, &encode(err)?).await
}

/// Listing producer: one ENTRY per object under root, END when the walk is done.
/// The first walk error aborts the stream.
pub async fn list_files<S>(root: &Path, stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_entries(TreeWalk::new(root), stream).await
}

/// Drain a blocking entry source into ENTRY frames. An `Err` item becomes a
/// single ERROR frame and nothing follows it.
pub async fn send_entries<I, S>(entries: I, stream: &mut S) -> Result<()>
where
    I: Iterator<Item = Result<DirEntry>> + Send + 'static,
    S: AsyncWrite + Unpin,
{
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<DirEntry>>(64);
    let walker = tokio::task::spawn_blocking(move || {
        for item in entries {
            let failed = item.is_err();
            // Receiver gone means the connection died; stop walking
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });

    let mut sent = 0u64;
    while let Some(item) = rx.recv().await {
        match item {
            Ok(entry) => {
                write_frame(stream, frame::ENTRY, &encode(&entry)?).await?;
                sent += 1;
            }
            Err(e) => {
                warn!("listing aborted: {:#}", e);
                let err = RemoteError::new(StatusCode::Io, format!("{:#}", e));
                return send_error(stream, &err).await;
            }
        }
    }
    walker.await.context("walk task")?;
    write_frame(stream, frame::END, &[]).await?;
    debug!(entries = sent, "listing sent");
    Ok(())
}

/// Download producer: CHUNK frames of up to CHUNK_SIZE bytes, END at EOF
pub async fn download<S>(root: &Path, req: &DownloadRequest, stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let path = match normalize_under_root(root, &req.name) {
        Ok(p) => p,
        Err(e) => {
            warn!(path = %req.name, "download refused: {:#}", e);
            let err = RemoteError::new(StatusCode::InvalidArgument, format!("{}: {:#}", req.name, e));
            return send_error(stream, &err).await;
        }
    };
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %req.name, "open failed: {}", e);
            return send_error(stream, &RemoteError::from_io(&e, &req.name)).await;
        }
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(path = %req.name, "read failed: {}", e);
                return send_error(stream, &RemoteError::from_io(&e, &req.name)).await;
            }
        };
        write_frame(stream, frame::CHUNK, &buf[..n]).await?;
        total += n as u64;
    }
    write_frame(stream, frame::END, &[]).await?;
    debug!(path = %req.name, bytes = total, "download sent");
    Ok(())
}
