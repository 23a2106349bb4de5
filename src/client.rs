//! Client side of the two remote calls.
//!
//! A `Client` is cheap to clone and holds no connection; every call dials its
//! own connection, so workers can issue calls concurrently without sharing
//! any mutable state.

use anyhow::{anyhow, Context, Result};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use rustls::pki_types::ServerName;

use crate::error::{RemoteError, StatusCode};
use crate::protocol::{frame, timeouts, DirEntry, DownloadChunk, DownloadRequest};
use crate::protocol_core::{decode, encode, read_frame, write_frame};

/// Byte stream a call runs over (plain TCP or TLS)
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// Message type carried by one kind of response stream
pub trait StreamItem: Sized {
    const FRAME: u8;
    fn from_payload(payload: Vec<u8>) -> Result<Self>;
}

impl StreamItem for DirEntry {
    const FRAME: u8 = frame::ENTRY;
    fn from_payload(payload: Vec<u8>) -> Result<Self> {
        decode(&payload)
    }
}

impl StreamItem for DownloadChunk {
    const FRAME: u8 = frame::CHUNK;
    fn from_payload(payload: Vec<u8>) -> Result<Self> {
        Ok(DownloadChunk { data: payload })
    }
}

/// Lazy, finite, non-restartable sequence of server messages.
///
/// `message()` suspends until the next element arrives. It returns `Ok(None)`
/// once the server closed the stream cleanly, and an error (usually a
/// `RemoteError`) when the stream was aborted; after either, the connection is
/// gone and every later call returns `Ok(None)`.
pub struct RemoteStream<T> {
    conn: Option<Box<dyn Connection>>,
    cancel: CancellationToken,
    _item: PhantomData<fn() -> T>,
}

impl<T: StreamItem> RemoteStream<T> {
    pub async fn message(&mut self) -> Result<Option<T>> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };
        let next = tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow::Error::new(RemoteError::cancelled())),
            res = read_frame(conn) => res,
        };
        let (typ, payload) = match next {
            Ok(f) => f,
            Err(e) => {
                self.conn = None;
                if e.is::<RemoteError>() {
                    return Err(e);
                }
                return Err(anyhow::Error::new(RemoteError::new(
                    StatusCode::Protocol,
                    format!("stream broken: {:#}", e),
                )));
            }
        };
        match typ {
            t if t == T::FRAME => match T::from_payload(payload) {
                Ok(item) => Ok(Some(item)),
                Err(e) => {
                    self.conn = None;
                    Err(RemoteError::new(StatusCode::Protocol, format!("{:#}", e)).into())
                }
            },
            frame::END => {
                self.conn = None;
                Ok(None)
            }
            frame::ERROR => {
                self.conn = None;
                let err: RemoteError = decode(&payload).unwrap_or_else(|e| {
                    RemoteError::new(StatusCode::Protocol, format!("undecodable ERROR frame: {:#}", e))
                });
                Err(err.into())
            }
            other => {
                self.conn = None;
                Err(RemoteError::new(
                    StatusCode::Protocol,
                    format!("unexpected frame {}", frame::name(other)),
                )
                .into())
            }
        }
    }

    /// Drain the rest of the stream into a vector
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.message().await? {
            out.push(item);
        }
        Ok(out)
    }
}

#[derive(Clone)]
struct TlsTarget {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

#[derive(Clone)]
pub struct Client {
    addr: String,
    tls: Option<TlsTarget>,
    cancel: CancellationToken,
}

impl Client {
    /// Plaintext client for `addr` (host:port). No connection is made yet.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Encrypt every call; the server name is derived from the address host
    pub fn with_tls(mut self, config: rustls::ClientConfig) -> Result<Self> {
        let host = host_of(&self.addr);
        let host = if host.is_empty() { "localhost" } else { host };
        self.tls = Some(TlsTarget {
            connector: TlsConnector::from(Arc::new(config)),
            server_name: crate::tls::server_name_for(host)?,
        });
        Ok(self)
    }

    /// Calls made through this client (and its clones) observe `token`
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Dial once (TCP and, if configured, TLS) to fail fast on a bad address
    pub async fn check_connection(&self) -> Result<()> {
        self.dial().await.map(drop)
    }

    async fn dial(&self) -> Result<Box<dyn Connection>> {
        if self.cancel.is_cancelled() {
            return Err(RemoteError::cancelled().into());
        }
        let connect = async {
            let tcp = TcpStream::connect(&self.addr)
                .await
                .with_context(|| format!("connect {}", self.addr))?;
            let _ = tcp.set_nodelay(true);
            let conn: Box<dyn Connection> = match &self.tls {
                Some(t) => Box::new(
                    t.connector
                        .connect(t.server_name.clone(), tcp)
                        .await
                        .with_context(|| format!("tls handshake with {}", self.addr))?,
                ),
                None => Box::new(tcp),
            };
            Ok::<_, anyhow::Error>(conn)
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow::Error::new(RemoteError::cancelled())),
            res = timeout(Duration::from_millis(timeouts::CONNECT_MS), connect) => match res {
                Ok(conn) => conn,
                Err(_) => Err(anyhow!("connect {}: timeout ({} ms)", self.addr, timeouts::CONNECT_MS)),
            },
        }
    }

    async fn call<T: StreamItem>(&self, req_frame: u8, payload: &[u8]) -> Result<RemoteStream<T>> {
        let mut conn = self.dial().await?;
        write_frame(&mut conn, req_frame, payload)
            .await
            .context("send request")?;
        Ok(RemoteStream {
            conn: Some(conn),
            cancel: self.cancel.clone(),
            _item: PhantomData,
        })
    }

    /// `ListFiles()`: every object under the server root, parents first
    pub async fn list_files(&self) -> Result<RemoteStream<DirEntry>> {
        self.call(frame::LIST_REQ, &[]).await
    }

    /// `Download(name)`: the file's bytes in arrival order
    pub async fn download(&self, name: &str) -> Result<RemoteStream<DownloadChunk>> {
        let req = DownloadRequest {
            name: name.to_string(),
        };
        self.call(frame::DOWNLOAD_REQ, &encode(&req)?).await
    }
}

/// Host part of `host:port`, `[v6]:port` or a bare host
fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((h, _)) => h,
        None => addr,
    }
}
