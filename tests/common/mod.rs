#![allow(dead_code)]

use anyhow::Result;
use ft::progress::ProgressObserver;
use ft::server::Server;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = (path.as_os_str().len() % 251) as u8;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

/// Start a plaintext server on an ephemeral loopback port
pub async fn start_server(root: &Path) -> Result<(String, JoinHandle<()>)> {
    start_with(Server::new(root)?).await
}

pub async fn start_with(server: Server) -> Result<(String, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let task = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    Ok((addr, task))
}

/// Counts observer callbacks per name
#[derive(Default)]
pub struct RecordingProgress {
    pub starts: Mutex<HashMap<String, u32>>,
    pub ends: Mutex<HashMap<String, u32>>,
    pub bytes: Mutex<HashMap<String, u64>>,
    /// Names whose job ended unsuccessfully
    pub failed: Mutex<Vec<String>>,
}

impl ProgressObserver for RecordingProgress {
    fn on_job_start(&self, name: &str, _total: u64) {
        *self.starts.lock().entry(name.to_string()).or_default() += 1;
    }
    fn on_bytes(&self, name: &str, delta: u64) {
        *self.bytes.lock().entry(name.to_string()).or_default() += delta;
    }
    fn on_job_end(&self, name: &str, ok: bool) {
        *self.ends.lock().entry(name.to_string()).or_default() += 1;
        if !ok {
            self.failed.lock().push(name.to_string());
        }
    }
}
