//! Shared protocol constants and message shapes for the ft framed transport

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"FTX1";
pub const VERSION: u16 = 1;

/// Size of the frame header: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub const HEADER_LEN: usize = 11;

// Maximum frame payload size (64MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Bytes per CHUNK frame sent by the download producer
pub const CHUNK_SIZE: usize = 4096 * 1000;

pub const DEFAULT_PORT: u16 = 11111;

/// Worker pool size used when the caller does not pick one
pub const DEFAULT_WORKERS: usize = 5;

/// Directory flag carried in the top bit of `DirEntry::mode`
pub const MODE_DIR: u32 = 1 << 31;

/// Permission bits carried in the low bits of `DirEntry::mode`
pub const MODE_PERM: u32 = 0o777;

// Frame type IDs. One request frame per connection, then a stream of
// response frames terminated by END or ERROR.
pub mod frame {
    pub const LIST_REQ: u8 = 1;
    pub const DOWNLOAD_REQ: u8 = 2;
    pub const ENTRY: u8 = 3;
    pub const CHUNK: u8 = 4;
    pub const END: u8 = 5;
    pub const ERROR: u8 = 6;

    pub fn name(t: u8) -> &'static str {
        match t {
            LIST_REQ => "LIST_REQ",
            DOWNLOAD_REQ => "DOWNLOAD_REQ",
            ENTRY => "ENTRY",
            CHUNK => "CHUNK",
            END => "END",
            ERROR => "ERROR",
            _ => "UNKNOWN",
        }
    }
}

pub mod timeouts {
    // Connection establishment timeout (ms), TLS handshake included
    pub const CONNECT_MS: u64 = 5000;

    // Deadline for the single request frame a server expects per connection (ms)
    pub const REQUEST_MS: u64 = 5000;
}

/// Seconds and nanoseconds since the Unix epoch
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp {
                seconds: d.as_secs() as i64,
                nanos: d.subsec_nanos() as i32,
            },
            Err(e) => {
                // Before the epoch: keep nanos non-negative
                let d = e.duration();
                let mut seconds = -(d.as_secs() as i64);
                let mut nanos = d.subsec_nanos() as i32;
                if nanos > 0 {
                    seconds -= 1;
                    nanos = 1_000_000_000 - nanos;
                }
                Timestamp { seconds, nanos }
            }
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        let nanos = self.nanos.clamp(0, 999_999_999) as u32;
        if self.seconds >= 0 {
            UNIX_EPOCH + Duration::new(self.seconds as u64, nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.seconds.unsigned_abs()) + Duration::from_nanos(nanos as u64)
        }
    }
}

/// One filesystem object reported by the listing stream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Slash-separated path relative to the served root
    pub name: String,
    pub size: i64,
    pub mode: u32,
    pub mod_time: Timestamp,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & MODE_DIR != 0
    }

    pub fn permissions(&self) -> u32 {
        self.mode & MODE_PERM
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub name: String,
}

/// Opaque payload of one CHUNK frame; ordering is arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadChunk {
    pub data: Vec<u8>,
}
