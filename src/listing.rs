//! CSV rendering of a remote listing (`ft list`)

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat, TimeZone};
use std::io::Write;

use crate::client::RemoteStream;
use crate::protocol::{DirEntry, MODE_DIR, MODE_PERM};

pub const HEADER: &str = "name,size,mode,modtime";

/// How the mode column is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeFormat {
    /// `drwxr-xr-x` / `-rw-r--r--`
    Symbolic,
    /// Raw mode value in octal, directory flag included
    Octal,
}

impl Default for ModeFormat {
    fn default() -> Self {
        if cfg!(unix) {
            ModeFormat::Symbolic
        } else {
            ModeFormat::Octal
        }
    }
}

pub fn mode_string(mode: u32) -> String {
    const RWX: &[u8; 9] = b"rwxrwxrwx";
    let mut s = String::with_capacity(10);
    s.push(if mode & MODE_DIR != 0 { 'd' } else { '-' });
    let perm = mode & MODE_PERM;
    for (i, c) in RWX.iter().enumerate() {
        if perm & (1 << (8 - i)) != 0 {
            s.push(*c as char);
        } else {
            s.push('-');
        }
    }
    s
}

fn quoted(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

fn modtime(seconds: i64) -> String {
    match Local.timestamp_opt(seconds, 0).earliest() {
        Some(t) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => seconds.to_string(),
    }
}

/// One CSV line (without newline), every field quoted
pub fn format_row(entry: &DirEntry, format: ModeFormat) -> String {
    let mode = match format {
        ModeFormat::Symbolic => mode_string(entry.mode),
        ModeFormat::Octal => format!("{:o}", entry.mode),
    };
    [
        quoted(&entry.name),
        quoted(&entry.size.to_string()),
        quoted(&mode),
        quoted(&modtime(entry.mod_time.seconds)),
    ]
    .join(",")
}

/// Write the header and one row per streamed entry; returns the row count
pub async fn write_listing<W: Write>(
    listing: &mut RemoteStream<DirEntry>,
    out: &mut W,
    format: ModeFormat,
) -> Result<u64> {
    writeln!(out, "{}", HEADER).context("write header")?;
    let mut rows = 0u64;
    while let Some(entry) = listing.message().await? {
        writeln!(out, "{}", format_row(&entry, format)).context("write row")?;
        rows += 1;
    }
    out.flush().context("flush listing")?;
    Ok(rows)
}
