//! Shared protocol logic for the server and client halves
//!
//! Frame header handling, async frame I/O over any byte stream (plain TCP or
//! TLS), message encoding, and the path rules both sides apply to entry names.

use anyhow::{anyhow, bail, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{HEADER_LEN, MAGIC, MAX_FRAME_SIZE, VERSION};

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!("frame payload too large: {} bytes (max: {})", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        bail!("invalid magic in frame header");
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        bail!("protocol version mismatch: got {}, expected {}", version, VERSION);
    }
    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    Ok((frame_type, payload_len))
}

pub async fn write_frame<S>(stream: &mut S, t: u8, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    validate_frame_size(payload.len())?;
    let hdr = build_frame_header(t, payload.len() as u32);
    stream.write_all(&hdr).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<S>(stream: &mut S) -> Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut hdr = [0u8; HEADER_LEN];
    stream.read_exact(&mut hdr).await.context("read frame header")?;
    let (typ, len_u32) = parse_frame_header(&hdr)?;
    let len = len_u32 as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await.context("read frame payload")?;
    }
    Ok((typ, payload))
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).context("encode message")
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).context("decode message")
}

/// Turn a slash-separated entry name into a relative path.
/// Rejects empty names, NUL bytes, absolute paths and parent components;
/// "." segments and repeated slashes are dropped.
pub fn relative_path(name: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if name.contains('\0') {
        bail!("path contains NUL byte");
    }
    let mut safe = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                // On Windows, reject components with ':' (ADS defense)
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("empty path");
    }
    Ok(safe)
}

/// Resolve an entry name to a path that stays under `root` after symlinks
/// are resolved. `root` must already be canonical.
pub fn normalize_under_root(root: &Path, name: &str) -> Result<PathBuf> {
    let joined = root.join(relative_path(name)?);

    // For existing paths, canonicalize to resolve symlinks.
    // For new files, canonicalize parent then append filename.
    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", joined, e))?
    } else {
        match (joined.parent(), joined.file_name()) {
            (Some(parent), Some(file_name)) if parent.exists() => parent
                .canonicalize()
                .map_err(|e| anyhow!("failed to canonicalize parent {:?}: {}", parent, e))?
                .join(file_name),
            _ => joined,
        }
    };

    if !final_path.starts_with(root) {
        bail!("path {:?} escapes root {:?}", name, root);
    }
    Ok(final_path)
}

/// Slash-separated form of a root-relative path
pub fn slash_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{frame, DirEntry, Timestamp};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_frame_header_round_trip() {
        let header = build_frame_header(frame::CHUNK, 12345);
        let (t, len) = parse_frame_header(&header).unwrap();
        assert_eq!(t, frame::CHUNK);
        assert_eq!(len, 12345);
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = build_frame_header(frame::END, 0);
        header[0..4].copy_from_slice(b"WRNG");
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_parse_frame_header_wrong_version() {
        let mut header = build_frame_header(frame::END, 0);
        header[4..6].copy_from_slice(&999u16.to_le_bytes());
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_validate_frame_size_edge_cases() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let entry = DirEntry {
            name: "sub/b.txt".into(),
            size: 5,
            mode: 0o644,
            mod_time: Timestamp { seconds: 1, nanos: 2 },
        };
        write_frame(&mut a, frame::ENTRY, &encode(&entry).unwrap()).await.unwrap();
        write_frame(&mut a, frame::END, &[]).await.unwrap();

        let (t, pl) = read_frame(&mut b).await.unwrap();
        assert_eq!(t, frame::ENTRY);
        assert_eq!(decode::<DirEntry>(&pl).unwrap(), entry);
        let (t, pl) = read_frame(&mut b).await.unwrap();
        assert_eq!(t, frame::END);
        assert!(pl.is_empty());
    }

    #[tokio::test]
    async fn test_read_frame_truncated_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hdr = build_frame_header(frame::CHUNK, 100);
        a.write_all(&hdr).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn test_relative_path_rules() {
        assert_eq!(relative_path("sub/b.txt").unwrap(), Path::new("sub").join("b.txt"));
        assert_eq!(relative_path("./sub//b.txt").unwrap(), Path::new("sub").join("b.txt"));
        assert!(relative_path("../etc/passwd").is_err());
        assert!(relative_path("sub/../../x").is_err());
        assert!(relative_path("/etc/passwd").is_err());
        assert!(relative_path("file\0.txt").is_err());
        assert!(relative_path("").is_err());
        assert!(relative_path(".").is_err());
    }

    #[test]
    fn test_normalize_under_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("subdir")).unwrap();
        fs::write(root.join("subdir/file.txt"), "test").unwrap();

        let p = normalize_under_root(&root, "subdir/file.txt").unwrap();
        assert_eq!(p, root.join("subdir/file.txt"));

        let p = normalize_under_root(&root, "subdir/new.txt").unwrap();
        assert!(p.starts_with(&root));

        assert!(normalize_under_root(&root, "../outside").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_normalize_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), "x").unwrap();
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), root.join("link")).unwrap();
        assert!(normalize_under_root(&root, "link").is_err());
    }

    #[test]
    fn test_slash_name() {
        let rel = Path::new("a").join("b").join("c.txt");
        assert_eq!(slash_name(&rel), "a/b/c.txt");
    }
}
