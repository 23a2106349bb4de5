use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

/// Certificate file expected inside a TLS directory (both sides)
pub const CERT_FILE: &str = "server.crt";
/// Private key file expected inside the server's TLS directory
pub const KEY_FILE: &str = "server.key";

fn cert_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join(CERT_FILE), dir.join(KEY_FILE))
}

/// Write a self-signed certificate/key pair into `dir` unless one is already there.
/// `names` become subject alternative names; IP literals become IP SANs.
pub fn generate_self_signed(dir: &Path, names: &[String]) -> Result<bool> {
    let (cert_path, key_path) = cert_paths(dir);
    if cert_path.exists() && key_path.exists() {
        return Ok(false);
    }
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let cert = rcgen::generate_simple_self_signed(names.to_vec())
        .context("generate self-signed cert")?;
    fs::write(&cert_path, cert.serialize_pem().context("serialize cert")?)
        .context("write cert pem")?;
    fs::write(&key_path, cert.serialize_private_key_pem()).context("write key pem")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))
            .context("restrict key permissions")?;
    }
    Ok(true)
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open {}", path.display()))?,
    );
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.context("read cert")?);
    }
    if out.is_empty() {
        return Err(anyhow!("no certificate found in {}", path.display()));
    }
    Ok(out)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut rd)
        .context("read key")?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

/// Server TLS configuration from `dir/server.crt` and `dir/server.key`
pub fn load_server_config(dir: &Path) -> Result<rustls::ServerConfig> {
    let (cert_path, key_path) = cert_paths(dir);
    let certs = read_certs(&cert_path)?;
    let key = read_key(&key_path)?;
    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(cfg)
}

/// Client TLS configuration trusting exactly the certificate(s) in `dir/server.crt`
pub fn load_client_config(dir: &Path) -> Result<rustls::ClientConfig> {
    let (cert_path, _) = cert_paths(dir);
    let mut roots = rustls::RootCertStore::empty();
    for cert in read_certs(&cert_path)? {
        roots.add(cert).context("add trusted certificate")?;
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name {:?}: {}", host, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_then_load() {
        let tmp = TempDir::new().unwrap();
        let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        assert!(generate_self_signed(tmp.path(), &names).unwrap());
        // Existing pair is kept
        assert!(!generate_self_signed(tmp.path(), &names).unwrap());

        load_server_config(tmp.path()).unwrap();
        load_client_config(tmp.path()).unwrap();
    }

    #[test]
    fn test_missing_files_error() {
        let tmp = TempDir::new().unwrap();
        assert!(load_server_config(tmp.path()).is_err());
        assert!(load_client_config(tmp.path()).is_err());
    }

    #[test]
    fn test_server_name_for() {
        assert!(matches!(server_name_for("127.0.0.1").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name_for("[::1]").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name_for("files.local").unwrap(), ServerName::DnsName(_)));
        assert!(server_name_for("bad name!").is_err());
    }
}
