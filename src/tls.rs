use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::{info, warn};

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") { return PathBuf::from(appdata).join("FaIDS"); }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("faids");
    }
    PathBuf::from(".faids")
}

pub fn default_server_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir().join("certificates");
    (dir.join("cert.pem"), dir.join("key.pem"))
}

/// Write a fresh self-signed pair to `cert_path` / `key_path`
pub fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    for p in [cert_path, key_path] {
        if let Some(dir) = p.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
    }
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "faids.local".to_string()])
        .context("generate self-signed cert")?;
    fs::write(cert_path, cert.serialize_pem().context("serialize cert")?)
        .context("write cert pem")?;
    fs::write(key_path, cert.serialize_private_key_pem())
        .context("write key pem")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600)).context("restrict key permissions")?;
    }
    Ok(())
}

fn load_certs(cert_path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(fs::File::open(cert_path).context("open cert")?);
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.context("read cert")?);
    }
    if out.is_empty() {
        return Err(anyhow!("no certificate found in {}", cert_path.display()));
    }
    Ok(out)
}

fn load_key(key_path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(fs::File::open(key_path).context("open key")?);
    let pkcs8: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut rd).collect();
    if let Some(k) = pkcs8.into_iter().next() {
        return Ok(PrivateKeyDer::from(k.context("pkcs8 key")?));
    }
    let mut rd2 = BufReader::new(fs::File::open(key_path).context("reopen key")?);
    let rsa: Vec<_> = rustls_pemfile::rsa_private_keys(&mut rd2).collect();
    let k = rsa.into_iter().next().context("no PKCS#8 or RSA key found")??;
    Ok(PrivateKeyDer::from(k))
}

/// Server TLS context from a PEM pair, generating and persisting a
/// self-signed pair first when either file is missing.
pub fn load_or_generate_server_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    if !cert_path.exists() || !key_path.exists() {
        warn!(cert = %cert_path.display(), "certificate missing, generating a self-signed one");
        generate_self_signed(cert_path, key_path)?;
    }

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    info!(cert = %cert_path.display(), "loaded TLS certificate");

    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(cfg)
}

/// How a client decides whether to trust the relay's certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerTrust {
    /// Encrypt only; identity comes from username/password, not the certificate
    AcceptAny,
    /// Pin the first certificate seen for host:port in a known_hosts file
    Tofu { known_hosts: PathBuf },
}

pub fn known_hosts_path() -> PathBuf {
    config_dir().join("known_hosts")
}

fn read_known_hosts(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(f) = fs::File::open(path) {
        for line in BufReader::new(f).lines().map_while(|l| l.ok()) {
            if line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    map
}

fn write_known_hosts(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    if let Some(p) = path.parent() {
        fs::create_dir_all(p).context("create known_hosts parent dir")?;
    }

    // Write beside the target, then rename over it
    let temp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&temp_path).context("create temp known_hosts")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = f.metadata()?.permissions();
            perms.set_mode(0o600);
            f.set_permissions(perms)?;
        }
        writeln!(f, "# FaIDS known_hosts - format version 1")?;
        for (k, v) in map.iter() {
            writeln!(f, "{}={}", k, v)?;
        }
        f.flush()?;
        f.sync_all()?;
    }
    fs::rename(&temp_path, path).context("replace known_hosts")?;
    Ok(())
}

pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    let digest = h.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

fn any_signature_valid() -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
}

fn verify_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::ED25519,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
    ]
}

#[derive(Debug)]
struct AcceptAnyVerifier;

impl ServerCertVerifier for AcceptAnyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        any_signature_valid()
    }
    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        any_signature_valid()
    }
    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        verify_schemes()
    }
}

#[derive(Debug)]
struct TofuVerifier {
    hostport: String,
    known_path: PathBuf,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = fingerprint(end_entity);
        let mut map = read_known_hosts(&self.known_path);
        match map.get(&self.hostport) {
            Some(saved) if saved == &fp => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::General(
                "relay certificate changed; refusing connection (TOFU)".into(),
            )),
            None => {
                map.insert(self.hostport.clone(), fp);
                if let Err(e) = write_known_hosts(&self.known_path, &map) {
                    warn!(error = %e, "could not persist known_hosts");
                }
                Ok(ServerCertVerified::assertion())
            }
        }
    }
    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        any_signature_valid()
    }
    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        any_signature_valid()
    }
    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        verify_schemes()
    }
}

pub fn build_client_config(host: &str, port: u16, trust: &ServerTrust) -> rustls::ClientConfig {
    let verifier: Arc<dyn ServerCertVerifier> = match trust {
        ServerTrust::AcceptAny => Arc::new(AcceptAnyVerifier),
        ServerTrust::Tofu { known_hosts } => Arc::new(TofuVerifier {
            hostport: format!("{}:{}", host, port),
            known_path: known_hosts.clone(),
        }),
    };
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth()
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name {host}: {e}"))
}
