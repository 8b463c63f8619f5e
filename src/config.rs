//! Relay daemon settings, stored as TOML next to the TLS material

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::protocol::{timeouts, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT, MIN_FRAME_SIZE_LIMIT};
use crate::tls;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub debug_mode: bool,
    pub max_frame_bytes: usize,
    pub handshake_timeout_secs: u64,
    pub negotiation_timeout_secs: u64,
    pub transfer_idle_timeout_secs: u64,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub credentials_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let (cert_path, key_path) = tls::default_server_cert_paths();
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            debug_mode: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_secs: timeouts::HANDSHAKE_SECS,
            negotiation_timeout_secs: timeouts::NEGOTIATION_SECS,
            transfer_idle_timeout_secs: timeouts::TRANSFER_IDLE_SECS,
            cert_path,
            key_path,
            credentials_path: tls::config_dir().join("credentials").join("users_creds.json"),
        }
    }
}

pub fn default_path() -> PathBuf {
    tls::config_dir().join("faidsd.toml")
}

impl Config {
    /// Read and validate `path`. A missing file yields the defaults, which are
    /// written out so the operator has something to edit.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            let cfg = Config::default();
            match cfg.save(path) {
                Ok(()) => info!(path = %path.display(), "wrote default configuration"),
                Err(e) => warn!(path = %path.display(), error = %e, "could not write default configuration"),
            }
            return Ok(cfg);
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Config = toml::from_str(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let data = toml::to_string_pretty(self).context("serialize config")?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }

    /// Command-line values win over the file
    pub fn override_with(&mut self, bind: Option<&str>, port: Option<u16>, debug: bool) {
        if let Some(b) = bind {
            self.bind_address = b.to_string();
        }
        if let Some(p) = port {
            self.port = p;
        }
        self.debug_mode |= debug;
    }

    pub fn validate(&self) -> Result<()> {
        validate_bind_address(&self.bind_address)?;
        if self.port == 0 {
            bail!("port must be between 1 and 65535");
        }
        for (name, secs) in [
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("negotiation_timeout_secs", self.negotiation_timeout_secs),
            ("transfer_idle_timeout_secs", self.transfer_idle_timeout_secs),
        ] {
            if secs == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.max_frame_bytes < MIN_FRAME_SIZE_LIMIT {
            bail!("max_frame_bytes must be at least {MIN_FRAME_SIZE_LIMIT}");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Dotted IPv4 with every octet in 0..=254
pub fn validate_bind_address(addr: &str) -> Result<()> {
    let octets: Vec<&str> = addr.split('.').collect();
    if octets.len() != 4 {
        bail!("bind address {addr:?} is not a dotted IPv4 address");
    }
    for o in octets {
        if o.is_empty() || o.len() > 3 || !o.bytes().all(|b| b.is_ascii_digit()) {
            bail!("bind address {addr:?} has a non-numeric octet {o:?}");
        }
        let v: u16 = o.parse().with_context(|| format!("octet {o:?}"))?;
        if v > 254 {
            bail!("bind address {addr:?} has octet {v} outside 0..=254");
        }
    }
    Ok(())
}
