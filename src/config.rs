use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::rtc::DEFAULT_ICE_SERVERS;
use crate::sender::{SenderConfig, DEFAULT_CHUNK_SIZE, DEFAULT_LOW_WATER_MARK};
use crate::signaling::SignalingSettings;

const MIN_CHUNK_SIZE: usize = 1024;
const MAX_CHUNK_SIZE: usize = 256 * 1024;

pub const ENV_CHUNK_SIZE: &str = "MESHDROP_CHUNK_SIZE";
pub const ENV_LOW_WATER_MARK: &str = "MESHDROP_LOW_WATER_MARK";
pub const ENV_HEARTBEAT_INTERVAL: &str = "MESHDROP_HEARTBEAT_INTERVAL";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub relay_url: String,
    #[serde(default = "random_client_id")]
    pub client_id: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub http_addr: Option<String>,
    #[serde(default)]
    pub http_token: Option<String>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub signaling: SignalingTimings,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub low_water_mark: usize,
    pub max_send_retries: u32,
    pub retry_base_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            max_send_retries: 3,
            retry_base_ms: 100,
            heartbeat_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignalingTimings {
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub keepalive_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for SignalingTimings {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            keepalive_interval_ms: 15_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Values supplied on the command line; each one wins over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub relay_url: Option<String>,
    pub client_id: Option<String>,
    pub download_dir: Option<PathBuf>,
    pub http_addr: Option<String>,
    pub http_token: Option<String>,
}

fn random_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// A config with defaults for everything but the relay.
    pub fn with_relay(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            client_id: random_client_id(),
            download_dir: default_download_dir(),
            ice_servers: default_ice_servers(),
            http_addr: None,
            http_token: None,
            log_path: None,
            transfer: TransferSettings::default(),
            signaling: SignalingTimings::default(),
            config_path: None,
        }
    }

    /// Load from `path` if given, apply CLI and environment overrides, then
    /// normalize and validate.
    pub fn resolve(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut cfg = match (path, overrides.relay_url.as_deref()) {
            (Some(p), _) => Config::load(p)?,
            (None, Some(relay)) => Config::with_relay(relay),
            (None, None) => anyhow::bail!("a relay url is required (--relay or config file)"),
        };
        cfg.apply_overrides(overrides);
        cfg.apply_env_with(|key| std::env::var(key).ok())?;
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, o: Overrides) {
        if let Some(v) = o.relay_url {
            self.relay_url = v;
        }
        if let Some(v) = o.client_id {
            self.client_id = v;
        }
        if let Some(v) = o.download_dir {
            self.download_dir = v;
        }
        if let Some(v) = o.http_addr {
            self.http_addr = Some(v);
        }
        if let Some(v) = o.http_token {
            self.http_token = Some(v);
        }
    }

    pub fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = get(ENV_CHUNK_SIZE) {
            self.transfer.chunk_size = parse_bytes(&raw)
                .with_context(|| format!("{ENV_CHUNK_SIZE}: invalid size {raw:?}"))?;
        }
        if let Some(raw) = get(ENV_LOW_WATER_MARK) {
            self.transfer.low_water_mark = parse_bytes(&raw)
                .with_context(|| format!("{ENV_LOW_WATER_MARK}: invalid size {raw:?}"))?;
        }
        if let Some(raw) = get(ENV_HEARTBEAT_INTERVAL) {
            let d = parse_duration(&raw)
                .with_context(|| format!("{ENV_HEARTBEAT_INTERVAL}: invalid duration {raw:?}"))?;
            self.transfer.heartbeat_interval_ms = d.as_millis() as u64;
        }
        Ok(())
    }

    fn normalize(&mut self) -> Result<()> {
        self.relay_url = self.relay_url.trim().trim_end_matches('/').to_string();
        self.client_id = self.client_id.trim().to_string();
        if self.download_dir.is_relative() {
            let cwd = std::env::current_dir().context("resolve current directory")?;
            self.download_dir = cwd.join(&self.download_dir);
        }
        self.ice_servers.retain(|s| !s.trim().is_empty());
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_relay_url(&self.relay_url).context("relay_url")?;
        if self.client_id.is_empty() {
            anyhow::bail!("client_id must not be empty");
        }
        let t = &self.transfer;
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&t.chunk_size) {
            anyhow::bail!(
                "chunk_size {} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]",
                t.chunk_size
            );
        }
        if t.low_water_mark < t.chunk_size {
            anyhow::bail!(
                "low_water_mark {} is below chunk_size {}",
                t.low_water_mark,
                t.chunk_size
            );
        }
        if t.heartbeat_interval_ms == 0 || self.signaling.keepalive_interval_ms == 0 {
            anyhow::bail!("heartbeat and keep-alive intervals must be positive");
        }
        Ok(())
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            chunk_size: self.transfer.chunk_size,
            low_water_mark: self.transfer.low_water_mark,
            max_retries: self.transfer.max_send_retries,
            retry_base: Duration::from_millis(self.transfer.retry_base_ms),
        }
    }

    pub fn signaling_settings(&self) -> SignalingSettings {
        SignalingSettings {
            reconnect_base: Duration::from_millis(self.signaling.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.signaling.reconnect_max_ms),
            keepalive_interval: Duration::from_millis(self.signaling.keepalive_interval_ms),
            connect_timeout: Duration::from_millis(self.signaling.connect_timeout_ms.max(1)),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.transfer.heartbeat_interval_ms)
    }

    /// `ws(s)://<host>/api/ws/session/<session>?client_id=<client>`
    pub fn signaling_url(&self, session_id: &str) -> Result<Url> {
        validate_session_id(session_id)?;
        signaling_url(&self.relay_url, session_id, &self.client_id)
    }

    pub fn log_file(&self) -> PathBuf {
        if let Some(p) = &self.log_path {
            return p.clone();
        }
        match self.config_path.as_ref().and_then(|p| p.parent()) {
            Some(dir) => dir.join("logs").join("meshdrop.log"),
            None => self
                .download_dir
                .join(".meshdrop")
                .join("logs")
                .join("meshdrop.log"),
        }
    }
}

pub fn signaling_url(relay: &str, session_id: &str, client_id: &str) -> Result<Url> {
    let mut url = Url::parse(relay).with_context(|| format!("parse relay url {relay}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => anyhow::bail!("unsupported relay scheme {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot switch relay scheme to {scheme}"))?;
    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}/api/ws/session/{session_id}"));
    url.query_pairs_mut().clear().append_pair("client_id", client_id);
    Ok(url)
}

fn validate_relay_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
        anyhow::bail!("url must be http, https, ws or wss");
    }
    Ok(())
}

pub fn validate_session_id(id: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,128}$").unwrap());
    if PATTERN.is_match(id) {
        Ok(())
    } else {
        anyhow::bail!("invalid session id: {id:?}")
    }
}

/// `<int><unit>` where unit is ms|s|m|h.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim().to_lowercase();
    let (num, unit) = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .map(|i| s.split_at(i))?;
    let n: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// `16KB`, `1MB`, `512B` or a bare byte count.
pub fn parse_bytes(s: &str) -> Option<usize> {
    let raw = s.trim();
    if raw.is_empty() {
        return None;
    }
    let upper = raw.to_uppercase();
    let (num, mult) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };
    let n: usize = num.trim().parse().ok()?;
    if n == 0 {
        return None;
    }
    Some(n.saturating_mul(mult))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::{env, fs};

    #[test]
    fn load_config_from_json_with_defaults() {
        let tmp = env::temp_dir().join("meshdrop-config-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let json = format!(
            r#"{{
                "relay_url": "https://relay.example.com/",
                "download_dir": "{}",
                "transfer": {{ "chunk_size": 32768 }}
            }}"#,
            tmp.join("dl").display()
        );
        fs::write(&cfg_path, json).unwrap();

        let cfg = Config::resolve(Some(&cfg_path), Overrides::default()).unwrap();
        assert_eq!(cfg.relay_url, "https://relay.example.com");
        assert_eq!(cfg.transfer.chunk_size, 32 * 1024);
        assert_eq!(cfg.transfer.low_water_mark, 1024 * 1024);
        assert_eq!(cfg.ice_servers.len(), 2);
        assert!(!cfg.client_id.is_empty());
        assert_eq!(cfg.log_file(), tmp.join("logs").join("meshdrop.log"));
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let mut cfg = Config::with_relay("http://a.example");
        cfg.apply_overrides(Overrides {
            relay_url: Some("http://b.example".into()),
            client_id: Some("me".into()),
            ..Default::default()
        });
        assert_eq!(cfg.relay_url, "http://b.example");
        assert_eq!(cfg.client_id, "me");
    }

    #[test]
    fn env_overrides_parse_units() {
        let env: HashMap<&str, &str> = [
            (ENV_CHUNK_SIZE, "64KB"),
            (ENV_LOW_WATER_MARK, "2MB"),
            (ENV_HEARTBEAT_INTERVAL, "3s"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::with_relay("http://relay");
        cfg.apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.transfer.chunk_size, 64 * 1024);
        assert_eq!(cfg.transfer.low_water_mark, 2 * 1024 * 1024);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(3));

        let err = cfg
            .apply_env_with(|k| (k == ENV_CHUNK_SIZE).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_CHUNK_SIZE));
    }

    #[test]
    fn reject_bad_relay_scheme_and_chunk_bounds() {
        let err = Config::resolve(None, Overrides {
            relay_url: Some("ftp://bad.example.com".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("relay_url"));

        let mut cfg = Config::with_relay("http://relay");
        cfg.transfer.chunk_size = 512;
        assert!(cfg.validate().is_err());
        cfg.transfer.chunk_size = 64 * 1024;
        cfg.transfer.low_water_mark = 1024;
        assert!(cfg.validate().unwrap_err().to_string().contains("low_water_mark"));
    }

    #[test]
    fn signaling_url_maps_scheme_and_path() {
        let url = signaling_url("https://relay.example.com", "abc", "me").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://relay.example.com/api/ws/session/abc?client_id=me"
        );
        let url = signaling_url("http://127.0.0.1:8001/", "s-1", "c").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8001/api/ws/session/s-1?client_id=c");
    }

    #[test]
    fn session_id_pattern() {
        assert!(validate_session_id("a.B_c-9").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bytes("16kb"), Some(16 * 1024));
        assert_eq!(parse_bytes("100"), Some(100));
        assert_eq!(parse_bytes("0"), None);
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration(&format!("{}h", u64::MAX)), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX / 2)), None);
    }
}
