use clap::Parser;
use log::{info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::util::Result;

pub const DEFAULT_ORIGIN_URL: &str = "http://localhost:80";

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    /// upstream origin, requests are forwarded to origin_url + path
    #[clap(long, env = "ORIGIN_URL", default_value = DEFAULT_ORIGIN_URL)]
    pub origin_url: String,

    #[clap(long, env = "CACHEGATE_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[clap(long, env = "CACHEGATE_PORT", default_value_t = 1567)]
    pub port: u16,

    /// ttl of dynamic pages in milliseconds
    #[clap(long, env = "DYNAMIC_TTL_MS", default_value_t = 60_000)]
    pub dynamic_ttl_ms: u64,

    /// ttl of static pages in milliseconds
    #[clap(long, env = "STATIC_TTL_MS", default_value_t = 18_000_000)]
    pub static_ttl_ms: u64,

    #[clap(long, env = "CLEANUP_INTERVAL_MINUTES", default_value_t = 5)]
    pub cleanup_interval_minutes: u64,

    /// path substrings that mark a page as dynamic
    #[clap(
        long,
        env = "DYNAMIC_KEYWORDS",
        value_delimiter = ',',
        default_value = "submit,process,handle,result,action,traitement"
    )]
    pub dynamic_keywords: Vec<String>,

    /// name of the cookie carrying the session token
    #[clap(long, env = "SESSION_COOKIE", default_value = "PHPSESSID")]
    pub session_cookie: String,

    /// optional json configuration file, overrides flags when readable
    #[clap(long, env = "CACHEGATE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct FileConfig {
    server: ServerSection,
    cache: CacheSection,
    dynamic_page_detection: DetectionSection,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct ServerSection {
    port: Option<u16>,
    #[serde(alias = "xampp_server_url")]
    origin_url: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct CacheSection {
    dynamic_page_expiration_ms: Option<u64>,
    static_page_expiration_ms: Option<u64>,
    cleanup_interval_minutes: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct DetectionSection {
    keywords: Option<Vec<String>>,
}

impl Config {
    /// parses flags and env, then layers the json file on top. an unreadable
    /// file is reported and ignored so the server still starts.
    pub fn load() -> Self {
        let mut config = Config::parse();
        if let Some(path) = config.config.clone() {
            match config.apply_file(&path) {
                Ok(()) => info!("loaded configuration from {}", path.display()),
                Err(e) => warn!(
                    "failed to load configuration from {}: {}, using defaults",
                    path.display(),
                    e
                ),
            }
        }
        config
    }

    /// overrides every field present in the json file. on error self is untouched.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let file: FileConfig = serde_json::from_str(&raw)?;

        if let Some(port) = file.server.port {
            self.port = port;
        }
        if let Some(origin_url) = file.server.origin_url {
            self.origin_url = origin_url;
        }
        if let Some(ttl) = file.cache.dynamic_page_expiration_ms {
            self.dynamic_ttl_ms = ttl;
        }
        if let Some(ttl) = file.cache.static_page_expiration_ms {
            self.static_ttl_ms = ttl;
        }
        if let Some(minutes) = file.cache.cleanup_interval_minutes {
            self.cleanup_interval_minutes = minutes;
        }
        if let Some(keywords) = file.dynamic_page_detection.keywords {
            self.dynamic_keywords = keywords;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn cleanup_interval(&self) -> Duration {
        // a zero period would make the sweeper spin
        Duration::from_secs(self.cleanup_interval_minutes.max(1) * 60)
    }
}

/// runtime settings shared by the pipeline, sweeper and console.
///
/// ttls are plain atomics: the console is the only writer and readers may
/// briefly observe the previous value during an update.
#[derive(Debug)]
pub struct Settings {
    dynamic_ttl_ms: AtomicU64,
    static_ttl_ms: AtomicU64,
    dynamic_keywords: Vec<String>,
    session_cookie: String,
}

impl Settings {
    pub fn new(dynamic_ttl: Duration, static_ttl: Duration, dynamic_keywords: Vec<String>) -> Self {
        Self {
            dynamic_ttl_ms: AtomicU64::new(duration_to_ms(dynamic_ttl)),
            static_ttl_ms: AtomicU64::new(duration_to_ms(static_ttl)),
            dynamic_keywords,
            session_cookie: "PHPSESSID".to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::from_millis(config.dynamic_ttl_ms),
            Duration::from_millis(config.static_ttl_ms),
            config
                .dynamic_keywords
                .iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        )
        .with_session_cookie(config.session_cookie.clone())
    }

    pub fn with_session_cookie(mut self, name: String) -> Self {
        self.session_cookie = name;
        self
    }

    pub fn dynamic_ttl(&self) -> Duration {
        Duration::from_millis(self.dynamic_ttl_ms.load(Ordering::Relaxed))
    }

    pub fn static_ttl(&self) -> Duration {
        Duration::from_millis(self.static_ttl_ms.load(Ordering::Relaxed))
    }

    pub fn set_dynamic_ttl(&self, ttl: Duration) {
        self.dynamic_ttl_ms.store(duration_to_ms(ttl), Ordering::Relaxed);
    }

    pub fn set_static_ttl(&self, ttl: Duration) {
        self.static_ttl_ms.store(duration_to_ms(ttl), Ordering::Relaxed);
    }

    pub fn ttl_for(&self, is_dynamic: bool) -> Duration {
        if is_dynamic {
            self.dynamic_ttl()
        } else {
            self.static_ttl()
        }
    }

    pub fn dynamic_keywords(&self) -> &[String] {
        &self.dynamic_keywords
    }

    pub fn session_cookie(&self) -> &str {
        &self.session_cookie
    }
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
