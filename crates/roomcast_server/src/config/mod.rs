#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use roomcast_domain::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.roomcast/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".roomcast").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub rate_limit: RateLimitSettings,
	pub cache: CacheSettings,
	pub persistence: PersistenceSettings,
}

/// Process-level settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Credential validation settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HMAC secret for stateless access tokens. Without it every
	/// credential resolves to anonymous and connections are refused.
	pub hmac_secret: Option<SecretString>,
	/// TTL for the identity cache.
	pub credential_cache_ttl: Duration,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			hmac_secret: None,
			credential_cache_ttl: Duration::from_secs(60),
		}
	}
}

/// Per-connection sliding-window limits.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
	pub max_events: u32,
	pub per_seconds: u64,
}

impl Default for RateLimitSettings {
	fn default() -> Self {
		Self {
			max_events: 30,
			per_seconds: 10,
		}
	}
}

/// Read-cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
	/// TTL for cached message pages; a missed invalidation self-heals
	/// within this bound.
	pub message_ttl: Duration,
}

impl Default for CacheSettings {
	fn default() -> Self {
		Self {
			message_ttl: Duration::from_secs(300),
		}
	}
}

/// Persistence settings.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). Unset runs the in-memory store.
	pub database_url: Option<String>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			server: ServerSettings::default(),
			auth: AuthSettings::default(),
			rate_limit: RateLimitSettings::default(),
			cache: CacheSettings::default(),
			persistence: PersistenceSettings::default(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	rate_limit: FileRateLimitSettings,

	#[serde(default)]
	cache: FileCacheSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
	credential_cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRateLimitSettings {
	max_events: Option<u32>,
	per_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCacheSettings {
	message_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerConfig::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			auth: AuthSettings {
				hmac_secret: file
					.auth
					.hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				credential_cache_ttl: file
					.auth
					.credential_cache_ttl_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.auth.credential_cache_ttl),
			},
			rate_limit: RateLimitSettings {
				max_events: file.rate_limit.max_events.unwrap_or(defaults.rate_limit.max_events),
				per_seconds: file.rate_limit.per_seconds.unwrap_or(defaults.rate_limit.per_seconds),
			},
			cache: CacheSettings {
				message_ttl: file
					.cache
					.message_ttl_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.cache.message_ttl),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("ROOMCAST_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.hmac_secret = Some(SecretString::new(v));
			info!("auth: hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_CREDENTIAL_CACHE_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.auth.credential_cache_ttl = Duration::from_secs(secs);
		info!(secs, "auth: credential_cache_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_RATE_LIMIT_MAX_EVENTS")
		&& let Ok(max_events) = v.trim().parse::<u32>()
	{
		cfg.rate_limit.max_events = max_events;
		info!(max_events, "rate limit: max_events overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_RATE_LIMIT_PER_SECONDS")
		&& let Ok(per_seconds) = v.trim().parse::<u64>()
	{
		cfg.rate_limit.per_seconds = per_seconds;
		info!(per_seconds, "rate limit: per_seconds overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_CACHE_MESSAGE_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.cache.message_ttl = Duration::from_secs(secs);
		info!(secs, "cache: message_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server: metrics_bind overridden by env");
		}
	}

	if cfg.auth.hmac_secret.is_none() {
		warn!("auth: no hmac_secret configured; every connection will be refused as anonymous");
	}
}
