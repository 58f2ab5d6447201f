#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::auth::CredentialValidator;
use crate::server::cache::{KeyValueStore, MemoryKvStore, RoomReadCache};
use crate::server::connection::ConnectionSettings;
use crate::server::presence::{PresenceHook, PresenceTracker};
use crate::server::room_bus::MemoryRoomBus;
use crate::server::routes::build_router;
use crate::server::state::{AppState, HealthState};
use crate::server::store::{ChatStore, MemoryStore, SqlStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: roomcast_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Bind address (default: 127.0.0.1:8403)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind = "127.0.0.1:8403".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind.parse().unwrap_or_else(|e| {
		eprintln!("invalid bind address {bind}: {e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,roomcast_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("roomcast_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Presence writes touch the account's last-seen timestamp; an explicit
/// hook call rather than an implicit signal.
struct LastSeenHook {
	store: Arc<dyn ChatStore>,
}

#[async_trait::async_trait]
impl PresenceHook for LastSeenHook {
	async fn user_seen(&self, user: roomcast_domain::UserId) {
		if let Err(e) = self.store.touch_last_seen(user).await {
			warn!(error = %e, %user, "failed to touch last seen");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health = HealthState::new();

	let store: Arc<dyn ChatStore> = match server_cfg.persistence.database_url.as_deref() {
		Some(database_url) => {
			let store = SqlStore::connect(database_url).await.context("connect chat store")?;
			info!("chat store connected (sql)");
			Arc::new(store)
		}
		None => {
			warn!("no database_url configured; using in-memory store (single-process, non-durable)");
			Arc::new(MemoryStore::new())
		}
	};

	let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
	let bus = Arc::new(MemoryRoomBus::new());
	let presence = PresenceTracker::with_hook(Arc::new(LastSeenHook {
		store: Arc::clone(&store),
	}));
	let cache = RoomReadCache::new(Arc::clone(&kv), server_cfg.cache.message_ttl);
	let validator = CredentialValidator::new(
		Arc::clone(&store),
		Arc::clone(&kv),
		server_cfg.auth.hmac_secret.clone(),
		server_cfg.auth.credential_cache_ttl,
	);

	let settings = ConnectionSettings {
		rate_limit_max_events: server_cfg.rate_limit.max_events,
		rate_limit_per_seconds: server_cfg.rate_limit.per_seconds,
		..ConnectionSettings::default()
	};

	let app = AppState {
		store,
		kv,
		bus,
		presence,
		cache,
		validator,
		settings,
		health: health.clone(),
	};

	let router = build_router(app);

	let listener = tokio::net::TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	health.mark_ready();
	info!(%bind_addr, "roomcast_server listening");

	axum::serve(listener, router).await.context("serve")?;

	Ok(())
}
