#![forbid(unsafe_code)]

use axum::http::HeaderMap;
use roomcast_domain::Identity;
use tracing::debug;

use crate::server::auth::CredentialValidator;
use crate::server::connection::ConnectionSettings;
use crate::server::rate_limit::SlidingWindow;

/// Everything decided about a connection before the session layer sees it.
#[derive(Debug)]
pub struct AdmittedConnection {
	pub identity: Identity,
	pub limiter: SlidingWindow,
}

/// Run the admission pipeline for one connection attempt: build the rate
/// window first, then resolve the credential. The limiter exists before any
/// message is read, so throttling never depends on authentication state.
pub async fn admit(
	validator: &CredentialValidator,
	settings: &ConnectionSettings,
	headers: &HeaderMap,
	query: Option<&str>,
) -> AdmittedConnection {
	let limiter = SlidingWindow::new(settings.rate_limit_max_events, settings.rate_limit_per_seconds);

	let identity = validator.resolve(headers, query).await;
	if identity.is_anonymous() {
		metrics::counter!("roomcast_server_admissions_anonymous_total").increment(1);
		debug!("admission resolved to anonymous identity");
	} else {
		metrics::counter!("roomcast_server_admissions_authenticated_total").increment(1);
	}

	AdmittedConnection { identity, limiter }
}
