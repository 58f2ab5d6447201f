#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use roomcast_domain::{Identity, SecretString, User, UserId};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::server::cache::KeyValueStore;
use crate::server::store::ChatStore;
use crate::util::time::unix_secs_now;

/// Claims carried by a `v1.<payload>.<sig>` access token.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Verify token format, signature and expiry.
pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token for `sub` expiring at `exp`. Used by tests and ops tooling.
pub fn mint_hmac_token(sub: &str, exp: u64, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::json!({ "sub": sub, "exp": exp });
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).context("encode token claims")?);
	let sig_b64 = URL_SAFE_NO_PAD.encode(sign(payload_b64.as_bytes(), secret.as_bytes()));
	Ok(format!("v1.{payload_b64}.{sig_b64}"))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	// HMAC-SHA256 accepts any key length; this cannot fail.
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Extract the bearer credential from a connection request.
///
/// Priority: `Authorization: Bearer <t>`, then a `token` query parameter,
/// then the protocol-negotiation header (some browser clients can only
/// smuggle a token there), skipping the literal `binary` entry.
pub fn bearer_token_from_parts(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
	if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
		&& let Some((prefix, raw)) = value.trim().split_once(' ')
		&& prefix.eq_ignore_ascii_case("bearer")
	{
		let raw = raw.trim();
		if !raw.is_empty() {
			return Some(raw.to_string());
		}
	}

	if let Some(query) = query {
		for pair in query.split('&') {
			if let Some((key, value)) = pair.split_once('=')
				&& key == "token" && !value.is_empty()
			{
				return Some(value.to_string());
			}
		}
	}

	if let Some(value) = headers.get("sec-websocket-protocol").and_then(|v| v.to_str().ok()) {
		for part in value.split(',') {
			let part = part.trim();
			if !part.is_empty() && !part.eq_ignore_ascii_case("binary") {
				return Some(part.to_string());
			}
		}
	}

	None
}

fn identity_cache_key(user: UserId) -> String {
	format!("auth:user:{user}")
}

/// Resolves bearer credentials to identities.
///
/// Every failure path degrades to [`Identity::Anonymous`]; nothing here
/// returns an error to the caller. Resolved accounts are cached for a short
/// TTL so reconnect storms do not hammer the store.
#[derive(Clone)]
pub struct CredentialValidator {
	store: Arc<dyn ChatStore>,
	kv: Arc<dyn KeyValueStore>,
	hmac_secret: Option<SecretString>,
	cache_ttl: Duration,
}

impl CredentialValidator {
	pub fn new(
		store: Arc<dyn ChatStore>,
		kv: Arc<dyn KeyValueStore>,
		hmac_secret: Option<SecretString>,
		cache_ttl: Duration,
	) -> Self {
		Self {
			store,
			kv,
			hmac_secret,
			cache_ttl,
		}
	}

	/// Resolve a connection request to an identity.
	pub async fn resolve(&self, headers: &HeaderMap, query: Option<&str>) -> Identity {
		match bearer_token_from_parts(headers, query) {
			Some(token) => self.resolve_token(&token).await,
			None => Identity::Anonymous,
		}
	}

	/// Resolve a raw bearer token to an identity.
	pub async fn resolve_token(&self, token: &str) -> Identity {
		let Some(secret) = self.hmac_secret.as_ref() else {
			warn!("credential presented but no hmac secret configured");
			return Identity::Anonymous;
		};

		let claims = match verify_hmac_token(token, secret.expose()) {
			Ok(claims) => claims,
			Err(e) => {
				debug!(error = %e, "credential rejected");
				metrics::counter!("roomcast_server_credentials_rejected_total").increment(1);
				return Identity::Anonymous;
			}
		};

		let user_id = match claims.sub.parse::<UserId>() {
			Ok(id) => id,
			Err(e) => {
				debug!(error = %e, sub = %claims.sub, "credential subject is not a user id");
				return Identity::Anonymous;
			}
		};

		match self.lookup_user(user_id).await {
			Some(user) => Identity::User(user),
			None => Identity::Anonymous,
		}
	}

	/// Identity-cache lookup, falling back to the store on a miss.
	///
	/// Negative results (missing or inactive account) are cached too; a
	/// structurally valid token for a deactivated account stays anonymous
	/// for the TTL.
	async fn lookup_user(&self, user: UserId) -> Option<User> {
		let key = identity_cache_key(user);

		match self.kv.get(&key).await {
			Ok(Some(raw)) => {
				if let Ok(cached) = serde_json::from_str::<Option<User>>(&raw) {
					metrics::counter!("roomcast_server_identity_cache_hits_total").increment(1);
					return cached;
				}
				warn!(%user, "identity cache entry is corrupt; falling through to store");
			}
			Ok(None) => {}
			Err(e) => {
				warn!(error = %e, %user, "identity cache read failed; falling through to store");
			}
		}

		metrics::counter!("roomcast_server_identity_cache_misses_total").increment(1);

		let found = match self.store.active_user(user).await {
			Ok(found) => found,
			Err(e) => {
				warn!(error = %e, %user, "identity lookup failed; treating as anonymous");
				return None;
			}
		};

		match serde_json::to_string(&found) {
			Ok(raw) => {
				if let Err(e) = self.kv.set(&key, &raw, Some(self.cache_ttl)).await {
					warn!(error = %e, %user, "identity cache write failed");
				}
			}
			Err(e) => warn!(error = %e, %user, "identity cache encode failed"),
		}

		found
	}
}
