#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use roomcast_domain::{Identity, SecretString, UserId};

use crate::server::auth::{CredentialValidator, bearer_token_from_parts, mint_hmac_token, verify_hmac_token};
use crate::server::cache::{KeyValueStore, MemoryKvStore};
use crate::server::store::{ChatStore, MemoryStore};
use crate::util::time::unix_secs_now;

const SECRET: &str = "test-secret";

fn validator(store: &Arc<MemoryStore>, ttl: Duration) -> CredentialValidator {
	CredentialValidator::new(
		Arc::clone(store) as Arc<dyn ChatStore>,
		Arc::new(MemoryKvStore::new()) as Arc<dyn KeyValueStore>,
		Some(SecretString::new(SECRET)),
		ttl,
	)
}

fn token_for(user: UserId) -> String {
	mint_hmac_token(&user.to_string(), unix_secs_now() + 600, SECRET).expect("mint token")
}

#[test]
fn token_roundtrip_verifies() {
	let token = mint_hmac_token("42", unix_secs_now() + 600, SECRET).expect("mint");
	let claims = verify_hmac_token(&token, SECRET).expect("verify");
	assert_eq!(claims.sub, "42");
}

#[test]
fn expired_token_is_rejected() {
	let token = mint_hmac_token("42", unix_secs_now() - 1, SECRET).expect("mint");
	assert!(verify_hmac_token(&token, SECRET).is_err());
}

#[test]
fn tampered_signature_is_rejected() {
	let token = mint_hmac_token("42", unix_secs_now() + 600, SECRET).expect("mint");
	let mut parts: Vec<&str> = token.split('.').collect();
	let forged = format!("{}x", parts[2]);
	parts[2] = &forged;
	assert!(verify_hmac_token(&parts.join("."), SECRET).is_err());
}

#[test]
fn wrong_secret_is_rejected() {
	let token = mint_hmac_token("42", unix_secs_now() + 600, SECRET).expect("mint");
	assert!(verify_hmac_token(&token, "other-secret").is_err());
}

#[test]
fn malformed_tokens_are_rejected() {
	for token in ["", "v1", "v1.only-two", "v2.a.b", "not a token at all"] {
		assert!(verify_hmac_token(token, SECRET).is_err(), "token: {token}");
	}
}

#[test]
fn authorization_header_is_preferred() {
	let mut headers = HeaderMap::new();
	headers.insert("authorization", HeaderValue::from_static("Bearer from-header"));
	headers.insert("sec-websocket-protocol", HeaderValue::from_static("from-protocol"));

	let token = bearer_token_from_parts(&headers, Some("token=from-query"));
	assert_eq!(token.as_deref(), Some("from-header"));
}

#[test]
fn bearer_prefix_is_case_insensitive() {
	let mut headers = HeaderMap::new();
	headers.insert("authorization", HeaderValue::from_static("bearer lower"));
	assert_eq!(bearer_token_from_parts(&headers, None).as_deref(), Some("lower"));
}

#[test]
fn non_bearer_authorization_is_ignored() {
	let mut headers = HeaderMap::new();
	headers.insert("authorization", HeaderValue::from_static("Basic dXNlcjpwYXNz"));
	assert_eq!(bearer_token_from_parts(&headers, None), None);
}

#[test]
fn query_parameter_beats_protocol_header() {
	let mut headers = HeaderMap::new();
	headers.insert("sec-websocket-protocol", HeaderValue::from_static("from-protocol"));

	let token = bearer_token_from_parts(&headers, Some("a=b&token=from-query&c=d"));
	assert_eq!(token.as_deref(), Some("from-query"));
}

#[test]
fn protocol_header_skips_the_binary_entry() {
	let mut headers = HeaderMap::new();
	headers.insert("sec-websocket-protocol", HeaderValue::from_static("binary, the-token"));
	assert_eq!(bearer_token_from_parts(&headers, None).as_deref(), Some("the-token"));

	let mut headers = HeaderMap::new();
	headers.insert("sec-websocket-protocol", HeaderValue::from_static("BINARY"));
	assert_eq!(bearer_token_from_parts(&headers, None), None);
}

#[test]
fn no_credential_anywhere_yields_none() {
	assert_eq!(bearer_token_from_parts(&HeaderMap::new(), None), None);
	assert_eq!(bearer_token_from_parts(&HeaderMap::new(), Some("page=2")), None);
}

#[tokio::test]
async fn valid_token_for_active_user_resolves() {
	let store = Arc::new(MemoryStore::new());
	let user = store.create_user("alice").await.expect("create user");
	let validator = validator(&store, Duration::from_secs(60));

	match validator.resolve_token(&token_for(user.id)).await {
		Identity::User(resolved) => assert_eq!(resolved.id, user.id),
		Identity::Anonymous => panic!("expected resolved identity"),
	}
}

#[tokio::test]
async fn token_via_query_parameter_resolves() {
	let store = Arc::new(MemoryStore::new());
	let user = store.create_user("alice").await.expect("create user");
	let validator = validator(&store, Duration::from_secs(60));

	let query = format!("token={}", token_for(user.id));
	let identity = validator.resolve(&HeaderMap::new(), Some(&query)).await;
	assert!(matches!(identity, Identity::User(_)));
}

#[tokio::test]
async fn inactive_user_resolves_to_anonymous_despite_valid_token() {
	let store = Arc::new(MemoryStore::new());
	let user = store.create_user("alice").await.expect("create user");
	store.set_user_active(user.id, false).await;
	let validator = validator(&store, Duration::from_secs(60));

	assert!(validator.resolve_token(&token_for(user.id)).await.is_anonymous());
}

#[tokio::test]
async fn unknown_subject_resolves_to_anonymous() {
	let store = Arc::new(MemoryStore::new());
	let validator = validator(&store, Duration::from_secs(60));

	let token = mint_hmac_token("999", unix_secs_now() + 600, SECRET).expect("mint");
	assert!(validator.resolve_token(&token).await.is_anonymous());

	let token = mint_hmac_token("not-an-id", unix_secs_now() + 600, SECRET).expect("mint");
	assert!(validator.resolve_token(&token).await.is_anonymous());
}

#[tokio::test]
async fn garbage_token_resolves_to_anonymous() {
	let store = Arc::new(MemoryStore::new());
	let validator = validator(&store, Duration::from_secs(60));

	assert!(validator.resolve_token("garbage").await.is_anonymous());
}

#[tokio::test]
async fn missing_secret_resolves_to_anonymous() {
	let store = Arc::new(MemoryStore::new());
	let user = store.create_user("alice").await.expect("create user");

	let validator = CredentialValidator::new(
		Arc::clone(&store) as Arc<dyn ChatStore>,
		Arc::new(MemoryKvStore::new()) as Arc<dyn KeyValueStore>,
		None,
		Duration::from_secs(60),
	);

	assert!(validator.resolve_token(&token_for(user.id)).await.is_anonymous());
}

#[tokio::test]
async fn identity_cache_serves_within_the_ttl() {
	let store = Arc::new(MemoryStore::new());
	let user = store.create_user("alice").await.expect("create user");
	let validator = validator(&store, Duration::from_secs(60));

	assert!(matches!(validator.resolve_token(&token_for(user.id)).await, Identity::User(_)));

	// The store no longer answers, but the cached identity still does.
	store.set_available(false).await;
	assert!(matches!(validator.resolve_token(&token_for(user.id)).await, Identity::User(_)));
}

#[tokio::test]
async fn identity_cache_entries_expire() {
	let store = Arc::new(MemoryStore::new());
	let user = store.create_user("alice").await.expect("create user");
	let validator = validator(&store, Duration::from_millis(20));

	assert!(matches!(validator.resolve_token(&token_for(user.id)).await, Identity::User(_)));

	store.set_user_active(user.id, false).await;
	tokio::time::sleep(Duration::from_millis(40)).await;

	// Cache expired; the deactivation is now visible.
	assert!(validator.resolve_token(&token_for(user.id)).await.is_anonymous());
}

#[tokio::test]
async fn negative_results_are_cached_too() {
	let store = Arc::new(MemoryStore::new());
	let user = store.create_user("alice").await.expect("create user");
	store.set_user_active(user.id, false).await;
	let validator = validator(&store, Duration::from_secs(60));

	assert!(validator.resolve_token(&token_for(user.id)).await.is_anonymous());

	// Reactivation stays invisible until the negative entry expires.
	store.set_user_active(user.id, true).await;
	assert!(validator.resolve_token(&token_for(user.id)).await.is_anonymous());
}

#[tokio::test]
async fn store_failure_during_lookup_degrades_to_anonymous() {
	let store = Arc::new(MemoryStore::new());
	let user = store.create_user("alice").await.expect("create user");
	let validator = validator(&store, Duration::from_secs(60));

	store.set_available(false).await;
	assert!(validator.resolve_token(&token_for(user.id)).await.is_anonymous());
}
