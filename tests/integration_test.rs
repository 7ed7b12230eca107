// Integration tests for frodo-auth
//
// These tests run the full login flows against mocked AM endpoints:
// deployment detection, callback-tree login (including 2FA), the PKCE
// authorization-code and JWT-bearer exchanges, and the token cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use mockito::{Matcher, Server, ServerGuard};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::RsaPrivateKey;
use serde_json::json;

use frodo_auth::{
    ConnectionProfile, ConnectionProfileStore, DeploymentType, FrodoError, OtpCallbackHandler,
    SessionContext,
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Context with user credentials, caching off, pointed at a mock server
fn user_context(url: &str) -> SessionContext {
    SessionContext::builder()
        .host(url)
        .username("alice")
        .password("secret")
        .use_token_cache(false)
        .max_retries(0)
        .build()
        .expect("Failed to build session context")
}

/// Mounts `GET /json/serverinfo/*` returning the classic cookie name
async fn mock_server_info(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("GET", "/json/serverinfo/*")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"cookieName":"iPlanetDirectoryPro","realm":"/"}"#)
        .create_async()
        .await
}

/// Mounts the session-info lookup with the given expiration time
async fn mock_session_info(
    server: &mut ServerGuard,
    max_idle: chrono::DateTime<Utc>,
) -> mockito::Mock {
    server
        .mock("POST", "/json/realms/root/sessions/")
        .match_query(Matcher::UrlEncoded(
            "_action".into(),
            "getSessionInfo".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "username": "alice",
                "realm": "/",
                "maxIdleExpirationTime": max_idle.to_rfc3339(),
            })
            .to_string(),
        )
        .create_async()
        .await
}

/// Mounts an authorize endpoint that never redirects (classic behavior)
async fn mock_authorize_no_redirect(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("POST", "/oauth2/realms/root/authorize")
        .with_status(200)
        .with_body("<html>login page</html>")
        .create_async()
        .await
}

/// Private RSA JWK in the shape AM issues for service accounts
fn generate_service_account_jwk() -> String {
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("Failed to generate key");
    let primes = key.primes();
    json!({
        "kty": "RSA",
        "kid": "test-key",
        "n": URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        "e": URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        "d": URL_SAFE_NO_PAD.encode(key.d().to_bytes_be()),
        "p": URL_SAFE_NO_PAD.encode(primes[0].to_bytes_be()),
        "q": URL_SAFE_NO_PAD.encode(primes[1].to_bytes_be()),
    })
    .to_string()
}

/// In-memory profile store for the credential-resolution tests
#[derive(Default)]
struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, ConnectionProfile>>,
}

impl ConnectionProfileStore for MemoryProfileStore {
    fn load(&self, host: &str) -> Option<ConnectionProfile> {
        self.profiles.lock().unwrap().get(host).cloned()
    }

    fn save(&self, profile: &ConnectionProfile) -> anyhow::Result<()> {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.host.clone(), profile.clone());
        Ok(())
    }
}

// ==================================================================================================
// Classic Login
// ==================================================================================================

#[tokio::test]
async fn test_classic_login_end_to_end() {
    init_tracing();
    let mut server = Server::new_async().await;

    mock_server_info(&mut server).await;
    let authenticate = server
        .mock("POST", "/json/realms/root/authenticate")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"tokenId":"abc123","successUrl":"/","realm":"/"}"#)
        .expect(1)
        .create_async()
        .await;
    let max_idle = Utc::now() + Duration::minutes(30);
    mock_session_info(&mut server, max_idle).await;
    // Neither admin client redirects, so the host is classic
    let probes = server
        .mock("POST", "/oauth2/realms/root/authorize")
        .with_status(200)
        .with_body("<html>login page</html>")
        .expect(2)
        .create_async()
        .await;

    let ctx = user_context(&server.url());
    let tokens = ctx.get_tokens(false, false, &[], None).await.unwrap();

    let session = tokens.user_session_token.unwrap();
    assert_eq!(session.token_id, "abc123");
    assert!(!session.from_cache);
    assert!((session.expires - max_idle.timestamp_millis()).abs() < 1000);
    assert!(tokens.bearer_token.is_none());
    assert_eq!(tokens.subject, "alice");
    assert_eq!(tokens.realm, "/");
    assert_eq!(ctx.deployment_type().await, Some(DeploymentType::Classic));

    authenticate.assert_async().await;
    probes.assert_async().await;
}

// ==================================================================================================
// ForgeOps Login (session + PKCE bearer)
// ==================================================================================================

#[tokio::test]
async fn test_forgeops_login_obtains_bearer_token() {
    init_tracing();
    let mut server = Server::new_async().await;

    mock_server_info(&mut server).await;
    server
        .mock("POST", "/json/realms/root/authenticate")
        .with_status(200)
        .with_body(r#"{"tokenId":"sess-42","successUrl":"/","realm":"/"}"#)
        .create_async()
        .await;
    mock_session_info(&mut server, Utc::now() + Duration::minutes(30)).await;

    // The cloud client gets the login page, the forgeops client redirects
    // with a code (once for detection, once for the bearer exchange)
    server
        .mock("POST", "/oauth2/realms/root/authorize")
        .match_body(Matcher::UrlEncoded(
            "client_id".into(),
            "idmAdminClient".into(),
        ))
        .with_status(200)
        .with_body("<html>login page</html>")
        .create_async()
        .await;
    let forgeops_authorize = server
        .mock("POST", "/oauth2/realms/root/authorize")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("client_id".into(), "idm-admin-ui".into()),
            Matcher::UrlEncoded("code_challenge_method".into(), "S256".into()),
            Matcher::UrlEncoded("csrf".into(), "sess-42".into()),
        ]))
        .with_status(302)
        .with_header(
            "Location",
            "https://host/platform/appAuthHelperRedirect.html?code=an-auth-code&state=s",
        )
        .expect(2)
        .create_async()
        .await;

    let access_token = server
        .mock("POST", "/oauth2/realms/root/access_token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("client_id".into(), "idm-admin-ui".into()),
            Matcher::UrlEncoded("code".into(), "an-auth-code".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"access_token":"at-777","token_type":"Bearer","expires_in":3600,"scope":"openid fr:idm:*"}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let ctx = user_context(&server.url());
    let tokens = ctx.get_tokens(false, false, &[], None).await.unwrap();

    assert_eq!(tokens.user_session_token.unwrap().token_id, "sess-42");
    let bearer = tokens.bearer_token.unwrap();
    assert_eq!(bearer.access_token, "at-777");
    assert_eq!(bearer.expires_in, 3600);
    assert_eq!(ctx.deployment_type().await, Some(DeploymentType::Forgeops));
    assert_eq!(ctx.admin_client_id().await.as_deref(), Some("idm-admin-ui"));
    assert_eq!(tokens.realm, "/");

    forgeops_authorize.assert_async().await;
    access_token.assert_async().await;
}

// ==================================================================================================
// Service Account Login
// ==================================================================================================

#[tokio::test]
async fn test_cloud_service_account_login() {
    init_tracing();
    let mut server = Server::new_async().await;
    let sa_id = "0199208f-8d19-43e8-b7a9-2b3f5f8b9c15";

    mock_server_info(&mut server).await;
    let access_token = server
        .mock("POST", "/oauth2/realms/root/access_token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded(
                "grant_type".into(),
                "urn:ietf:params:oauth:grant-type:jwt-bearer".into(),
            ),
            Matcher::UrlEncoded("client_id".into(), "service-account".into()),
            Matcher::UrlEncoded("scope".into(), "fr:am:* fr:idm:* fr:idc:esv:*".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"access_token":"sa-at-1","token_type":"Bearer","expires_in":899,"scope":"fr:am:* fr:idm:*"}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let ctx = SessionContext::builder()
        .host(server.url())
        .service_account(sa_id, generate_service_account_jwk())
        .use_token_cache(false)
        .max_retries(0)
        .build()
        .unwrap();
    let tokens = ctx.get_tokens(false, false, &[], None).await.unwrap();

    assert!(tokens.user_session_token.is_none());
    let bearer = tokens.bearer_token.unwrap();
    assert_eq!(bearer.access_token, "sa-at-1");
    assert_eq!(tokens.subject, sa_id);
    // A service account implies an Identity Cloud tenant
    assert_eq!(ctx.deployment_type().await, Some(DeploymentType::Cloud));
    assert!(ctx.use_bearer_token_for_am_apis().await);
    assert_eq!(tokens.realm, "alpha");

    access_token.assert_async().await;
}

#[tokio::test]
async fn test_service_account_scope_retry() {
    init_tracing();
    let mut server = Server::new_async().await;

    // First exchange names the unsupported scope, second succeeds without it
    let rejected = server
        .mock("POST", "/oauth2/realms/root/access_token")
        .match_body(Matcher::UrlEncoded(
            "scope".into(),
            "fr:am:* fr:idm:* fr:idc:esv:*".into(),
        ))
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"error":"invalid_scope","error_description":"Unknown/invalid scope(s): [fr:idc:esv:*]"}"#,
        )
        .expect(1)
        .create_async()
        .await;
    let granted = server
        .mock("POST", "/oauth2/realms/root/access_token")
        .match_body(Matcher::UrlEncoded(
            "scope".into(),
            "fr:am:* fr:idm:*".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"access_token":"sa-at-2","token_type":"Bearer","expires_in":899,"scope":"fr:am:* fr:idm:*"}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let ctx = SessionContext::builder()
        .host(server.url())
        .service_account("sa-1", generate_service_account_jwk())
        .use_token_cache(false)
        .max_retries(0)
        .build()
        .unwrap();
    let token = frodo_auth::get_fresh_sa_bearer_token(&ctx).await.unwrap();
    assert_eq!(token.access_token, "sa-at-2");

    rejected.assert_async().await;
    granted.assert_async().await;
}

// ==================================================================================================
// 2FA and Unsupported Factors
// ==================================================================================================

#[tokio::test]
async fn test_login_gives_up_after_three_rounds() {
    init_tracing();
    let mut server = Server::new_async().await;

    mock_server_info(&mut server).await;
    // A journey that never completes: every submission yields another step
    let authenticate = server
        .mock("POST", "/json/realms/root/authenticate")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "authId": "looping",
                "callbacks": [{
                    "type": "NameCallback",
                    "output": [{"name": "prompt", "value": "User Name"}],
                    "input": [{"name": "IDToken1", "value": ""}]
                }]
            })
            .to_string(),
        )
        .expect(4)
        .create_async()
        .await;

    let ctx = user_context(&server.url());
    let err = ctx.get_tokens(false, false, &[], None).await.unwrap_err();
    match err {
        FrodoError::Authentication(msg) => assert!(msg.contains("3 steps")),
        other => panic!("unexpected error: {other:?}"),
    }
    // Initial submission plus exactly three resubmissions
    authenticate.assert_async().await;
}

#[tokio::test]
async fn test_webauthn_factor_is_rejected() {
    init_tracing();
    let mut server = Server::new_async().await;

    mock_server_info(&mut server).await;
    server
        .mock("POST", "/json/realms/root/authenticate")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "authId": "webauthn-step",
                "callbacks": [{
                    "type": "HiddenValueCallback",
                    "output": [
                        {"name": "value", "value": "webAuthnOutcome"},
                        {"name": "id", "value": "webAuthnOutcome"}
                    ],
                    "input": [{"name": "IDToken1", "value": ""}]
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let ctx = user_context(&server.url());
    let err = ctx.get_tokens(false, false, &[], None).await.unwrap_err();
    match err {
        FrodoError::UnsupportedFactor { factor } => assert_eq!(factor, "WebAuthN"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_otp_code_login() {
    init_tracing();
    let mut server = Server::new_async().await;

    mock_server_info(&mut server).await;
    // Round 1: empty body, answered with username/password prompts
    server
        .mock("POST", "/json/realms/root/authenticate")
        .match_body(Matcher::Json(json!({})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "authId": "step-1",
                "callbacks": [
                    {
                        "type": "NameCallback",
                        "output": [{"name": "prompt", "value": "User Name"}],
                        "input": [{"name": "IDToken1", "value": ""}]
                    },
                    {
                        "type": "PasswordCallback",
                        "output": [{"name": "prompt", "value": "Password"}],
                        "input": [{"name": "IDToken2", "value": ""}]
                    }
                ]
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    // Round 2: credentials submitted, a one-time code is requested
    server
        .mock("POST", "/json/realms/root/authenticate")
        .match_body(Matcher::PartialJson(json!({"authId": "step-1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "authId": "step-2",
                "callbacks": [{
                    "type": "NameCallback",
                    "output": [{"name": "prompt", "value": "Enter verification code"}],
                    "input": [{"name": "IDToken1", "value": ""}]
                }]
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    // Round 3: the filled code completes the journey
    let final_round = server
        .mock("POST", "/json/realms/root/authenticate")
        .match_body(Matcher::PartialJson(json!({
            "authId": "step-2",
            "callbacks": [{
                "type": "NameCallback",
                "input": [{"name": "IDToken1", "value": "123456"}]
            }]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"tokenId":"otp-sess","successUrl":"/","realm":"/"}"#)
        .expect(1)
        .create_async()
        .await;
    mock_session_info(&mut server, Utc::now() + Duration::minutes(30)).await;
    mock_authorize_no_redirect(&mut server).await;

    let handler: OtpCallbackHandler = Arc::new(|_prompt| Some("123456".to_string()));
    let ctx = user_context(&server.url());
    let tokens = ctx
        .get_tokens(false, false, &[], Some(handler))
        .await
        .unwrap();

    assert_eq!(tokens.user_session_token.unwrap().token_id, "otp-sess");
    final_round.assert_async().await;
}

#[tokio::test]
async fn test_otp_prompt_without_handler_fails() {
    init_tracing();
    let mut server = Server::new_async().await;

    mock_server_info(&mut server).await;
    server
        .mock("POST", "/json/realms/root/authenticate")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "authId": "otp-step",
                "callbacks": [{
                    "type": "NameCallback",
                    "output": [{"name": "prompt", "value": "Enter verification code"}],
                    "input": [{"name": "IDToken1", "value": ""}]
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let ctx = user_context(&server.url());
    let err = ctx.get_tokens(false, false, &[], None).await.unwrap_err();
    assert!(matches!(err, FrodoError::MissingCallbackHandler));
}

// ==================================================================================================
// Token Cache
// ==================================================================================================

#[tokio::test]
async fn test_second_login_is_served_from_cache() {
    init_tracing();
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("TokenCache.json");

    // Both contexts resolve the cookie name, only one authenticates
    mock_server_info(&mut server).await;
    let authenticate = server
        .mock("POST", "/json/realms/root/authenticate")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"tokenId":"cached-sess","successUrl":"/","realm":"/"}"#)
        .expect(1)
        .create_async()
        .await;
    mock_session_info(&mut server, Utc::now() + Duration::minutes(30)).await;

    let build = || {
        SessionContext::builder()
            .host(server.url())
            .username("alice")
            .password("secret")
            .deployment_type(DeploymentType::Classic)
            .token_cache_path(&cache_path)
            .max_retries(0)
            .build()
            .unwrap()
    };

    let first = build().get_tokens(false, false, &[], None).await.unwrap();
    let fresh = first.user_session_token.unwrap();
    assert!(!fresh.from_cache);

    let second = build().get_tokens(false, false, &[], None).await.unwrap();
    let cached = second.user_session_token.unwrap();
    assert!(cached.from_cache);
    assert_eq!(cached.token_id, "cached-sess");

    authenticate.assert_async().await;
}

// ==================================================================================================
// Connection Profiles
// ==================================================================================================

#[tokio::test]
async fn test_profile_store_supplies_missing_credentials() {
    init_tracing();
    let mut server = Server::new_async().await;

    mock_server_info(&mut server).await;
    server
        .mock("POST", "/json/realms/root/authenticate")
        .with_status(200)
        .with_body(r#"{"tokenId":"prof-sess","successUrl":"/","realm":"/"}"#)
        .create_async()
        .await;
    mock_session_info(&mut server, Utc::now() + Duration::minutes(30)).await;

    let store = Arc::new(MemoryProfileStore::default());
    store
        .save(&ConnectionProfile {
            host: server.url(),
            username: Some("alice".to_string()),
            password: Some("secret".to_string()),
            deployment_type: Some("classic".to_string()),
            ..Default::default()
        })
        .unwrap();

    let ctx = SessionContext::builder()
        .host(server.url())
        .use_token_cache(false)
        .max_retries(0)
        .profile_store(store)
        .build()
        .unwrap();
    let tokens = ctx.get_tokens(false, false, &[], None).await.unwrap();

    assert_eq!(tokens.subject, "alice");
    assert_eq!(tokens.user_session_token.unwrap().token_id, "prof-sess");
    // The profile pinned the deployment type, so no authorize probes ran
    assert_eq!(ctx.deployment_type().await, Some(DeploymentType::Classic));
}

#[tokio::test]
async fn test_first_connect_records_a_profile() {
    init_tracing();
    let mut server = Server::new_async().await;

    mock_server_info(&mut server).await;
    server
        .mock("POST", "/json/realms/root/authenticate")
        .with_status(200)
        .with_body(r#"{"tokenId":"rec-sess","successUrl":"/","realm":"/"}"#)
        .create_async()
        .await;
    mock_session_info(&mut server, Utc::now() + Duration::minutes(30)).await;
    mock_authorize_no_redirect(&mut server).await;

    let store = Arc::new(MemoryProfileStore::default());
    let ctx = SessionContext::builder()
        .host(server.url())
        .username("alice")
        .password("secret")
        .use_token_cache(false)
        .max_retries(0)
        .profile_store(store.clone())
        .build()
        .unwrap();
    ctx.get_tokens(false, false, &[], None).await.unwrap();

    let recorded = store.load(&server.url()).expect("profile was not saved");
    assert_eq!(recorded.username.as_deref(), Some("alice"));
    assert_eq!(recorded.deployment_type(), Some(DeploymentType::Classic));
}

// ==================================================================================================
// Auto Refresh
// ==================================================================================================

#[tokio::test]
async fn test_auto_refresh_reruns_login_before_expiry() {
    init_tracing();
    let mut server = Server::new_async().await;

    mock_server_info(&mut server).await;
    // Session expires in 26s: the refresh timeout computes to about 1s
    let authenticate = server
        .mock("POST", "/json/realms/root/authenticate")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"tokenId":"short-sess","successUrl":"/","realm":"/"}"#)
        .expect_at_least(2)
        .create_async()
        .await;
    mock_session_info(&mut server, Utc::now() + Duration::seconds(26)).await;

    let ctx = SessionContext::builder()
        .host(server.url())
        .username("alice")
        .password("secret")
        .deployment_type(DeploymentType::Classic)
        .use_token_cache(false)
        .max_retries(0)
        .build()
        .unwrap();
    ctx.get_tokens(false, true, &[], None).await.unwrap();

    // The armed timer fires after roughly a second and logs in again
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    ctx.stop_auto_refresh().await;

    authenticate.assert_async().await;
}
