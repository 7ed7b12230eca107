// OAuth2 flows
// PKCE authorization-code exchange for admin users and the JWT-bearer
// grant for service accounts

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::auth::endpoints;
use crate::auth::info;
use crate::auth::types::{AccessTokenResponse, BearerToken, DeploymentType};
use crate::error::Result;
use crate::state::SessionContext;

/// OAuth2 client the Identity Cloud admin UI uses
pub(crate) const CLOUD_ADMIN_CLIENT_ID: &str = "idmAdminClient";
/// OAuth2 client the ForgeOps admin UI uses
pub(crate) const FORGEOPS_ADMIN_CLIENT_ID: &str = "idm-admin-ui";
/// Client id of the JWT-bearer grant for service accounts
pub(crate) const SERVICE_ACCOUNT_CLIENT_ID: &str = "service-account";
/// Scope requested for service accounts unless the grant negotiates it down
pub(crate) const DEFAULT_SERVICE_ACCOUNT_SCOPE: &str = "fr:am:* fr:idm:* fr:idc:esv:*";

/// Fixed admin scope set for ForgeOps deployments, also the cloud fallback
const FORGEOPS_ADMIN_SCOPES: &[&str] = &["openid", "fr:idm:*"];

/// Admin scopes Identity Cloud can grant; intersected with what the tenant reports
const CLOUD_ADMIN_KNOWN_SCOPES: &[&str] = &[
    "fr:am:*",
    "fr:idm:*",
    "fr:idc:esv:*",
    "fr:idc:analytics:*",
    "fr:idc:certificate:*",
    "fr:idc:content-security-policy:*",
    "fr:idc:custom-domain:*",
    "fr:idc:promotion:*",
    "fr:idc:release:*",
];

static CODE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&]code=([^&]+)").expect("Invalid code parameter pattern"));

/// PKCE verifier/challenge pair plus a fresh state value (S256)
#[derive(Debug, Clone)]
pub(crate) struct Pkce {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; 48];
        rand::thread_rng().fill_bytes(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let mut state_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut state_bytes);

        Pkce {
            challenge: challenge_for(&verifier),
            verifier,
            state: URL_SAFE_NO_PAD.encode(state_bytes),
        }
    }
}

/// `challenge = BASE64URL(SHA256(verifier))`
fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Pulls the `code` parameter out of a redirect Location
pub(crate) fn extract_code(location: &str) -> Option<String> {
    CODE_PARAM
        .captures(location)
        .map(|captures| captures[1].to_string())
}

/// Runs one authorize call and returns the code from the redirect, if any.
/// The current session cookie authenticates the call; a response that is
/// not a code redirect is not an error here.
pub(crate) async fn authorize_for_code(
    ctx: &SessionContext,
    client_id: &str,
    scopes: &[String],
    pkce: &Pkce,
) -> Result<Option<String>> {
    let host = ctx.require_host().await?;
    let url = endpoints::authorize_url(&host, "/");

    let mut form: Vec<(&str, String)> = vec![
        ("redirect_uri", endpoints::redirect_uri(&host)),
        ("scope", scopes.join(" ")),
        ("response_type", "code".to_string()),
        ("client_id", client_id.to_string()),
        ("state", pkce.state.clone()),
        ("code_challenge", pkce.challenge.clone()),
        ("code_challenge_method", "S256".to_string()),
        ("decision", "allow".to_string()),
    ];

    let mut request = ctx.transport().no_redirect_client().post(&url);
    if let (Some(cookie_name), Some(session)) =
        (ctx.cookie_name().await, ctx.session_token().await)
    {
        form.push(("csrf", session.token_id.clone()));
        request = request.header("Cookie", format!("{cookie_name}={}", session.token_id));
    }

    let request = request.form(&form).build()?;
    let response = ctx.transport().execute_raw_no_redirect(request).await?;

    let status = response.status();
    if !status.is_redirection() {
        tracing::debug!(client_id, status = %status, "Authorize did not redirect");
        return Ok(None);
    }
    let code = response
        .headers()
        .get("Location")
        .and_then(|value| value.to_str().ok())
        .and_then(extract_code);
    if code.is_none() {
        tracing::debug!(client_id, "Authorize redirected without a code");
    }
    Ok(code)
}

/// Exchanges an authorization code for a bearer token
pub(crate) async fn exchange_code(
    ctx: &SessionContext,
    client_id: &str,
    code: &str,
    verifier: &str,
) -> Result<BearerToken> {
    let host = ctx.require_host().await?;
    let url = endpoints::access_token_url(&host, "/");

    let form: Vec<(&str, String)> = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("client_id", client_id.to_string()),
        ("redirect_uri", endpoints::redirect_uri(&host)),
        ("code_verifier", verifier.to_string()),
    ];

    let request = ctx.transport().client().post(&url).form(&form).build()?;
    let response = ctx.transport().execute(request).await?;
    let body: AccessTokenResponse = response.json().await?;
    Ok(BearerToken::from_response(
        body,
        Utc::now().timestamp_millis(),
    ))
}

/// Exchanges a signed JWT-bearer assertion for a bearer token
pub(crate) async fn exchange_jwt_bearer(
    ctx: &SessionContext,
    assertion: &str,
    scope: &str,
) -> Result<BearerToken> {
    let host = ctx.require_host().await?;
    let url = endpoints::access_token_url(&host, "/");

    let form: Vec<(&str, String)> = vec![
        ("client_id", SERVICE_ACCOUNT_CLIENT_ID.to_string()),
        (
            "grant_type",
            "urn:ietf:params:oauth:grant-type:jwt-bearer".to_string(),
        ),
        ("assertion", assertion.to_string()),
        ("scope", scope.to_string()),
    ];

    let request = ctx.transport().client().post(&url).form(&form).build()?;
    let response = ctx.transport().execute(request).await?;
    let body: AccessTokenResponse = response.json().await?;
    Ok(BearerToken::from_response(
        body,
        Utc::now().timestamp_millis(),
    ))
}

/// Admin scopes to request for the authorization-code exchange.
/// ForgeOps uses a fixed set; cloud intersects the known admin scopes with
/// what the tenant reports, falling back to the fixed set when the lookup
/// fails or nothing intersects.
pub(crate) async fn admin_scopes(
    ctx: &SessionContext,
    deployment_type: DeploymentType,
) -> Vec<String> {
    let fallback = || FORGEOPS_ADMIN_SCOPES.iter().map(|s| s.to_string()).collect();

    if deployment_type != DeploymentType::Cloud {
        return fallback();
    }

    let available = match info::available_service_account_scopes(ctx).await {
        Ok(scopes) => scopes,
        Err(e) => {
            tracing::warn!(error = %e, "Could not list tenant scopes, using minimal admin scopes");
            return fallback();
        }
    };

    let mut scopes: Vec<String> = CLOUD_ADMIN_KNOWN_SCOPES
        .iter()
        .filter(|known| available.iter().any(|a| a == *known))
        .map(|s| s.to_string())
        .collect();
    if scopes.is_empty() {
        return fallback();
    }
    scopes.insert(0, "openid".to_string());
    scopes
}
