// AM endpoint construction
// Realm-path derivation and URLs for the authenticate, OAuth2 and session APIs

use crate::error::{FrodoError, Result};

/// Header carrying the AM API version pin
pub const API_VERSION_HEADER: &str = "Accept-API-Version";
/// Version pin for the authenticate endpoint
pub const AUTHENTICATE_API_VERSION: &str = "protocol=1.0,resource=2.1";
/// Version pin for the sessions endpoint
pub const SESSION_API_VERSION: &str = "protocol=1.0,resource=4.0";

/// Converts a realm name to the AM realm path form.
///
/// `/` maps to `/realms/root`, `alpha` to `/realms/root/realms/alpha`,
/// `a/b` to `/realms/root/realms/a/realms/b`.
pub fn realm_path(realm: &str) -> String {
    let trimmed = realm.trim().trim_matches('/');
    if trimmed.is_empty() || trimmed == "root" {
        return "/realms/root".to_string();
    }
    let mut path = String::from("/realms/root");
    for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
        path.push_str("/realms/");
        path.push_str(segment);
    }
    path
}

fn base(host: &str) -> &str {
    host.trim_end_matches('/')
}

pub fn authenticate_url(host: &str, realm: &str, service: Option<&str>) -> String {
    let mut url = format!("{}/json{}/authenticate", base(host), realm_path(realm));
    if let Some(service) = service {
        url.push_str(&format!(
            "?authIndexType=service&authIndexValue={service}"
        ));
    }
    url
}

pub fn authorize_url(host: &str, realm: &str) -> String {
    format!("{}/oauth2{}/authorize", base(host), realm_path(realm))
}

pub fn access_token_url(host: &str, realm: &str) -> String {
    format!("{}/oauth2{}/access_token", base(host), realm_path(realm))
}

pub fn session_info_url(host: &str, realm: &str) -> String {
    format!(
        "{}/json{}/sessions/?_action=getSessionInfo",
        base(host),
        realm_path(realm)
    )
}

pub fn server_info_url(host: &str) -> String {
    format!("{}/json/serverinfo/*", base(host))
}

pub fn service_account_scopes_url(host: &str) -> String {
    format!("{}/environment/scopes/service-accounts", base(host))
}

pub fn redirect_uri(host: &str) -> String {
    format!("{}/platform/appAuthHelperRedirect.html", base(host))
}

/// Access-token URL with the port spelled out, the form AM expects as a JWT audience
pub fn jwt_audience(host: &str, realm: &str) -> Result<String> {
    let url = reqwest::Url::parse(&access_token_url(host, realm))
        .map_err(|e| FrodoError::Configuration(format!("Invalid host URL '{host}': {e}")))?;
    let scheme = url.scheme();
    let host_name = url
        .host_str()
        .ok_or_else(|| FrodoError::Configuration(format!("Host URL '{host}' has no host part")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| FrodoError::Configuration(format!("Host URL '{host}' has no known port")))?;
    Ok(format!("{scheme}://{host_name}:{port}{}", url.path()))
}
