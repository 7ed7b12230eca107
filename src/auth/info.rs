// AM lookups
// Server info, session info and tenant scope queries used around the flows

use chrono::DateTime;

use crate::auth::endpoints;
use crate::auth::types::{ServerInfo, SessionInfo};
use crate::error::{FrodoError, Result};
use crate::state::SessionContext;

/// Classic default session cookie, used when server info cannot be read
pub(crate) const DEFAULT_COOKIE_NAME: &str = "iPlanetDirectoryPro";

/// Resolves the session cookie name and caches it on the context.
/// A failed lookup falls back to the classic default instead of failing
/// the login.
pub(crate) async fn resolve_cookie_name(ctx: &SessionContext) -> Result<String> {
    if let Some(name) = ctx.cookie_name().await {
        return Ok(name);
    }

    let host = ctx.require_host().await?;
    let url = endpoints::server_info_url(&host);
    let request = ctx.transport().client().get(&url).build()?;

    let name = match ctx.transport().execute(request).await {
        Ok(response) => match response.json::<ServerInfo>().await {
            Ok(info) => info.cookie_name,
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable server info, assuming default cookie name");
                DEFAULT_COOKIE_NAME.to_string()
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "Server info lookup failed, assuming default cookie name");
            DEFAULT_COOKIE_NAME.to_string()
        }
    };

    ctx.set_cookie_name(name.clone()).await;
    Ok(name)
}

/// Resolves a session's max-idle expiration as epoch milliseconds
pub(crate) async fn session_expiry(ctx: &SessionContext, token_id: &str) -> Result<i64> {
    let host = ctx.require_host().await?;
    let cookie_name = resolve_cookie_name(ctx).await?;
    let url = endpoints::session_info_url(&host, "/");

    let request = ctx
        .transport()
        .client()
        .post(&url)
        .header(endpoints::API_VERSION_HEADER, endpoints::SESSION_API_VERSION)
        .header("Cookie", format!("{cookie_name}={token_id}"))
        .json(&serde_json::json!({ "tokenId": token_id }))
        .build()?;

    let response = ctx.transport().execute(request).await?;
    let info: SessionInfo = response.json().await?;
    let expires = DateTime::parse_from_rfc3339(&info.max_idle_expiration_time).map_err(|e| {
        FrodoError::Authentication(format!(
            "Unparseable session expiration '{}': {e}",
            info.max_idle_expiration_time
        ))
    })?;
    Ok(expires.timestamp_millis())
}

/// Lists the service-account scopes the tenant can grant
pub(crate) async fn available_service_account_scopes(
    ctx: &SessionContext,
) -> Result<Vec<String>> {
    let host = ctx.require_host().await?;
    let url = endpoints::service_account_scopes_url(&host);

    let mut request = ctx.transport().client().get(&url);
    if let (Some(cookie_name), Some(session)) =
        (ctx.cookie_name().await, ctx.session_token().await)
    {
        request = request.header("Cookie", format!("{cookie_name}={}", session.token_id));
    }
    let request = request.build()?;

    let response = ctx.transport().execute(request).await?;
    Ok(response.json::<Vec<String>>().await?)
}
