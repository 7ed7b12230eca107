// Login orchestration
// Picks and runs the credential flow for a context, consulting the token
// cache first and arming the refresh timer afterwards

use crate::auth::callbacks::{self, OtpCallbackHandler};
use crate::auth::detect;
use crate::auth::endpoints;
use crate::auth::info;
use crate::auth::jwt;
use crate::auth::oauth2::{
    self, Pkce, CLOUD_ADMIN_CLIENT_ID, DEFAULT_SERVICE_ACCOUNT_SCOPE, FORGEOPS_ADMIN_CLIENT_ID,
};
use crate::auth::types::{BearerToken, DeploymentType, SessionToken, TokenType, Tokens};
use crate::cache::TokenCache;
use crate::error::{CacheError, FrodoError, Result};
use crate::profile::ConnectionProfile;
use crate::state::SessionContext;

impl SessionContext {
    /// Obtains valid tokens for this context, logging in as needed.
    ///
    /// Service-account credentials win over username/password unless
    /// `force_login_as_user` is set. When `allowed_types` is non-empty, a
    /// deployment type outside it fails the call; a type known up front
    /// fails before any network traffic. `auto_refresh` arms a timer that
    /// re-runs this login shortly before the earliest token expiry.
    pub async fn get_tokens(
        &self,
        force_login_as_user: bool,
        auto_refresh: bool,
        allowed_types: &[DeploymentType],
        otp_handler: Option<OtpCallbackHandler>,
    ) -> Result<Tokens> {
        let host = self.require_host().await?;
        resolve_credentials(self, &host).await?;

        if let Some(deployment_type) = self.deployment_type().await {
            check_allowed(deployment_type, allowed_types)?;
        }
        let first_connect = self.deployment_type().await.is_none();

        info::resolve_cookie_name(self).await?;

        let cache = open_cache(self).await;

        let sa_ready = self.service_account_id().await.is_some()
            && self.service_account_jwk().await.is_some();
        let user_ready = self.username().await.is_some() && self.password().await.is_some();
        let cloud_or_unknown = matches!(
            self.deployment_type().await,
            None | Some(DeploymentType::Cloud)
        );

        let (bearer_token, user_session_token, subject) =
            if !force_login_as_user && cloud_or_unknown && sa_ready {
                let (token, subject) = service_account_login(self, cache.as_ref()).await?;
                check_allowed(DeploymentType::Cloud, allowed_types)?;
                (Some(token), None, subject)
            } else if user_ready {
                let (bearer, session, subject) =
                    user_login(self, cache.as_ref(), allowed_types, otp_handler.as_ref())
                        .await?;
                (bearer, Some(session), subject)
            } else {
                return Err(FrodoError::Configuration(
                    "Incomplete or no credentials".to_string(),
                ));
            };

        // Deployment type is settled by now; realm defaults follow it
        let deployment_type = detect::determine_deployment_type(self).await;
        if !self.realm_is_set().await {
            self.set_realm(deployment_type.default_realm().to_string())
                .await;
        }

        if first_connect {
            save_connection_profile(self, &host).await;
        }

        crate::auth::refresh::schedule_auto_refresh(self, force_login_as_user, auto_refresh)
            .await;

        Ok(Tokens {
            bearer_token,
            user_session_token,
            subject,
            host,
            realm: self.realm().await,
        })
    }
}

/// JWT-bearer grant for service accounts, cache first
async fn service_account_login(
    ctx: &SessionContext,
    cache: Option<&TokenCache>,
) -> Result<(BearerToken, String)> {
    let sa_id = ctx.service_account_id().await.ok_or_else(|| {
        FrodoError::Configuration("Service account id is required".to_string())
    })?;

    let cached = match cache {
        Some(cache) => read_cached_bearer(cache, ctx, TokenType::SaBearer).await,
        None => None,
    };

    let token = match cached {
        Some(token) => token,
        None => {
            let token = get_fresh_sa_bearer_token(ctx).await?;
            if let Some(cache) = cache {
                cache.save_bearer_token(ctx, TokenType::SaBearer, &token).await;
            }
            token
        }
    };

    ctx.set_bearer_token(token.clone()).await;
    ctx.set_use_bearer_token_for_am_apis(true).await;
    ctx.set_deployment_type(DeploymentType::Cloud).await;
    tracing::info!(service_account = %sa_id, from_cache = token.from_cache, "Service account authenticated");
    Ok((token, sa_id))
}

/// Exchanges a freshly signed JWT assertion for a bearer token. An
/// `invalid_scope` rejection naming specific scopes is retried once with
/// those scopes removed; any other failure is surfaced as-is.
pub async fn get_fresh_sa_bearer_token(ctx: &SessionContext) -> Result<BearerToken> {
    let host = ctx.require_host().await?;
    let sa_id = ctx.service_account_id().await.ok_or_else(|| {
        FrodoError::Configuration("Service account id is required".to_string())
    })?;
    let jwk = ctx.service_account_jwk().await.ok_or_else(|| {
        FrodoError::Configuration("Service account JWK is required".to_string())
    })?;
    let audience = endpoints::jwt_audience(&host, "/")?;

    let scopes: Vec<&str> = DEFAULT_SERVICE_ACCOUNT_SCOPE.split(' ').collect();
    let assertion = jwt::build_bearer_assertion(&sa_id, &jwk, &audience)?;
    match oauth2::exchange_jwt_bearer(ctx, &assertion, &scopes.join(" ")).await {
        Ok(token) => Ok(token),
        Err(FrodoError::Am {
            error, description, ..
        }) if error == "invalid_scope" => {
            let retained: Vec<&str> = scopes
                .into_iter()
                .filter(|scope| !description.contains(scope))
                .collect();
            if retained.is_empty() {
                return Err(FrodoError::Authentication(format!(
                    "Tenant rejected every requested scope: {description}"
                )));
            }
            tracing::info!(
                scope = retained.join(" "),
                "Retrying grant without the scopes the tenant rejected"
            );
            // Assertions are single-use, sign a fresh one
            let assertion = jwt::build_bearer_assertion(&sa_id, &jwk, &audience)?;
            oauth2::exchange_jwt_bearer(ctx, &assertion, &retained.join(" ")).await
        }
        Err(e) => Err(e),
    }
}

/// Session login via the callback tree, plus the PKCE authorization-code
/// exchange on cloud and forgeops deployments. Both tokens are cache first.
async fn user_login(
    ctx: &SessionContext,
    cache: Option<&TokenCache>,
    allowed_types: &[DeploymentType],
    otp_handler: Option<&OtpCallbackHandler>,
) -> Result<(Option<BearerToken>, SessionToken, String)> {
    let username = ctx
        .username()
        .await
        .ok_or_else(|| FrodoError::Configuration("Username is required".to_string()))?;

    let cached = match cache {
        Some(cache) => match cache.read_session_token(ctx).await {
            Ok(token) => Some(token),
            Err(CacheError::NotFound) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Session token cache read failed, logging in");
                None
            }
        },
        None => None,
    };

    let session_token = match cached {
        Some(token) => token,
        None => callbacks::run_login_rounds(ctx, otp_handler).await?,
    };
    ctx.set_session_token(session_token.clone()).await;
    if !session_token.from_cache {
        if let Some(cache) = cache {
            cache.save_session_token(ctx, &session_token).await;
        }
    }
    tracing::info!(
        username = %username,
        from_cache = session_token.from_cache,
        "User session established"
    );

    // Detection needs the session cookie the login just produced
    let deployment_type = detect::determine_deployment_type(ctx).await;
    check_allowed(deployment_type, allowed_types)?;

    let bearer_token = match deployment_type {
        DeploymentType::Classic => None,
        DeploymentType::Cloud | DeploymentType::Forgeops => {
            let cached = match cache {
                Some(cache) => read_cached_bearer(cache, ctx, TokenType::UserBearer).await,
                None => None,
            };
            let token = match cached {
                Some(token) => token,
                None => {
                    let token = user_bearer_token(ctx, deployment_type).await?;
                    if let Some(cache) = cache {
                        cache
                            .save_bearer_token(ctx, TokenType::UserBearer, &token)
                            .await;
                    }
                    token
                }
            };
            ctx.set_bearer_token(token.clone()).await;
            Some(token)
        }
    };

    Ok((bearer_token, session_token, username))
}

/// PKCE authorization-code exchange using the admin client matched during
/// detection (or the deployment's well-known one when the type was pinned)
async fn user_bearer_token(
    ctx: &SessionContext,
    deployment_type: DeploymentType,
) -> Result<BearerToken> {
    let client_id = match ctx.admin_client_id().await {
        Some(client_id) => client_id,
        None => {
            let client_id = match deployment_type {
                DeploymentType::Cloud => CLOUD_ADMIN_CLIENT_ID,
                _ => FORGEOPS_ADMIN_CLIENT_ID,
            };
            ctx.set_admin_client_id(client_id.to_string()).await;
            client_id.to_string()
        }
    };

    let scopes = oauth2::admin_scopes(ctx, deployment_type).await;
    let pkce = Pkce::generate();
    let code = oauth2::authorize_for_code(ctx, &client_id, &scopes, &pkce)
        .await?
        .ok_or_else(|| {
            FrodoError::Authentication(
                "Authorize endpoint did not return an authorization code".to_string(),
            )
        })?;
    oauth2::exchange_code(ctx, &client_id, &code, &pkce.verifier).await
}

/// Pulls credentials from the profile store when the context has none
async fn resolve_credentials(ctx: &SessionContext, host: &str) -> Result<()> {
    let user_ready = ctx.username().await.is_some() && ctx.password().await.is_some();
    let sa_ready = ctx.service_account_id().await.is_some()
        && ctx.service_account_jwk().await.is_some();
    if user_ready || sa_ready {
        return Ok(());
    }

    let incomplete =
        || FrodoError::Configuration("Incomplete or no credentials".to_string());
    let store = ctx.profile_store().ok_or_else(incomplete)?;
    let profile = store.load(host).ok_or_else(incomplete)?;
    tracing::debug!(host, "Filling missing credentials from the connection profile");

    if profile.service_account_id.is_some() && profile.service_account_jwk.is_some() {
        ctx.set_service_account(profile.service_account_id, profile.service_account_jwk)
            .await;
    } else if profile.username.is_some() && profile.password.is_some() {
        ctx.set_user_credentials(profile.username, profile.password)
            .await;
    } else {
        return Err(incomplete());
    }

    if ctx.authentication_service().await.is_none() {
        ctx.set_authentication_service(profile.authentication_service)
            .await;
    }
    if ctx.deployment_type().await.is_none() {
        if let Some(deployment_type) = profile
            .deployment_type
            .as_deref()
            .and_then(|s| s.parse().ok())
        {
            ctx.set_deployment_type(deployment_type).await;
        }
    }
    Ok(())
}

/// Records the connection after a first successful auto-detected login.
/// Failures never fail the login.
async fn save_connection_profile(ctx: &SessionContext, host: &str) {
    let Some(store) = ctx.profile_store() else {
        return;
    };
    let profile = ConnectionProfile {
        host: host.to_string(),
        username: ctx.username().await,
        password: ctx.password().await,
        service_account_id: ctx.service_account_id().await,
        service_account_jwk: ctx.service_account_jwk().await,
        authentication_service: ctx.authentication_service().await,
        deployment_type: ctx.deployment_type().await.map(|d| d.to_string()),
    };
    if let Err(e) = store.save(&profile) {
        tracing::warn!(error = %e, host, "Could not save connection profile");
    }
}

fn check_allowed(
    deployment_type: DeploymentType,
    allowed_types: &[DeploymentType],
) -> Result<()> {
    if allowed_types.is_empty() || allowed_types.contains(&deployment_type) {
        return Ok(());
    }
    Err(FrodoError::UnsupportedDeploymentType {
        deployment_type: deployment_type.to_string(),
        allowed: allowed_types
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

async fn open_cache(ctx: &SessionContext) -> Option<TokenCache> {
    if !ctx.use_token_cache().await {
        return None;
    }
    match TokenCache::for_context(ctx).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            tracing::warn!(error = %e, "Token cache unavailable, continuing without it");
            None
        }
    }
}

/// Cache probe that treats any failure as a miss
async fn read_cached_bearer(
    cache: &TokenCache,
    ctx: &SessionContext,
    token_type: TokenType,
) -> Option<BearerToken> {
    match cache.read_bearer_token(ctx, token_type).await {
        Ok(token) => Some(token),
        Err(CacheError::NotFound) => None,
        Err(e) => {
            tracing::debug!(token_type = %token_type, error = %e, "Bearer token cache read failed");
            None
        }
    }
}
