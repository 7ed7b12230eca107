// Auto refresh
// One cancellable timer per session context that re-runs the login shortly
// before the earliest relevant token expiry

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;

use crate::auth::types::DeploymentType;
use crate::state::SessionContext;

/// Fire this long before the earliest expiry (ms)
const REFRESH_MARGIN_MS: i64 = 25_000;
/// Timeouts below this are clamped so near-expiry tokens still refresh (ms)
const CLAMP_THRESHOLD_MS: i64 = 30_000;
/// Floor for clamped timeouts (ms)
const MIN_TIMEOUT_MS: i64 = 10;

/// Arms (or disarms) the refresh timer for the context. Any previous timer
/// is cancelled first; there is never more than one pending per context.
pub(crate) fn schedule_auto_refresh<'a>(
    ctx: &'a SessionContext,
    force_login_as_user: bool,
    auto_refresh: bool,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    // Boxed with an explicit `Send` bound so the compiler can resolve the
    // async recursion through the spawned refresh task
    Box::pin(async move {
    ctx.swap_refresh_task(None).await;
    if !auto_refresh {
        return;
    }

    let session_expires = ctx.session_token().await.map(|t| t.expires);
    let bearer_expires = ctx.bearer_token().await.map(|t| t.expires);
    let expires = match next_expiry(
        ctx.deployment_type().await,
        ctx.use_bearer_token_for_am_apis().await,
        session_expires,
        bearer_expires,
    ) {
        Some(expires) => expires,
        None => {
            tracing::debug!("No token expiry to refresh against");
            return;
        }
    };

    let timeout = refresh_timeout_ms(expires, Utc::now().timestamp_millis());
    tracing::debug!(timeout_ms = timeout, expires, "Auto-refresh timer armed");

    let task_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(timeout as u64)).await;
        // Hand the slot back before logging in again; get_tokens will arm
        // the next timer
        task_ctx.clear_refresh_task().await;
        tracing::debug!("Refreshing tokens");
        if let Err(e) = task_ctx
            .get_tokens(force_login_as_user, true, &[], None)
            .await
        {
            tracing::warn!(error = %e, "Token auto-refresh failed");
        }
    });
    ctx.swap_refresh_task(Some(task)).await;
    })
}

/// The expiry the next refresh must beat. Classic deployments only carry a
/// session; a cloud service account only carries a bearer token; everything
/// else refreshes against whichever of the two expires first.
fn next_expiry(
    deployment_type: Option<DeploymentType>,
    use_sa_bearer: bool,
    session_expires: Option<i64>,
    bearer_expires: Option<i64>,
) -> Option<i64> {
    match deployment_type {
        Some(DeploymentType::Classic) => session_expires,
        Some(DeploymentType::Cloud) if use_sa_bearer => bearer_expires,
        _ => match (session_expires, bearer_expires) {
            (Some(session), Some(bearer)) => Some(session.min(bearer)),
            (session, bearer) => session.or(bearer),
        },
    }
}

/// Milliseconds until the refresh should run. Anything below the clamp
/// threshold refreshes almost immediately instead of being skipped.
fn refresh_timeout_ms(expires: i64, now: i64) -> i64 {
    let timeout = expires - now - REFRESH_MARGIN_MS;
    if timeout < CLAMP_THRESHOLD_MS {
        timeout.max(MIN_TIMEOUT_MS)
    } else {
        timeout
    }
}
