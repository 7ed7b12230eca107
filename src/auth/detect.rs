// Deployment detection
// Classifies a host as classic, cloud or forgeops by probing the OAuth2
// authorize endpoint with the well-known admin clients

use crate::auth::oauth2::{self, Pkce, CLOUD_ADMIN_CLIENT_ID, FORGEOPS_ADMIN_CLIENT_ID};
use crate::auth::types::DeploymentType;
use crate::state::SessionContext;

/// Scopes used for the detection probes; every admin client can ask for these
const PROBE_SCOPES: &[&str] = &["openid", "fr:idm:*"];

/// Determines the deployment type of the context's host, caching the result.
///
/// A context already using bearer tokens against AM APIs can only be a cloud
/// tenant. Otherwise the cloud and forgeops admin clients are probed in turn;
/// a code redirect from either identifies the deployment and pins that client
/// id on the context for the later authorization-code exchange. A host that
/// answers neither probe is classic. Probe failures are never surfaced.
pub(crate) async fn determine_deployment_type(ctx: &SessionContext) -> DeploymentType {
    if let Some(deployment_type) = ctx.deployment_type().await {
        return deployment_type;
    }

    if ctx.use_bearer_token_for_am_apis().await {
        ctx.set_deployment_type(DeploymentType::Cloud).await;
        return DeploymentType::Cloud;
    }

    let scopes: Vec<String> = PROBE_SCOPES.iter().map(|s| s.to_string()).collect();
    let candidates = [
        (CLOUD_ADMIN_CLIENT_ID, DeploymentType::Cloud),
        (FORGEOPS_ADMIN_CLIENT_ID, DeploymentType::Forgeops),
    ];

    for (client_id, deployment_type) in candidates {
        let pkce = Pkce::generate();
        match oauth2::authorize_for_code(ctx, client_id, &scopes, &pkce).await {
            Ok(Some(_)) => {
                tracing::debug!(
                    client_id,
                    deployment_type = %deployment_type,
                    "Authorize probe redirected with a code"
                );
                ctx.set_admin_client_id(client_id.to_string()).await;
                ctx.set_deployment_type(deployment_type).await;
                return deployment_type;
            }
            Ok(None) => {
                tracing::debug!(client_id, "Authorize probe did not yield a code");
            }
            Err(e) => {
                // A failed probe only means "not this kind of deployment"
                tracing::debug!(client_id, error = %e, "Authorize probe failed");
            }
        }
    }

    ctx.set_deployment_type(DeploymentType::Classic).await;
    DeploymentType::Classic
}
