// Callback-tree login
// Drives the authenticate-step protocol, filling prompts round by round
// until AM hands back a session token

use std::sync::Arc;

use crate::auth::endpoints;
use crate::auth::info;
use crate::auth::types::{AuthenticateResponse, AuthenticationStep, Callback, SessionToken};
use crate::error::{FrodoError, Result};
use crate::state::SessionContext;

/// Handler a caller registers for one-time-code prompts; receives the prompt
/// text and returns the code, or `None` when no code can be supplied
pub type OtpCallbackHandler = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resubmission rounds allowed before the login is abandoned
const MAX_STEPS: usize = 3;

/// What one round of callback processing decided
#[derive(Debug)]
struct StepOutcome {
    /// The step with its inputs filled, ready to resubmit
    step: AuthenticationStep,
    need_2fa: bool,
    factor: Option<&'static str>,
    /// False when the journey demands a factor this library cannot automate
    supported: bool,
}

/// Runs the callback-tree protocol to completion and resolves the session's
/// expiry through a session-info lookup.
pub(crate) async fn run_login_rounds(
    ctx: &SessionContext,
    otp_handler: Option<&OtpCallbackHandler>,
) -> Result<SessionToken> {
    let host = ctx.require_host().await?;
    let service = ctx.authentication_service().await;
    let url = endpoints::authenticate_url(&host, "/", service.as_deref());

    let mut response = submit(ctx, &url, serde_json::json!({})).await?;
    let mut rounds = 0usize;

    loop {
        match response {
            AuthenticateResponse::Success(success) => {
                let expires = info::session_expiry(ctx, &success.token_id).await?;
                tracing::info!(
                    realm = success.realm.as_deref().unwrap_or("/"),
                    "Session login succeeded"
                );
                return Ok(SessionToken {
                    token_id: success.token_id,
                    success_url: success.success_url,
                    realm: success.realm,
                    expires,
                    from_cache: false,
                });
            }
            AuthenticateResponse::Failure(failure) => {
                return Err(FrodoError::Authentication(format!(
                    "{} ({})",
                    failure.message,
                    failure.reason.as_deref().unwrap_or("unknown")
                )));
            }
            AuthenticateResponse::Step(step) => {
                if rounds >= MAX_STEPS {
                    return Err(FrodoError::Authentication(format!(
                        "Login did not complete within {MAX_STEPS} steps"
                    )));
                }
                rounds += 1;

                let outcome = process_step(ctx, step, otp_handler).await?;
                if !outcome.supported {
                    return Err(FrodoError::UnsupportedFactor {
                        factor: outcome.factor.unwrap_or("unknown").to_string(),
                    });
                }
                if outcome.need_2fa {
                    tracing::debug!(
                        factor = outcome.factor.unwrap_or(""),
                        round = rounds,
                        "Answering second-factor challenge"
                    );
                }
                let body = serde_json::to_value(&outcome.step)
                    .map_err(|e| FrodoError::Internal(e.into()))?;
                response = submit(ctx, &url, body).await?;
            }
        }
    }
}

/// Fills the step's callbacks from the context's credentials and the OTP
/// handler. Unknown callback kinds are resubmitted untouched.
async fn process_step(
    ctx: &SessionContext,
    mut step: AuthenticationStep,
    otp_handler: Option<&OtpCallbackHandler>,
) -> Result<StepOutcome> {
    let username = ctx.username().await.unwrap_or_default();
    let password = ctx.password().await.unwrap_or_default();

    let mut need_2fa = false;
    let mut factor = None;

    for callback in &mut step.callbacks {
        match callback {
            Callback::SelectIdPCallback(body) => {
                // Only local logins are automated; leave federation journeys
                // unanswered
                if offers_local_authentication(body) {
                    body.set_input_value("localAuthentication");
                }
            }
            Callback::HiddenValueCallback(body) => {
                if body.output_contains("webauthnoutcome") {
                    return Ok(StepOutcome {
                        step,
                        need_2fa: true,
                        factor: Some("WebAuthN"),
                        supported: false,
                    });
                }
                if body.output_contains("skip") {
                    body.set_input_value("Skip");
                }
            }
            Callback::NameCallback(body) => {
                if body.output_contains("code") {
                    // One-time-code prompt, not the username field
                    need_2fa = true;
                    factor = Some("Code");
                    let handler = otp_handler.ok_or(FrodoError::MissingCallbackHandler)?;
                    let prompt = prompt_text(body).unwrap_or("Enter code");
                    let code = handler(prompt).ok_or_else(|| {
                        FrodoError::Authentication(
                            "No one-time code was provided".to_string(),
                        )
                    })?;
                    body.set_input_value(code);
                } else {
                    body.set_input_value(username.clone());
                }
            }
            Callback::PasswordCallback(body) => {
                body.set_input_value(password.clone());
            }
            Callback::TextInputCallback(_) | Callback::Other(_) => {}
        }
    }

    Ok(StepOutcome {
        step,
        need_2fa,
        factor,
        supported: true,
    })
}

fn offers_local_authentication(body: &crate::auth::types::CallbackBody) -> bool {
    body.output.iter().any(|nv| {
        nv.value
            .as_array()
            .map(|providers| {
                providers.iter().any(|p| {
                    p.get("provider").and_then(|v| v.as_str()) == Some("localAuthentication")
                })
            })
            .unwrap_or(false)
    })
}

fn prompt_text(body: &crate::auth::types::CallbackBody) -> Option<&str> {
    body.output
        .iter()
        .find(|nv| nv.name == "prompt")
        .and_then(|nv| nv.value_str())
}

async fn submit(
    ctx: &SessionContext,
    url: &str,
    body: serde_json::Value,
) -> Result<AuthenticateResponse> {
    let request = ctx
        .transport()
        .client()
        .post(url)
        .header(
            endpoints::API_VERSION_HEADER,
            endpoints::AUTHENTICATE_API_VERSION,
        )
        .json(&body)
        .build()?;
    let response = ctx.transport().execute(request).await?;
    Ok(response.json().await?)
}
