// Authentication wire types
// Shapes exchanged with the AM authenticate, OAuth2 and session endpoints

use serde::{Deserialize, Serialize};

use crate::error::FrodoError;

/// Kind of AM deployment a host resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentType {
    /// Self-hosted AM with session-cookie admin APIs
    Classic,
    /// Identity Cloud tenant
    Cloud,
    /// ForgeOps (CDK/CDM) deployment
    Forgeops,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Classic => "classic",
            DeploymentType::Cloud => "cloud",
            DeploymentType::Forgeops => "forgeops",
        }
    }

    /// Realm used when the caller never set one
    pub fn default_realm(&self) -> &'static str {
        match self {
            DeploymentType::Cloud => "alpha",
            _ => "/",
        }
    }
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentType {
    type Err = FrodoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "classic" => Ok(DeploymentType::Classic),
            "cloud" => Ok(DeploymentType::Cloud),
            "forgeops" => Ok(DeploymentType::Forgeops),
            other => Err(FrodoError::Configuration(format!(
                "Unknown deployment type '{other}'"
            ))),
        }
    }
}

/// Kind of token held in the cache, keyed by its stable wire name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    UserSession,
    UserBearer,
    SaBearer,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::UserSession => "userSessionToken",
            TokenType::UserBearer => "userBearerToken",
            TokenType::SaBearer => "saBearerToken",
        }
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single name/value slot inside a callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl NameValue {
    pub fn value_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Output/input slot pairs shared by every callback kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackBody {
    #[serde(default)]
    pub output: Vec<NameValue>,
    #[serde(default)]
    pub input: Vec<NameValue>,
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl CallbackBody {
    /// Sets the first input slot, the one AM reads the answer from
    pub fn set_input_value(&mut self, value: impl Into<serde_json::Value>) {
        if let Some(slot) = self.input.first_mut() {
            slot.value = value.into();
        }
    }

    /// True when any output slot's string value contains `needle` (case-insensitive)
    pub fn output_contains(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.output.iter().any(|nv| {
            nv.value_str()
                .map(|v| v.to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
    }
}

/// One callback of an authentication step, dispatched on the AM `type` tag
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Callback {
    NameCallback(CallbackBody),
    PasswordCallback(CallbackBody),
    TextInputCallback(CallbackBody),
    HiddenValueCallback(CallbackBody),
    SelectIdPCallback(CallbackBody),
    /// Any callback kind this library does not act on; resubmitted verbatim
    #[serde(untagged)]
    Other(serde_json::Value),
}

/// One round of the callback-tree protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationStep {
    pub auth_id: String,
    #[serde(default)]
    pub callbacks: Vec<Callback>,
}

/// Terminal authenticate response carrying the session token
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenResponse {
    pub token_id: String,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub realm: Option<String>,
}

/// Error-shaped authenticate response
#[derive(Debug, Clone, Deserialize)]
pub struct AmFailure {
    pub code: u16,
    #[serde(default)]
    pub reason: Option<String>,
    pub message: String,
}

/// Everything a 200 from the authenticate endpoint can decode to
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AuthenticateResponse {
    Success(SessionTokenResponse),
    Step(AuthenticationStep),
    Failure(AmFailure),
}

/// Session token plus its resolved lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub token_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    /// Epoch milliseconds the session stops being usable
    pub expires: i64,
    #[serde(skip)]
    pub from_cache: bool,
}

/// OAuth2 access_token response body
#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Bearer token plus its resolved lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BearerToken {
    pub access_token: String,
    pub token_type: String,
    /// Seconds of validity as reported by the token endpoint
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Epoch milliseconds the token stops being usable
    pub expires: i64,
    #[serde(skip)]
    pub from_cache: bool,
}

impl BearerToken {
    /// Builds a bearer token from a token-endpoint response received at `now` (epoch ms)
    pub fn from_response(response: AccessTokenResponse, now: i64) -> Self {
        BearerToken {
            expires: now + response.expires_in * 1000,
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_in: response.expires_in,
            scope: response.scope,
            from_cache: false,
        }
    }
}

/// Result of a completed `get_tokens` call
#[derive(Debug, Clone)]
pub struct Tokens {
    pub bearer_token: Option<BearerToken>,
    pub user_session_token: Option<SessionToken>,
    /// Username or service account id the tokens belong to
    pub subject: String,
    pub host: String,
    pub realm: String,
}

/// Subset of `GET /json/serverinfo/*` this library reads
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub cookie_name: String,
}

/// Subset of the getSessionInfo response this library reads
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub max_idle_expiration_time: String,
    #[serde(default)]
    pub username: Option<String>,
}
