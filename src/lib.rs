// frodo-auth - AM authentication and token lifecycle
//
// Detects the deployment type of an AM host, logs in through the callback
// tree (with 2FA), the OAuth2 authorization-code flow or the JWT-bearer
// grant, caches tokens in an encrypted file and keeps them fresh with a
// per-context auto-refresh timer.

pub mod auth;
pub mod cache;
pub mod error;
pub mod profile;
pub mod state;
pub mod transport;

pub use auth::types::{
    BearerToken, Callback, DeploymentType, SessionToken, TokenType, Tokens,
};
pub use auth::{get_fresh_sa_bearer_token, OtpCallbackHandler};
pub use cache::TokenCache;
pub use error::{CacheError, FrodoError, Result};
pub use profile::{ConnectionProfile, ConnectionProfileStore};
pub use state::{SessionContext, SessionContextBuilder};
