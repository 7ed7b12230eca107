// Authentication flows
// Deployment detection, callback-tree session login, OAuth2 PKCE and
// JWT-bearer grants, and the auto-refresh timer

mod callbacks;
mod detect;
pub mod endpoints;
mod info;
mod jwt;
mod login;
mod oauth2;
mod refresh;
pub mod types;

pub use callbacks::OtpCallbackHandler;
pub use jwt::{build_bearer_assertion, parse_jwk, ServiceAccountJwk};
pub use login::get_fresh_sa_bearer_token;
