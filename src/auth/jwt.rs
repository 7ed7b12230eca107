// Service-account JWT assertions
// Parses the account's RSA JWK and mints the signed RS256 bearer assertion

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::{BigUint, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FrodoError, Result};

/// Seconds an assertion stays valid; AM only needs it for one exchange
const ASSERTION_LIFETIME_SECS: i64 = 180;

/// RSA JWK as issued for AM service accounts
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountJwk {
    #[serde(default)]
    pub kty: String,
    #[serde(default)]
    pub kid: Option<String>,
    pub n: String,
    pub e: String,
    pub d: String,
    #[serde(default)]
    pub p: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
struct JwtBearerClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    jti: String,
}

fn decode_component(name: &str, value: &str) -> Result<BigUint> {
    let bytes = URL_SAFE_NO_PAD.decode(value).map_err(|e| {
        FrodoError::Configuration(format!("Service account JWK field '{name}' is not base64url: {e}"))
    })?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// Parses the JWK JSON text carried on the session context
pub fn parse_jwk(jwk_json: &str) -> Result<ServiceAccountJwk> {
    let jwk: ServiceAccountJwk = serde_json::from_str(jwk_json)
        .map_err(|e| FrodoError::Configuration(format!("Invalid service account JWK: {e}")))?;
    if !jwk.kty.is_empty() && jwk.kty != "RSA" {
        return Err(FrodoError::Configuration(format!(
            "Unsupported service account JWK key type '{}'",
            jwk.kty
        )));
    }
    Ok(jwk)
}

/// Reassembles the RSA private key from its JWK components
fn encoding_key(jwk: &ServiceAccountJwk) -> Result<EncodingKey> {
    let n = decode_component("n", &jwk.n)?;
    let e = decode_component("e", &jwk.e)?;
    let d = decode_component("d", &jwk.d)?;
    let p = jwk
        .p
        .as_deref()
        .ok_or_else(|| FrodoError::Configuration("Service account JWK is missing 'p'".to_string()))?;
    let q = jwk
        .q
        .as_deref()
        .ok_or_else(|| FrodoError::Configuration("Service account JWK is missing 'q'".to_string()))?;
    let primes = vec![decode_component("p", p)?, decode_component("q", q)?];

    let private_key = RsaPrivateKey::from_components(n, e, d, primes)
        .map_err(|e| FrodoError::Configuration(format!("Service account JWK is not a valid RSA key: {e}")))?;
    let pem = private_key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| FrodoError::Internal(anyhow::anyhow!("Failed to encode RSA key: {e}")))?;
    EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| FrodoError::Internal(anyhow::anyhow!("Failed to build signing key: {e}")))
}

/// Mints the signed JWT-bearer assertion for a service account.
/// `iss` and `sub` are the account id, `aud` the access_token endpoint with
/// an explicit port, `jti` a fresh UUID.
pub fn build_bearer_assertion(sa_id: &str, jwk_json: &str, audience: &str) -> Result<String> {
    let jwk = parse_jwk(jwk_json)?;
    let key = encoding_key(&jwk)?;

    let claims = JwtBearerClaims {
        iss: sa_id.to_string(),
        sub: sa_id.to_string(),
        aud: audience.to_string(),
        exp: Utc::now().timestamp() + ASSERTION_LIFETIME_SECS,
        jti: Uuid::new_v4().to_string(),
    };

    let mut header = Header::new(Algorithm::RS256);
    header.kid = jwk.kid.clone();

    encode(&header, &claims, &key)
        .map_err(|e| FrodoError::Internal(anyhow::anyhow!("Failed to sign assertion: {e}")))
}
