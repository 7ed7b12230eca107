// Token cache
// Encrypted file-backed store of session and bearer tokens, keyed by
// uuid-v5 hashes of host, realm, token type and subject

mod crypto;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::auth::types::{BearerToken, SessionToken, TokenType};
use crate::error::CacheError;
use crate::state::SessionContext;

/// Namespace for uuid-v5 key hashing; fixed so cache files stay readable
/// across releases
const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x7c9e_6679_7425_40de_944b_e07f_c1f9_0ae7);

/// Tokens expiring within this margin are treated as absent (ms)
const VALIDITY_MARGIN_MS: i64 = 30_000;

/// Entries stay readable this long past expiry before purge removes them (ms)
const PURGE_GRACE_MS: i64 = 60_000;

type ExpiryMap = BTreeMap<String, CacheEntry>;
type SubjectMap = BTreeMap<String, ExpiryMap>;
type TypeMap = BTreeMap<String, SubjectMap>;
type RealmMap = BTreeMap<String, TypeMap>;
type HostMap = BTreeMap<String, RealmMap>;

/// One stored token version under its expiry key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    checksum: String,
    token: String,
}

/// Hashed key path plus the secret that decrypts entries under it
struct KeyMaterial {
    host_key: String,
    realm_key: String,
    type_key: String,
    subject_key: String,
    secret: String,
}

fn hash_key(input: &str) -> String {
    Uuid::new_v5(&KEY_NAMESPACE, input.as_bytes()).to_string()
}

/// Resolves the key path for a context/token-type pair.
/// User token types require username and password, the service-account type
/// requires the account id and JWK; anything missing is an explicit error.
async fn key_material(
    ctx: &SessionContext,
    token_type: TokenType,
) -> Result<KeyMaterial, CacheError> {
    let host = ctx
        .host()
        .await
        .ok_or_else(|| CacheError::Subject("no host on context".to_string()))?;

    let (subject, secret) = match token_type {
        TokenType::UserSession | TokenType::UserBearer => {
            let username = ctx
                .username()
                .await
                .ok_or_else(|| CacheError::Subject("no username on context".to_string()))?;
            let password = ctx
                .password()
                .await
                .ok_or_else(|| CacheError::Subject("no password on context".to_string()))?;
            (username, password)
        }
        TokenType::SaBearer => {
            let sa_id = ctx.service_account_id().await.ok_or_else(|| {
                CacheError::Subject("no service account id on context".to_string())
            })?;
            let jwk = ctx.service_account_jwk().await.ok_or_else(|| {
                CacheError::Subject("no service account JWK on context".to_string())
            })?;
            (sa_id, jwk)
        }
    };

    Ok(KeyMaterial {
        host_key: hash_key(&host),
        // Flows authenticate against the root realm, so that is the only
        // realm keyed today
        realm_key: hash_key("/"),
        type_key: hash_key(token_type.as_str()),
        subject_key: hash_key(&subject),
        secret,
    })
}

/// Encrypted token cache at a fixed file path
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    /// Opens the cache at `path`, creating the directory if needed and
    /// eagerly purging expired entries
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache = TokenCache { path: path.into() };
        if let Some(dir) = cache.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        if cache.path.exists() {
            cache.purge()?;
        }
        Ok(cache)
    }

    /// Opens the cache at the location configured on the context
    pub async fn for_context(ctx: &SessionContext) -> Result<Self, CacheError> {
        Self::open(ctx.token_cache_path().await)
    }

    /// True when a decryptable, still-valid token exists for this pair
    pub async fn has_token(&self, ctx: &SessionContext, token_type: TokenType) -> bool {
        match self.read_value(ctx, token_type).await {
            Ok(_) => true,
            Err(CacheError::NotFound) => false,
            Err(e) => {
                tracing::debug!(token_type = %token_type, error = %e, "Token cache probe failed");
                false
            }
        }
    }

    /// Reads the cached user session token
    pub async fn read_session_token(
        &self,
        ctx: &SessionContext,
    ) -> Result<SessionToken, CacheError> {
        let value = self.read_value(ctx, TokenType::UserSession).await?;
        let mut token: SessionToken = serde_json::from_value(value)?;
        token.from_cache = true;
        tracing::debug!(token_type = %TokenType::UserSession, "Token cache hit");
        Ok(token)
    }

    /// Reads a cached bearer token of the given type
    pub async fn read_bearer_token(
        &self,
        ctx: &SessionContext,
        token_type: TokenType,
    ) -> Result<BearerToken, CacheError> {
        let value = self.read_value(ctx, token_type).await?;
        let mut token: BearerToken = serde_json::from_value(value)?;
        token.from_cache = true;
        tracing::debug!(token_type = %token_type, "Token cache hit");
        Ok(token)
    }

    /// Caches a session token. Failures are logged, never propagated.
    pub async fn save_session_token(&self, ctx: &SessionContext, token: &SessionToken) -> bool {
        self.save(ctx, TokenType::UserSession, token, token.expires)
            .await
    }

    /// Caches a bearer token under the given type. Failures are logged, never propagated.
    pub async fn save_bearer_token(
        &self,
        ctx: &SessionContext,
        token_type: TokenType,
        token: &BearerToken,
    ) -> bool {
        self.save(ctx, token_type, token, token.expires).await
    }

    /// Removes entries past their expiry grace period, pruning branches
    /// that end up empty
    pub fn purge(&self) -> Result<(), CacheError> {
        let mut tree = self.load_tree()?;
        let before = leaf_count(&tree);
        purge_tree(&mut tree, Utc::now().timestamp_millis());
        let removed = before - leaf_count(&tree);
        if removed > 0 {
            tracing::debug!(removed, "Purged expired token cache entries");
            self.persist(&tree)?;
        }
        Ok(())
    }

    /// Drops every cached token. Failures are logged, never propagated.
    pub fn flush(&self) -> bool {
        match self.persist(&HostMap::new()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to flush token cache");
                false
            }
        }
    }

    async fn read_value(
        &self,
        ctx: &SessionContext,
        token_type: TokenType,
    ) -> Result<serde_json::Value, CacheError> {
        let km = key_material(ctx, token_type).await?;
        let tree = self.load_tree()?;
        let expiries = tree
            .get(&km.host_key)
            .and_then(|realms| realms.get(&km.realm_key))
            .and_then(|types| types.get(&km.type_key))
            .and_then(|subjects| subjects.get(&km.subject_key))
            .ok_or(CacheError::NotFound)?;

        // Newest version wins; older ones linger until purge
        let (expiry, entry) = expiries
            .iter()
            .filter_map(|(k, v)| k.parse::<i64>().ok().map(|e| (e, v)))
            .max_by_key(|(e, _)| *e)
            .ok_or(CacheError::NotFound)?;

        if expiry - Utc::now().timestamp_millis() <= VALIDITY_MARGIN_MS {
            return Err(CacheError::NotFound);
        }

        let key = crypto::derive_key(&km.secret)?;
        let plaintext = crypto::decrypt(&key, &entry.token)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn save<T: Serialize>(
        &self,
        ctx: &SessionContext,
        token_type: TokenType,
        token: &T,
        expires: i64,
    ) -> bool {
        match self.save_inner(ctx, token_type, token, expires).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(token_type = %token_type, error = %e, "Failed to cache token");
                false
            }
        }
    }

    async fn save_inner<T: Serialize>(
        &self,
        ctx: &SessionContext,
        token_type: TokenType,
        token: &T,
        expires: i64,
    ) -> Result<(), CacheError> {
        let km = key_material(ctx, token_type).await?;
        let json = serde_json::to_string(token)?;
        let checksum = hex::encode(Sha256::digest(json.as_bytes()));

        let mut tree = self.load_tree()?;

        let already_cached = tree
            .get(&km.host_key)
            .and_then(|realms| realms.get(&km.realm_key))
            .and_then(|types| types.get(&km.type_key))
            .and_then(|subjects| subjects.get(&km.subject_key))
            .map(|expiries| expiries.values().any(|e| e.checksum == checksum))
            .unwrap_or(false);
        if already_cached {
            tracing::debug!(token_type = %token_type, "Token already cached, skipping write");
            return Ok(());
        }

        purge_tree(&mut tree, Utc::now().timestamp_millis());

        let key = crypto::derive_key(&km.secret)?;
        let payload = crypto::encrypt(&key, json.as_bytes())?;
        tree.entry(km.host_key)
            .or_default()
            .entry(km.realm_key)
            .or_default()
            .entry(km.type_key)
            .or_default()
            .entry(km.subject_key)
            .or_default()
            .insert(
                expires.to_string(),
                CacheEntry {
                    checksum,
                    token: payload,
                },
            );

        self.persist(&tree)?;
        tracing::debug!(token_type = %token_type, expires, "Token cached");
        Ok(())
    }

    fn load_tree(&self) -> Result<HostMap, CacheError> {
        if !self.path.exists() {
            return Ok(HostMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        match serde_json::from_str(&content) {
            Ok(tree) => Ok(tree),
            Err(e) => {
                // A corrupt cache only costs re-logins; start over
                tracing::warn!(path = %self.path.display(), error = %e, "Token cache unreadable, starting empty");
                Ok(HostMap::new())
            }
        }
    }

    /// Writes the tree to a temp file and renames it into place, so the
    /// cache file is never observed half-written
    fn persist(&self, tree: &HostMap) -> Result<(), CacheError> {
        let content = serde_json::to_string(tree)?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(crate::state::DEFAULT_CACHE_FILE);
        let tmp_path = dir.join(format!(
            ".{}.tmp.{}",
            file_name,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));

        let write_result = (|| -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
            }

            std::fs::rename(&tmp_path, &self.path)?;

            if let Ok(parent) = std::fs::File::open(&dir) {
                let _ = parent.sync_all();
            }

            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(CacheError::Io(err));
        }
        Ok(())
    }
}

fn purge_tree(tree: &mut HostMap, now: i64) {
    tree.retain(|_, realms| {
        realms.retain(|_, types| {
            types.retain(|_, subjects| {
                subjects.retain(|_, expiries| {
                    expiries.retain(|expiry, _| {
                        // Unparseable expiry keys are dropped with the rest
                        expiry
                            .parse::<i64>()
                            .map(|e| now <= e + PURGE_GRACE_MS)
                            .unwrap_or(false)
                    });
                    !expiries.is_empty()
                });
                !subjects.is_empty()
            });
            !types.is_empty()
        });
        !realms.is_empty()
    });
}

fn leaf_count(tree: &HostMap) -> usize {
    tree.values()
        .flat_map(|realms| realms.values())
        .flat_map(|types| types.values())
        .flat_map(|subjects| subjects.values())
        .map(|expiries| expiries.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_context(dir: &std::path::Path) -> SessionContext {
        SessionContext::builder()
            .host("https://openam.example.com/am")
            .username("alice")
            .password("s3cr3t")
            .token_cache_path(dir.join("TokenCache.json"))
            .build()
            .unwrap()
    }

    fn session_token(expires: i64) -> SessionToken {
        SessionToken {
            token_id: "abc123".to_string(),
            success_url: Some("/console".to_string()),
            realm: Some("/".to_string()),
            expires,
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn test_session_token_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = user_context(dir.path());
        let cache = TokenCache::for_context(&ctx).await.unwrap();

        let token = session_token(Utc::now().timestamp_millis() + 600_000);
        assert!(cache.save_session_token(&ctx, &token).await);

        let loaded = cache.read_session_token(&ctx).await.unwrap();
        assert!(loaded.from_cache);
        assert_eq!(loaded.token_id, token.token_id);
        assert_eq!(loaded.expires, token.expires);
        assert!(cache.has_token(&ctx, TokenType::UserSession).await);
    }

    #[tokio::test]
    async fn test_bearer_token_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = user_context(dir.path());
        let cache = TokenCache::for_context(&ctx).await.unwrap();

        let token = BearerToken {
            access_token: "at-1".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            scope: Some("openid fr:idm:*".to_string()),
            expires: Utc::now().timestamp_millis() + 3_600_000,
            from_cache: false,
        };
        assert!(cache.save_bearer_token(&ctx, TokenType::UserBearer, &token).await);

        let loaded = cache
            .read_bearer_token(&ctx, TokenType::UserBearer)
            .await
            .unwrap();
        assert!(loaded.from_cache);
        assert_eq!(loaded.access_token, "at-1");
        // Session slot stays empty
        assert!(!cache.has_token(&ctx, TokenType::UserSession).await);
    }

    #[tokio::test]
    async fn test_read_rejects_token_inside_validity_margin() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = user_context(dir.path());
        let cache = TokenCache::for_context(&ctx).await.unwrap();

        // Valid for 10 more seconds, below the 30 second margin
        let token = session_token(Utc::now().timestamp_millis() + 10_000);
        assert!(cache.save_session_token(&ctx, &token).await);

        assert!(matches!(
            cache.read_session_token(&ctx).await,
            Err(CacheError::NotFound)
        ));
        assert!(!cache.has_token(&ctx, TokenType::UserSession).await);
    }

    #[tokio::test]
    async fn test_purge_removes_expired_and_prunes_branches() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = user_context(dir.path());
        let cache = TokenCache::for_context(&ctx).await.unwrap();

        let token = session_token(Utc::now().timestamp_millis() - 61_000);
        assert!(cache.save_session_token(&ctx, &token).await);

        cache.purge().unwrap();

        assert!(matches!(
            cache.read_session_token(&ctx).await,
            Err(CacheError::NotFound)
        ));

        // Empty branches are pruned all the way up
        let content = std::fs::read_to_string(dir.path().join("TokenCache.json")).unwrap();
        assert_eq!(content, "{}");
    }

    #[tokio::test]
    async fn test_save_is_idempotent_by_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = user_context(dir.path());
        let cache = TokenCache::for_context(&ctx).await.unwrap();

        let token = session_token(Utc::now().timestamp_millis() + 600_000);
        assert!(cache.save_session_token(&ctx, &token).await);
        assert!(cache.save_session_token(&ctx, &token).await);

        let content = std::fs::read_to_string(dir.path().join("TokenCache.json")).unwrap();
        let tree: HostMap = serde_json::from_str(&content).unwrap();
        assert_eq!(leaf_count(&tree), 1);
    }

    #[tokio::test]
    async fn test_read_picks_latest_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = user_context(dir.path());
        let cache = TokenCache::for_context(&ctx).await.unwrap();

        let now = Utc::now().timestamp_millis();
        let older = session_token(now + 300_000);
        let mut newer = session_token(now + 900_000);
        newer.token_id = "def456".to_string();

        assert!(cache.save_session_token(&ctx, &older).await);
        assert!(cache.save_session_token(&ctx, &newer).await);

        let loaded = cache.read_session_token(&ctx).await.unwrap();
        assert_eq!(loaded.token_id, "def456");
    }

    #[tokio::test]
    async fn test_missing_subject_is_explicit_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SessionContext::builder()
            .host("https://openam.example.com/am")
            .token_cache_path(dir.path().join("TokenCache.json"))
            .build()
            .unwrap();
        let cache = TokenCache::for_context(&ctx).await.unwrap();

        assert!(matches!(
            cache.read_session_token(&ctx).await,
            Err(CacheError::Subject(_))
        ));
        assert!(matches!(
            cache.read_bearer_token(&ctx, TokenType::SaBearer).await,
            Err(CacheError::Subject(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_secret_cannot_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = user_context(dir.path());
        let cache = TokenCache::for_context(&ctx).await.unwrap();

        let token = session_token(Utc::now().timestamp_millis() + 600_000);
        assert!(cache.save_session_token(&ctx, &token).await);

        ctx.set_user_credentials(Some("alice".to_string()), Some("wrong".to_string()))
            .await;
        assert!(matches!(
            cache.read_session_token(&ctx).await,
            Err(CacheError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_empties_cache() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = user_context(dir.path());
        let cache = TokenCache::for_context(&ctx).await.unwrap();

        let token = session_token(Utc::now().timestamp_millis() + 600_000);
        assert!(cache.save_session_token(&ctx, &token).await);
        assert!(cache.flush());

        assert!(!cache.has_token(&ctx, TokenType::UserSession).await);
    }

    #[tokio::test]
    async fn test_corrupt_cache_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TokenCache.json");
        std::fs::write(&path, "not json at all").unwrap();

        let ctx = user_context(dir.path());
        let cache = TokenCache::open(&path).unwrap();
        assert!(matches!(
            cache.read_session_token(&ctx).await,
            Err(CacheError::NotFound)
        ));

        // Saving over the corrupt file works and round-trips
        let token = session_token(Utc::now().timestamp_millis() + 600_000);
        assert!(cache.save_session_token(&ctx, &token).await);
        assert_eq!(
            cache.read_session_token(&ctx).await.unwrap().token_id,
            "abc123"
        );
    }

    #[test]
    fn test_hash_key_is_deterministic_and_opaque() {
        let a = hash_key("https://openam.example.com/am");
        let b = hash_key("https://openam.example.com/am");
        assert_eq!(a, b);
        assert_ne!(a, hash_key("https://other.example.com/am"));
        assert!(!a.contains("example.com"));
    }

    proptest::proptest! {
        #[test]
        fn prop_hash_key_is_stable_and_collision_free(
            a in "[a-zA-Z0-9:/@.-]{1,60}",
            b in "[a-zA-Z0-9:/@.-]{1,60}",
        ) {
            proptest::prop_assert_eq!(hash_key(&a), hash_key(&a));
            if a != b {
                proptest::prop_assert_ne!(hash_key(&a), hash_key(&b));
            }
        }
    }
}
