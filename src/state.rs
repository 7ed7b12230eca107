// Session context
// Per-connection settings, live tokens and the refresh timer handle

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::auth::types::{BearerToken, DeploymentType, SessionToken};
use crate::error::{FrodoError, Result};
use crate::profile::ConnectionProfileStore;
use crate::transport::Transport;

/// Default token cache location relative to the home directory
pub const DEFAULT_CACHE_DIR: &str = ".frodo";
/// Default token cache file name
pub const DEFAULT_CACHE_FILE: &str = "TokenCache.json";

/// Mutable per-connection state
#[derive(Debug, Default)]
struct SessionState {
    host: Option<String>,
    username: Option<String>,
    password: Option<String>,
    service_account_id: Option<String>,
    service_account_jwk: Option<String>,
    realm: Option<String>,
    authentication_service: Option<String>,
    deployment_type: Option<DeploymentType>,
    cookie_name: Option<String>,
    admin_client_id: Option<String>,
    use_bearer_token_for_am_apis: bool,
    session_token: Option<SessionToken>,
    bearer_token: Option<BearerToken>,
    use_token_cache: bool,
    token_cache_path: Option<PathBuf>,
}

/// Session context shared by the login flows, the cache and the refresh timer.
/// Cheap to clone; all clones observe the same state.
#[derive(Clone)]
pub struct SessionContext {
    state: Arc<RwLock<SessionState>>,
    transport: Transport,
    profile_store: Option<Arc<dyn ConnectionProfileStore>>,
    refresh_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionContext {
    pub fn builder() -> SessionContextBuilder {
        SessionContextBuilder::new()
    }

    /// Builder seeded from `FRODO_*` environment variables (a `.env` file is honored)
    pub fn from_env() -> SessionContextBuilder {
        SessionContextBuilder::from_env()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn profile_store(&self) -> Option<Arc<dyn ConnectionProfileStore>> {
        self.profile_store.clone()
    }

    /// Host URL, required before any flow runs
    pub async fn require_host(&self) -> Result<String> {
        self.state
            .read()
            .await
            .host
            .clone()
            .ok_or_else(|| FrodoError::Configuration("Host URL is required".to_string()))
    }

    pub async fn host(&self) -> Option<String> {
        self.state.read().await.host.clone()
    }

    pub async fn username(&self) -> Option<String> {
        self.state.read().await.username.clone()
    }

    pub async fn password(&self) -> Option<String> {
        self.state.read().await.password.clone()
    }

    pub async fn set_user_credentials(&self, username: Option<String>, password: Option<String>) {
        let mut state = self.state.write().await;
        state.username = username;
        state.password = password;
    }

    pub async fn service_account_id(&self) -> Option<String> {
        self.state.read().await.service_account_id.clone()
    }

    pub async fn service_account_jwk(&self) -> Option<String> {
        self.state.read().await.service_account_jwk.clone()
    }

    pub async fn set_service_account(&self, id: Option<String>, jwk: Option<String>) {
        let mut state = self.state.write().await;
        state.service_account_id = id;
        state.service_account_jwk = jwk;
    }

    /// Effective realm; `/` until a caller or the default-realm step sets one
    pub async fn realm(&self) -> String {
        self.state
            .read()
            .await
            .realm
            .clone()
            .unwrap_or_else(|| "/".to_string())
    }

    pub async fn realm_is_set(&self) -> bool {
        self.state.read().await.realm.is_some()
    }

    pub async fn set_realm(&self, realm: String) {
        self.state.write().await.realm = Some(realm);
    }

    pub async fn authentication_service(&self) -> Option<String> {
        self.state.read().await.authentication_service.clone()
    }

    pub async fn set_authentication_service(&self, service: Option<String>) {
        self.state.write().await.authentication_service = service;
    }

    pub async fn deployment_type(&self) -> Option<DeploymentType> {
        self.state.read().await.deployment_type
    }

    pub async fn set_deployment_type(&self, deployment_type: DeploymentType) {
        self.state.write().await.deployment_type = Some(deployment_type);
    }

    pub async fn cookie_name(&self) -> Option<String> {
        self.state.read().await.cookie_name.clone()
    }

    pub async fn set_cookie_name(&self, cookie_name: String) {
        self.state.write().await.cookie_name = Some(cookie_name);
    }

    /// OAuth2 client id matched during deployment detection
    pub async fn admin_client_id(&self) -> Option<String> {
        self.state.read().await.admin_client_id.clone()
    }

    pub async fn set_admin_client_id(&self, client_id: String) {
        self.state.write().await.admin_client_id = Some(client_id);
    }

    pub async fn use_bearer_token_for_am_apis(&self) -> bool {
        self.state.read().await.use_bearer_token_for_am_apis
    }

    pub async fn set_use_bearer_token_for_am_apis(&self, value: bool) {
        self.state.write().await.use_bearer_token_for_am_apis = value;
    }

    pub async fn session_token(&self) -> Option<SessionToken> {
        self.state.read().await.session_token.clone()
    }

    pub async fn set_session_token(&self, token: SessionToken) {
        self.state.write().await.session_token = Some(token);
    }

    pub async fn bearer_token(&self) -> Option<BearerToken> {
        self.state.read().await.bearer_token.clone()
    }

    pub async fn set_bearer_token(&self, token: BearerToken) {
        self.state.write().await.bearer_token = Some(token);
    }

    pub async fn use_token_cache(&self) -> bool {
        self.state.read().await.use_token_cache
    }

    /// Cache file location; `~/.frodo/TokenCache.json` unless overridden
    pub async fn token_cache_path(&self) -> PathBuf {
        if let Some(path) = self.state.read().await.token_cache_path.clone() {
            return path;
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CACHE_DIR)
            .join(DEFAULT_CACHE_FILE)
    }

    /// Replace the pending refresh timer, aborting any previous one
    pub(crate) async fn swap_refresh_task(&self, task: Option<JoinHandle<()>>) {
        let mut slot = self.refresh_task.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = task;
    }

    /// Drop the stored refresh handle without aborting it. The refresh task
    /// calls this on itself before re-entering the login, so re-arming does
    /// not cancel the round in flight.
    pub(crate) async fn clear_refresh_task(&self) {
        self.refresh_task.lock().await.take();
    }

    /// Cancel the pending auto-refresh timer, if any
    pub async fn stop_auto_refresh(&self) {
        self.swap_refresh_task(None).await;
        tracing::debug!("Auto-refresh timer stopped");
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext").finish_non_exhaustive()
    }
}

/// Builder for `SessionContext`
#[derive(Default)]
pub struct SessionContextBuilder {
    host: Option<String>,
    username: Option<String>,
    password: Option<String>,
    service_account_id: Option<String>,
    service_account_jwk: Option<String>,
    realm: Option<String>,
    authentication_service: Option<String>,
    deployment_type: Option<DeploymentType>,
    use_token_cache: bool,
    token_cache_path: Option<PathBuf>,
    connect_timeout: u64,
    request_timeout: u64,
    max_retries: u32,
    profile_store: Option<Arc<dyn ConnectionProfileStore>>,
}

impl SessionContextBuilder {
    pub fn new() -> Self {
        Self {
            use_token_cache: true,
            connect_timeout: 10,
            request_timeout: 30,
            max_retries: 3,
            ..Default::default()
        }
    }

    /// Seed the builder from `FRODO_*` environment variables
    pub fn from_env() -> Self {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let mut builder = Self::new();
        builder.host = std::env::var("FRODO_HOST").ok();
        builder.username = std::env::var("FRODO_USERNAME").ok();
        builder.password = std::env::var("FRODO_PASSWORD").ok();
        builder.service_account_id = std::env::var("FRODO_SA_ID").ok();
        builder.service_account_jwk = std::env::var("FRODO_SA_JWK").ok();
        builder.realm = std::env::var("FRODO_REALM").ok();
        builder.authentication_service = std::env::var("FRODO_AUTHENTICATION_SERVICE").ok();
        builder.token_cache_path = std::env::var("FRODO_TOKEN_CACHE_PATH")
            .ok()
            .map(PathBuf::from);
        if let Ok(no_cache) = std::env::var("FRODO_NO_CACHE") {
            let no_cache = no_cache.to_lowercase();
            builder.use_token_cache = !(no_cache == "1" || no_cache == "true");
        }
        builder
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Service account identity: UUID plus the RSA JWK as JSON text
    pub fn service_account(mut self, id: impl Into<String>, jwk: impl Into<String>) -> Self {
        self.service_account_id = Some(id.into());
        self.service_account_jwk = Some(jwk.into());
        self
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// Authentication tree/service to log in through
    pub fn authentication_service(mut self, service: impl Into<String>) -> Self {
        self.authentication_service = Some(service.into());
        self
    }

    /// Pin the deployment type instead of detecting it
    pub fn deployment_type(mut self, deployment_type: DeploymentType) -> Self {
        self.deployment_type = Some(deployment_type);
        self
    }

    pub fn use_token_cache(mut self, use_token_cache: bool) -> Self {
        self.use_token_cache = use_token_cache;
        self
    }

    pub fn token_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_cache_path = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout = seconds;
        self
    }

    pub fn request_timeout(mut self, seconds: u64) -> Self {
        self.request_timeout = seconds;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn profile_store(mut self, store: Arc<dyn ConnectionProfileStore>) -> Self {
        self.profile_store = Some(store);
        self
    }

    pub fn build(self) -> Result<SessionContext> {
        let transport = Transport::new(self.connect_timeout, self.request_timeout, self.max_retries)?;
        let state = SessionState {
            host: self.host.map(|h| h.trim_end_matches('/').to_string()),
            username: self.username,
            password: self.password,
            service_account_id: self.service_account_id,
            service_account_jwk: self.service_account_jwk,
            realm: self.realm,
            authentication_service: self.authentication_service,
            deployment_type: self.deployment_type,
            cookie_name: None,
            admin_client_id: None,
            use_bearer_token_for_am_apis: false,
            session_token: None,
            bearer_token: None,
            use_token_cache: self.use_token_cache,
            token_cache_path: self.token_cache_path,
        };
        Ok(SessionContext {
            state: Arc::new(RwLock::new(state)),
            transport,
            profile_store: self.profile_store,
            refresh_task: Arc::new(Mutex::new(None)),
        })
    }
}

impl std::fmt::Debug for SessionContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContextBuilder")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .field("use_token_cache", &self.use_token_cache)
            .finish_non_exhaustive()
    }
}
