#![forbid(unsafe_code)]

//! Connection upkeep and the phone/code sign-in exchange.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::client::NetworkClient;
use crate::config::upsert_env_value;
use crate::entities::EntityResolver;
use crate::error::{ClientError, GatewayError};

/// Message returned by `/code` when `/login` was never called.
pub const NO_PENDING_LOGIN: &str = "No hay login pendiente";

/// At most one in-flight authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLogin {
    pub phone: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    AlreadyAuthorized,
    CodeSent { phone: String },
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CodeOutcome {
    Authenticated { session_string: Option<String> },
    Error { error: String },
}

pub struct SessionManager {
    resolver: Arc<EntityResolver>,
    authorized: AtomicBool,
    session_token: RwLock<Option<String>>,
    session_loaded: bool,
    pending: Mutex<Option<PendingLogin>>,
    persist_to: Option<PathBuf>,
}

impl SessionManager {
    /// `session_loaded` records whether a session token was supplied at
    /// startup. When `persist_to` is set, tokens from a fresh sign-in are
    /// written there as `SESSION_STRING`.
    pub fn new(
        resolver: Arc<EntityResolver>,
        session_loaded: bool,
        persist_to: Option<PathBuf>,
    ) -> Self {
        Self {
            resolver,
            authorized: AtomicBool::new(false),
            session_token: RwLock::new(None),
            session_loaded,
            pending: Mutex::new(None),
            persist_to,
        }
    }

    /// Connects, authorizes and resolves publishers as needed, then probes
    /// liveness. Safe to call repeatedly. Returns whether the session is
    /// authorized afterwards.
    pub async fn ensure_connected(&self, client: &dyn NetworkClient) -> Result<bool, GatewayError> {
        if !client.is_connected().await {
            info!("connecting to the network");
            client.connect().await?;
        }

        if !self.check_authorized(client).await? {
            warn!("connected but not authorized, retrying authorization");
            if let Err(err) = client.start().await {
                warn!(error = %err, "authorization attempt failed");
            }
        }

        if !self.check_authorized(client).await? {
            self.authorized.store(false, Ordering::SeqCst);
            warn!("client not authorized; sign in through /login");
            return Ok(false);
        }

        self.resolver.resolve_all(client).await;
        client.ping().await?;
        self.mark_authorized(client).await;
        info!("connection and publisher check succeeded");
        Ok(true)
    }

    /// Authorization check that drops the cached flag when the call fails.
    async fn check_authorized(&self, client: &dyn NetworkClient) -> Result<bool, GatewayError> {
        client.is_authorized().await.map_err(|err| {
            self.authorized.store(false, Ordering::SeqCst);
            GatewayError::from(err)
        })
    }

    /// Runs [`Self::ensure_connected`] every `period` forever. The first pass
    /// happens one period from now; startup performs its own.
    pub async fn run_keepalive(&self, client: Arc<dyn NetworkClient>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.ensure_connected(client.as_ref()).await {
                error!(error = %err, "keep-alive pass failed");
            }
        }
    }

    /// Asks the network for the current authorization state and caches it.
    pub async fn refresh_authorization(&self, client: &dyn NetworkClient) -> bool {
        match client.is_authorized().await {
            Ok(true) => {
                self.mark_authorized(client).await;
                true
            }
            Ok(false) => {
                self.authorized.store(false, Ordering::SeqCst);
                false
            }
            Err(err) => {
                warn!(error = %err, "authorization probe failed");
                self.authorized.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    /// Session token, only once authorized.
    pub fn current_session_token(&self) -> Option<String> {
        if !self.is_authorized() {
            return None;
        }
        self.session_token.read().clone()
    }

    pub fn session_loaded(&self) -> bool {
        self.session_loaded
    }

    pub fn pending_login(&self) -> Option<PendingLogin> {
        self.pending.lock().clone()
    }

    /// Sends a login code to `phone`, replacing any earlier pending login.
    pub async fn request_code(&self, client: &dyn NetworkClient, phone: &str) -> LoginOutcome {
        if let Err(err) = client.connect().await {
            return LoginOutcome::Error {
                error: err.to_string(),
            };
        }
        if matches!(client.is_authorized().await, Ok(true)) {
            self.mark_authorized(client).await;
            return LoginOutcome::AlreadyAuthorized;
        }
        match client.send_code(phone).await {
            Ok(()) => {
                *self.pending.lock() = Some(PendingLogin {
                    phone: phone.to_string(),
                    sent_at: Utc::now(),
                });
                info!(phone, "login code sent");
                LoginOutcome::CodeSent {
                    phone: phone.to_string(),
                }
            }
            Err(err) => {
                warn!(phone, error = %err, "sending login code failed");
                LoginOutcome::Error {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Completes the pending login with `code`.
    pub async fn submit_code(
        &self,
        client: &dyn NetworkClient,
        code: &str,
    ) -> Result<CodeOutcome, GatewayError> {
        let phone = self
            .pending_login()
            .map(|pending| pending.phone)
            .ok_or_else(|| GatewayError::Validation(NO_PENDING_LOGIN.to_string()))?;

        if let Err(err) = client.sign_in(&phone, code).await {
            let error = match err {
                ClientError::PasswordRequired => "2FA required".to_string(),
                other => other.to_string(),
            };
            warn!(error = %error, "sign-in failed");
            return Ok(CodeOutcome::Error { error });
        }
        if let Err(err) = client.start().await {
            return Ok(CodeOutcome::Error {
                error: err.to_string(),
            });
        }

        *self.pending.lock() = None;
        self.mark_authorized(client).await;
        self.resolver.resolve_all(client).await;

        let session_string = self.session_token.read().clone();
        if let Some(token) = session_string.clone() {
            self.persist_session(token).await;
        }
        info!("sign-in completed");
        Ok(CodeOutcome::Authenticated { session_string })
    }

    async fn mark_authorized(&self, client: &dyn NetworkClient) {
        self.authorized.store(true, Ordering::SeqCst);
        match client.session_string().await {
            Ok(Some(token)) => *self.session_token.write() = Some(token),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not read session token"),
        }
    }

    async fn persist_session(&self, token: String) {
        let Some(path) = self.persist_to.clone() else {
            return;
        };
        let result =
            tokio::task::spawn_blocking(move || upsert_env_value(&path, "SESSION_STRING", &token))
                .await;
        match result {
            Ok(Ok(())) => info!("session token persisted"),
            Ok(Err(err)) => warn!(error = %err, "failed to persist session token"),
            Err(err) => warn!(error = %err, "session persistence task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::read_env_file;
    use crate::testing::ScriptedClient;

    fn manager(publishers: &[&str], persist_to: Option<PathBuf>) -> SessionManager {
        let resolver = Arc::new(EntityResolver::new(
            publishers.iter().map(|s| s.to_string()).collect(),
        ));
        SessionManager::new(resolver, false, persist_to)
    }

    #[tokio::test]
    async fn ensure_connected_connects_resolves_and_pings() {
        let client = ScriptedClient::authorized().with_entity("@a", 1);
        client.connected.store(false, Ordering::SeqCst);
        let session = manager(&["@a"], None);

        assert!(session.ensure_connected(&client).await.unwrap());
        assert_eq!(ScriptedClient::calls(&client.connect_calls), 1);
        assert_eq!(ScriptedClient::calls(&client.ping_calls), 1);
        assert!(session.is_authorized());
        assert!(session.current_session_token().is_some());
        assert!(session.resolver.is_resolved());
    }

    #[tokio::test]
    async fn ensure_connected_is_idempotent() {
        let client = ScriptedClient::authorized().with_entity("@a", 1);
        let session = manager(&["@a"], None);
        session.ensure_connected(&client).await.unwrap();
        session.ensure_connected(&client).await.unwrap();
        assert_eq!(ScriptedClient::calls(&client.connect_calls), 0);
        assert_eq!(ScriptedClient::calls(&client.resolve_calls), 1);
        assert_eq!(ScriptedClient::calls(&client.ping_calls), 2);
    }

    #[tokio::test]
    async fn unauthorized_session_attempts_start_and_reports_false() {
        let client = ScriptedClient::default().with_entity("@a", 1);
        let session = manager(&["@a"], None);
        assert!(!session.ensure_connected(&client).await.unwrap());
        assert_eq!(ScriptedClient::calls(&client.start_calls), 1);
        assert_eq!(ScriptedClient::calls(&client.resolve_calls), 0);
        assert!(!session.is_authorized());
        assert!(session.current_session_token().is_none());
    }

    #[tokio::test]
    async fn connect_failure_propagates() {
        let client = ScriptedClient::default().with_entity("@a", 1);
        client.fail_connect.store(true, Ordering::SeqCst);
        let session = manager(&["@a"], None);
        assert!(matches!(
            session.ensure_connected(&client).await,
            Err(GatewayError::ExternalUnavailable(_))
        ));
        assert_eq!(ScriptedClient::calls(&client.ping_calls), 0);
    }

    #[tokio::test]
    async fn failed_authorization_check_clears_cached_flag() {
        let client = ScriptedClient::authorized().with_entity("@a", 1);
        let session = manager(&["@a"], None);
        assert!(session.ensure_connected(&client).await.unwrap());
        assert!(session.is_authorized());

        client.fail_authorized.store(true, Ordering::SeqCst);
        assert!(session.ensure_connected(&client).await.is_err());
        assert!(!session.is_authorized());
        assert!(session.current_session_token().is_none());

        client.fail_authorized.store(false, Ordering::SeqCst);
        assert!(session.refresh_authorization(&client).await);
        client.fail_authorized.store(true, Ordering::SeqCst);
        assert!(!session.refresh_authorization(&client).await);
        assert!(!session.is_authorized());
    }

    #[tokio::test]
    async fn ping_failure_propagates() {
        let client = ScriptedClient::authorized().with_entity("@a", 1);
        client.fail_ping.store(true, Ordering::SeqCst);
        let session = manager(&["@a"], None);
        assert!(session.ensure_connected(&client).await.is_err());
        assert_eq!(ScriptedClient::calls(&client.ping_calls), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_survives_a_failed_pass() {
        let scripted = Arc::new(ScriptedClient::authorized().with_entity("@a", 1));
        scripted.connected.store(false, Ordering::SeqCst);
        scripted.fail_connect.store(true, Ordering::SeqCst);
        let session = Arc::new(manager(&["@a"], None));

        let client: Arc<dyn NetworkClient> = scripted.clone();
        let loop_session = session.clone();
        let keepalive = tokio::spawn(async move {
            loop_session
                .run_keepalive(client, Duration::from_secs(1))
                .await;
        });

        // Nothing happens before the first period elapses.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ScriptedClient::calls(&scripted.connect_calls), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ScriptedClient::calls(&scripted.connect_calls), 1);
        assert_eq!(ScriptedClient::calls(&scripted.ping_calls), 0);
        assert!(!session.is_authorized());

        scripted.fail_connect.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ScriptedClient::calls(&scripted.connect_calls), 2);
        assert_eq!(ScriptedClient::calls(&scripted.ping_calls), 1);
        assert!(session.is_authorized());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ScriptedClient::calls(&scripted.connect_calls), 2);
        assert_eq!(ScriptedClient::calls(&scripted.ping_calls), 2);

        keepalive.abort();
    }

    #[tokio::test]
    async fn code_without_login_is_rejected() {
        let client = ScriptedClient::default();
        let session = manager(&[], None);
        let err = session.submit_code(&client, "12345").await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(ref msg) if msg == NO_PENDING_LOGIN));
    }

    #[tokio::test]
    async fn login_then_code_authenticates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join(".env");
        let client = ScriptedClient::default();
        let session = manager(&[], Some(env_path.clone()));

        let outcome = session.request_code(&client, "+51999").await;
        assert_eq!(
            outcome,
            LoginOutcome::CodeSent {
                phone: "+51999".into()
            }
        );
        assert_eq!(session.pending_login().unwrap().phone, "+51999");

        // A later submission supersedes the first.
        session.request_code(&client, "+51888").await;
        assert_eq!(session.pending_login().unwrap().phone, "+51888");

        let outcome = session.submit_code(&client, "12345").await.unwrap();
        assert_eq!(
            outcome,
            CodeOutcome::Authenticated {
                session_string: Some("1SignedInSessionTokenValue".into())
            }
        );
        assert!(session.pending_login().is_none());
        assert!(session.is_authorized());

        let vars = read_env_file(&env_path).unwrap();
        assert_eq!(
            vars.get("SESSION_STRING").map(String::as_str),
            Some("1SignedInSessionTokenValue")
        );
    }

    #[tokio::test]
    async fn two_factor_is_reported_and_login_stays_pending() {
        let client = ScriptedClient::default();
        client.require_password.store(true, Ordering::SeqCst);
        let session = manager(&[], None);
        session.request_code(&client, "+51999").await;
        let outcome = session.submit_code(&client, "12345").await.unwrap();
        assert_eq!(
            outcome,
            CodeOutcome::Error {
                error: "2FA required".into()
            }
        );
        assert!(session.pending_login().is_some());
    }

    #[tokio::test]
    async fn login_when_authorized_short_circuits() {
        let client = ScriptedClient::authorized();
        let session = manager(&[], None);
        let outcome = session.request_code(&client, "+51999").await;
        assert_eq!(outcome, LoginOutcome::AlreadyAuthorized);
        assert!(client.sent_codes.lock().is_empty());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "already_authorized");
    }
}
