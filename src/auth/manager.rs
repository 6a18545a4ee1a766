// Session manager
// Owns all authentication state: the cached token pair, the single-flight
// authentication gate, the proactive refresh timer, and debounced
// persistence. Callers only ever ask it for a currently valid token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{AuthError, Result};
use crate::store::SessionStore;

use super::identity::IdentityClient;
use super::types::{PersistedSession, TokenSet};

/// Fraction of the access token's remaining lifetime after which the
/// proactive refresh fires. Proportional so the schedule scales with
/// whatever lifetime the deployment hands out; matches the reference
/// mobile client.
const REFRESH_AT_LIFETIME_FRACTION: f64 = 0.8;

/// Default quiescence window for durable writes
pub const DEFAULT_PERSIST_DEBOUNCE: StdDuration = StdDuration::from_millis(500);

/// Identity and behavior of a session manager instance.
///
/// The one-time code is forwarded with the next credential login and
/// discarded once that login succeeds; it is never persisted.
pub struct SessionConfig {
    pub username: String,
    pub password: String,
    pub otp: Option<String>,
    /// Log chatty lifecycle events at info instead of debug
    pub verbose: bool,
    /// Quiescence window for durable writes
    pub persist_debounce: StdDuration,
}

impl SessionConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            otp: None,
            verbose: false,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
        }
    }

    pub fn with_otp(mut self, otp: Option<String>) -> Self {
        self.otp = otp.filter(|code| !code.is_empty());
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_persist_debounce(mut self, window: StdDuration) -> Self {
        self.persist_debounce = window;
        self
    }
}

/// Session manager for one Nimbus account.
///
/// Construct once per account with [`SessionManager::new`] and share the
/// returned `Arc` with every caller that needs tokens. Restoring from the
/// durable store happens during construction; no network I/O does.
pub struct SessionManager {
    identity: IdentityClient,
    store: Arc<dyn SessionStore>,
    username: String,
    password: String,
    otp: StdMutex<Option<String>>,
    verbose: bool,
    persist_debounce: StdDuration,

    /// Empty or coherent; only mutated under the authentication gate
    session: RwLock<Option<TokenSet>>,

    /// Single-flight gate: at most one authentication procedure in flight
    auth_gate: Mutex<()>,

    /// Bumped on every token-set and clear; lets a fired timer detect that
    /// a newer token-set superseded it while it waited
    generation: AtomicU64,

    refresh_task: StdMutex<Option<JoinHandle<()>>>,
    persist_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Set up a manager and synchronously reconcile with the durable store.
    ///
    /// A stored record is adopted only when it belongs to `config.username`;
    /// if its refresh token is still viable the proactive refresh chain is
    /// re-armed immediately, since downtime between restarts may already
    /// have consumed most of the access token's lifetime.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        identity: IdentityClient,
        store: Arc<dyn SessionStore>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            identity,
            store,
            username: config.username,
            password: config.password,
            otp: StdMutex::new(config.otp),
            verbose: config.verbose,
            persist_debounce: config.persist_debounce,
            session: RwLock::new(None),
            auth_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            refresh_task: StdMutex::new(None),
            persist_task: StdMutex::new(None),
        });

        manager.restore();
        manager
    }

    /// Return a currently valid access token, authenticating if needed.
    ///
    /// Concurrent calls while an authentication is in flight all observe
    /// that attempt's outcome; no duplicate network requests are issued.
    pub async fn get_token(self: &Arc<Self>) -> Result<String> {
        if let Some(tokens) = self.snapshot() {
            if tokens.access_valid(Utc::now()) {
                return Ok(tokens.access_token);
            }
        }

        self.authenticate().await
    }

    /// Pure check: token present and not expired. Usable while an
    /// authentication procedure is in flight.
    pub fn has_valid_token(&self) -> bool {
        self.snapshot()
            .map(|tokens| tokens.access_valid(Utc::now()))
            .unwrap_or(false)
    }

    /// Force a refresh-grant rotation of the current token pair.
    ///
    /// Fails with [`AuthError::AuthenticationFailed`] when no unexpired
    /// refresh token is held; never falls back to a credential login.
    pub async fn refresh_now(self: &Arc<Self>) -> Result<()> {
        self.refresh_once(None).await
    }

    /// Write the current session to the durable store immediately, bypassing
    /// the debounce window. Short-lived callers use this before exiting;
    /// failures are logged, never propagated.
    pub fn flush(&self) {
        if let Some(task) = self.persist_task.lock().unwrap().take() {
            task.abort();
        }

        let Some(tokens) = self.snapshot() else { return };
        let record = PersistedSession::new(&self.username, &tokens);
        if let Err(err) = self.store.save(&record) {
            tracing::warn!(error = %err, "Failed to persist session");
        }
    }

    /// Clear the in-memory session and delete the durable record.
    ///
    /// Waits for any in-flight authentication so the clear is ordered after
    /// it; nothing can observe the old tokens once this returns.
    pub async fn logout(&self) {
        let _flight = self.auth_gate.lock().await;
        tracing::info!(username = %self.username, "Logging out; clearing session state");
        self.clear_session();
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Expiry instants of the current token pair (access, refresh), if any.
    pub fn token_expiries(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.snapshot()
            .map(|tokens| (tokens.access_expiry, tokens.refresh_expiry))
    }

    // ---- authentication procedure ----------------------------------------

    /// Full strategy selection: refresh first (silent), credentials as the
    /// fallback. Holds the single-flight gate for the whole procedure.
    async fn authenticate(self: &Arc<Self>) -> Result<String> {
        let _flight = self.auth_gate.lock().await;

        // A concurrent caller may have finished authenticating while we
        // waited on the gate
        let now = Utc::now();
        if let Some(tokens) = self.snapshot() {
            if tokens.access_valid(now) && tokens.refresh_valid(now) {
                return Ok(tokens.access_token);
            }
        }

        if let Some(refresh_token) = self.refreshable_token(now) {
            match self.identity.refresh_grant(&refresh_token).await {
                Ok(grant) => {
                    self.log_lifecycle("Session refreshed silently");
                    let tokens = TokenSet::from_grant(grant, Utc::now());
                    let access = tokens.access_token.clone();
                    self.adopt(tokens);
                    return Ok(access);
                }
                Err(err) if err.is_invalid_grant() => {
                    tracing::warn!(error = %err, "Refresh token revoked; clearing stored session");
                    self.clear_session();
                }
                Err(err) => {
                    tracing::debug!(error = %err, "Token refresh failed; falling back to credential login");
                }
            }
        }

        // Credential fallback. Always at warn: this is the path that makes
        // the provider email a login notification to the account holder.
        tracing::warn!(
            username = %self.username,
            "Logging in with username/password; the account holder will receive a login notification email"
        );

        let otp = self.otp.lock().unwrap().clone();
        match self
            .identity
            .password_grant(&self.username, &self.password, otp.as_deref())
            .await
        {
            Ok(grant) => {
                // The one-time code is single-use; discard it now that a
                // login consumed it
                self.otp.lock().unwrap().take();
                self.log_lifecycle("Credential login succeeded");
                let tokens = TokenSet::from_grant(grant, Utc::now());
                let access = tokens.access_token.clone();
                self.adopt(tokens);
                Ok(access)
            }
            Err(err) => {
                self.drop_tokens();
                if err.is_credential_rejection() {
                    Err(err)
                } else {
                    tracing::error!(error = %err, "Neither token refresh nor credential login succeeded");
                    Err(AuthError::AuthenticationFailed)
                }
            }
        }
    }

    /// Refresh-only path, used by the proactive timer and `refresh_now`.
    ///
    /// `expected_generation` lets a fired timer stand down when a newer
    /// token-set won the gate first.
    async fn refresh_once(self: &Arc<Self>, expected_generation: Option<u64>) -> Result<()> {
        let _flight = self.auth_gate.lock().await;

        if let Some(generation) = expected_generation {
            if self.generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
        }

        let Some(refresh_token) = self.refreshable_token(Utc::now()) else {
            return Err(AuthError::AuthenticationFailed);
        };

        match self.identity.refresh_grant(&refresh_token).await {
            Ok(grant) => {
                self.log_lifecycle("Session refreshed silently");
                self.adopt(TokenSet::from_grant(grant, Utc::now()));
                Ok(())
            }
            Err(err) if err.is_invalid_grant() => {
                tracing::warn!(error = %err, "Refresh token revoked; clearing stored session");
                self.clear_session();
                Err(err)
            }
            // Transport or endpoint trouble: keep the session so the next
            // demand-driven attempt can still try refresh or fall back
            Err(err) => Err(err),
        }
    }

    // ---- state transitions ------------------------------------------------

    /// Replace the session wholesale, then re-arm the refresh timer and
    /// schedule a durable write. The token-set happens-before both.
    fn adopt(self: &Arc<Self>, tokens: TokenSet) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.session.write().unwrap() = Some(tokens);
        self.arm_proactive_refresh();
        self.schedule_persist();
    }

    /// Clear the in-memory session and cancel scheduled work.
    fn drop_tokens(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_scheduled();
        *self.session.write().unwrap() = None;
    }

    /// Full clear: memory plus the durable record. Deleting the record is
    /// best-effort; a failure is logged and does not block the clear.
    fn clear_session(&self) {
        self.drop_tokens();
        if let Err(err) = self.store.clear() {
            tracing::warn!(error = %err, "Failed to delete stored session record");
        }
    }

    fn cancel_scheduled(&self) {
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.persist_task.lock().unwrap().take() {
            task.abort();
        }
    }

    // ---- restore ----------------------------------------------------------

    fn restore(self: &Arc<Self>) {
        let record = match self.store.load() {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!("No stored session; starting empty");
                return;
            }
            Err(err) => {
                // A corrupt or unreadable record degrades to "no prior
                // session", never to a failure
                tracing::warn!(error = %err, "Failed to read stored session; starting empty");
                return;
            }
        };

        if record.username != self.username {
            tracing::warn!(
                stored = %record.username,
                configured = %self.username,
                "Stored session belongs to a different account; ignoring it"
            );
            return;
        }

        let tokens = record.into_token_set();
        let refresh_viable = tokens.refresh_valid(Utc::now());
        *self.session.write().unwrap() = Some(tokens);
        self.log_lifecycle("Restored session from durable store");

        if refresh_viable {
            self.arm_proactive_refresh();
        }
    }

    // ---- scheduling -------------------------------------------------------

    /// Cancel any armed timer and arm a fresh one-shot for the current
    /// token pair. No timer is armed when the refresh token would expire
    /// before the computed fire time.
    fn arm_proactive_refresh(self: &Arc<Self>) {
        let mut slot = self.refresh_task.lock().unwrap();
        if let Some(task) = slot.take() {
            task.abort();
        }

        let Some(tokens) = self.snapshot() else { return };
        let Some(delay) =
            proactive_refresh_delay(tokens.access_expiry, tokens.refresh_expiry, Utc::now())
        else {
            tracing::debug!("Refresh token expires before the proactive slot; no timer armed");
            return;
        };

        self.log_lifecycle(&format!(
            "Proactive refresh scheduled in {}s",
            delay.as_secs()
        ));

        let generation = self.generation.load(Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(manager) = weak.upgrade() else { return };
            if manager.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            // Still the current timer, so the slot holds our own handle;
            // drop it without aborting so the adopt below cannot cancel
            // this task mid-refresh
            manager.refresh_task.lock().unwrap().take();

            if let Err(err) = manager.refresh_once(Some(generation)).await {
                tracing::warn!(error = %err, "Proactive refresh failed; next token request will recover");
            }
        }));
    }

    /// Hold durable writes for a quiescence window so a burst of token-sets
    /// produces one write of the final state.
    fn schedule_persist(self: &Arc<Self>) {
        let mut slot = self.persist_task.lock().unwrap();
        if let Some(task) = slot.take() {
            task.abort();
        }

        let delay = self.persist_debounce;
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(manager) = weak.upgrade() else { return };
            // Snapshot at fire time: last write wins
            let Some(tokens) = manager.snapshot() else { return };

            let record = PersistedSession::new(&manager.username, &tokens);
            match manager.store.save(&record) {
                Ok(()) => manager.log_lifecycle("Session persisted"),
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to persist session; will retry on the next token set");
                }
            }
        }));
    }

    // ---- helpers ----------------------------------------------------------

    fn snapshot(&self) -> Option<TokenSet> {
        self.session.read().unwrap().clone()
    }

    fn refreshable_token(&self, now: DateTime<Utc>) -> Option<String> {
        self.snapshot()
            .filter(|tokens| tokens.refresh_valid(now))
            .map(|tokens| tokens.refresh_token)
    }

    fn log_lifecycle(&self, message: &str) {
        if self.verbose {
            tracing::info!("{message}");
        } else {
            tracing::debug!("{message}");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cancel_scheduled();
    }
}

/// When the proactive refresh should fire: once 80% of the access token's
/// remaining lifetime has elapsed (clamped at zero), and only while that
/// instant still strictly precedes the refresh token's own expiry.
fn proactive_refresh_delay(
    access_expiry: DateTime<Utc>,
    refresh_expiry: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<StdDuration> {
    let lifetime_ms = (access_expiry - now).num_milliseconds();
    let delay_ms = if lifetime_ms > 0 {
        (lifetime_ms as f64 * REFRESH_AT_LIFETIME_FRACTION) as i64
    } else {
        0
    };

    let fire_at = now + Duration::milliseconds(delay_ms);
    if fire_at >= refresh_expiry {
        return None;
    }

    Some(StdDuration::from_millis(delay_ms as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenGrant;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn test_identity() -> IdentityClient {
        IdentityClient::new("http://127.0.0.1:9/token", 1, 1).unwrap()
    }

    fn record_for(username: &str, expires_in: u64, refresh_expires_in: u64) -> PersistedSession {
        let grant = TokenGrant {
            access_token: "stored-access".to_string(),
            refresh_token: "stored-refresh".to_string(),
            expires_in,
            refresh_expires_in,
        };
        PersistedSession::new(username, &TokenSet::from_grant(grant, Utc::now()))
    }

    #[test]
    fn test_proactive_delay_is_80_percent_of_lifetime() {
        let now = Utc::now();
        let delay = proactive_refresh_delay(
            now + Duration::seconds(100),
            now + Duration::seconds(3600),
            now,
        )
        .unwrap();

        assert_eq!(delay.as_secs(), 80);
    }

    #[test]
    fn test_proactive_delay_clamps_expired_access_to_zero() {
        let now = Utc::now();
        let delay = proactive_refresh_delay(
            now - Duration::seconds(60),
            now + Duration::seconds(600),
            now,
        )
        .unwrap();

        assert_eq!(delay, StdDuration::ZERO);
    }

    #[test]
    fn test_no_timer_when_refresh_expires_first() {
        let now = Utc::now();
        // Fire time would be now+80s, refresh dies at now+60s
        assert!(proactive_refresh_delay(
            now + Duration::seconds(100),
            now + Duration::seconds(60),
            now,
        )
        .is_none());

        // Refresh token already expired
        assert!(proactive_refresh_delay(
            now + Duration::seconds(100),
            now - Duration::seconds(1),
            now,
        )
        .is_none());
    }

    proptest! {
        /// Whenever a timer is armed it fires strictly before the refresh
        /// token expires and never later than the access token does.
        #[test]
        fn prop_armed_timer_fires_inside_the_viable_window(
            access_secs in -600i64..7200,
            refresh_secs in -600i64..86_400,
        ) {
            let now = Utc::now();
            let access_expiry = now + Duration::seconds(access_secs);
            let refresh_expiry = now + Duration::seconds(refresh_secs);

            if let Some(delay) = proactive_refresh_delay(access_expiry, refresh_expiry, now) {
                let fire_at = now + Duration::milliseconds(delay.as_millis() as i64);
                prop_assert!(fire_at < refresh_expiry);
                if access_secs > 0 {
                    prop_assert!(fire_at <= access_expiry);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_restore_adopts_matching_record() {
        let store = Arc::new(MemoryStore::with_record(record_for(
            "alice@example.com",
            300,
            1800,
        )));
        let manager = SessionManager::new(
            test_identity(),
            store,
            SessionConfig::new("alice@example.com", "hunter2"),
        );

        assert!(manager.has_valid_token());
        let (access_expiry, refresh_expiry) = manager.token_expiries().unwrap();
        assert!(access_expiry > Utc::now());
        assert!(refresh_expiry > access_expiry);
    }

    #[tokio::test]
    async fn test_restore_ignores_record_for_other_account() {
        let store = Arc::new(MemoryStore::with_record(record_for(
            "alice@example.com",
            300,
            1800,
        )));
        let manager = SessionManager::new(
            test_identity(),
            store.clone(),
            SessionConfig::new("bob@example.com", "hunter2"),
        );

        assert!(!manager.has_valid_token());
        assert!(manager.token_expiries().is_none());
        // The foreign record is left in place, not deleted
        assert!(store.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_restore_survives_store_read_failure() {
        struct BrokenStore;
        impl SessionStore for BrokenStore {
            fn load(&self) -> anyhow::Result<Option<PersistedSession>> {
                anyhow::bail!("disk on fire")
            }
            fn save(&self, _: &PersistedSession) -> anyhow::Result<()> {
                Ok(())
            }
            fn clear(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let manager = SessionManager::new(
            test_identity(),
            Arc::new(BrokenStore),
            SessionConfig::new("alice@example.com", "hunter2"),
        );

        assert!(!manager.has_valid_token());
    }

    #[tokio::test]
    async fn test_logout_clears_memory_and_store() {
        let store = Arc::new(MemoryStore::with_record(record_for(
            "alice@example.com",
            300,
            1800,
        )));
        let manager = SessionManager::new(
            test_identity(),
            store.clone(),
            SessionConfig::new("alice@example.com", "hunter2"),
        );
        assert!(manager.has_valid_token());

        manager.logout().await;

        assert!(!manager.has_valid_token());
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_now_without_refresh_token_fails() {
        let manager = SessionManager::new(
            test_identity(),
            Arc::new(MemoryStore::new()),
            SessionConfig::new("alice@example.com", "hunter2"),
        );

        let err = manager.refresh_now().await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationFailed));
    }

    #[test]
    fn test_session_config_discards_empty_otp() {
        let config = SessionConfig::new("alice@example.com", "hunter2")
            .with_otp(Some(String::new()));
        assert!(config.otp.is_none());

        let config =
            SessionConfig::new("alice@example.com", "hunter2").with_otp(Some("123456".into()));
        assert_eq!(config.otp.as_deref(), Some("123456"));
    }
}
