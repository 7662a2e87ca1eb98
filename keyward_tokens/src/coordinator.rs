//! Single-flight coordination of access token refreshes
//!
//! Every caller that needs an access token goes through the
//! [`RefreshCoordinator`]. While the cached credential is valid it is handed
//! out directly. Once it expires, the first caller to notice starts a
//! refresh _episode_ and performs the only network call of that episode.
//! Every caller that arrives while the episode is in flight waits on it and
//! receives the very same outcome.
//!
//! An episode settles by writing the store, publishing its outcome to the
//! waiters, and returning to idle, all while holding the state lock. A
//! caller arriving after that point sees the settled store and, if it still
//! needs a new token, starts a new episode instead of joining the old one.

use std::{error, fmt, sync::Arc};

use keyward_clock::{Clock, System, UnixMillis};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    AccessTokenRef, Credential, ExpiryPolicy, RefreshError, RefreshToken, RefreshWatcher, Session,
    SessionBridge, TokenRefresher, TokenStore,
};

type Outcome = Result<Option<Arc<Credential>>, Arc<RefreshError>>;

/// Whether a refresh is currently in flight
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshState {
    /// No refresh is in flight
    Idle,
    /// A refresh is in flight and new callers will wait on it
    Refreshing,
}

enum Phase {
    Idle,
    Refreshing(watch::Receiver<Option<Outcome>>),
}

struct State {
    store: TokenStore,
    phase: Phase,
}

/// What a caller needs from the coordinator
#[derive(Clone, Copy, Debug)]
enum Demand<'a> {
    /// Any credential that is not expired
    Valid,
    /// A newly refreshed credential
    Forced,
    /// Any unexpired credential other than the one that was rejected
    Replacing(&'a AccessTokenRef),
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>, Option<Arc<Credential>>),
    Waiter(watch::Receiver<Option<Outcome>>),
}

enum Acquired {
    Refreshed(Credential),
    FromSession(Credential),
    Nothing,
}

struct Inner<C> {
    state: Mutex<State>,
    refresher: Box<dyn TokenRefresher>,
    session: Box<dyn SessionBridge>,
    policy: ExpiryPolicy,
    clock: C,
    published: watch::Sender<Option<Arc<Credential>>>,
}

/// Keeps a caller supplied with a valid access token
///
/// The coordinator is a cheaply cloneable handle. Construct it once at
/// start-up and pass clones to every component that sends authenticated
/// requests; all clones share the same credential and refresh state.
pub struct RefreshCoordinator<C = System> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for RefreshCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for RefreshCoordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RefreshCoordinator")
            .field("credential", &state.store.get())
            .field("state", &state.phase.as_state())
            .field("policy", &self.inner.policy)
            .field("clock", &self.inner.clock)
            .finish()
    }
}

impl Phase {
    fn as_state(&self) -> RefreshState {
        match self {
            Phase::Idle => RefreshState::Idle,
            Phase::Refreshing(_) => RefreshState::Refreshing,
        }
    }
}

/// Configures a [`RefreshCoordinator`] before it is shared
pub struct RefreshCoordinatorBuilder<C = System> {
    refresher: Box<dyn TokenRefresher>,
    session: Box<dyn SessionBridge>,
    policy: ExpiryPolicy,
    clock: C,
    credential: Option<Credential>,
}

impl<C: fmt::Debug> fmt::Debug for RefreshCoordinatorBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshCoordinatorBuilder")
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .field("credential", &self.credential)
            .finish()
    }
}

impl<C> RefreshCoordinatorBuilder<C> {
    /// Sets the expiry policy
    pub fn with_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Seeds the store with an already known credential
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> RefreshCoordinatorBuilder<D> {
        RefreshCoordinatorBuilder {
            refresher: self.refresher,
            session: self.session,
            policy: self.policy,
            clock,
            credential: self.credential,
        }
    }

    /// Builds the coordinator
    pub fn build(self) -> RefreshCoordinator<C> {
        let mut store = TokenStore::new();
        if let Some(credential) = self.credential {
            store.set(Arc::new(credential));
        }

        let (published, _) = watch::channel(None);

        RefreshCoordinator {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    store,
                    phase: Phase::Idle,
                }),
                refresher: self.refresher,
                session: self.session,
                policy: self.policy,
                clock: self.clock,
                published,
            }),
        }
    }
}

impl RefreshCoordinator {
    /// Constructs a coordinator with the default expiry policy and the system clock
    pub fn new<R, S>(refresher: R, session: S) -> Self
    where
        R: TokenRefresher + 'static,
        S: SessionBridge + 'static,
    {
        Self::builder(refresher, session).build()
    }

    /// Starts configuring a coordinator
    pub fn builder<R, S>(refresher: R, session: S) -> RefreshCoordinatorBuilder
    where
        R: TokenRefresher + 'static,
        S: SessionBridge + 'static,
    {
        RefreshCoordinatorBuilder {
            refresher: Box::new(refresher),
            session: Box::new(session),
            policy: ExpiryPolicy::default(),
            clock: System,
            credential: None,
        }
    }
}

impl<C> RefreshCoordinator<C> {
    /// The cached credential, without regard to its expiry
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.inner.state.lock().store.get()
    }

    /// Whether a refresh is currently in flight
    pub fn refresh_state(&self) -> RefreshState {
        self.inner.state.lock().phase.as_state()
    }

    /// The expiry policy in use
    pub fn policy(&self) -> &ExpiryPolicy {
        &self.inner.policy
    }

    /// Subscribes to notifications of successful refreshes
    pub fn subscribe(&self) -> RefreshWatcher {
        RefreshWatcher::new(self.inner.published.subscribe())
    }

    /// Clears the cached credential and terminates the session
    pub async fn sign_out(&self) {
        self.inner.state.lock().store.clear();
        tracing::info!("signing out");
        self.inner.session.terminate_session().await;
    }
}

impl<C: Clock + Send + Sync + 'static> RefreshCoordinator<C> {
    /// Gets a credential that is not expired, refreshing it if required
    ///
    /// Returns immediately while the cached credential is valid. Otherwise
    /// waits on the refresh already in flight, or starts one. Returns `None`
    /// if no credential could be obtained; if that was due to a failed
    /// refresh, the session has been terminated.
    pub async fn get_valid_access_token(&self) -> Option<Arc<Credential>> {
        self.acquire(Demand::Valid).await.unwrap_or_default()
    }

    /// Refreshes the credential regardless of its expiry
    ///
    /// Joins the refresh already in flight, if there is one. On failure, the
    /// session has been terminated by the time this returns.
    pub async fn refresh_access_token(&self) -> Result<Arc<Credential>, Arc<RefreshError>> {
        self.acquire_refreshed(Demand::Forced).await
    }

    /// Replaces a credential that the server has rejected
    ///
    /// If the cached credential has already been replaced by another
    /// caller since `rejected` was handed out, that replacement is returned
    /// without another refresh.
    pub async fn refresh_rejected(
        &self,
        rejected: &AccessTokenRef,
    ) -> Result<Arc<Credential>, Arc<RefreshError>> {
        self.acquire_refreshed(Demand::Replacing(rejected)).await
    }

    async fn acquire_refreshed(
        &self,
        demand: Demand<'_>,
    ) -> Result<Arc<Credential>, Arc<RefreshError>> {
        // A joined cold-start episode may settle with no credential at all.
        // One more attempt is made before giving up.
        for _ in 0..2 {
            if let Some(credential) = self.acquire(demand).await? {
                return Ok(credential);
            }
        }

        Err(Arc::new(RefreshError::NoRefreshToken))
    }

    async fn acquire(&self, demand: Demand<'_>) -> Outcome {
        loop {
            let role = {
                let mut state = self.inner.state.lock();
                let cached = state.store.get();

                if self.satisfies(cached.as_deref(), demand, self.inner.clock.now()) {
                    tracing::trace!("cached credential satisfies request");
                    return Ok(cached);
                }

                match &state.phase {
                    Phase::Refreshing(episode) => Role::Waiter(episode.clone()),
                    Phase::Idle => {
                        let (sender, receiver) = watch::channel(None);
                        state.phase = Phase::Refreshing(receiver);
                        Role::Leader(sender, cached)
                    }
                }
            };

            match role {
                Role::Waiter(episode) => {
                    tracing::debug!("waiting on in-flight refresh");
                    match wait_for_settlement(episode).await {
                        Err(error) if matches!(*error, RefreshError::Abandoned) => {
                            // Only the leader was cancelled; the refresh is still owed.
                            tracing::debug!("in-flight refresh was abandoned, trying again");
                        }
                        outcome => return outcome,
                    }
                }
                Role::Leader(sender, cached) => return self.lead(demand, sender, cached).await,
            }
        }
    }

    fn satisfies(&self, credential: Option<&Credential>, demand: Demand<'_>, now: UnixMillis) -> bool {
        if self.inner.policy.is_expired(credential, now) {
            return false;
        }

        match demand {
            Demand::Valid => true,
            Demand::Forced => false,
            Demand::Replacing(rejected) => {
                credential.is_some_and(|c| c.access_token() != rejected)
            }
        }
    }

    async fn lead(
        &self,
        demand: Demand<'_>,
        sender: watch::Sender<Option<Outcome>>,
        cached: Option<Arc<Credential>>,
    ) -> Outcome {
        let mut episode = Episode {
            inner: &self.inner,
            sender: Some(sender),
        };

        tracing::debug!(?demand, has_cached = cached.is_some(), "starting refresh");

        let (outcome, refreshed) = match self.run_episode(demand, cached).await {
            Ok(Acquired::Refreshed(credential)) => (Ok(Some(Arc::new(credential))), true),
            Ok(Acquired::FromSession(credential)) => (Ok(Some(Arc::new(credential))), false),
            Ok(Acquired::Nothing) => (Ok(None), false),
            Err(error) => (Err(Arc::new(error)), false),
        };

        episode.settle(&outcome);

        match &outcome {
            Ok(Some(credential)) => {
                tracing::debug!(
                    refreshed,
                    expires_at = credential.expires_at().0,
                    "refresh settled with new credential"
                );
                if refreshed {
                    self.inner.published.send_replace(Some(Arc::clone(credential)));
                }
            }
            Ok(None) => {
                tracing::debug!("refresh settled without a credential");
            }
            Err(error) => {
                tracing::warn!(
                    error = (&**error as &dyn error::Error),
                    "refresh failed, terminating session"
                );
                self.inner.session.terminate_session().await;
            }
        }

        outcome
    }

    async fn run_episode(
        &self,
        demand: Demand<'_>,
        cached: Option<Arc<Credential>>,
    ) -> Result<Acquired, RefreshError> {
        let mut refresh_token: Option<RefreshToken> = cached
            .as_deref()
            .and_then(Credential::refresh_token)
            .map(ToOwned::to_owned);

        if refresh_token.is_none() {
            if let Some(session) = self.fetch_session().await {
                if let Some(access_token) = session.access_token {
                    let now = self.inner.clock.now();
                    let expires_at = self.inner.policy.expiry_for(&access_token, now);
                    let mut credential = Credential::new(access_token, expires_at);
                    if let Some(refresh_token) = &session.refresh_token {
                        credential = credential.with_refresh_token(refresh_token.clone());
                    }

                    if self.satisfies(Some(&credential), demand, now) {
                        tracing::debug!("using access token from session");
                        return Ok(Acquired::FromSession(credential));
                    }
                }

                refresh_token = session.refresh_token;
            }
        }

        let refresh_token = match refresh_token {
            Some(refresh_token) => refresh_token,
            None if cached.is_none() && matches!(demand, Demand::Valid) => {
                tracing::debug!("no cached credential and no session to start from");
                return Ok(Acquired::Nothing);
            }
            None => return Err(RefreshError::NoRefreshToken),
        };

        let issued = self.inner.refresher.refresh(&refresh_token).await?;
        let now = self.inner.clock.now();
        let credential = issued.into_credential(&self.inner.policy, now, Some(&refresh_token));

        Ok(Acquired::Refreshed(credential))
    }

    async fn fetch_session(&self) -> Option<Session> {
        match self.inner.session.fetch_session().await {
            Ok(session) => session,
            Err(source) => {
                let error = RefreshError::SessionFetchFailed(source);
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "continuing without a session"
                );
                None
            }
        }
    }
}

async fn wait_for_settlement(mut episode: watch::Receiver<Option<Outcome>>) -> Outcome {
    match episode.wait_for(Option::is_some).await {
        Ok(settled) => settled
            .clone()
            .unwrap_or_else(|| Err(Arc::new(RefreshError::Abandoned))),
        Err(_) => Err(Arc::new(RefreshError::Abandoned)),
    }
}

/// The leader's hold on an in-flight episode
///
/// Dropping it unsettled, such as when the leading future is cancelled,
/// settles the episode as abandoned. Waiters then start or join a new
/// episode of their own.
struct Episode<'a, C> {
    inner: &'a Inner<C>,
    sender: Option<watch::Sender<Option<Outcome>>>,
}

impl<C> Episode<'_, C> {
    fn settle(&mut self, outcome: &Outcome) {
        let mut state = self.inner.state.lock();

        match outcome {
            Ok(Some(credential)) => state.store.set(Arc::clone(credential)),
            Err(error) if error.is_terminal() => state.store.clear(),
            Ok(None) | Err(_) => {}
        }

        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome.clone()));
        }

        state.phase = Phase::Idle;
    }
}

impl<C> Drop for Episode<'_, C> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            tracing::warn!("refresh dropped before settling");
            self.settle(&Err(Arc::new(RefreshError::Abandoned)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use futures::future::join_all;
    use keyward_clock::{DurationMillis, TestClock};

    use super::*;
    use crate::{AccessToken, BoxError, IssuedToken, RefreshTokenRef};

    const T: UnixMillis = UnixMillis(1_700_000_000_000);

    #[derive(Default)]
    struct FakeIssuer {
        calls: AtomicUsize,
        reject_with: Option<u16>,
        hang: bool,
        seen: Mutex<Vec<String>>,
    }

    impl FakeIssuer {
        fn rejecting(status: u16) -> Self {
            Self {
                reject_with: Some(status),
                ..Self::default()
            }
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeIssuer {
        async fn refresh(
            &self,
            refresh_token: &RefreshTokenRef,
        ) -> Result<IssuedToken, RefreshError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().push(refresh_token.as_str().to_owned());

            if self.hang {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;

            match self.reject_with {
                Some(status) => Err(RefreshError::RefreshRequestFailed {
                    status,
                    body: r#"{"error":"invalid_grant"}"#.to_owned(),
                }),
                None => Ok(IssuedToken::new(AccessToken::new(format!("access-{}", call)))
                    .with_expires_in(DurationMillis::from_secs(3600))),
            }
        }
    }

    #[derive(Default)]
    struct FakeSession {
        session: Option<Session>,
        fail: bool,
        fetches: AtomicUsize,
        terminations: AtomicUsize,
    }

    impl FakeSession {
        fn with(session: Session) -> Self {
            Self {
                session: Some(session),
                ..Self::default()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn terminations(&self) -> usize {
            self.terminations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionBridge for FakeSession {
        async fn fetch_session(&self) -> Result<Option<Session>, BoxError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("session provider unavailable".into())
            } else {
                Ok(self.session.clone())
            }
        }

        async fn terminate_session(&self) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        issuer: Arc<FakeIssuer>,
        session: Arc<FakeSession>,
        clock: Arc<TestClock>,
        coordinator: RefreshCoordinator<Arc<TestClock>>,
    }

    fn harness(
        issuer: FakeIssuer,
        session: FakeSession,
        credential: Option<Credential>,
    ) -> Harness {
        let issuer = Arc::new(issuer);
        let session = Arc::new(session);
        let clock = Arc::new(TestClock::new(T));

        let mut builder = RefreshCoordinator::builder(Arc::clone(&issuer), Arc::clone(&session))
            .with_clock(Arc::clone(&clock));
        if let Some(credential) = credential {
            builder = builder.with_credential(credential);
        }

        Harness {
            issuer,
            session,
            clock,
            coordinator: builder.build(),
        }
    }

    fn cached(access_token: &'static str, expires_in: u64) -> Credential {
        Credential::new(
            AccessToken::from_static(access_token),
            T + DurationMillis(expires_in),
        )
        .with_refresh_token(RefreshToken::from_static("refresh-0"))
    }

    fn jwt_expiring_at(exp_secs: u64) -> AccessToken {
        let payload = format!(r#"{{"exp":{}}}"#, exp_secs);
        AccessToken::new(format!(
            "e30.{}.sig",
            URL_SAFE_NO_PAD.encode(payload.as_bytes())
        ))
    }

    fn token_of(credential: &Option<Arc<Credential>>) -> Option<&str> {
        credential.as_ref().map(|c| c.access_token().as_str())
    }

    mod when_cached_credential_is_valid {
        use super::*;

        #[tokio::test]
        async fn returns_cached_credential_without_refreshing() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 61_000)),
            );

            let credential = h.coordinator.get_valid_access_token().await;

            assert_eq!(token_of(&credential), Some("cached"));
            assert_eq!(h.issuer.calls(), 0);
        }

        #[tokio::test]
        async fn forced_refresh_still_refreshes() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 3_600_000)),
            );

            let credential = h.coordinator.refresh_access_token().await.unwrap();

            assert_eq!(credential.access_token().as_str(), "access-1");
            assert_eq!(h.issuer.calls(), 1);
        }
    }

    mod when_cached_credential_is_inside_margin {
        use super::*;

        #[tokio::test]
        async fn refreshes_using_cached_refresh_token() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 30_000)),
            );

            let credential = h.coordinator.get_valid_access_token().await;

            assert_eq!(token_of(&credential), Some("access-1"));
            assert_eq!(h.issuer.calls(), 1);
            assert_eq!(*h.issuer.seen.lock(), vec!["refresh-0".to_owned()]);
            assert_eq!(h.session.fetches.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn new_expiry_is_now_plus_lifetime() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 30_000)),
            );

            let credential = h.coordinator.get_valid_access_token().await.unwrap();

            assert_eq!(credential.expires_at(), UnixMillis(T.0 + 3_600_000));
            assert_eq!(token_of(&h.coordinator.current()), Some("access-1"));
        }

        #[tokio::test]
        async fn refresh_token_is_retained_when_not_rotated() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 0)),
            );

            let credential = h.coordinator.get_valid_access_token().await.unwrap();

            assert_eq!(
                credential.refresh_token().map(|r| r.as_str()),
                Some("refresh-0")
            );
        }

        #[tokio::test]
        async fn concurrent_callers_share_a_single_refresh() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 30_000)),
            );

            let results = join_all((0..8).map(|_| h.coordinator.get_valid_access_token())).await;

            assert_eq!(h.issuer.calls(), 1);
            for result in &results {
                assert_eq!(token_of(result), Some("access-1"));
            }
            assert_eq!(h.coordinator.refresh_state(), RefreshState::Idle);
        }

        #[tokio::test]
        async fn caller_after_settlement_starts_a_new_episode() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 30_000)),
            );

            let first = h.coordinator.get_valid_access_token().await;
            h.clock.advance(DurationMillis(3_600_000));
            let second = h.coordinator.get_valid_access_token().await;

            assert_eq!(token_of(&first), Some("access-1"));
            assert_eq!(token_of(&second), Some("access-2"));
            assert_eq!(h.issuer.calls(), 2);
        }

        #[tokio::test]
        async fn subscribers_are_notified_of_the_refresh() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 30_000)),
            );
            let mut watcher = h.coordinator.subscribe();
            assert!(watcher.latest().is_none());

            let (notified, _) = tokio::join!(watcher.changed(), h.coordinator.get_valid_access_token());

            assert_eq!(notified.unwrap().access_token().as_str(), "access-1");
        }
    }

    mod when_issuer_rejects_refresh {
        use super::*;

        #[tokio::test]
        async fn every_waiter_gets_nothing_and_session_is_terminated_once() {
            let h = harness(
                FakeIssuer::rejecting(400),
                FakeSession::default(),
                Some(cached("cached", 30_000)),
            );

            let results = join_all((0..5).map(|_| h.coordinator.get_valid_access_token())).await;

            assert!(results.iter().all(Option::is_none));
            assert_eq!(h.issuer.calls(), 1);
            assert_eq!(h.session.terminations(), 1);
            assert!(h.coordinator.current().is_none());
        }

        #[tokio::test]
        async fn forced_refresh_reports_the_same_failure_to_all() {
            let h = harness(
                FakeIssuer::rejecting(401),
                FakeSession::default(),
                Some(cached("cached", 3_600_000)),
            );

            let (a, b) = tokio::join!(
                h.coordinator.refresh_access_token(),
                h.coordinator.refresh_access_token()
            );

            let (a, b) = (a.unwrap_err(), b.unwrap_err());
            assert!(Arc::ptr_eq(&a, &b));
            assert!(matches!(
                *a,
                RefreshError::RefreshRequestFailed { status: 401, .. }
            ));
            assert_eq!(h.session.terminations(), 1);
        }

        #[tokio::test]
        async fn no_credential_is_published() {
            let h = harness(
                FakeIssuer::rejecting(400),
                FakeSession::default(),
                Some(cached("cached", 0)),
            );
            let watcher = h.coordinator.subscribe();

            h.coordinator.get_valid_access_token().await;

            assert!(watcher.latest().is_none());
        }
    }

    mod when_a_request_was_rejected {
        use super::*;

        #[tokio::test]
        async fn concurrent_rejections_share_a_single_refresh() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 3_600_000)),
            );
            let rejected = AccessToken::from_static("cached");

            let (a, b) = tokio::join!(
                h.coordinator.refresh_rejected(&rejected),
                h.coordinator.refresh_rejected(&rejected)
            );

            assert_eq!(a.unwrap().access_token().as_str(), "access-1");
            assert_eq!(b.unwrap().access_token().as_str(), "access-1");
            assert_eq!(h.issuer.calls(), 1);
        }

        #[tokio::test]
        async fn already_replaced_credential_is_reused() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 3_600_000)),
            );
            let rejected = AccessToken::from_static("cached");

            let first = h.coordinator.refresh_rejected(&rejected).await.unwrap();
            let second = h.coordinator.refresh_rejected(&rejected).await.unwrap();

            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(h.issuer.calls(), 1);
        }
    }

    mod when_nothing_is_cached {
        use super::*;

        #[tokio::test]
        async fn valid_session_access_token_is_adopted_without_refresh() {
            let exp = (T.0 / 1000) + 3600;
            let h = harness(
                FakeIssuer::default(),
                FakeSession::with(Session {
                    access_token: Some(jwt_expiring_at(exp)),
                    refresh_token: Some(RefreshToken::from_static("session-refresh")),
                }),
                None,
            );
            let watcher = h.coordinator.subscribe();

            let credential = h.coordinator.get_valid_access_token().await.unwrap();

            assert_eq!(credential.expires_at(), UnixMillis::from_secs(exp));
            assert_eq!(
                credential.refresh_token().map(|r| r.as_str()),
                Some("session-refresh")
            );
            assert_eq!(h.issuer.calls(), 0);
            assert!(watcher.latest().is_none());
        }

        #[tokio::test]
        async fn expired_session_access_token_is_refreshed_with_session_refresh_token() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::with(Session {
                    access_token: Some(jwt_expiring_at(T.0 / 1000)),
                    refresh_token: Some(RefreshToken::from_static("session-refresh")),
                }),
                None,
            );

            let credential = h.coordinator.get_valid_access_token().await;

            assert_eq!(token_of(&credential), Some("access-1"));
            assert_eq!(*h.issuer.seen.lock(), vec!["session-refresh".to_owned()]);
        }

        #[tokio::test]
        async fn no_session_yields_nothing_without_terminating() {
            let h = harness(FakeIssuer::default(), FakeSession::default(), None);

            let credential = h.coordinator.get_valid_access_token().await;

            assert!(credential.is_none());
            assert_eq!(h.issuer.calls(), 0);
            assert_eq!(h.session.terminations(), 0);
        }

        #[tokio::test]
        async fn session_fetch_failure_is_swallowed() {
            let h = harness(FakeIssuer::default(), FakeSession::failing(), None);

            let credential = h.coordinator.get_valid_access_token().await;

            assert!(credential.is_none());
            assert_eq!(h.session.terminations(), 0);
            assert_eq!(h.coordinator.refresh_state(), RefreshState::Idle);
        }

        #[tokio::test]
        async fn forced_refresh_without_refresh_token_fails_and_terminates() {
            let h = harness(FakeIssuer::default(), FakeSession::default(), None);

            let error = h.coordinator.refresh_access_token().await.unwrap_err();

            assert!(matches!(*error, RefreshError::NoRefreshToken));
            assert_eq!(h.issuer.calls(), 0);
            assert_eq!(h.session.terminations(), 1);
        }
    }

    mod when_cached_credential_has_no_refresh_token {
        use super::*;

        #[tokio::test]
        async fn expiry_ends_the_session_without_a_network_call() {
            let credential = Credential::new(AccessToken::from_static("cached"), T);
            let h = harness(FakeIssuer::default(), FakeSession::default(), Some(credential));

            let result = h.coordinator.get_valid_access_token().await;

            assert!(result.is_none());
            assert_eq!(h.issuer.calls(), 0);
            assert_eq!(h.session.terminations(), 1);
        }
    }

    mod when_the_leading_caller_is_cancelled {
        use super::*;

        #[tokio::test]
        async fn state_returns_to_idle_and_store_is_kept() {
            let h = harness(
                FakeIssuer::hanging(),
                FakeSession::default(),
                Some(cached("cached", 0)),
            );

            let leader = tokio::time::timeout(
                Duration::from_millis(50),
                h.coordinator.get_valid_access_token(),
            )
            .await;

            assert!(leader.is_err());
            assert_eq!(h.coordinator.refresh_state(), RefreshState::Idle);
            assert_eq!(h.session.terminations(), 0);
            assert_eq!(token_of(&h.coordinator.current()), Some("cached"));
        }

        #[tokio::test]
        async fn waiters_take_over_and_receive_the_refreshed_credential() {
            let h = harness(
                FakeIssuer::default(),
                FakeSession::default(),
                Some(cached("cached", 0)),
            );
            let rejected = AccessToken::from_static("cached");

            let leader = tokio::time::timeout(
                Duration::from_millis(5),
                h.coordinator.get_valid_access_token(),
            );
            let (leader, valid, replaced) = tokio::join!(
                leader,
                h.coordinator.get_valid_access_token(),
                h.coordinator.refresh_rejected(&rejected),
            );

            assert!(leader.is_err());
            assert_eq!(token_of(&valid), Some("access-2"));
            assert_eq!(replaced.unwrap().access_token().as_str(), "access-2");
            assert_eq!(h.issuer.calls(), 2);
            assert_eq!(h.session.terminations(), 0);
            assert_eq!(h.coordinator.refresh_state(), RefreshState::Idle);
        }
    }

    #[tokio::test]
    async fn sign_out_clears_and_terminates() {
        let h = harness(
            FakeIssuer::default(),
            FakeSession::default(),
            Some(cached("cached", 3_600_000)),
        );

        h.coordinator.sign_out().await;

        assert!(h.coordinator.current().is_none());
        assert_eq!(h.session.terminations(), 1);
    }
}
