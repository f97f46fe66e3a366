//! Role resolution with caching, bounded retries, and a polyfill for
//! hosts that lack the rich identity endpoint.
//!
//! ## Design
//! - Every directory call goes through a [`RequestCache`] so concurrent
//!   lookups for the same client coalesce, and through a [`RetryPolicy`]
//!   so flaky hosts get bounded retries.
//! - Hosts disagree on whether the rich identity endpoint exists at
//!   all. The resolver tracks that as [`ApiPresence`]: it starts
//!   unknown, gets settled by evidence, and once settled the losing
//!   path is never tried again. While unknown, identity lookups race
//!   the rich endpoint against a plain role lookup so an answer is in
//!   hand either way.
//! - A missing rich endpoint is polyfilled: identity is assembled from
//!   the client id and the role lookup, with no display name.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::authorization::{ClientInfo, HostDirectory, Role};
use crate::error::SyncError;
use crate::request::retry::{DEFAULT_BACKOFF_MS, DEFAULT_BASE_TIMEOUT_MS};
use crate::request::{RequestCache, RetryPolicy};

/// Sentinel id probed during warm-up. Never a real client.
const WARMUP_CLIENT_ID: &str = "synclave:warmup";

/// Timeouts tolerated on the rich endpoint before concluding it is
/// missing.
const DEFAULT_PRESENCE_TRIES: u32 = 3;

/// TTL for coalesced role and identity lookups: 5 seconds.
const LOOKUP_TTL_MS: u64 = 5_000;

/// TTL for registration results: 1 hour. Registrations also carry the
/// client's roles, so a fresh one doubles as a role answer.
const REGISTRATION_TTL_SECS: u64 = 3_600;

/// Field older hosts wrap the role array under.
const LEGACY_ROLES_FIELD: &str = "userRoles";

/// What the resolver believes about the rich identity endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApiPresence {
    /// No evidence yet; `tries_left` timeouts remain before giving up.
    Unknown { tries_left: u32 },
    /// The endpoint answered at least once, success or rejection.
    ProbablyExists,
    /// The endpoint only ever timed out; identity gets polyfilled.
    ProbablyPolyfilled,
}

impl ApiPresence {
    /// Any response, success or definite rejection, proves the endpoint
    /// is really there.
    fn witnessed(self) -> ApiPresence {
        ApiPresence::ProbablyExists
    }

    /// A timeout burns one try. Out of tries, conclude the endpoint is
    /// missing. Settled states stay settled.
    fn timed_out(self) -> ApiPresence {
        match self {
            ApiPresence::Unknown { tries_left } if tries_left > 1 => ApiPresence::Unknown {
                tries_left: tries_left - 1,
            },
            ApiPresence::Unknown { .. } => ApiPresence::ProbablyPolyfilled,
            settled => settled,
        }
    }
}

/// Tuning knobs for [`RoleResolver`].
#[derive(Debug, Clone)]
pub struct AuthorizationConfig {
    pub lookup_ttl: Duration,
    pub registration_ttl: Duration,
    pub base_timeout: Duration,
    pub backoff: Vec<Duration>,
    pub presence_tries: u32,
    pub warmup_probe: bool,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            lookup_ttl: Duration::from_millis(LOOKUP_TTL_MS),
            registration_ttl: Duration::from_secs(REGISTRATION_TTL_SECS),
            base_timeout: Duration::from_millis(DEFAULT_BASE_TIMEOUT_MS),
            backoff: DEFAULT_BACKOFF_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            presence_tries: DEFAULT_PRESENCE_TRIES,
            warmup_probe: true,
        }
    }
}

/// Role and identity lookups against a [`HostDirectory`].
///
/// Construction spawns a background warm-up probe when enabled, so a
/// Tokio runtime must be current.
pub struct RoleResolver {
    host: Arc<dyn HostDirectory>,
    config: AuthorizationConfig,
    presence: Arc<Mutex<ApiPresence>>,
    registrations: RequestCache<Vec<Role>>,
    role_lookups: RequestCache<Vec<Role>>,
    info_lookups: RequestCache<ClientInfo>,
    warmup_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoleResolver {
    pub fn new(host: Arc<dyn HostDirectory>) -> Self {
        Self::with_config(host, AuthorizationConfig::default())
    }

    pub fn with_config(host: Arc<dyn HostDirectory>, config: AuthorizationConfig) -> Self {
        let presence = Arc::new(Mutex::new(ApiPresence::Unknown {
            tries_left: config.presence_tries,
        }));
        let warmup = config.warmup_probe.then(|| {
            tokio::spawn(warmup_probe(
                host.clone(),
                presence.clone(),
                config.base_timeout,
            ))
        });
        Self {
            registrations: RequestCache::with_ttl(config.registration_ttl),
            role_lookups: RequestCache::with_ttl(config.lookup_ttl),
            info_lookups: RequestCache::with_ttl(config.lookup_ttl),
            host,
            config,
            presence,
            warmup_task: Mutex::new(warmup),
        }
    }

    /// Announce `client_id` to the host. The response carries the
    /// client's roles, which are kept long enough to answer later role
    /// checks without another round trip.
    pub async fn register_client_id(&self, client_id: &str) -> Result<Vec<Role>, SyncError> {
        if client_id.is_empty() {
            return Err(SyncError::MissingClientId);
        }
        let host = self.host.clone();
        let policy = RetryPolicy::with_delays(self.config.base_timeout, self.config.backoff.clone());
        let id = client_id.to_string();
        self.registrations
            .get_or_fetch(client_id, move || async move {
                policy
                    .run(
                        "registering client id",
                        || host.register_client_id(&id),
                        normalize_roles,
                        || SyncError::Exhausted {
                            operation: "registering client id".into(),
                        },
                    )
                    .await
            })
            .await
    }

    /// Roles currently granted to `client_id`.
    pub async fn client_roles(&self, client_id: &str) -> Result<Vec<Role>, SyncError> {
        if client_id.is_empty() {
            return Err(SyncError::MissingClientId);
        }
        // A live registration already answered this; no second trip.
        if let Some(pending) = self.registrations.cached(client_id) {
            return pending.await;
        }
        self.fetch_roles(client_id).await
    }

    /// Identity record for `client_id`, polyfilled when the host has no
    /// rich endpoint.
    pub async fn client_info(&self, client_id: &str) -> Result<ClientInfo, SyncError> {
        if client_id.is_empty() {
            return Err(SyncError::MissingClientId);
        }
        let presence = *self.presence.lock();
        match presence {
            ApiPresence::ProbablyExists => {
                self.fetch_info(client_id, self.config.backoff.clone())
                    .await
            }
            ApiPresence::ProbablyPolyfilled => self.polyfill_info(client_id).await,
            ApiPresence::Unknown { tries_left } => self.probe_info(client_id, tries_left).await,
        }
    }

    /// True when `client_id` holds at least one of `allowed`. An empty
    /// allowlist is an open gate and costs no lookup.
    pub async fn verify_roles_allowed(
        &self,
        client_id: &str,
        allowed: &[Role],
    ) -> Result<bool, SyncError> {
        if allowed.is_empty() {
            return Ok(true);
        }
        if client_id.is_empty() {
            return Err(SyncError::MissingClientId);
        }
        let held = self.client_roles(client_id).await?;
        Ok(held.iter().any(|role| allowed.contains(role)))
    }

    async fn fetch_roles(&self, client_id: &str) -> Result<Vec<Role>, SyncError> {
        let host = self.host.clone();
        let policy = RetryPolicy::with_delays(self.config.base_timeout, self.config.backoff.clone());
        let id = client_id.to_string();
        self.role_lookups
            .get_or_fetch(client_id, move || async move {
                policy
                    .run(
                        "getting client roles",
                        || host.client_roles(&id),
                        normalize_roles,
                        || SyncError::Exhausted {
                            operation: "getting client roles".into(),
                        },
                    )
                    .await
            })
            .await
    }

    async fn fetch_info(
        &self,
        client_id: &str,
        delays: Vec<Duration>,
    ) -> Result<ClientInfo, SyncError> {
        let host = self.host.clone();
        let policy = RetryPolicy::with_delays(self.config.base_timeout, delays);
        let id = client_id.to_string();
        self.info_lookups
            .get_or_fetch(client_id, move || async move {
                policy
                    .run(
                        "getting client info",
                        || host.client_info(&id),
                        parse_client_info,
                        || SyncError::Exhausted {
                            operation: "getting client info".into(),
                        },
                    )
                    .await
            })
            .await
    }

    /// Identity assembled locally from the role lookup.
    async fn polyfill_info(&self, client_id: &str) -> Result<ClientInfo, SyncError> {
        let roles = self.client_roles(client_id).await?;
        Ok(ClientInfo {
            user_id: client_id.to_string(),
            roles,
            display_name: None,
        })
    }

    /// Identity lookup while the rich endpoint's presence is unknown.
    async fn probe_info(&self, client_id: &str, tries_left: u32) -> Result<ClientInfo, SyncError> {
        // The schedule widens by one delay per consumed try: early
        // probes fail fast, later ones get more patience.
        let consumed = self.config.presence_tries.saturating_sub(tries_left) as usize;
        let widened = self.config.backoff[..consumed.min(self.config.backoff.len())].to_vec();

        // Race the rich endpoint against the role lookup it would
        // replace; whichever way presence settles, an answer is in hand.
        let (info_outcome, roles_outcome) = tokio::join!(
            self.fetch_info(client_id, widened),
            self.client_roles(client_id)
        );

        match info_outcome {
            Ok(info) => {
                self.transition(ApiPresence::witnessed);
                Ok(info)
            }
            Err(err) if err.is_timeout() => {
                self.transition(ApiPresence::timed_out);
                let roles = roles_outcome?;
                Ok(ClientInfo {
                    user_id: client_id.to_string(),
                    roles,
                    display_name: None,
                })
            }
            Err(err) => {
                // A definite rejection proves somebody answered there.
                self.transition(ApiPresence::witnessed);
                Err(err)
            }
        }
    }

    fn transition(&self, step: fn(ApiPresence) -> ApiPresence) {
        transition(&self.presence, step);
    }
}

impl Drop for RoleResolver {
    fn drop(&mut self) {
        if let Some(task) = self.warmup_task.lock().take() {
            task.abort();
        }
    }
}

fn transition(presence: &Mutex<ApiPresence>, step: fn(ApiPresence) -> ApiPresence) {
    let mut guard = presence.lock();
    let next = step(*guard);
    if next != *guard {
        tracing::debug!(from = ?*guard, to = ?next, "rich identity endpoint presence updated");
        *guard = next;
    }
}

/// Probe the rich endpoint with a sentinel id until presence settles,
/// so the first real identity lookup does not pay for the discovery.
async fn warmup_probe(
    host: Arc<dyn HostDirectory>,
    presence: Arc<Mutex<ApiPresence>>,
    base_timeout: Duration,
) {
    loop {
        if !matches!(*presence.lock(), ApiPresence::Unknown { .. }) {
            break;
        }
        let outcome = tokio::time::timeout(base_timeout, host.client_info(WARMUP_CLIENT_ID)).await;
        let step: fn(ApiPresence) -> ApiPresence = match outcome {
            Ok(Ok(_)) => ApiPresence::witnessed,
            Ok(Err(err)) if err.is_timeout() => ApiPresence::timed_out,
            Ok(Err(_)) => ApiPresence::witnessed,
            Err(_) => ApiPresence::timed_out,
        };
        transition(&presence, step);
    }
}

/// Normalize the host's role payload. Two shapes are accepted: a plain
/// role array, and the legacy object wrapping one under `userRoles`.
fn normalize_roles(payload: Value) -> Option<Vec<Role>> {
    let entries = match payload {
        Value::Array(entries) => entries,
        Value::Object(mut fields) => match fields.remove(LEGACY_ROLES_FIELD) {
            Some(Value::Array(entries)) => entries,
            _ => return None,
        },
        _ => return None,
    };
    let mut roles = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::String(name) = entry else {
            // A non-string member means this is not a role array at
            // all; let the retry layer treat the answer as unusable.
            return None;
        };
        match Role::parse(&name) {
            Some(role) => roles.push(role),
            None => tracing::debug!(role = %name, "skipping unrecognized role"),
        }
    }
    Some(roles)
}

fn parse_client_info(payload: Value) -> Option<ClientInfo> {
    let Value::Object(mut fields) = payload else {
        return None;
    };
    let Some(Value::String(user_id)) = fields.remove("userId") else {
        return None;
    };
    let roles = normalize_roles(fields.remove("roles")?)?;
    let display_name = match fields.remove("displayName") {
        Some(Value::String(name)) => Some(name),
        _ => None,
    };
    Some(ClientInfo {
        user_id,
        roles,
        display_name,
    })
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum InfoBehavior {
        Answer(Value),
        Reject,
        Hang,
    }

    struct FakeDirectory {
        roles: Value,
        info: InfoBehavior,
        register_calls: AtomicUsize,
        role_calls: AtomicUsize,
        info_calls: AtomicUsize,
    }

    impl FakeDirectory {
        fn new(roles: Value, info: InfoBehavior) -> Self {
            Self {
                roles,
                info,
                register_calls: AtomicUsize::new(0),
                role_calls: AtomicUsize::new(0),
                info_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HostDirectory for FakeDirectory {
        async fn register_client_id(&self, _client_id: &str) -> Result<Value, SyncError> {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.roles.clone())
        }

        async fn client_roles(&self, _client_id: &str) -> Result<Value, SyncError> {
            self.role_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.roles.clone())
        }

        async fn client_info(&self, _client_id: &str) -> Result<Value, SyncError> {
            self.info_calls.fetch_add(1, Ordering::SeqCst);
            match &self.info {
                InfoBehavior::Answer(value) => Ok(value.clone()),
                InfoBehavior::Reject => Err(SyncError::Host("no such endpoint".into())),
                InfoBehavior::Hang => std::future::pending().await,
            }
        }
    }

    fn fast_config() -> AuthorizationConfig {
        AuthorizationConfig {
            lookup_ttl: Duration::from_secs(5),
            registration_ttl: Duration::from_secs(3_600),
            base_timeout: Duration::from_millis(10),
            backoff: vec![Duration::from_millis(1), Duration::from_millis(1)],
            presence_tries: 2,
            warmup_probe: false,
        }
    }

    #[test]
    fn presence_transitions() {
        let unknown = ApiPresence::Unknown { tries_left: 2 };
        assert_eq!(unknown.timed_out(), ApiPresence::Unknown { tries_left: 1 });
        assert_eq!(
            unknown.timed_out().timed_out(),
            ApiPresence::ProbablyPolyfilled
        );
        assert_eq!(unknown.witnessed(), ApiPresence::ProbablyExists);
        // Settled states do not unsettle.
        assert_eq!(
            ApiPresence::ProbablyExists.timed_out(),
            ApiPresence::ProbablyExists
        );
        assert_eq!(
            ApiPresence::ProbablyPolyfilled.witnessed(),
            ApiPresence::ProbablyExists
        );
    }

    #[test]
    fn roles_parse_from_a_plain_array() {
        let roles = normalize_roles(json!(["presenter", "attendee"]));
        assert_eq!(roles, Some(vec![Role::Presenter, Role::Attendee]));
    }

    #[test]
    fn roles_parse_from_the_legacy_wrapper() {
        let roles = normalize_roles(json!({ "userRoles": ["organizer"] }));
        assert_eq!(roles, Some(vec![Role::Organizer]));
    }

    #[test]
    fn unrecognized_role_names_are_skipped() {
        let roles = normalize_roles(json!(["presenter", "superuser"]));
        assert_eq!(roles, Some(vec![Role::Presenter]));
    }

    #[test]
    fn non_string_role_members_reject_the_whole_shape() {
        assert_eq!(normalize_roles(json!(["presenter", 7])), None);
        assert_eq!(normalize_roles(json!("presenter")), None);
        assert_eq!(normalize_roles(json!({ "roles": ["presenter"] })), None);
    }

    #[test]
    fn client_info_parses_with_optional_display_name() {
        let full = parse_client_info(json!({
            "userId": "client-a",
            "roles": ["presenter"],
            "displayName": "Avery",
        }))
        .unwrap();
        assert_eq!(full.user_id, "client-a");
        assert_eq!(full.display_name.as_deref(), Some("Avery"));

        let bare = parse_client_info(json!({
            "userId": "client-b",
            "roles": [],
        }))
        .unwrap();
        assert!(bare.display_name.is_none());

        assert!(parse_client_info(json!({ "roles": ["guest"] })).is_none());
    }

    #[tokio::test]
    async fn missing_client_id_fails_fast() {
        let host = Arc::new(FakeDirectory::new(json!([]), InfoBehavior::Reject));
        let resolver = RoleResolver::with_config(host.clone(), fast_config());

        assert!(matches!(
            resolver.client_roles("").await,
            Err(SyncError::MissingClientId)
        ));
        assert!(matches!(
            resolver.register_client_id("").await,
            Err(SyncError::MissingClientId)
        ));
        assert!(matches!(
            resolver.client_info("").await,
            Err(SyncError::MissingClientId)
        ));
        assert_eq!(host.role_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_role_payload_exhausts_the_schedule() {
        let host = Arc::new(FakeDirectory::new(
            json!({ "wrong": true }),
            InfoBehavior::Reject,
        ));
        let resolver = RoleResolver::with_config(host.clone(), fast_config());

        let got = resolver.client_roles("client-a").await;
        assert!(matches!(got, Err(SyncError::Exhausted { .. })));
        // One initial attempt plus one per scheduled delay.
        assert_eq!(host.role_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn registration_answers_later_role_checks() {
        let host = Arc::new(FakeDirectory::new(
            json!(["presenter"]),
            InfoBehavior::Reject,
        ));
        let resolver = RoleResolver::with_config(host.clone(), fast_config());

        let registered = resolver.register_client_id("client-a").await.unwrap();
        assert_eq!(registered, vec![Role::Presenter]);

        let roles = resolver.client_roles("client-a").await.unwrap();
        assert_eq!(roles, vec![Role::Presenter]);
        assert_eq!(host.register_calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.role_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_allowlist_is_an_open_gate() {
        let host = Arc::new(FakeDirectory::new(json!([]), InfoBehavior::Reject));
        let resolver = RoleResolver::with_config(host.clone(), fast_config());

        assert!(resolver.verify_roles_allowed("client-a", &[]).await.unwrap());
        assert_eq!(host.role_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn allowlist_checks_intersection() {
        let host = Arc::new(FakeDirectory::new(
            json!(["attendee"]),
            InfoBehavior::Reject,
        ));
        let resolver = RoleResolver::with_config(host, fast_config());

        assert!(resolver
            .verify_roles_allowed("client-a", &[Role::Presenter, Role::Attendee])
            .await
            .unwrap());
        assert!(!resolver
            .verify_roles_allowed("client-a", &[Role::Organizer])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rich_endpoint_answer_settles_presence_to_exists() {
        let host = Arc::new(FakeDirectory::new(
            json!(["attendee"]),
            InfoBehavior::Answer(json!({
                "userId": "client-a",
                "roles": ["presenter"],
                "displayName": "Avery",
            })),
        ));
        let resolver = RoleResolver::with_config(host.clone(), fast_config());

        let info = resolver.client_info("client-a").await.unwrap();
        assert_eq!(info.roles, vec![Role::Presenter]);
        assert_eq!(info.display_name.as_deref(), Some("Avery"));

        // The probe raced a role lookup; once presence is settled the
        // direct path skips it.
        let raced = host.role_calls.load(Ordering::SeqCst);
        let _ = resolver.client_info("client-b").await.unwrap();
        assert_eq!(host.role_calls.load(Ordering::SeqCst), raced);
    }

    #[tokio::test]
    async fn repeated_hangs_settle_presence_to_polyfilled() {
        let host = Arc::new(FakeDirectory::new(
            json!(["attendee"]),
            InfoBehavior::Hang,
        ));
        let resolver = RoleResolver::with_config(host.clone(), fast_config());

        // First probe: empty schedule, one hung attempt.
        let a = resolver.client_info("a").await.unwrap();
        assert_eq!(a.user_id, "a");
        assert_eq!(a.roles, vec![Role::Attendee]);
        assert!(a.display_name.is_none());
        assert_eq!(host.info_calls.load(Ordering::SeqCst), 1);

        // Second probe: schedule widened by one delay, two attempts,
        // and the presence budget is spent.
        let b = resolver.client_info("b").await.unwrap();
        assert_eq!(b.roles, vec![Role::Attendee]);
        assert_eq!(host.info_calls.load(Ordering::SeqCst), 3);

        // Settled: polyfill without touching the rich endpoint.
        let c = resolver.client_info("c").await.unwrap();
        assert_eq!(c.user_id, "c");
        assert_eq!(host.info_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rich_endpoint_rejection_witnesses_existence() {
        let host = Arc::new(FakeDirectory::new(
            json!(["attendee"]),
            InfoBehavior::Reject,
        ));
        let resolver = RoleResolver::with_config(host.clone(), fast_config());

        // The rejection propagates rather than polyfilling.
        let got = resolver.client_info("a").await;
        assert!(matches!(got, Err(SyncError::Host(_))));

        // Presence settled to exists: the next lookup runs the full
        // schedule against the endpoint instead of probing.
        let got = resolver.client_info("b").await;
        assert!(matches!(got, Err(SyncError::Host(_))));
        assert_eq!(host.info_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn warmup_rejection_settles_presence_without_real_lookups() {
        let host = Arc::new(FakeDirectory::new(json!([]), InfoBehavior::Reject));
        let mut config = fast_config();
        config.warmup_probe = true;
        let _resolver = RoleResolver::with_config(host.clone(), config);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // One sentinel probe witnessed the endpoint and the loop ended.
        assert_eq!(host.info_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn warmup_hangs_settle_presence_to_polyfilled() {
        let host = Arc::new(FakeDirectory::new(json!(["guest"]), InfoBehavior::Hang));
        let mut config = fast_config();
        config.warmup_probe = true;
        let resolver = RoleResolver::with_config(host.clone(), config);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let warmup_calls = host.info_calls.load(Ordering::SeqCst);
        assert_eq!(warmup_calls, 2);

        // Real lookups polyfill straight away.
        let info = resolver.client_info("client-a").await.unwrap();
        assert_eq!(info.roles, vec![Role::Guest]);
        assert_eq!(host.info_calls.load(Ordering::SeqCst), warmup_calls);
    }
}
