//! Deployment reconciler — drives one node toward its desired closure.
//!
//! The reconciler is an explicit state machine:
//!
//! ```text
//! Idle ──Update(put, own key)──▶ Evaluating ──same closure──▶ Idle
//!                                     │
//!                                     ▼
//!                                 Deploying ──▶ Reporting ──▶ Idle
//! ```
//!
//! [`Reconciler::handle`] consumes one [`Event`] and runs the machine back
//! to `Idle`. [`Reconciler::run`] turns desired-state revisions read from a
//! [`DeploymentBus`] into events. Outer shutdown is only observed while
//! idle, so a deployment that has started always finishes and reports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nixfleet_cache::{CacheOptions, CacheServer};
use nixfleet_core::{NodeIdentity, SecretKey};
use nixfleet_state::{
    DEFAULT_MAX_VALUE_SIZE, DeploymentDescriptor, DeploymentOutcome, KvEntry, Layout, Operation,
    StateStore, unix_now,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::DeploymentBus;
use crate::collaborators::Collaborators;
use crate::error::{AgentError, AgentResult};
use crate::output::{CapturedOutput, DEFAULT_MAX_OUTPUT_BYTES, fit_outcome, omitted_notice};

/// How long a stopped proxy may take to drain its connections.
const PROXY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Evaluating,
    Deploying,
    Reporting,
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Update(KvEntry),
    Timeout,
    Cancelled,
}

/// What handling one event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Not addressed to this node, not a put, or a timeout.
    Ignored,
    /// Addressed to this node but undecodable.
    Discarded,
    /// The node already runs the requested closure.
    UpToDate,
    Reported(DeploymentOutcome),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub identity: NodeIdentity,
    /// Key the per-deployment cache proxy signs narinfos with.
    pub cache_key: Arc<SecretKey>,
    pub layout: Layout,
    /// Forces every deployment to dry-activate.
    pub dry_run: bool,
    /// Longest wait for a desired-state revision, and the pause after a
    /// failed read.
    pub poll_interval: Duration,
    pub max_output_bytes: usize,
    /// Largest serialized outcome the result bucket accepts.
    pub max_record_bytes: usize,
    /// Cache the proxy pulls missing paths from, normally the dispatcher.
    pub upstream: Option<String>,
}

impl ReconcilerOptions {
    pub fn new(identity: NodeIdentity, cache_key: Arc<SecretKey>) -> Self {
        Self {
            identity,
            cache_key,
            layout: Layout::default(),
            dry_run: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_record_bytes: DEFAULT_MAX_VALUE_SIZE,
            upstream: None,
        }
    }
}

pub struct Reconciler {
    /// Node-local cache store the proxy serves from.
    store: StateStore,
    bus: Arc<dyn DeploymentBus>,
    options: ReconcilerOptions,
    collaborators: Collaborators,
    /// Newest desired-state revision already handled.
    last_revision: u64,
    phase: Phase,
}

impl Reconciler {
    /// `store` backs the per-deployment cache proxy and must hold the cache
    /// resources of `options.layout`.
    pub fn new(
        store: StateStore,
        bus: Arc<dyn DeploymentBus>,
        options: ReconcilerOptions,
        collaborators: Collaborators,
    ) -> AgentResult<Self> {
        store.key_value(&options.layout.narinfo)?;
        store.object_store(&options.layout.nar)?;
        Ok(Self {
            store,
            bus,
            options,
            collaborators,
            last_revision: 0,
            phase: Phase::Idle,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.options.identity
    }

    /// Follow this node's desired state until `shutdown` turns true.
    ///
    /// A failed read is logged and retried after `poll_interval`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        info!(
            node = %self.options.identity,
            upstream = self.options.upstream.as_deref().unwrap_or("none"),
            "watching for deployments"
        );

        loop {
            if *shutdown.borrow() {
                self.handle(Event::Cancelled).await?;
                break;
            }

            let next = tokio::select! {
                next = self.bus.next_desired(
                    &self.options.identity,
                    self.last_revision,
                    self.options.poll_interval,
                ) => Some(next),
                _ = shutdown.changed() => None,
            };

            let event = match next {
                None => Event::Cancelled,
                Some(Ok(Some(entry))) => Event::Update(entry),
                Some(Ok(None)) => Event::Timeout,
                Some(Err(e)) => {
                    warn!(node = %self.options.identity, error = %e, "reading desired state failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            match self.handle(event).await {
                Ok(Disposition::Stopped) => break,
                Ok(_) => {}
                Err(e) => error!(node = %self.options.identity, error = %e, "deployment handling failed"),
            }
        }

        info!(node = %self.options.identity, "reconciler stopped");
        Ok(())
    }

    /// Run the machine for one event and return it to `Idle`.
    pub async fn handle(&mut self, event: Event) -> AgentResult<Disposition> {
        let result = self.step(event).await;
        self.phase = Phase::Idle;
        result
    }

    async fn step(&mut self, event: Event) -> AgentResult<Disposition> {
        let entry = match event {
            Event::Cancelled => return Ok(Disposition::Stopped),
            Event::Timeout => return Ok(Disposition::Ignored),
            Event::Update(entry) => entry,
        };
        self.last_revision = self.last_revision.max(entry.revision);

        if entry.key != self.options.identity.as_str() || entry.operation != Operation::Put {
            debug!(bucket = %entry.bucket, key = %entry.key, operation = ?entry.operation, "ignoring update");
            return Ok(Disposition::Ignored);
        }

        let descriptor: DeploymentDescriptor = match serde_json::from_slice(&entry.value) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(revision = entry.revision, error = %e, "discarding malformed deployment");
                return Ok(Disposition::Discarded);
            }
        };

        self.phase = Phase::Evaluating;
        match self.collaborators.inspector.current_closure().await {
            Ok(current) if current == descriptor.closure => {
                info!(closure = %descriptor.closure, "system already matches deployment");
                return Ok(Disposition::UpToDate);
            }
            Ok(current) => {
                debug!(%current, closure = %descriptor.closure, "system differs from deployment");
            }
            Err(e) => {
                warn!(error = %e, "could not determine current system, deploying anyway");
            }
        }

        self.phase = Phase::Deploying;
        let outcome = self.deploy(&descriptor).await;

        self.phase = Phase::Reporting;
        let outcome = self.report(outcome).await?;
        Ok(Disposition::Reported(outcome))
    }

    async fn deploy(&self, descriptor: &DeploymentDescriptor) -> DeploymentOutcome {
        info!(
            closure = %descriptor.closure,
            action = descriptor.action.as_str(),
            "deploying"
        );
        let started = Instant::now();
        let mut output = CapturedOutput::default();

        let result = self.attempt(descriptor, &mut output).await;
        let elapsed = started.elapsed();
        let success = match &result {
            Ok(()) => {
                info!(closure = %descriptor.closure, ?elapsed, "deployment complete");
                true
            }
            Err(e) => {
                error!(closure = %descriptor.closure, ?elapsed, error = %e, "deployment failed");
                output.push_line(&e.to_string());
                false
            }
        };

        DeploymentOutcome {
            deployment: descriptor.clone(),
            success,
            output: output.into_string(self.options.max_output_bytes),
            elapsed_ms: elapsed.as_millis() as u64,
            finished_at: unix_now(),
        }
    }

    /// Serve a private cache proxy while fetching and applying. Whichever
    /// finishes first ends the attempt.
    async fn attempt(
        &self,
        descriptor: &DeploymentDescriptor,
        output: &mut CapturedOutput,
    ) -> AgentResult<()> {
        let mut proxy_options = CacheOptions::new(self.options.cache_key.clone(), &self.options.layout);
        proxy_options.bind = SocketAddr::from(([127, 0, 0, 1], 0));
        proxy_options.upstream = self.options.upstream.clone();
        proxy_options.quiet = true;

        let mut proxy = CacheServer::new(self.store.clone(), proxy_options);
        proxy.init().await?;
        let addr = proxy.listen_addr().ok_or(AgentError::ProxyNotBound)?;
        let endpoint = format!("http://{addr}");
        debug!(%endpoint, "cache proxy started");

        let (stop_tx, stop_rx) = watch::channel(false);
        let serve = proxy.run(stop_rx);
        tokio::pin!(serve);
        let work = self.fetch_and_apply(&endpoint, descriptor, output);
        tokio::pin!(work);

        let (result, proxy_finished) = tokio::select! {
            result = &mut work => (result, false),
            served = &mut serve => {
                let err = match served {
                    Ok(()) => AgentError::ProxyStopped,
                    Err(e) => AgentError::Cache(e),
                };
                (Err(err), true)
            }
        };

        if !proxy_finished {
            let _ = stop_tx.send(true);
            match tokio::time::timeout(PROXY_DRAIN_TIMEOUT, &mut serve).await {
                Ok(Ok(())) => debug!(%endpoint, "cache proxy stopped"),
                Ok(Err(e)) => warn!(%endpoint, error = %e, "cache proxy failed while stopping"),
                Err(_) => warn!(%endpoint, "cache proxy did not stop in time"),
            }
        }

        result
    }

    async fn fetch_and_apply(
        &self,
        endpoint: &str,
        descriptor: &DeploymentDescriptor,
        output: &mut CapturedOutput,
    ) -> AgentResult<()> {
        info!(closure = %descriptor.closure, %endpoint, "copying closure from cache proxy");
        match self
            .collaborators
            .fetcher
            .fetch(endpoint, &descriptor.closure)
            .await
        {
            Ok(captured) => output.push_command(&captured),
            Err(failure) => {
                output.push_command(&failure.output);
                return Err(AgentError::Command {
                    step: "fetch",
                    message: failure.message,
                });
            }
        }

        let dry_run = descriptor.dry_run || self.options.dry_run;
        info!(action = descriptor.action.as_str(), dry_run, "switching configuration");
        match self.collaborators.applier.apply(descriptor, dry_run).await {
            Ok(captured) => {
                output.push_command(&captured);
                Ok(())
            }
            Err(failure) => {
                output.push_command(&failure.output);
                Err(AgentError::Command {
                    step: "apply",
                    message: failure.message,
                })
            }
        }
    }

    /// Send `outcome` to the bus, cut down to fit the result bucket.
    /// Returns what was stored.
    async fn report(&self, outcome: DeploymentOutcome) -> AgentResult<DeploymentOutcome> {
        let node = &self.options.identity;
        let outcome = fit_outcome(outcome, self.options.max_record_bytes);
        match self.bus.report(node, &outcome).await {
            Ok(()) => {
                debug!(%node, success = outcome.success, "outcome reported");
                Ok(outcome)
            }
            Err(e) if e.is_too_large() => {
                warn!(%node, error = %e, "outcome refused as too large, reporting without output");
                let mut bare = outcome;
                bare.output = omitted_notice(bare.output.len());
                self.bus.report(node, &bare).await?;
                Ok(bare)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use nixfleet_api::ApiError;
    use nixfleet_state::{Action, bootstrap};

    use super::*;
    use crate::bus::LocalBus;
    use crate::collaborators::{
        ClosureFetcher, CommandFailure, CommandOutput, CommandResult, ConfigurationApplier,
        SystemInspector,
    };

    const CURRENT: &str = "/nix/store/abc-system";
    const TARGET: &str = "/nix/store/xyz-system";

    /// One fake playing every host role, recording what was asked of it.
    struct FakeSystem {
        current: Result<String, String>,
        fetch_output: Vec<u8>,
        fetch_fails: bool,
        apply_fails: bool,
        fetches: Mutex<Vec<(String, String)>>,
        applies: Mutex<Vec<(String, bool)>>,
    }

    impl FakeSystem {
        fn running(current: &str) -> Self {
            Self {
                current: Ok(current.to_string()),
                fetch_output: b"copied\n".to_vec(),
                fetch_fails: false,
                apply_fails: false,
                fetches: Mutex::new(Vec::new()),
                applies: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SystemInspector for FakeSystem {
        async fn current_closure(&self) -> Result<String, CommandFailure> {
            self.current
                .clone()
                .map_err(|msg| CommandFailure::new(msg, CommandOutput::default()))
        }
    }

    #[async_trait]
    impl ClosureFetcher for FakeSystem {
        async fn fetch(&self, endpoint: &str, closure: &str) -> CommandResult {
            self.fetches
                .lock()
                .unwrap()
                .push((endpoint.to_string(), closure.to_string()));
            if self.fetch_fails {
                return Err(CommandFailure::new(
                    "exited with exit status: 1",
                    CommandOutput {
                        stdout: Vec::new(),
                        stderr: b"error: path not found\n".to_vec(),
                    },
                ));
            }
            Ok(CommandOutput {
                stdout: self.fetch_output.clone(),
                stderr: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl ConfigurationApplier for FakeSystem {
        async fn apply(&self, descriptor: &DeploymentDescriptor, dry_run: bool) -> CommandResult {
            self.applies
                .lock()
                .unwrap()
                .push((descriptor.closure.clone(), dry_run));
            if self.apply_fails {
                return Err(CommandFailure::new(
                    "exited with exit status: 4",
                    CommandOutput::stdout("activation failed\n"),
                ));
            }
            Ok(CommandOutput::stdout("activated\n"))
        }
    }

    fn identity() -> NodeIdentity {
        NodeIdentity::from_public_key(&SecretKey::from_seed("node", [2; 32]).public_key())
    }

    fn options() -> ReconcilerOptions {
        ReconcilerOptions::new(
            identity(),
            Arc::new(SecretKey::from_seed("cache-1", [5; 32])),
        )
    }

    fn store() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        bootstrap(&store, &Layout::default()).unwrap();
        store
    }

    /// Reconciler whose bus is the buckets of the same store.
    fn reconciler(system: Arc<FakeSystem>) -> (StateStore, Reconciler) {
        let store = store();
        let bus = Arc::new(LocalBus::open(&store, &Layout::default()).unwrap());
        let reconciler = Reconciler::new(
            store.clone(),
            bus,
            options(),
            Collaborators::from_system(system),
        )
        .unwrap();
        (store, reconciler)
    }

    /// Refuses the first `refusals` reports as too large, keeps the rest.
    struct RefusingBus {
        refusals: AtomicUsize,
        reports: Mutex<Vec<DeploymentOutcome>>,
    }

    #[async_trait]
    impl DeploymentBus for RefusingBus {
        async fn next_desired(
            &self,
            _node: &NodeIdentity,
            _after: u64,
            wait: Duration,
        ) -> AgentResult<Option<KvEntry>> {
            tokio::time::sleep(wait).await;
            Ok(None)
        }

        async fn report(&self, _node: &NodeIdentity, outcome: &DeploymentOutcome) -> AgentResult<()> {
            let left = self.refusals.load(Ordering::SeqCst);
            if left > 0 {
                self.refusals.store(left - 1, Ordering::SeqCst);
                return Err(ApiError::TooLarge("length limit exceeded".to_string()).into());
            }
            self.reports.lock().unwrap().push(outcome.clone());
            Ok(())
        }
    }

    /// Fails the first `failures` reads, then behaves like `inner`.
    struct FlakyBus {
        failures: AtomicUsize,
        inner: LocalBus,
    }

    #[async_trait]
    impl DeploymentBus for FlakyBus {
        async fn next_desired(
            &self,
            node: &NodeIdentity,
            after: u64,
            wait: Duration,
        ) -> AgentResult<Option<KvEntry>> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ApiError::Http {
                    url: "http://dispatcher".to_string(),
                    message: "connection refused".to_string(),
                }
                .into());
            }
            self.inner.next_desired(node, after, wait).await
        }

        async fn report(&self, node: &NodeIdentity, outcome: &DeploymentOutcome) -> AgentResult<()> {
            self.inner.report(node, outcome).await
        }
    }

    fn update(key: &str, descriptor: &DeploymentDescriptor) -> Event {
        Event::Update(KvEntry {
            bucket: "agent-deployments".to_string(),
            key: key.to_string(),
            value: serde_json::to_vec(descriptor).unwrap(),
            revision: 1,
            operation: Operation::Put,
        })
    }

    fn descriptor(closure: &str) -> DeploymentDescriptor {
        DeploymentDescriptor {
            closure: closure.to_string(),
            action: Action::Switch,
            dry_run: false,
        }
    }

    fn stored_outcome(store: &StateStore) -> Option<DeploymentOutcome> {
        store
            .key_value("agent-deployment-results")
            .unwrap()
            .get_json(identity().as_str())
            .unwrap()
    }

    #[tokio::test]
    async fn timeout_and_cancel() {
        let (_, mut r) = reconciler(Arc::new(FakeSystem::running(CURRENT)));
        assert_eq!(r.handle(Event::Timeout).await.unwrap(), Disposition::Ignored);
        assert_eq!(r.handle(Event::Cancelled).await.unwrap(), Disposition::Stopped);
        assert_eq!(r.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn foreign_keys_and_deletes_are_ignored() {
        let system = Arc::new(FakeSystem::running(CURRENT));
        let (store, mut r) = reconciler(system.clone());

        let foreign = update("Nsomeoneelse", &descriptor(TARGET));
        assert_eq!(r.handle(foreign).await.unwrap(), Disposition::Ignored);

        let delete = Event::Update(KvEntry {
            bucket: "agent-deployments".to_string(),
            key: identity().to_string(),
            value: Vec::new(),
            revision: 2,
            operation: Operation::Delete,
        });
        assert_eq!(r.handle(delete).await.unwrap(), Disposition::Ignored);

        assert!(system.fetches.lock().unwrap().is_empty());
        assert!(stored_outcome(&store).is_none());
    }

    #[tokio::test]
    async fn malformed_descriptor_is_discarded() {
        let (store, mut r) = reconciler(Arc::new(FakeSystem::running(CURRENT)));
        let event = Event::Update(KvEntry {
            bucket: "agent-deployments".to_string(),
            key: identity().to_string(),
            value: b"{not json".to_vec(),
            revision: 1,
            operation: Operation::Put,
        });
        assert_eq!(r.handle(event).await.unwrap(), Disposition::Discarded);
        assert!(stored_outcome(&store).is_none());
    }

    #[tokio::test]
    async fn matching_closure_writes_no_outcome() {
        let system = Arc::new(FakeSystem::running(CURRENT));
        let (store, mut r) = reconciler(system.clone());

        let event = update(identity().as_str(), &descriptor(CURRENT));
        assert_eq!(r.handle(event).await.unwrap(), Disposition::UpToDate);
        assert!(system.fetches.lock().unwrap().is_empty());
        assert!(stored_outcome(&store).is_none());
    }

    #[tokio::test]
    async fn mismatch_deploys_and_reports_success() {
        let system = Arc::new(FakeSystem::running(CURRENT));
        let (store, mut r) = reconciler(system.clone());

        let event = update(identity().as_str(), &descriptor(TARGET));
        let Disposition::Reported(outcome) = r.handle(event).await.unwrap() else {
            panic!("expected a reported outcome");
        };

        assert!(outcome.success);
        assert_eq!(outcome.deployment.closure, TARGET);
        assert_eq!(outcome.output, "copied\nactivated\n");
        assert_eq!(stored_outcome(&store), Some(outcome));

        let fetches = system.fetches.lock().unwrap();
        assert_eq!(fetches.len(), 1);
        assert!(fetches[0].0.starts_with("http://127.0.0.1:"));
        assert_eq!(fetches[0].1, TARGET);
        assert_eq!(*system.applies.lock().unwrap(), vec![(TARGET.to_string(), false)]);
    }

    #[tokio::test]
    async fn fetch_failure_skips_apply() {
        let mut fake = FakeSystem::running(CURRENT);
        fake.fetch_fails = true;
        let system = Arc::new(fake);
        let (store, mut r) = reconciler(system.clone());

        r.handle(update(identity().as_str(), &descriptor(TARGET)))
            .await
            .unwrap();

        let outcome = stored_outcome(&store).unwrap();
        assert!(!outcome.success);
        assert!(outcome.output.contains("error: path not found"));
        assert!(outcome.output.contains("fetch failed"));
        assert!(system.applies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_failure_is_reported() {
        let mut fake = FakeSystem::running(CURRENT);
        fake.apply_fails = true;
        let (store, mut r) = reconciler(Arc::new(fake));

        r.handle(update(identity().as_str(), &descriptor(TARGET)))
            .await
            .unwrap();

        let outcome = stored_outcome(&store).unwrap();
        assert!(!outcome.success);
        assert!(outcome.output.starts_with("copied\nactivation failed\n"));
    }

    #[tokio::test]
    async fn unknown_current_system_still_deploys() {
        let mut fake = FakeSystem::running(CURRENT);
        fake.current = Err("readlink failed".to_string());
        let (store, mut r) = reconciler(Arc::new(fake));

        r.handle(update(identity().as_str(), &descriptor(TARGET)))
            .await
            .unwrap();
        assert!(stored_outcome(&store).unwrap().success);
    }

    #[tokio::test]
    async fn agent_dry_run_overrides_descriptor() {
        let system = Arc::new(FakeSystem::running(CURRENT));
        let (_, mut r) = reconciler(system.clone());
        r.options.dry_run = true;

        r.handle(update(identity().as_str(), &descriptor(TARGET)))
            .await
            .unwrap();
        assert_eq!(*system.applies.lock().unwrap(), vec![(TARGET.to_string(), true)]);
    }

    #[tokio::test]
    async fn oversized_output_is_truncated() {
        let system = Arc::new(FakeSystem::running(CURRENT));
        let (store, mut r) = reconciler(system);
        r.options.max_output_bytes = 8;

        r.handle(update(identity().as_str(), &descriptor(TARGET)))
            .await
            .unwrap();
        let outcome = stored_outcome(&store).unwrap();
        assert!(outcome.output.starts_with("[output truncated"));
        assert!(outcome.output.ends_with("\ntivated\n"));
    }

    #[tokio::test]
    async fn escape_heavy_output_is_still_reported() {
        let mut fake = FakeSystem::running(CURRENT);
        fake.fetch_output = vec![0x1b; 600 * 1024];
        let (store, mut r) = reconciler(Arc::new(fake));

        let Disposition::Reported(outcome) = r
            .handle(update(identity().as_str(), &descriptor(TARGET)))
            .await
            .unwrap()
        else {
            panic!("expected a reported outcome");
        };

        let stored = stored_outcome(&store).unwrap();
        assert_eq!(stored, outcome);
        assert!(serde_json::to_vec(&stored).unwrap().len() <= DEFAULT_MAX_VALUE_SIZE);
        assert!(stored.output.starts_with("[output truncated"));
        assert!(stored.output.ends_with("activated\n"));
    }

    #[tokio::test]
    async fn refused_outcome_is_resent_without_output() {
        let bus = Arc::new(RefusingBus {
            refusals: AtomicUsize::new(1),
            reports: Mutex::new(Vec::new()),
        });
        let mut r = Reconciler::new(
            store(),
            bus.clone(),
            options(),
            Collaborators::from_system(Arc::new(FakeSystem::running(CURRENT))),
        )
        .unwrap();

        r.handle(update(identity().as_str(), &descriptor(TARGET)))
            .await
            .unwrap();

        let reports = bus.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].success);
        assert!(reports[0].output.starts_with("[output omitted: "));
    }

    #[tokio::test]
    async fn read_errors_do_not_end_the_loop() {
        let store = store();
        let bus = Arc::new(FlakyBus {
            failures: AtomicUsize::new(3),
            inner: LocalBus::open(&store, &Layout::default()).unwrap(),
        });
        let mut options = options();
        options.poll_interval = Duration::from_millis(10);
        let mut r = Reconciler::new(
            store.clone(),
            bus.clone(),
            options,
            Collaborators::from_system(Arc::new(FakeSystem::running(CURRENT))),
        )
        .unwrap();

        let mut results = store
            .key_value("agent-deployment-results")
            .unwrap()
            .watch(identity().as_str())
            .unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { r.run(stop_rx).await });

        store
            .key_value("agent-deployments")
            .unwrap()
            .put_json(identity().as_str(), &descriptor(TARGET))
            .unwrap();

        match results.next(Duration::from_secs(5)).await.unwrap() {
            nixfleet_state::WatchEvent::Entry(_) => {}
            other => panic!("no outcome after read errors: {other:?}"),
        }
        assert_eq!(bus.failures.load(Ordering::SeqCst), 0);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn revisions_already_handled_are_not_redelivered() {
        let system = Arc::new(FakeSystem::running(CURRENT));
        let (store, mut r) = reconciler(system.clone());
        r.options.poll_interval = Duration::from_millis(10);

        store
            .key_value("agent-deployments")
            .unwrap()
            .put_json(identity().as_str(), &descriptor(TARGET))
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            r.run(stop_rx).await.unwrap();
            r
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop_tx.send(true).unwrap();
        let r = handle.await.unwrap();

        assert_eq!(system.fetches.lock().unwrap().len(), 1);
        assert!(r.last_revision > 0);
    }
}
