//! Dynamic client controller.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use logship_config::{Configuration, ControllerConfiguration};
use logship_core::{
    task::spawn_traced_named, ClusterState, DestinationKey, LabelSet, LogClient, SendPermissionMatrix,
};
use logship_error::GenericError;
use tokio::{
    select,
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{telemetry::ClientTelemetry, ClientError};

mod builder;
pub use self::builder::{
    ClientBuilder, DefaultClientBuilder, DestinationTarget, HttpPushClientFactory, PushClientFactory,
};

mod routing;
pub use self::routing::Router;

/// A managed destination.
struct ClientRecord {
    state: ClusterState,
    last_state_change: Instant,
    chain: Arc<dyn LogClient>,
    enabled: bool,
    telemetry: ClientTelemetry,
}

impl ClientRecord {
    fn new(
        key: &DestinationKey, state: ClusterState, chain: Arc<dyn LogClient>, permissions: &SendPermissionMatrix,
    ) -> Self {
        Self {
            state,
            last_state_change: Instant::now(),
            chain,
            enabled: permissions.allows(state),
            telemetry: ClientTelemetry::for_destination(key),
        }
    }
}

struct Registry {
    clients: RwLock<HashMap<DestinationKey, ClientRecord>>,
    builder: Arc<dyn ClientBuilder>,
    router: Router,
    main_permissions: SendPermissionMatrix,
    dynamic_permissions: SendPermissionMatrix,
    deleted_client_time_expiration: Duration,
}

impl Registry {
    fn permissions(&self, key: &DestinationKey) -> &SendPermissionMatrix {
        if key.is_main() {
            &self.main_permissions
        } else {
            &self.dynamic_permissions
        }
    }

    async fn build_record(&self, key: &DestinationKey, state: ClusterState) -> Result<ClientRecord, GenericError> {
        let target = self.router.target(key)?;
        let chain = self.builder.build(key, &target).await?;
        info!(destination = %key, url = %target.url, state = %state, "Created client for destination.");

        Ok(ClientRecord::new(key, state, chain, self.permissions(key)))
    }

    async fn reconcile(&self) {
        let expired = {
            let mut clients = self.clients.write().await;
            let expired_keys = clients
                .iter()
                .filter(|(key, record)| {
                    !key.is_main()
                        && record.state == ClusterState::Deleted
                        && record.last_state_change.elapsed() >= self.deleted_client_time_expiration
                })
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();

            expired_keys
                .into_iter()
                .filter_map(|key| clients.remove(&key).map(|record| (key, record)))
                .collect::<Vec<_>>()
        };

        if expired.is_empty() {
            return;
        }

        join_all(expired.into_iter().map(|(key, record)| async move {
            info!(destination = %key, "Removing client of deleted destination.");
            record.chain.stop_wait().await;
        }))
        .await;
    }
}

/// Owns the delivery chain of every destination, and gates entries by the lifecycle state of their destination.
///
/// Each entry is routed to a destination (see [`Router`]). Destinations are created lazily, in the `Creation` state,
/// when the first entry for them arrives, or when a state notification names them. Whether entries for a destination
/// are forwarded depends on its state: the main destination is gated by the main send permissions, every other
/// destination by the dynamic ones. Entries for a destination that is not currently enabled are accepted and discarded.
///
/// Destinations that have been `Deleted` for at least the configured expiration are torn down by a reconciliation pass
/// that runs on a fixed interval. The main destination is registered (in the `Ready` state) at construction and is
/// never torn down.
pub struct Controller {
    registry: Arc<Registry>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl Controller {
    /// Creates a new `Controller`, building the main destination's chain and spawning the reconciliation task.
    ///
    /// The reconciliation task is cancelled when `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// If the main destination's chain cannot be built, an error is returned.
    pub async fn new(
        config: &Configuration, builder: Arc<dyn ClientBuilder>, shutdown: CancellationToken,
    ) -> Result<Self, GenericError> {
        let ControllerConfiguration {
            ctl_sync_timeout,
            deleted_client_time_expiration,
            main_permissions,
            dynamic_permissions,
        } = config.controller.clone();

        let registry = Registry {
            clients: RwLock::new(HashMap::new()),
            builder,
            router: Router::from_configuration(config),
            main_permissions,
            dynamic_permissions,
            deleted_client_time_expiration,
        };

        let main = registry.build_record(&DestinationKey::Main, ClusterState::Ready).await?;
        registry.clients.write().await.insert(DestinationKey::Main, main);

        let registry = Arc::new(registry);
        let cancel = shutdown.child_token();
        let reconciler = spawn_traced_named(
            "controller-reconciler",
            run_reconciler(Arc::clone(&registry), ctl_sync_timeout, cancel.clone()),
        );

        Ok(Self {
            registry,
            reconciler: Mutex::new(Some(reconciler)),
            cancel,
            stopped: AtomicBool::new(false),
        })
    }

    /// Records a lifecycle state change of a destination.
    ///
    /// Unknown destinations are created in the given state, unless that state is `Deleted`. Transitions outside the
    /// nominal lifecycle are applied, but logged.
    ///
    /// # Errors
    ///
    /// If the chain of a previously unknown destination cannot be built, an error is returned.
    pub async fn notify(&self, key: DestinationKey, state: ClusterState) -> Result<(), GenericError> {
        let mut clients = self.registry.clients.write().await;

        if let Some(record) = clients.get_mut(&key) {
            if record.state == state {
                return Ok(());
            }

            if !record.state.is_expected_transition(state) {
                warn!(destination = %key, from = %record.state, to = %state, "Unexpected state transition.");
            }

            record.state = state;
            record.last_state_change = Instant::now();
            record.enabled = self.registry.permissions(&key).allows(state);
            info!(destination = %key, state = %state, enabled = record.enabled, "Destination changed state.");

            return Ok(());
        }

        if state == ClusterState::Deleted {
            debug!(destination = %key, "Ignoring deletion of unknown destination.");
            return Ok(());
        }

        let record = self.registry.build_record(&key, state).await?;
        clients.insert(key, record);

        Ok(())
    }

    /// Runs a single reconciliation pass, tearing down every destination that has been `Deleted` for long enough.
    pub async fn reconcile(&self) {
        self.registry.reconcile().await;
    }

    /// Returns the current state of a destination, if it is managed.
    pub async fn state(&self, key: &DestinationKey) -> Option<ClusterState> {
        self.registry.clients.read().await.get(key).map(|record| record.state)
    }

    /// Returns the number of managed destinations, including the main one.
    pub async fn destination_count(&self) -> usize {
        self.registry.clients.read().await.len()
    }

    async fn chain_for(&self, key: &DestinationKey) -> Result<Option<Arc<dyn LogClient>>, GenericError> {
        {
            let clients = self.registry.clients.read().await;
            if let Some(record) = clients.get(key) {
                return Ok(admit(record));
            }
        }

        let mut clients = self.registry.clients.write().await;
        if let Some(record) = clients.get(key) {
            return Ok(admit(record));
        }

        let record = self.registry.build_record(key, ClusterState::Creation).await?;
        let chain = admit(&record);
        clients.insert(key.clone(), record);

        Ok(chain)
    }

    async fn shutdown(&self) -> Vec<(DestinationKey, Arc<dyn LogClient>)> {
        self.stopped.store(true, SeqCst);
        self.cancel.cancel();

        if let Some(reconciler) = self.reconciler.lock().await.take() {
            if let Err(e) = reconciler.await {
                error!(error = %e, "Reconciliation task failed.");
            }
        }

        self.registry
            .clients
            .write()
            .await
            .drain()
            .map(|(key, record)| (key, record.chain))
            .collect()
    }
}

fn admit(record: &ClientRecord) -> Option<Arc<dyn LogClient>> {
    if record.enabled {
        Some(Arc::clone(&record.chain))
    } else {
        record.telemetry.track_admission_drop();
        None
    }
}

fn is_stopped(error: &GenericError) -> bool {
    matches!(error.downcast_ref::<ClientError>(), Some(ClientError::Stopped { .. }))
}

#[async_trait]
impl LogClient for Controller {
    async fn handle(&self, labels: LabelSet, timestamp: DateTime<Utc>, line: String) -> Result<(), GenericError> {
        if self.stopped.load(SeqCst) {
            return Err(ClientError::Stopped {
                destination: "controller".to_string(),
            }
            .into());
        }

        let mut labels = labels;
        let key = self.registry.router.route(&mut labels);
        let Some(chain) = self.chain_for(&key).await? else {
            return Ok(());
        };

        match chain.handle(labels.clone(), timestamp, line.clone()).await {
            // A reconciliation pass may have torn the chain down after it was looked up.
            Err(e) if is_stopped(&e) && !self.stopped.load(SeqCst) => {
                debug!(destination = %key, "Destination chain was stopped concurrently. Looking it up again.");
                match self.chain_for(&key).await? {
                    Some(chain) => chain.handle(labels, timestamp, line).await,
                    None => Ok(()),
                }
            }
            result => result,
        }
    }

    async fn stop(&self) {
        let chains = self.shutdown().await;
        join_all(chains.iter().map(|(_, chain)| chain.stop())).await;
        debug!(destinations = chains.len(), "Controller stopped.");
    }

    async fn stop_wait(&self) {
        let chains = self.shutdown().await;
        join_all(chains.iter().map(|(_, chain)| chain.stop_wait())).await;
        debug!(destinations = chains.len(), "Controller stopped gracefully.");
    }
}

async fn run_reconciler(registry: Arc<Registry>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(interval = ?period, "Reconciliation task started.");

    loop {
        select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = ticker.tick() => registry.reconcile().await,
        }
    }

    debug!("Reconciliation task stopped.");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use logship_core::{test_util::FakeClient, TENANT_LABEL};
    use tokio::{sync::Notify, time::sleep};

    use super::*;
    use crate::push::{
        test_support::{transient, RecordingPushClient},
        PushClient,
    };

    /// Builds a fresh fake chain for every destination, keeping every chain it built.
    #[derive(Default)]
    struct FakeBuilder {
        built: StdMutex<Vec<(DestinationKey, DestinationTarget, Arc<FakeClient>)>>,
    }

    impl FakeBuilder {
        fn built_for(&self, key: &DestinationKey) -> Vec<(DestinationTarget, Arc<FakeClient>)> {
            self.built
                .lock()
                .unwrap()
                .iter()
                .filter(|(built_key, _, _)| built_key == key)
                .map(|(_, target, client)| (target.clone(), Arc::clone(client)))
                .collect()
        }

        fn latest(&self, key: &DestinationKey) -> Arc<FakeClient> {
            self.built_for(key).pop().unwrap().1
        }
    }

    #[async_trait]
    impl ClientBuilder for FakeBuilder {
        async fn build(
            &self, destination: &DestinationKey, target: &DestinationTarget,
        ) -> Result<Arc<dyn LogClient>, GenericError> {
            let client = FakeClient::new();
            self.built
                .lock()
                .unwrap()
                .push((destination.clone(), target.clone(), Arc::clone(&client)));
            Ok(client)
        }
    }

    fn config(extra: &[(&str, &str)]) -> Configuration {
        let mut pairs = vec![
            ("DynamicHostPath", r#"{"kubernetes": {"namespace_name": "namespace"}}"#),
            ("DynamicHostPrefix", "http://loki."),
            ("DynamicHostSuffix", ".svc:3100/loki/api/v1/push"),
            ("DynamicHostRegex", "^shoot--"),
            ("CtlSyncTimeout", "60s"),
            ("DeletedClientTimeExpiration", "1h"),
        ];
        pairs.extend_from_slice(extra);
        Configuration::from_pairs(pairs).unwrap()
    }

    async fn controller(config: &Configuration) -> (Controller, Arc<FakeBuilder>) {
        let builder = Arc::new(FakeBuilder::default());
        let controller = Controller::new(config, builder.clone(), CancellationToken::new())
            .await
            .unwrap();
        (controller, builder)
    }

    fn shoot() -> DestinationKey {
        DestinationKey::named("shoot--dev--a")
    }

    async fn send(controller: &Controller, namespace: &str, line: &str) {
        let labels = [("namespace", namespace)].into_iter().collect();
        controller.handle(labels, Utc::now(), line.to_string()).await.unwrap();
    }

    fn lines(client: &FakeClient) -> Vec<String> {
        client.entries().into_iter().map(|entry| entry.line).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn main_destination_is_registered_ready() {
        let (controller, builder) = controller(&config(&[])).await;

        assert_eq!(controller.state(&DestinationKey::Main).await, Some(ClusterState::Ready));
        assert_eq!(controller.destination_count().await, 1);

        send(&controller, "garden", "to main").await;
        assert_eq!(lines(&builder.latest(&DestinationKey::Main)), vec!["to main"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unseen_destinations_are_created_lazily() {
        let (controller, builder) = controller(&config(&[])).await;

        send(&controller, "shoot--dev--a", "first").await;
        send(&controller, "shoot--dev--a", "second").await;

        assert_eq!(controller.state(&shoot()).await, Some(ClusterState::Creation));
        let built = builder.built_for(&shoot());
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].0.url.as_str(), "http://loki.shoot--dev--a.svc:3100/loki/api/v1/push");
        assert_eq!(lines(&built[0].1), vec!["first", "second"]);
        assert!(lines(&builder.latest(&DestinationKey::Main)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn admission_follows_the_permission_matrices() {
        let (controller, builder) = controller(&config(&[])).await;

        send(&controller, "shoot--dev--a", "creation").await;
        controller.notify(shoot(), ClusterState::Ready).await.unwrap();
        send(&controller, "shoot--dev--a", "ready").await;
        controller.notify(shoot(), ClusterState::Deletion).await.unwrap();
        send(&controller, "shoot--dev--a", "deletion").await;
        assert_eq!(lines(&builder.latest(&shoot())), vec!["creation", "deletion"]);

        controller.notify(DestinationKey::Main, ClusterState::Hibernating).await.unwrap();
        send(&controller, "garden", "hibernating").await;
        controller.notify(DestinationKey::Main, ClusterState::Hibernated).await.unwrap();
        send(&controller, "garden", "hibernated").await;
        controller.notify(DestinationKey::Main, ClusterState::Waking).await.unwrap();
        send(&controller, "garden", "waking").await;
        assert_eq!(lines(&builder.latest(&DestinationKey::Main)), vec!["waking"]);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_permissions_override_defaults() {
        let config = config(&[("SendLogsToDefaultClientWhenClusterIsInReadyState", "true")]);
        let (controller, builder) = controller(&config).await;

        controller.notify(shoot(), ClusterState::Ready).await.unwrap();
        send(&controller, "shoot--dev--a", "ready").await;
        assert_eq!(lines(&builder.latest(&shoot())), vec!["ready"]);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_create_unknown_destinations() {
        let (controller, builder) = controller(&config(&[])).await;

        controller.notify(DestinationKey::named("shoot--dev--b"), ClusterState::Hibernated).await.unwrap();
        assert_eq!(
            controller.state(&DestinationKey::named("shoot--dev--b")).await,
            Some(ClusterState::Hibernated)
        );

        controller.notify(DestinationKey::named("shoot--dev--c"), ClusterState::Deleted).await.unwrap();
        assert_eq!(controller.state(&DestinationKey::named("shoot--dev--c")).await, None);
        assert!(builder.built_for(&DestinationKey::named("shoot--dev--c")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_destinations_are_reaped_after_expiration() {
        let (controller, builder) = controller(&config(&[])).await;

        send(&controller, "shoot--dev--a", "before").await;
        controller.notify(shoot(), ClusterState::Deletion).await.unwrap();
        controller.notify(shoot(), ClusterState::Deleted).await.unwrap();

        sleep(Duration::from_secs(30 * 60)).await;
        controller.reconcile().await;
        assert_eq!(controller.state(&shoot()).await, Some(ClusterState::Deleted));

        sleep(Duration::from_secs(31 * 60)).await;
        controller.reconcile().await;
        assert_eq!(controller.state(&shoot()).await, None);
        let reaped = builder.latest(&shoot());
        assert!(reaped.is_gracefully_stopped());
        assert!(!reaped.is_stopped());

        send(&controller, "shoot--dev--a", "after").await;
        assert_eq!(controller.state(&shoot()).await, Some(ClusterState::Creation));
        let built = builder.built_for(&shoot());
        assert_eq!(built.len(), 2);
        assert_eq!(lines(&built[1].1), vec!["after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_reset_the_expiration() {
        let (controller, _builder) = controller(&config(&[])).await;

        controller.notify(shoot(), ClusterState::Deleted).await.unwrap();
        controller.notify(shoot(), ClusterState::Creation).await.unwrap();
        controller.notify(shoot(), ClusterState::Deleted).await.unwrap();

        sleep(Duration::from_secs(59 * 60)).await;
        controller.notify(shoot(), ClusterState::Creation).await.unwrap();
        controller.notify(shoot(), ClusterState::Deleted).await.unwrap();

        sleep(Duration::from_secs(2 * 60)).await;
        controller.reconcile().await;
        assert_eq!(controller.state(&shoot()).await, Some(ClusterState::Deleted));
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_runs_periodically() {
        let config = config(&[("CtlSyncTimeout", "1s"), ("DeletedClientTimeExpiration", "5s")]);
        let (controller, _builder) = controller(&config).await;

        controller.notify(shoot(), ClusterState::Creation).await.unwrap();
        controller.notify(shoot(), ClusterState::Deleted).await.unwrap();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(controller.state(&shoot()).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn main_destination_is_never_reaped() {
        let config = config(&[("DeletedClientTimeExpiration", "0s")]);
        let (controller, _builder) = controller(&config).await;

        controller.notify(DestinationKey::Main, ClusterState::Deleted).await.unwrap();
        controller.reconcile().await;
        assert_eq!(controller.state(&DestinationKey::Main).await, Some(ClusterState::Deleted));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_fans_out_to_every_chain() {
        let (controller, builder) = controller(&config(&[])).await;
        send(&controller, "shoot--dev--a", "line").await;

        controller.stop().await;
        assert!(builder.latest(&DestinationKey::Main).is_stopped());
        assert!(builder.latest(&shoot()).is_stopped());
        assert!(!builder.latest(&shoot()).is_gracefully_stopped());

        let labels = [("namespace", "garden")].into_iter().collect();
        assert!(controller.handle(labels, Utc::now(), "late".to_string()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_wait_fans_out_to_every_chain() {
        let (controller, builder) = controller(&config(&[])).await;
        send(&controller, "shoot--dev--a", "line").await;

        controller.stop_wait().await;
        assert!(builder.latest(&DestinationKey::Main).is_gracefully_stopped());
        assert!(builder.latest(&shoot()).is_gracefully_stopped());
        assert!(!builder.latest(&shoot()).is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn dynamic_tenant_reaches_dynamic_destinations_only() {
        let config = config(&[("DynamicTenant", "user tag user-exposed.*")]);
        let (controller, builder) = controller(&config).await;

        for namespace in ["shoot--dev--a", "garden"] {
            let labels = [("namespace", namespace), ("tag", "user-exposed.kubernetes")]
                .into_iter()
                .collect();
            controller.handle(labels, Utc::now(), "line".to_string()).await.unwrap();
        }

        let shoot_entry = &builder.latest(&shoot()).entries()[0];
        assert_eq!(shoot_entry.labels.get(TENANT_LABEL), Some("user"));
        let main_entry = &builder.latest(&DestinationKey::Main).entries()[0];
        assert!(!main_entry.labels.contains_key(TENANT_LABEL));
    }

    /// A chain that parks every entry until released, then fails if it was stopped in the meantime.
    #[derive(Default)]
    struct ParkingClient {
        release: Notify,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl LogClient for ParkingClient {
        async fn handle(&self, _: LabelSet, _: DateTime<Utc>, _: String) -> Result<(), GenericError> {
            self.release.notified().await;
            if self.stopped.load(SeqCst) {
                return Err(ClientError::Stopped {
                    destination: "parking".to_string(),
                }
                .into());
            }
            Ok(())
        }

        async fn stop(&self) {
            self.stopped.store(true, SeqCst);
        }

        async fn stop_wait(&self) {
            self.stopped.store(true, SeqCst);
        }
    }

    /// Hands out a parking chain for the first dynamic destination it builds, and fakes otherwise.
    #[derive(Default)]
    struct ParkingBuilder {
        parking: Arc<ParkingClient>,
        parked: AtomicBool,
        fakes: FakeBuilder,
    }

    #[async_trait]
    impl ClientBuilder for ParkingBuilder {
        async fn build(
            &self, destination: &DestinationKey, target: &DestinationTarget,
        ) -> Result<Arc<dyn LogClient>, GenericError> {
            if !destination.is_main() && !self.parked.swap(true, SeqCst) {
                return Ok(self.parking.clone());
            }
            self.fakes.build(destination, target).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_racing_a_teardown_reach_the_rebuilt_chain() {
        let config = config(&[("DeletedClientTimeExpiration", "0s")]);
        let builder = Arc::new(ParkingBuilder::default());
        let controller = Arc::new(
            Controller::new(&config, builder.clone(), CancellationToken::new())
                .await
                .unwrap(),
        );

        controller.notify(shoot(), ClusterState::Creation).await.unwrap();
        controller.notify(shoot(), ClusterState::Deleted).await.unwrap();

        let sending = Arc::clone(&controller);
        let handle = tokio::spawn(async move {
            let labels = [("namespace", "shoot--dev--a")].into_iter().collect();
            sending.handle(labels, Utc::now(), "racing".to_string()).await
        });
        sleep(Duration::from_millis(1)).await;

        // The entry is parked in the old chain while it is torn down.
        controller.reconcile().await;
        assert_eq!(controller.state(&shoot()).await, None);
        builder.parking.release.notify_one();

        handle.await.unwrap().unwrap();
        assert_eq!(controller.state(&shoot()).await, Some(ClusterState::Creation));
        assert_eq!(lines(&builder.fakes.latest(&shoot())), vec!["racing"]);
    }

    /// Hands out one recording push client per push endpoint.
    #[derive(Default)]
    struct RecordingPushFactory {
        clients: StdMutex<HashMap<String, Arc<RecordingPushClient>>>,
    }

    impl RecordingPushFactory {
        fn client(&self, url: &str) -> Arc<RecordingPushClient> {
            let mut clients = self.clients.lock().unwrap();
            Arc::clone(clients.entry(url.to_string()).or_insert_with(RecordingPushClient::new))
        }
    }

    impl PushClientFactory for RecordingPushFactory {
        fn create(&self, target: &DestinationTarget, _: Duration) -> Result<Arc<dyn PushClient>, GenericError> {
            Ok(self.client(target.url.as_str()))
        }
    }

    const MAIN_URL: &str = "http://localhost:3100/loki/api/v1/push";
    const SHOOT_URL: &str = "http://loki.shoot--dev--a.svc:3100/loki/api/v1/push";

    async fn delivering_controller(config: &Configuration) -> (Controller, Arc<RecordingPushFactory>) {
        let push = Arc::new(RecordingPushFactory::default());
        let shutdown = CancellationToken::new();
        let builder = DefaultClientBuilder::with_push_client_factory(config, shutdown.clone(), push.clone());
        let controller = Controller::new(config, Arc::new(builder), shutdown).await.unwrap();
        (controller, push)
    }

    #[tokio::test(start_paused = true)]
    async fn dynamic_tenant_survives_label_packing() {
        let config = config(&[
            ("DynamicTenant", "user tag user-exposed.*"),
            ("PreservedLabels", "namespace"),
        ]);
        let (controller, push) = delivering_controller(&config).await;

        for namespace in ["shoot--dev--a", "garden"] {
            let labels = [
                ("namespace", namespace),
                ("tag", "user-exposed.kubernetes"),
                ("pod_name", "fluent-bit-0"),
            ]
            .into_iter()
            .collect();
            controller.handle(labels, Utc::now(), "line".to_string()).await.unwrap();
        }
        controller.stop_wait().await;

        let shoot_pushes = push.client(SHOOT_URL).delivered();
        assert_eq!(shoot_pushes.len(), 1);
        assert_eq!(shoot_pushes[0].tenant.as_deref(), Some("user"));
        let stream = &shoot_pushes[0].streams[0];
        assert_eq!(stream.labels.get("namespace"), Some("shoot--dev--a"));
        assert!(!stream.labels.contains_key(TENANT_LABEL));
        let packed: serde_json::Value = serde_json::from_str(&stream.entries[0].1).unwrap();
        assert_eq!(packed["_entry"], "line");
        assert_eq!(packed["pod_name"], "fluent-bit-0");
        assert!(packed.get(TENANT_LABEL).is_none());

        let main = push.client(MAIN_URL).delivered();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].tenant, None);
    }

    #[tokio::test]
    async fn buffered_chains_deliver_after_downstream_drops() {
        let dir = tempfile::tempdir().unwrap();
        let queue_dir = dir.path().to_string_lossy().into_owned();
        let config = config(&[
            ("Buffer", "true"),
            ("QueueDir", queue_dir.as_str()),
            ("BatchWait", "50ms"),
            ("MinBackoff", "10ms"),
            ("MaxBackoff", "10ms"),
            ("MaxRetries", "1"),
        ]);
        let (controller, push) = delivering_controller(&config).await;

        // The first two batches are given up on after two attempts each.
        let main = push.client(MAIN_URL);
        main.fail_next((0..4).map(|_| transient()));

        send(&controller, "garden", "buffered").await;

        for _ in 0..500 {
            if !main.delivered().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let delivered = main.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].streams[0].entries[0].1, "buffered");
        assert!(main.attempts() >= 5);
        controller.stop_wait().await;
    }
}
