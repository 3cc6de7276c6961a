//! The Update Coordinator: the page-side half of the update flow.
//!
//! It turns the registration's lifecycle into a single "update available"
//! signal, surfaces the newest release note, and runs the user-confirmed
//! activation handshake. It never reloads the page on its own: a controller
//! change observed outside [`UpdateCoordinator::confirm_update`] is ignored.

pub mod event;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use event::CoordinatorEvent;

use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::manifest::{ManifestSource, ReleaseEntry};
use crate::storage::{DurableStore, UPDATE_PENDING_KEY};
use crate::worker::{Registration, WorkerHandle, WorkerMessage};

/// The registration operations the coordinator depends on.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register(&self) -> Result<()>;

    /// Re-checks for a newer worker. Returns whether one was installed.
    async fn update(&self) -> Result<bool>;

    fn waiting(&self) -> Option<WorkerHandle>;

    async fn post_message(&self, target: &WorkerHandle, message: WorkerMessage) -> Result<bool>;

    fn subscribe_waiting(&self) -> watch::Receiver<Option<WorkerHandle>>;

    fn subscribe_controller(&self) -> watch::Receiver<Option<WorkerHandle>>;
}

#[async_trait]
impl WorkerRegistry for Registration {
    async fn register(&self) -> Result<()> {
        Self::register(self).await
    }

    async fn update(&self) -> Result<bool> {
        Self::update(self).await
    }

    fn waiting(&self) -> Option<WorkerHandle> {
        Self::waiting(self)
    }

    async fn post_message(&self, target: &WorkerHandle, message: WorkerMessage) -> Result<bool> {
        Self::post_message(self, target, message).await
    }

    fn subscribe_waiting(&self) -> watch::Receiver<Option<WorkerHandle>> {
        Self::subscribe_waiting(self)
    }

    fn subscribe_controller(&self) -> watch::Receiver<Option<WorkerHandle>> {
        Self::subscribe_controller(self)
    }
}

/// The page hosting the coordinator.
pub trait PageHost: Send + Sync {
    /// Reloads the page. The coordinator that called this is finished.
    fn reload(&self);
}

/// Result of [`UpdateCoordinator::confirm_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    /// The activation message was sent and the page reloaded.
    Reloaded,
    /// No waiting instance was known or reported; nothing happened.
    NothingToApply,
    /// Another confirmation is already running on this page.
    AlreadyInFlight,
}

/// Snapshot of the coordinator's exposed state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub update_available: bool,
    pub release_note: Option<ReleaseEntry>,
    pub waiting: Option<WorkerHandle>,
}

/// Page-side update state and activation handshake.
pub struct UpdateCoordinator {
    config: CoordinatorConfig,
    registry: Arc<dyn WorkerRegistry>,
    manifests: Arc<dyn ManifestSource>,
    store: Arc<dyn DurableStore>,
    page: Arc<dyn PageHost>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    update_available: watch::Sender<bool>,
    release_note: watch::Sender<Option<ReleaseEntry>>,
    waiting: Mutex<Option<WorkerHandle>>,
    confirming: AtomicBool,
}

impl std::fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("update_available", &*self.update_available.borrow())
            .field("confirming", &self.confirming.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl UpdateCoordinator {
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<dyn WorkerRegistry>,
        manifests: Arc<dyn ManifestSource>,
        store: Arc<dyn DurableStore>,
        page: Arc<dyn PageHost>,
        events: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            config,
            registry,
            manifests,
            store,
            page,
            events,
            update_available: watch::Sender::new(false),
            release_note: watch::Sender::new(None),
            waiting: Mutex::new(None),
            confirming: AtomicBool::new(false),
        }
    }

    /// Runs the page-load sequence, then leaves two background tasks running
    /// until `token` is cancelled: the waiting-instance listener and, outside
    /// development mode, the periodic update check.
    ///
    /// Nothing here is fatal to the page. Failures are logged and leave the
    /// corresponding state untouched.
    pub async fn startup(self: &Arc<Self>, token: &CancellationToken) {
        self.consume_pending_flag();
        self.load_release_note().await;

        // Subscribe before registering so an instance that starts waiting
        // during registration is not missed.
        let waiting_rx = self.registry.subscribe_waiting();

        if let Err(e) = self.registry.register().await {
            log::warn!("Worker registration failed: {e}");
        }
        if let Some(handle) = self.registry.waiting() {
            self.capture_waiting(handle);
        }

        tokio::spawn(Arc::clone(self).listen_waiting(waiting_rx, token.clone()));

        if self.config.dev_mode {
            log::debug!("Development mode: background update checks disabled");
        } else {
            tokio::spawn(Arc::clone(self).poll_updates(token.clone()));
        }
    }

    fn consume_pending_flag(&self) {
        match self.store.get(UPDATE_PENDING_KEY) {
            Ok(Some(value)) => {
                if let Err(e) = self.store.remove(UPDATE_PENDING_KEY) {
                    log::warn!("Could not clear update-pending flag: {e}");
                }
                if value == "true" {
                    log::info!("Update applied");
                    self.emit(CoordinatorEvent::UpdateSucceeded);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Could not read update-pending flag: {e}"),
        }
    }

    async fn load_release_note(&self) {
        let manifest = match self.manifests.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                log::warn!("Version manifest unavailable: {e}");
                self.emit(CoordinatorEvent::ManifestUnavailable {
                    error: e.to_string(),
                });
                return;
            }
        };
        if let Err(e) = manifest.validate() {
            log::warn!("Version manifest is inconsistent: {e}");
        }
        if let Some(latest) = manifest.latest() {
            self.emit(CoordinatorEvent::ReleaseNote {
                version: latest.version.clone(),
                title: latest.title.clone(),
            });
            self.release_note.send_replace(Some(latest.clone()));
        }
    }

    async fn listen_waiting(
        self: Arc<Self>,
        mut waiting_rx: watch::Receiver<Option<WorkerHandle>>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                changed = waiting_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let handle = waiting_rx.borrow_and_update().clone();
                    if let Some(handle) = handle {
                        self.capture_waiting(handle);
                    }
                }
            }
        }
    }

    async fn poll_updates(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.poll_interval().max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.registry.update().await {
                        Ok(true) => log::debug!("Update check installed a new worker"),
                        Ok(false) => {}
                        Err(e) => log::debug!("Update check failed: {e}"),
                    }
                }
            }
        }
    }

    fn capture_waiting(&self, handle: WorkerHandle) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting.as_ref() == Some(&handle) {
            return;
        }
        log::info!("Update available: {}", handle.tag);
        self.emit(CoordinatorEvent::UpdateAvailable {
            tag: handle.tag.clone(),
        });
        *waiting = Some(handle);
        drop(waiting);
        self.update_available.send_replace(true);
    }

    /// Applies the waiting update: sets the update-pending flag, tells the
    /// waiting instance to skip waiting, then reloads once the new instance
    /// takes control or the reload delay runs out, whichever comes first.
    pub async fn confirm_update(&self) -> ConfirmOutcome {
        if self.confirming.swap(true, Ordering::SeqCst) {
            return ConfirmOutcome::AlreadyInFlight;
        }

        let Some(target) = self.registry.waiting().or_else(|| self.captured()) else {
            log::debug!("Confirm requested with no waiting worker");
            self.confirming.store(false, Ordering::SeqCst);
            return ConfirmOutcome::NothingToApply;
        };

        let mut controller_rx = self.registry.subscribe_controller();

        if let Err(e) = self.store.set(UPDATE_PENDING_KEY, "true") {
            log::warn!("Could not persist update-pending flag: {e}");
        }
        match self
            .registry
            .post_message(&target, WorkerMessage::SkipWaiting)
            .await
        {
            Ok(true) => log::debug!("Sent SKIP_WAITING to {}", target.tag),
            Ok(false) => log::debug!("{} was no longer waiting", target.tag),
            Err(e) => log::warn!("Activating {} failed: {e}", target.tag),
        }

        let took_control =
            controller_rx.wait_for(|active| active.as_ref().is_some_and(|a| a.id == target.id));
        let acknowledged = matches!(
            tokio::time::timeout(self.config.reload_delay(), took_control).await,
            Ok(Ok(_))
        );
        if !acknowledged {
            log::debug!("No controller change within the reload delay, reloading anyway");
        }

        self.emit(CoordinatorEvent::Reloading { acknowledged });
        self.page.reload();
        ConfirmOutcome::Reloaded
    }

    fn captured(&self) -> Option<WorkerHandle> {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn update_available(&self) -> bool {
        *self.update_available.borrow()
    }

    #[must_use]
    pub fn release_note(&self) -> Option<ReleaseEntry> {
        self.release_note.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_update_available(&self) -> watch::Receiver<bool> {
        self.update_available.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            update_available: self.update_available(),
            release_note: self.release_note(),
            waiting: self.captured(),
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        // A closed receiver means nobody renders notices; that is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::Error;
    use crate::manifest::{BumpKind, NoteCategory, ReleaseNote, VersionManifest};
    use crate::storage::MemoryStore;
    use crate::worker::testing::{FakeNetwork, FakeScript, scope};
    use crate::worker::{CacheStorage, MemoryCacheStorage, Network, ScriptSource};
    use chrono::NaiveDate;
    use semver::Version;
    use std::sync::atomic::AtomicUsize;

    struct FixedManifest(Option<VersionManifest>);

    #[async_trait]
    impl ManifestSource for FixedManifest {
        async fn fetch_manifest(&self) -> Result<VersionManifest> {
            self.0
                .clone()
                .ok_or_else(|| Error::Manifest("offline".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingPage {
        reloads: AtomicUsize,
    }

    impl PageHost for CountingPage {
        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingPage {
        fn reloads(&self) -> usize {
            self.reloads.load(Ordering::SeqCst)
        }
    }

    /// Wraps a real registration, counting messages and optionally dropping them.
    struct CountingRegistry {
        inner: Registration,
        posts: AtomicUsize,
        drop_messages: bool,
    }

    #[async_trait]
    impl WorkerRegistry for CountingRegistry {
        async fn register(&self) -> Result<()> {
            self.inner.register().await
        }

        async fn update(&self) -> Result<bool> {
            self.inner.update().await
        }

        fn waiting(&self) -> Option<WorkerHandle> {
            self.inner.waiting()
        }

        async fn post_message(&self, target: &WorkerHandle, message: WorkerMessage) -> Result<bool> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            if self.drop_messages {
                return Ok(false);
            }
            self.inner.post_message(target, message).await
        }

        fn subscribe_waiting(&self) -> watch::Receiver<Option<WorkerHandle>> {
            self.inner.subscribe_waiting()
        }

        fn subscribe_controller(&self) -> watch::Receiver<Option<WorkerHandle>> {
            self.inner.subscribe_controller()
        }
    }

    fn entry(version: &str) -> ReleaseEntry {
        ReleaseEntry {
            version: Version::parse(version).unwrap(),
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            title: format!("Release {version}"),
            description: String::new(),
            kind: BumpKind::Minor,
            notes: vec![ReleaseNote::new(NoteCategory::Feature, "Faster job board")],
        }
    }

    fn manifest() -> VersionManifest {
        let mut manifest =
            VersionManifest::new(Version::new(1, 1, 0), NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
        manifest.releases.push(entry("1.1.0"));
        manifest.publish(entry("1.2.0"));
        manifest
    }

    struct Page {
        coordinator: Arc<UpdateCoordinator>,
        registry: Arc<CountingRegistry>,
        network: Arc<FakeNetwork>,
        script: Arc<FakeScript>,
        store: Arc<MemoryStore>,
        page: Arc<CountingPage>,
        events: mpsc::UnboundedReceiver<CoordinatorEvent>,
        token: CancellationToken,
    }

    impl Page {
        fn drain(&mut self) -> Vec<CoordinatorEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    impl Drop for Page {
        fn drop(&mut self) {
            self.token.cancel();
        }
    }

    struct Setup {
        config: CoordinatorConfig,
        manifest: Option<VersionManifest>,
        store: Arc<MemoryStore>,
        drop_messages: bool,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                config: CoordinatorConfig::new().with_reload_delay_ms(50),
                manifest: Some(manifest()),
                store: Arc::new(MemoryStore::new()),
                drop_messages: false,
            }
        }
    }

    fn page(setup: Setup) -> Page {
        let network = Arc::new(FakeNetwork::with_site("v1"));
        let script = Arc::new(FakeScript::new("detailer-v1.0.0"));
        let registry = Arc::new(CountingRegistry {
            inner: Registration::new(
                scope(),
                CacheConfig::new(),
                Arc::clone(&network) as Arc<dyn Network>,
                Arc::new(MemoryCacheStorage::new()) as Arc<dyn CacheStorage>,
                Arc::clone(&script) as Arc<dyn ScriptSource>,
            ),
            posts: AtomicUsize::new(0),
            drop_messages: setup.drop_messages,
        });
        let host = Arc::new(CountingPage::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(UpdateCoordinator::new(
            setup.config,
            Arc::clone(&registry) as Arc<dyn WorkerRegistry>,
            Arc::new(FixedManifest(setup.manifest)),
            Arc::clone(&setup.store) as Arc<dyn DurableStore>,
            Arc::clone(&host) as Arc<dyn PageHost>,
            tx,
        ));
        Page {
            coordinator,
            registry,
            network,
            script,
            store: setup.store,
            page: host,
            events: rx,
            token: CancellationToken::new(),
        }
    }

    async fn started(setup: Setup) -> Page {
        let p = page(setup);
        p.coordinator.startup(&p.token).await;
        p
    }

    /// Installs a second version that parks in the waiting slot.
    async fn deploy_waiting(p: &Page, tag: &str) {
        p.script.deploy(tag);
        assert!(p.registry.inner.update().await.unwrap());
    }

    async fn wait_until_available(p: &Page, within: Duration) -> bool {
        let mut rx = p.coordinator.subscribe_update_available();
        tokio::time::timeout(within, rx.wait_for(|available| *available))
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn release_note_is_newest_entry() {
        let mut p = started(Setup::default()).await;

        let note = p.coordinator.release_note().unwrap();
        assert_eq!(note.version, Version::new(1, 2, 0));
        assert!(!p.coordinator.update_available());
        assert!(p.drain().contains(&CoordinatorEvent::ReleaseNote {
            version: Version::new(1, 2, 0),
            title: "Release 1.2.0".to_string(),
        }));
    }

    #[tokio::test]
    async fn manifest_failure_leaves_note_empty() {
        let mut p = started(Setup {
            manifest: None,
            ..Setup::default()
        })
        .await;

        assert!(p.coordinator.release_note().is_none());
        assert!(matches!(
            p.drain().as_slice(),
            [CoordinatorEvent::ManifestUnavailable { .. }]
        ));
    }

    #[tokio::test]
    async fn pending_flag_is_consumed_once() {
        let store = Arc::new(MemoryStore::new());
        store.set(UPDATE_PENDING_KEY, "true").unwrap();

        let mut p = started(Setup {
            store: Arc::clone(&store),
            ..Setup::default()
        })
        .await;

        assert_eq!(store.get(UPDATE_PENDING_KEY).unwrap(), None);
        let notices = p
            .drain()
            .into_iter()
            .filter(|e| *e == CoordinatorEvent::UpdateSucceeded)
            .count();
        assert_eq!(notices, 1);

        // A second load shows nothing.
        let mut again = page(Setup {
            store,
            ..Setup::default()
        });
        again.coordinator.startup(&again.token).await;
        assert!(!again.drain().contains(&CoordinatorEvent::UpdateSucceeded));
    }

    #[tokio::test]
    async fn waiting_at_registration_is_available_immediately() {
        let p = page(Setup::default());
        p.registry.inner.register().await.unwrap();
        deploy_waiting(&p, "detailer-v1.1.0").await;

        p.coordinator.startup(&p.token).await;
        assert!(p.coordinator.update_available());
        assert_eq!(
            p.coordinator.status().waiting.unwrap().tag.as_str(),
            "detailer-v1.1.0"
        );
    }

    #[tokio::test]
    async fn later_waiting_instance_raises_signal() {
        let mut p = started(Setup::default()).await;
        assert!(!p.coordinator.update_available());

        deploy_waiting(&p, "detailer-v1.1.0").await;
        assert!(wait_until_available(&p, Duration::from_secs(1)).await);
        assert!(p.drain().iter().any(|e| matches!(
            e,
            CoordinatorEvent::UpdateAvailable { tag } if tag.as_str() == "detailer-v1.1.0"
        )));
    }

    #[tokio::test]
    async fn confirm_activates_and_reloads() {
        let mut p = started(Setup::default()).await;
        deploy_waiting(&p, "detailer-v1.1.0").await;
        assert!(wait_until_available(&p, Duration::from_secs(1)).await);
        let waiting = p.registry.inner.waiting().unwrap();

        assert_eq!(p.coordinator.confirm_update().await, ConfirmOutcome::Reloaded);

        assert_eq!(p.store.get(UPDATE_PENDING_KEY).unwrap().as_deref(), Some("true"));
        assert_eq!(p.registry.posts.load(Ordering::SeqCst), 1);
        assert_eq!(p.registry.inner.active(), Some(waiting));
        assert_eq!(p.page.reloads(), 1);
        assert!(p.drain().contains(&CoordinatorEvent::Reloading { acknowledged: true }));
    }

    #[tokio::test]
    async fn confirm_with_nothing_waiting_does_nothing() {
        let mut p = started(Setup::default()).await;
        p.drain();

        assert_eq!(
            p.coordinator.confirm_update().await,
            ConfirmOutcome::NothingToApply
        );
        assert_eq!(p.store.get(UPDATE_PENDING_KEY).unwrap(), None);
        assert_eq!(p.registry.posts.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(p.page.reloads(), 0);
        assert!(p.drain().is_empty());
    }

    #[tokio::test]
    async fn reload_fires_even_without_acknowledgement() {
        let mut p = started(Setup {
            drop_messages: true,
            ..Setup::default()
        })
        .await;
        deploy_waiting(&p, "detailer-v1.1.0").await;

        let started_at = std::time::Instant::now();
        assert_eq!(p.coordinator.confirm_update().await, ConfirmOutcome::Reloaded);
        assert!(started_at.elapsed() >= Duration::from_millis(50));
        assert_eq!(p.page.reloads(), 1);
        assert!(p.drain().contains(&CoordinatorEvent::Reloading { acknowledged: false }));
    }

    #[tokio::test]
    async fn only_one_confirmation_in_flight() {
        let p = started(Setup::default()).await;
        deploy_waiting(&p, "detailer-v1.1.0").await;

        let (a, b) = tokio::join!(
            p.coordinator.confirm_update(),
            p.coordinator.confirm_update()
        );
        let mut outcomes = [a, b];
        outcomes.sort_by_key(|o| *o == ConfirmOutcome::AlreadyInFlight);
        assert_eq!(
            outcomes,
            [ConfirmOutcome::Reloaded, ConfirmOutcome::AlreadyInFlight]
        );
        assert_eq!(p.page.reloads(), 1);
    }

    #[tokio::test]
    async fn controller_change_never_reloads_by_itself() {
        let p = started(Setup::default()).await;
        let client = p.registry.inner.attach_client().await;
        deploy_waiting(&p, "detailer-v1.1.0").await;

        // All clients closing activates the new worker without confirmation.
        p.registry.inner.detach_client(client).await.unwrap();
        assert_eq!(
            p.registry.inner.active().unwrap().tag.as_str(),
            "detailer-v1.1.0"
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(p.page.reloads(), 0);
    }

    #[tokio::test]
    async fn polling_discovers_new_worker() {
        let p = started(Setup {
            config: CoordinatorConfig::new().with_poll_interval_secs(1),
            ..Setup::default()
        })
        .await;
        p.script.deploy("detailer-v1.1.0");

        assert!(wait_until_available(&p, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn failed_polls_are_swallowed_and_polling_continues() {
        let p = started(Setup {
            config: CoordinatorConfig::new().with_poll_interval_secs(1),
            ..Setup::default()
        })
        .await;
        p.network.set_online(false);
        p.script.deploy("detailer-v1.1.0");

        // The first tick fails to install the new worker.
        assert!(!wait_until_available(&p, Duration::from_millis(1500)).await);
        assert!(!p.coordinator.update_available());
        assert!(p.registry.inner.waiting().is_none());

        p.network.set_online(true);
        assert!(wait_until_available(&p, Duration::from_secs(3)).await);
        assert_eq!(
            p.coordinator.status().waiting.unwrap().tag.as_str(),
            "detailer-v1.1.0"
        );
    }

    #[tokio::test]
    async fn dev_mode_does_not_poll() {
        let p = started(Setup {
            config: CoordinatorConfig::new()
                .with_poll_interval_secs(1)
                .with_dev_mode(true),
            ..Setup::default()
        })
        .await;
        p.script.deploy("detailer-v1.1.0");

        assert!(!wait_until_available(&p, Duration::from_millis(1500)).await);
        assert!(p.registry.inner.waiting().is_none());
    }
}
