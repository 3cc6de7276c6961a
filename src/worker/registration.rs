//! The registration for one scope: installs new worker instances, holds at
//! most one waiting and one active instance, and publishes their changes.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use url::Url;
use uuid::Uuid;

use super::cache::CacheStorage;
use super::clients::{ClientId, ClientInfo, ClientTable};
use super::controller::{CacheController, FetchOutcome, GenerationTag};
use super::network::Network;
use super::request::Request;
use super::script::{ScriptSource, WorkerScript};
use super::state::{LifecycleEvent, WorkerState};
use crate::config::CacheConfig;
use crate::error::Result;

/// Opaque address of one worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub id: Uuid,
    pub tag: GenerationTag,
}

/// Messages a page may post to a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Leave the waiting state now instead of when every client closes.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

/// Serializable view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub tag: GenerationTag,
    pub state: WorkerState,
}

/// Serializable view of the whole registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationStatus {
    pub scope: String,
    pub installing: Option<WorkerInfo>,
    pub waiting: Option<WorkerInfo>,
    pub active: Option<WorkerInfo>,
    pub clients: Vec<ClientInfo>,
}

struct WorkerInstance {
    id: Uuid,
    script: WorkerScript,
    state: StdMutex<WorkerState>,
    controller: CacheController,
}

impl WorkerInstance {
    fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id,
            tag: self.script.generation.clone(),
        }
    }

    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, event: LifecycleEvent) -> Result<WorkerState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = state.next(event)?;
        log::debug!("Worker {} ({}) -> {:?}", self.id, self.script.generation, *state);
        Ok(*state)
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            tag: self.script.generation.clone(),
            state: self.state(),
        }
    }
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<WorkerInstance>>,
    waiting: Option<Arc<WorkerInstance>>,
    active: Option<Arc<WorkerInstance>>,
    clients: ClientTable,
}

/// Lifecycle host for the worker instances of one scope.
pub struct Registration {
    scope: Url,
    config: CacheConfig,
    network: Arc<dyn Network>,
    storage: Arc<dyn CacheStorage>,
    script: Arc<dyn ScriptSource>,
    slots: Mutex<Slots>,
    /// Serializes update checks so only one instance installs at a time.
    update_lock: Mutex<()>,
    waiting_tx: watch::Sender<Option<WorkerHandle>>,
    controller_tx: watch::Sender<Option<WorkerHandle>>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("scope", &self.scope.as_str())
            .field("waiting", &*self.waiting_tx.borrow())
            .field("active", &*self.controller_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl Registration {
    #[must_use]
    pub fn new(
        scope: Url,
        config: CacheConfig,
        network: Arc<dyn Network>,
        storage: Arc<dyn CacheStorage>,
        script: Arc<dyn ScriptSource>,
    ) -> Self {
        Self {
            scope,
            config,
            network,
            storage,
            script,
            slots: Mutex::new(Slots::default()),
            update_lock: Mutex::new(()),
            waiting_tx: watch::Sender::new(None),
            controller_tx: watch::Sender::new(None),
        }
    }

    #[must_use]
    pub const fn scope(&self) -> &Url {
        &self.scope
    }

    /// Registers the worker for this scope, installing it if needed.
    ///
    /// A failed update check is only an error when nothing is active yet.
    ///
    /// # Errors
    ///
    /// Returns an error if no instance controls the scope and the first
    /// install fails.
    pub async fn register(&self) -> Result<()> {
        match self.update().await {
            Ok(_) => Ok(()),
            Err(e) if self.active().is_some() => {
                log::debug!("Update check during registration failed: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-checks the worker script and installs a new instance if its bytes
    /// changed. Returns whether a new instance was installed.
    ///
    /// The first instance for a scope activates immediately. Later ones park
    /// in the waiting slot, replacing any older waiting instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the script cannot be fetched or the new instance
    /// fails to install. The failed instance becomes redundant.
    pub async fn update(&self) -> Result<bool> {
        let _guard = self.update_lock.lock().await;
        let script = self.script.fetch_script().await?;

        {
            let slots = self.slots.lock().await;
            let newest = slots.waiting.as_ref().or(slots.active.as_ref());
            if newest.is_some_and(|w| w.script.digest == script.digest) {
                return Ok(false);
            }
        }

        let id = Uuid::new_v4();
        let instance = Arc::new(WorkerInstance {
            id,
            controller: CacheController::new(
                id,
                script.generation.clone(),
                self.scope.clone(),
                &self.config,
                Arc::clone(&self.network),
                Arc::clone(&self.storage),
            ),
            script,
            state: StdMutex::new(WorkerState::Installing),
        });
        log::info!("Installing worker {} ({})", id, instance.script.generation);
        self.slots.lock().await.installing = Some(Arc::clone(&instance));

        let installed = instance.controller.install().await;

        let mut slots = self.slots.lock().await;
        slots.installing = None;
        if let Err(e) = installed {
            instance.transition(LifecycleEvent::InstallFailed)?;
            log::warn!("Worker {} failed to install: {e}", instance.script.generation);
            return Err(e);
        }
        instance.transition(LifecycleEvent::Installed)?;

        if slots.active.is_none() {
            self.promote(&mut slots, instance).await?;
            return Ok(true);
        }

        if let Some(previous) = slots.waiting.replace(Arc::clone(&instance)) {
            previous.transition(LifecycleEvent::Superseded)?;
            log::info!(
                "Waiting worker {} superseded by {}",
                previous.script.generation,
                instance.script.generation
            );
        }
        log::info!("Worker {} is waiting", instance.script.generation);
        self.waiting_tx.send_replace(Some(instance.handle()));
        Ok(true)
    }

    /// Currently waiting instance, if any.
    #[must_use]
    pub fn waiting(&self) -> Option<WorkerHandle> {
        self.waiting_tx.borrow().clone()
    }

    /// Instance currently controlling the scope, if any.
    #[must_use]
    pub fn active(&self) -> Option<WorkerHandle> {
        self.controller_tx.borrow().clone()
    }

    /// Delivers `message` to `target`. Returns whether it had any effect.
    ///
    /// Skip-waiting sent to an instance that is not waiting is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if activation hits an invalid lifecycle transition.
    pub async fn post_message(&self, target: &WorkerHandle, message: WorkerMessage) -> Result<bool> {
        let mut slots = self.slots.lock().await;
        match message {
            WorkerMessage::SkipWaiting => {
                let is_waiting = slots
                    .waiting
                    .as_ref()
                    .is_some_and(|w| w.id == target.id && w.state().is_waiting());
                if !is_waiting {
                    log::debug!("Ignoring SKIP_WAITING for {} (not waiting)", target.tag);
                    return Ok(false);
                }
                self.activate_waiting(&mut slots).await?;
                Ok(true)
            }
        }
    }

    /// Opens a page client under the active instance.
    pub async fn attach_client(&self) -> ClientId {
        let mut slots = self.slots.lock().await;
        let controller = slots.active.as_ref().map(|w| w.id);
        slots.clients.attach(controller)
    }

    /// Closes a page client. When the last one closes, a waiting instance
    /// activates.
    ///
    /// # Errors
    ///
    /// Returns an error if activation hits an invalid lifecycle transition.
    pub async fn detach_client(&self, id: ClientId) -> Result<()> {
        let mut slots = self.slots.lock().await;
        if slots.clients.detach(id) && slots.clients.is_empty() && slots.waiting.is_some() {
            log::info!("Last client closed, activating waiting worker");
            self.activate_waiting(&mut slots).await?;
        }
        Ok(())
    }

    /// Routes a request through the active instance. With no active
    /// instance nothing is intercepted.
    pub async fn fetch(&self, request: &Request) -> FetchOutcome {
        let active = self.slots.lock().await.active.clone();
        match active {
            Some(worker) => worker.controller.handle_fetch(request).await,
            None => FetchOutcome::Passthrough,
        }
    }

    /// Fires whenever a new instance reaches (or leaves) the waiting slot.
    #[must_use]
    pub fn subscribe_waiting(&self) -> watch::Receiver<Option<WorkerHandle>> {
        self.waiting_tx.subscribe()
    }

    /// Fires whenever a different instance takes control of the scope.
    #[must_use]
    pub fn subscribe_controller(&self) -> watch::Receiver<Option<WorkerHandle>> {
        self.controller_tx.subscribe()
    }

    pub async fn status(&self) -> RegistrationStatus {
        let slots = self.slots.lock().await;
        RegistrationStatus {
            scope: self.scope.to_string(),
            installing: slots.installing.as_ref().map(|w| w.info()),
            waiting: slots.waiting.as_ref().map(|w| w.info()),
            active: slots.active.as_ref().map(|w| w.info()),
            clients: slots.clients.snapshot(),
        }
    }

    async fn activate_waiting(&self, slots: &mut Slots) -> Result<()> {
        let Some(next) = slots.waiting.take() else {
            return Ok(());
        };
        self.waiting_tx.send_replace(None);
        self.promote(slots, next).await
    }

    async fn promote(&self, slots: &mut Slots, next: Arc<WorkerInstance>) -> Result<()> {
        next.transition(LifecycleEvent::Activate)?;
        if let Some(previous) = slots.active.take() {
            previous.transition(LifecycleEvent::Superseded)?;
        }

        match next.controller.activate(&mut slots.clients).await {
            Ok(evicted) => log::info!(
                "Worker {} activated, {evicted} stale generation(s) evicted",
                next.script.generation
            ),
            Err(e) => log::warn!(
                "Worker {} activated but eviction failed: {e}",
                next.script.generation
            ),
        }

        next.transition(LifecycleEvent::ActivationComplete)?;
        self.controller_tx.send_replace(Some(next.handle()));
        slots.active = Some(next);
        Ok(())
    }
}
