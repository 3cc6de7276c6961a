//! The page the host keeps loaded: one Update Coordinator per page load.
//!
//! A confirmed update reloads the page, which here means tearing down the
//! current coordinator and starting a fresh one against the same durable
//! store, so the update-pending flag carries across exactly as in a browser.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::coordinator::{CoordinatorEvent, PageHost, UpdateCoordinator, WorkerRegistry};
use crate::manifest::ManifestSource;
use crate::storage::DurableStore;
use crate::worker::Registration;

const MAX_NOTICES: usize = 32;

/// Recent coordinator notices, newest last.
pub type Notices = Arc<Mutex<VecDeque<CoordinatorEvent>>>;

struct ReloadSignal(mpsc::UnboundedSender<()>);

impl PageHost for ReloadSignal {
    fn reload(&self) {
        let _ = self.0.send(());
    }
}

/// Everything a page load needs.
pub struct PageDeps {
    pub config: CoordinatorConfig,
    pub registration: Arc<Registration>,
    pub manifests: Arc<dyn ManifestSource>,
    pub store: Arc<dyn DurableStore>,
    pub notices: Notices,
}

async fn record_notices(mut events: mpsc::UnboundedReceiver<CoordinatorEvent>, notices: Notices) {
    while let Some(event) = events.recv().await {
        log::info!("Notice: {event:?}");
        let mut notices = notices.lock().unwrap_or_else(PoisonError::into_inner);
        if notices.len() == MAX_NOTICES {
            notices.pop_front();
        }
        notices.push_back(event);
    }
}

/// Loads the page, then reloads it each time its coordinator asks, until
/// `token` is cancelled. The current coordinator is published on `current`.
pub async fn run_pages(
    deps: PageDeps,
    current: watch::Sender<Option<Arc<UpdateCoordinator>>>,
    token: CancellationToken,
) {
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    let mut previous_client = None;
    let mut loads = 0_u64;

    loop {
        loads += 1;
        let page_token = token.child_token();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(record_notices(events_rx, Arc::clone(&deps.notices)));

        let coordinator = Arc::new(UpdateCoordinator::new(
            deps.config.clone(),
            Arc::clone(&deps.registration) as Arc<dyn WorkerRegistry>,
            Arc::clone(&deps.manifests),
            Arc::clone(&deps.store),
            Arc::new(ReloadSignal(reload_tx.clone())),
            events_tx,
        ));

        // The new page opens before the old one closes, so a reload alone
        // never leaves the scope without clients.
        let client = deps.registration.attach_client().await;
        if let Some(old) = previous_client.replace(client)
            && let Err(e) = deps.registration.detach_client(old).await
        {
            log::warn!("Closing previous page client failed: {e}");
        }

        log::info!("Page load #{loads}");
        current.send_replace(Some(Arc::clone(&coordinator)));
        coordinator.startup(&page_token).await;

        tokio::select! {
            () = token.cancelled() => {
                page_token.cancel();
                break;
            }
            _ = reload_rx.recv() => {
                log::info!("Reloading page");
                page_token.cancel();
            }
        }
    }

    if let Some(client) = previous_client
        && let Err(e) = deps.registration.detach_client(client).await
    {
        log::warn!("Closing page client failed: {e}");
    }
}
