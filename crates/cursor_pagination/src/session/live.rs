use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{
    OwnedSemaphorePermit,
    Semaphore,
};
use tokio_util::task::AbortOnDropHandle;

use super::list::SessionCore;
use crate::{
    backoff::Backoff,
    store::DocumentStore,
};

/// The standing subscription attached to the most recently loaded page.
/// Dropping the view aborts its task.
pub(crate) struct LivePageView {
    pub view_id: u64,
    pub page: usize,
    _task: AbortOnDropHandle<()>,
}

/// Exactly the constraints the page's point-in-time read used.
pub(crate) struct LiveTarget<S: DocumentStore> {
    pub view_id: u64,
    pub page: usize,
    pub query: S::Query,
    pub start: Option<S::Cursor>,
    pub page_size: usize,
}

impl LivePageView {
    /// Start following `target`.
    ///
    /// `slot` holds a single permit per session. A view's task keeps it for
    /// as long as its subscription may be open, and an aborted task only
    /// gives it back once its subscription has been dropped. So a new view
    /// never subscribes while the one it replaces, on this page or under a
    /// previous shape, is still tearing down.
    pub fn start<S: DocumentStore>(
        core: Arc<SessionCore<S>>,
        slot: Arc<Semaphore>,
        target: LiveTarget<S>,
    ) -> Self {
        let view_id = target.view_id;
        let page = target.page;
        let task = AbortOnDropHandle::new(tokio::spawn(async move {
            let Ok(permit) = slot.acquire_owned().await else {
                return;
            };
            run_live_view(core, target, permit).await
        }));
        Self {
            view_id,
            page,
            _task: task,
        }
    }
}

/// `_permit` outlives every subscription opened here.
async fn run_live_view<S: DocumentStore>(
    core: Arc<SessionCore<S>>,
    target: LiveTarget<S>,
    _permit: OwnedSemaphorePermit,
) {
    let mut backoff = Backoff::for_live_view();
    loop {
        let subscribed = core
            .store()
            .subscribe(&target.query, target.start.clone(), target.page_size)
            .await;
        let error = match subscribed {
            Ok(mut subscription) => loop {
                match subscription.next().await {
                    Some(Ok(documents)) => {
                        backoff.reset();
                        core.publish_live(target.view_id, documents);
                    },
                    Some(Err(e)) => {
                        tracing::warn!(
                            session_id = %core.id(),
                            page = target.page,
                            "Live page subscription failed: {e:#}"
                        );
                        break e;
                    },
                    None => {
                        tracing::debug!(
                            session_id = %core.id(),
                            page = target.page,
                            "Live page subscription closed by the store"
                        );
                        return;
                    },
                }
            },
            Err(e) => {
                tracing::warn!(
                    session_id = %core.id(),
                    page = target.page,
                    "Failed to subscribe to live page: {e:#}"
                );
                e
            },
        };
        let delay = backoff.fail(&error, &mut rand::rng());
        tracing::debug!(
            session_id = %core.id(),
            "Resubscribing to page {} in {delay:?} (failures: {})",
            target.page,
            backoff.failures()
        );
        tokio::time::sleep(delay).await;
    }
}
