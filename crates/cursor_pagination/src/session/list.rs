use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

use anyhow::Context;
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{
    watch,
    Semaphore,
};
use tokio_stream::wrappers::WatchStream;
use tokio_util::task::AbortOnDropHandle;
use tracing::Level;

use super::{
    live::{
        LivePageView,
        LiveTarget,
    },
    validate_page_number,
    PageLoad,
    PageLoadError,
    PaginationState,
    SessionId,
};
use crate::{
    chain::{
        CursorChain,
        PageResult,
        WalkOutcome,
    },
    shape::QueryShape,
    store::DocumentStore,
};

/// A paged listing over one [`QueryShape`] at a time.
///
/// Dropping the session cancels in-flight work: pending reads still
/// complete but their results are discarded, and the live subscription and
/// count query are torn down.
pub struct ListSession<S: DocumentStore> {
    core: Arc<SessionCore<S>>,
}

pub(crate) struct SessionCore<S: DocumentStore> {
    id: SessionId,
    store: Arc<S>,
    state: watch::Sender<PaginationState<S::Document>>,
    inner: Mutex<SessionInner<S>>,
    cancelled: AtomicBool,
    /// Held by whichever live view task has a subscription open.
    subscription_slot: Arc<Semaphore>,
}

struct SessionInner<S: DocumentStore> {
    bound: Option<BoundShape<S>>,
    /// Bumped every time a shape is bound, including rebinding the same
    /// shape on reset.
    shape_version: u64,
    /// Bumped by every `load_page`. Only the latest request may commit.
    latest_request: u64,
    next_view_id: u64,
    live: Option<LivePageView>,
    count_task: Option<AbortOnDropHandle<()>>,
    failed_page: Option<usize>,
}

struct BoundShape<S: DocumentStore> {
    shape: QueryShape,
    query: S::Query,
    /// Owned by this shape version only. Walks lock it, so a second
    /// `load_page` queues behind the first.
    chain: Arc<tokio::sync::Mutex<CursorChain<S::Cursor>>>,
}

impl<S: DocumentStore> Clone for BoundShape<S> {
    fn clone(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            query: self.query.clone(),
            chain: self.chain.clone(),
        }
    }
}

/// Identifies one `load_page` call under one shape version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Epoch {
    shape_version: u64,
    request: u64,
}

impl<S: DocumentStore> ListSession<S> {
    pub fn new(store: Arc<S>) -> Self {
        let (state, _) = watch::channel(PaginationState::default());
        let core = SessionCore {
            id: SessionId::new(),
            store,
            state,
            inner: Mutex::new(SessionInner {
                bound: None,
                shape_version: 0,
                latest_request: 0,
                next_view_id: 0,
                live: None,
                count_task: None,
                failed_page: None,
            }),
            cancelled: AtomicBool::new(false),
            subscription_slot: Arc::new(Semaphore::new(1)),
        };
        Self {
            core: Arc::new(core),
        }
    }

    pub fn id(&self) -> SessionId {
        self.core.id
    }

    pub fn shape(&self) -> Option<QueryShape> {
        self.core
            .inner
            .lock()
            .bound
            .as_ref()
            .map(|bound| bound.shape.clone())
    }

    /// Bind `shape` and load its first page. A shape equal to the bound one
    /// is a no-op and returns `None`.
    pub async fn set_shape(
        &self,
        shape: QueryShape,
    ) -> anyhow::Result<Option<PageLoad<S::Document>>> {
        if self
            .core
            .inner
            .lock()
            .bound
            .as_ref()
            .is_some_and(|bound| bound.shape == shape)
        {
            return Ok(None);
        }
        self.core.bind(shape);
        self.load_page(1).await.map(Some)
    }

    /// Discard all cached cursors and reload page 1 of the bound shape,
    /// recounting as well.
    pub async fn reset(&self) -> anyhow::Result<PageLoad<S::Document>> {
        let shape = self.shape().context(no_query_shape())?;
        self.core.bind(shape);
        self.load_page(1).await
    }

    /// Load `page`, walking the cursor chain forward from the deepest known
    /// boundary below it.
    pub async fn load_page(&self, page: usize) -> anyhow::Result<PageLoad<S::Document>> {
        validate_page_number(page)?;
        let (epoch, bound) = {
            let mut inner = self.core.inner.lock();
            let bound = inner.bound.clone().context(no_query_shape())?;
            {
                let state = self.core.state.borrow();
                if !state.has_more && page > state.current_page {
                    tracing::debug!(
                        session_id = %self.core.id,
                        page,
                        current_page = state.current_page,
                        "Page is beyond the end of the collection"
                    );
                    return Ok(PageLoad::Loaded(PageResult::beyond_end()));
                }
            }
            inner.latest_request += 1;
            let epoch = Epoch {
                shape_version: inner.shape_version,
                request: inner.latest_request,
            };
            self.core.state.send_modify(|state| state.loading = true);
            (epoch, bound)
        };

        let outcome = {
            let mut chain = bound.chain.lock().await;
            if !self.core.is_current(epoch) {
                return Ok(PageLoad::Discarded);
            }
            chain
                .walk(
                    &*self.core.store,
                    &bound.query,
                    bound.shape.page_size(),
                    page,
                    || self.core.is_current(epoch),
                )
                .await
        };
        match outcome {
            Ok(WalkOutcome::Reached { result, start }) => {
                let committed = self.core.commit_page(
                    epoch,
                    page,
                    result.clone(),
                    LiveTarget {
                        view_id: 0,
                        page,
                        query: bound.query,
                        start,
                        page_size: bound.shape.page_size(),
                    },
                );
                Ok(if committed {
                    PageLoad::Loaded(result)
                } else {
                    PageLoad::Discarded
                })
            },
            Ok(WalkOutcome::BeyondEnd) => {
                Ok(if self.core.commit_beyond_end(epoch, page) {
                    PageLoad::Loaded(PageResult::beyond_end())
                } else {
                    PageLoad::Discarded
                })
            },
            Ok(WalkOutcome::Superseded) => {
                tracing::debug!(session_id = %self.core.id, page, "Discarding superseded page load");
                Ok(PageLoad::Discarded)
            },
            Err(e) => {
                self.core.record_failure(epoch, page, &e);
                Err(e)
            },
        }
    }

    /// Re-issue the load that failed last, if the failure is still the
    /// latest thing that happened to this session.
    pub async fn retry(&self) -> anyhow::Result<Option<PageLoad<S::Document>>> {
        let failed_page = self.core.inner.lock().failed_page;
        match failed_page {
            Some(page) => self.load_page(page).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn next_page(&self) -> anyhow::Result<PageLoad<S::Document>> {
        let page = self.core.state.borrow().current_page + 1;
        self.load_page(page).await
    }

    /// `None` on page 1.
    pub async fn previous_page(&self) -> anyhow::Result<Option<PageLoad<S::Document>>> {
        let current_page = self.core.state.borrow().current_page;
        if current_page <= 1 {
            return Ok(None);
        }
        self.load_page(current_page - 1).await.map(Some)
    }

    /// `ceil(total_items / page_size)`, 0 before a shape is bound.
    pub fn total_pages(&self) -> u64 {
        let Some(shape) = self.shape() else {
            return 0;
        };
        shape.total_pages(self.core.state.borrow().total_items)
    }

    /// Number of page boundaries cached for the bound shape.
    pub async fn known_pages(&self) -> usize {
        let chain = self
            .core
            .inner
            .lock()
            .bound
            .as_ref()
            .map(|bound| bound.chain.clone());
        match chain {
            Some(chain) => chain.lock().await.known_pages(),
            None => 0,
        }
    }

    /// The page the live subscription is following, if any.
    pub fn live_page(&self) -> Option<usize> {
        self.core.inner.lock().live.as_ref().map(|view| view.page)
    }

    pub fn state(&self) -> PaginationState<S::Document> {
        self.core.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PaginationState<S::Document>> {
        self.core.state.subscribe()
    }

    pub fn updates(&self) -> impl Stream<Item = PaginationState<S::Document>> {
        WatchStream::new(self.subscribe_state())
    }
}

impl<S: DocumentStore> Drop for ListSession<S> {
    fn drop(&mut self) {
        self.core.cancelled.store(true, Ordering::SeqCst);
        let mut inner = self.core.inner.lock();
        inner.live = None;
        inner.count_task = None;
    }
}

fn no_query_shape() -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "NoQueryShape",
        "A query shape must be set before pages can be loaded",
    )
}

impl<S: DocumentStore> SessionCore<S> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn is_current(&self, epoch: Epoch) -> bool {
        let inner = self.inner.lock();
        self.is_current_locked(&inner, epoch)
    }

    fn is_current_locked(&self, inner: &SessionInner<S>, epoch: Epoch) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
            && inner.shape_version == epoch.shape_version
            && inner.latest_request == epoch.request
    }

    /// Start a new shape version: fresh chain, no live view, cleared state,
    /// and a count query racing the first page read.
    fn bind(self: &Arc<Self>, shape: QueryShape) {
        let query = self
            .store
            .query(shape.collection(), shape.filters(), shape.order());
        let mut inner = self.inner.lock();
        inner.shape_version += 1;
        let shape_version = inner.shape_version;
        inner.live = None;
        inner.count_task = None;
        inner.failed_page = None;
        tracing::info!(session_id = %self.id, shape_version, "Binding query shape {shape}");
        inner.bound = Some(BoundShape {
            shape: shape.clone(),
            query,
            chain: Arc::new(tokio::sync::Mutex::new(CursorChain::new())),
        });
        self.state.send_replace(PaginationState {
            loading: true,
            ..PaginationState::default()
        });
        inner.count_task = Some(self.spawn_count(shape_version, shape));
    }

    fn spawn_count(
        self: &Arc<Self>,
        shape_version: u64,
        shape: QueryShape,
    ) -> AbortOnDropHandle<()> {
        let core = self.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            let total_items = match core
                .store
                .count_read(shape.collection(), shape.filters())
                .await
            {
                Ok(total_items) => total_items,
                Err(e) => {
                    tracing::warn!(
                        session_id = %core.id,
                        "Count query failed, reporting 0 items: {e:#}"
                    );
                    0
                },
            };
            let inner = core.inner.lock();
            if core.cancelled.load(Ordering::SeqCst) || inner.shape_version != shape_version {
                tracing::debug!(session_id = %core.id, "Discarding count for a stale shape");
                return;
            }
            core.state
                .send_modify(|state| state.total_items = total_items);
        }))
    }

    fn commit_page(
        self: &Arc<Self>,
        epoch: Epoch,
        page: usize,
        result: PageResult<S::Document>,
        mut live: LiveTarget<S>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if !self.is_current_locked(&inner, epoch) {
            tracing::debug!(session_id = %self.id, page, "Discarding stale page result");
            return false;
        }
        inner.failed_page = None;
        inner.next_view_id += 1;
        live.view_id = inner.next_view_id;
        // Replacing the view aborts the previous one's task.
        inner.live = Some(LivePageView::start(
            self.clone(),
            self.subscription_slot.clone(),
            live,
        ));
        self.state.send_modify(|state| {
            state.data = result.items;
            state.loading = false;
            state.has_more = !result.is_last_page;
            state.current_page = page;
            state.error = None;
        });
        true
    }

    fn commit_beyond_end(&self, epoch: Epoch, page: usize) -> bool {
        let inner = self.inner.lock();
        if !self.is_current_locked(&inner, epoch) {
            return false;
        }
        tracing::debug!(session_id = %self.id, page, "Chain walk reached the end of the collection");
        self.state.send_modify(|state| state.loading = false);
        true
    }

    fn record_failure(&self, epoch: Epoch, page: usize, e: &anyhow::Error) {
        let level = e.log_level();
        if level == Level::ERROR {
            tracing::error!(session_id = %self.id, page, "Page load failed: {e:#}");
        } else if level == Level::WARN {
            tracing::warn!(session_id = %self.id, page, "Page load failed: {e:#}");
        } else {
            tracing::info!(session_id = %self.id, page, "Page load failed: {e:#}");
        }
        let mut inner = self.inner.lock();
        if !self.is_current_locked(&inner, epoch) {
            return;
        }
        inner.failed_page = Some(page);
        self.state.send_modify(|state| {
            state.loading = false;
            state.error = Some(PageLoadError::new(page, e));
        });
    }

    /// Apply an update from the live view `view_id`, unless it has been
    /// replaced since.
    pub fn publish_live(&self, view_id: u64, documents: Vec<S::Document>) {
        let mut inner = self.inner.lock();
        let is_installed = inner.live.as_ref().is_some_and(|view| view.view_id == view_id);
        if self.cancelled.load(Ordering::SeqCst) || !is_installed {
            return;
        }
        let Some(bound) = inner.bound.as_mut() else {
            return;
        };
        let full = documents.len() >= bound.shape.page_size();
        let recorded_end_is_stale = full && !self.state.borrow().has_more;
        if recorded_end_is_stale {
            tracing::debug!(
                session_id = %self.id,
                "Live update filled the last page, discarding cursor chain"
            );
            bound.chain = Arc::new(tokio::sync::Mutex::new(CursorChain::new()));
        }
        self.state.send_modify(|state| {
            state.data = documents;
            if recorded_end_is_stale {
                state.has_more = true;
            }
        });
    }
}
