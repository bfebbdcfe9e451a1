use std::sync::{
    atomic::{
        AtomicU64,
        Ordering,
    },
    Arc,
};

use anyhow::Context;
use tokio::sync::watch;

use super::{
    validate_page_number,
    PageLoad,
    PageLoadError,
    PaginationState,
    SessionId,
};
use crate::{
    chain::PageResult,
    shape::CollectionPath,
    store::{
        DocumentId,
        DocumentStore,
    },
};

/// Shows exactly one document looked up by id. Pagination is bypassed:
/// there is a single page, and `total_items` is 1 if the document exists
/// and 0 otherwise.
pub struct SingleDocumentSession<S: DocumentStore> {
    id: SessionId,
    store: Arc<S>,
    collection: CollectionPath,
    document_id: DocumentId,
    state: watch::Sender<PaginationState<S::Document>>,
    latest_read: AtomicU64,
}

impl<S: DocumentStore> SingleDocumentSession<S> {
    pub fn new(store: Arc<S>, collection: CollectionPath, document_id: DocumentId) -> Self {
        let (state, _) = watch::channel(PaginationState {
            has_more: false,
            ..PaginationState::default()
        });
        Self {
            id: SessionId::new(),
            store,
            collection,
            document_id,
            state,
            latest_read: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Point read the document. Only the latest of overlapping reads
    /// updates the state.
    pub async fn load(&self) -> anyhow::Result<Option<S::Document>> {
        let read = self.latest_read.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_modify(|state| state.loading = true);
        let result = self
            .store
            .read_document(&self.collection, &self.document_id)
            .await
            .with_context(|| {
                format!("Failed to read {}/{}", self.collection, self.document_id)
            });
        if self.latest_read.load(Ordering::SeqCst) != read {
            return result;
        }
        match result {
            Ok(document) => {
                tracing::debug!(
                    session_id = %self.id,
                    found = document.is_some(),
                    "Loaded {}/{}",
                    self.collection,
                    self.document_id
                );
                self.state.send_modify(|state| {
                    state.data = document.iter().cloned().collect();
                    state.total_items = document.is_some() as u64;
                    state.loading = false;
                    state.has_more = false;
                    state.current_page = 1;
                    state.error = None;
                });
                Ok(document)
            },
            Err(e) => {
                tracing::warn!(session_id = %self.id, "Document read failed: {e:#}");
                self.state.send_modify(|state| {
                    state.loading = false;
                    state.error = Some(PageLoadError::new(1, &e));
                });
                Err(e)
            },
        }
    }

    /// Page 1 re-reads the document. Every later page is empty.
    pub async fn load_page(&self, page: usize) -> anyhow::Result<PageLoad<S::Document>> {
        validate_page_number(page)?;
        if page > 1 {
            return Ok(PageLoad::Loaded(PageResult::beyond_end()));
        }
        let document = self.load().await?;
        Ok(PageLoad::Loaded(PageResult {
            items: document.into_iter().collect(),
            is_last_page: true,
        }))
    }

    pub fn state(&self) -> PaginationState<S::Document> {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PaginationState<S::Document>> {
        self.state.subscribe()
    }
}
