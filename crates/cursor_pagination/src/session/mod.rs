//! Pagination sessions.
//!
//! A session is either a paged listing over a [`QueryShape`] or a direct
//! lookup of one document by id. Both publish the same reactive
//! [`PaginationState`] so callers can render either without caring which
//! mode produced it.

use std::{
    fmt,
    sync::Arc,
};

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use tokio::sync::watch;
use uuid::Uuid;

pub use self::{
    list::ListSession,
    single::SingleDocumentSession,
};
use crate::{
    chain::PageResult,
    knobs::PAGINATION_MAX_PAGE_NUMBER,
    shape::{
        CollectionPath,
        QueryShape,
    },
    store::{
        DocumentId,
        DocumentStore,
    },
};

mod list;
mod live;
mod single;

/// Identifies one session in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The reactive fields a caller renders from.
#[derive(Clone, Debug, PartialEq)]
pub struct PaginationState<D> {
    /// Documents of the current page as of the latest read or live update.
    pub data: Vec<D>,
    pub loading: bool,
    /// False once the current page came back short.
    pub has_more: bool,
    /// 1-indexed.
    pub current_page: usize,
    /// Advisory count from the independent count query. 0 until it lands or
    /// when it fails.
    pub total_items: u64,
    pub error: Option<PageLoadError>,
}

impl<D> Default for PaginationState<D> {
    fn default() -> Self {
        Self {
            data: vec![],
            loading: false,
            has_more: true,
            current_page: 1,
            total_items: 0,
            error: None,
        }
    }
}

/// Cloneable summary of the last failed load, kept in the reactive state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageLoadError {
    pub page: usize,
    pub short_msg: String,
    pub msg: String,
    /// Whether issuing the same load again can succeed.
    pub retriable: bool,
}

impl PageLoadError {
    pub fn new(page: usize, e: &anyhow::Error) -> Self {
        Self {
            page,
            short_msg: e.short_msg().to_owned(),
            msg: e.user_facing_message(),
            retriable: !e.is_deterministic_user_error(),
        }
    }
}

/// What became of one `load_page` call.
#[derive(Clone, Debug, PartialEq)]
pub enum PageLoad<D> {
    /// The page was committed to the session state, or lies beyond the known
    /// end of the collection (empty, last page, nothing committed).
    Loaded(PageResult<D>),
    /// A newer request or shape took over before this one finished.
    Discarded,
}

impl<D> PageLoad<D> {
    pub fn into_result(self) -> Option<PageResult<D>> {
        match self {
            PageLoad::Loaded(result) => Some(result),
            PageLoad::Discarded => None,
        }
    }
}

/// What a caller asks a [`Session`] to show.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionRequest {
    List(QueryShape),
    SingleDocument {
        collection: CollectionPath,
        id: DocumentId,
    },
}

/// A session in exactly one of its two modes.
pub enum Session<S: DocumentStore> {
    List(ListSession<S>),
    SingleDocument(SingleDocumentSession<S>),
}

impl<S: DocumentStore> Session<S> {
    /// Open a session and issue its first read. Read failures are recorded
    /// in the session state rather than returned.
    pub async fn open(store: Arc<S>, request: SessionRequest) -> Self {
        match request {
            SessionRequest::List(shape) => {
                let session = ListSession::new(store);
                if let Err(e) = session.set_shape(shape).await {
                    tracing::debug!(session_id = %session.id(), "First page failed to load: {e:#}");
                }
                Session::List(session)
            },
            SessionRequest::SingleDocument { collection, id } => {
                let session = SingleDocumentSession::new(store, collection, id);
                if let Err(e) = session.load().await {
                    tracing::debug!(session_id = %session.id(), "Document failed to load: {e:#}");
                }
                Session::SingleDocument(session)
            },
        }
    }

    pub fn id(&self) -> SessionId {
        match self {
            Session::List(session) => session.id(),
            Session::SingleDocument(session) => session.id(),
        }
    }

    pub fn state(&self) -> PaginationState<S::Document> {
        match self {
            Session::List(session) => session.state(),
            Session::SingleDocument(session) => session.state(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PaginationState<S::Document>> {
        match self {
            Session::List(session) => session.subscribe_state(),
            Session::SingleDocument(session) => session.subscribe_state(),
        }
    }

    pub async fn load_page(&self, page: usize) -> anyhow::Result<PageLoad<S::Document>> {
        match self {
            Session::List(session) => session.load_page(page).await,
            Session::SingleDocument(session) => session.load_page(page).await,
        }
    }

    pub fn total_pages(&self) -> u64 {
        match self {
            Session::List(session) => session.total_pages(),
            Session::SingleDocument(session) => session.state().total_items,
        }
    }
}

fn validate_page_number(page: usize) -> anyhow::Result<()> {
    if page == 0 {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidPageNumber",
            "Page numbers start at 1, but page 0 was requested",
        ));
    }
    let max_page = *PAGINATION_MAX_PAGE_NUMBER;
    if page > max_page {
        anyhow::bail!(ErrorMetadata::pagination_limit(
            "PageNumberTooLarge",
            format!("Page {page} is beyond the maximum reachable page {max_page}"),
        ));
    }
    Ok(())
}
