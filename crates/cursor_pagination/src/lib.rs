//! Random-access pagination over document stores that can only read
//! "the next N documents after cursor C".
//!
//! A [`ListSession`] binds one [`QueryShape`] at a time and keeps a
//! [`chain::CursorChain`] of page boundaries for it, so jumping to page N
//! costs at most N bounded reads the first time and one read afterwards.
//! The most recently loaded page is additionally followed through a
//! standing subscription so concurrent writes show up without a re-fetch.

mod backoff;
pub mod chain;
pub mod knobs;
pub mod orders;
pub mod session;
pub mod shape;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use self::{
    chain::PageResult,
    session::{
        ListSession,
        PageLoad,
        PageLoadError,
        PaginationState,
        Session,
        SessionId,
        SessionRequest,
        SingleDocumentSession,
    },
    shape::{
        CollectionPath,
        FieldPath,
        Filter,
        FilterOperator,
        Order,
        OrderDirection,
        QueryShape,
    },
    store::{
        DocumentId,
        DocumentStore,
        ReadPage,
    },
};
