//! The interface the pagination core needs from a document store.
//!
//! Stores of this class only answer "give me N documents after cursor C";
//! they cannot skip to an offset. Everything else (random access, live
//! views, shape invalidation) is built on top of these primitives by the
//! session types.

use std::fmt::{
    self,
    Debug,
};

use async_trait::async_trait;
use futures::Stream;
use serde::{
    Deserialize,
    Serialize,
};

use crate::shape::{
    CollectionPath,
    Filter,
    Order,
};

/// Identifier of a single document within a collection.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Result of one bounded read.
#[derive(Clone, Debug)]
pub struct ReadPage<D, C> {
    /// Up to `limit` documents in query order.
    pub documents: Vec<D>,
    /// Position after the last returned document, `None` when nothing was
    /// returned.
    pub end_cursor: Option<C>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Query descriptor built from a collection, filters and ordering.
    type Query: Clone + Debug + Send + Sync + 'static;
    type Document: Clone + Debug + Send + Sync + 'static;
    /// Opaque position "after document X" under a query's ordering. Only
    /// meaningful for the query it was obtained from.
    type Cursor: Clone + Debug + PartialEq + Send + Sync + 'static;
    /// Standing query. Yields the current result set once on open and again
    /// after every write that affects it. Dropping the stream unsubscribes.
    type Subscription: Stream<Item = anyhow::Result<Vec<Self::Document>>> + Send + Unpin + 'static;

    /// Build a query descriptor. Pure, performs no I/O.
    fn query(&self, collection: &CollectionPath, filters: &[Filter], order: &Order) -> Self::Query;

    /// Read up to `limit` documents strictly after `after` (or from the start
    /// of the collection). Returns fewer iff the result set is exhausted.
    async fn limited_read(
        &self,
        query: &Self::Query,
        after: Option<&Self::Cursor>,
        limit: usize,
    ) -> anyhow::Result<ReadPage<Self::Document, Self::Cursor>>;

    /// Count the documents matching `filters`, independent of order and limit.
    async fn count_read(&self, collection: &CollectionPath, filters: &[Filter])
        -> anyhow::Result<u64>;

    /// Open a standing query with the same constraints as
    /// [`DocumentStore::limited_read`].
    async fn subscribe(
        &self,
        query: &Self::Query,
        after: Option<Self::Cursor>,
        limit: usize,
    ) -> anyhow::Result<Self::Subscription>;

    /// Point read of a single document.
    async fn read_document(
        &self,
        collection: &CollectionPath,
        id: &DocumentId,
    ) -> anyhow::Result<Option<Self::Document>>;
}
