//! Testing helpers: an in-memory [`DocumentStore`] over JSON documents.
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    sync::{
        atomic::{
            self,
            AtomicUsize,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use futures::{
    stream::BoxStream,
    StreamExt,
};
use parking_lot::Mutex;
use serde_json::{
    json,
    Value as JsonValue,
};
use tokio::sync::{
    oneshot,
    watch,
};

use crate::{
    shape::{
        compare_values,
        CollectionPath,
        FieldPath,
        Filter,
        FilterOperator,
        Order,
    },
    store::{
        DocumentId,
        DocumentStore,
        ReadPage,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub struct TestDocument {
    pub id: DocumentId,
    pub fields: JsonValue,
}

impl TestDocument {
    pub fn new(id: impl Into<DocumentId>, fields: JsonValue) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    fn field(&self, path: &FieldPath) -> Option<JsonValue> {
        if path.is_document_id() {
            return Some(JsonValue::String(self.id.to_string()));
        }
        let mut value = &self.fields;
        for component in path.components() {
            value = value.get(component)?;
        }
        Some(value.clone())
    }
}

#[derive(Clone, Debug)]
pub struct TestQuery {
    collection: CollectionPath,
    filters: Vec<Filter>,
    order: Order,
}

/// Position after the document with this order value and id.
#[derive(Clone, Debug, PartialEq)]
pub struct TestCursor {
    pub order_value: JsonValue,
    pub id: DocumentId,
}

#[derive(Default)]
struct InMemoryStoreInner {
    collections: BTreeMap<CollectionPath, BTreeMap<DocumentId, TestDocument>>,

    limited_reads: usize,
    count_reads: usize,
    point_reads: usize,
    subscribes: usize,
    read_log: Vec<Option<TestCursor>>,

    failing_reads: usize,
    failing_counts: bool,
    failing_subscribes: usize,
    interrupts: u64,

    paused: bool,
    pending_reads: Vec<oneshot::Sender<()>>,
}

/// Cheap to clone; clones share the same documents and counters.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<InMemoryStoreInner>>,
    writes: Arc<watch::Sender<u64>>,
    subscriptions: Arc<SubscriptionCounts>,
}

#[derive(Default)]
struct SubscriptionCounts {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (writes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(InMemoryStoreInner::default())),
            writes: Arc::new(writes),
            subscriptions: Arc::new(SubscriptionCounts::default()),
        }
    }

    /// Insert `doc1..=docN` with a numeric field `n` equal to their index.
    pub fn seed_numbered(&self, collection: &str, count: usize) {
        for n in 1..=count {
            self.insert(
                collection,
                TestDocument::new(format!("doc{n:04}"), json!({ "n": n })),
            );
        }
    }

    /// Insert or replace a document, notifying open subscriptions.
    pub fn insert(&self, collection: &str, document: TestDocument) {
        let collection: CollectionPath = collection.parse().expect("Invalid collection path");
        self.inner
            .lock()
            .collections
            .entry(collection)
            .or_default()
            .insert(document.id.clone(), document);
        self.writes.send_modify(|version| *version += 1);
    }

    pub fn remove(&self, collection: &str, id: &str) -> Option<TestDocument> {
        let collection: CollectionPath = collection.parse().expect("Invalid collection path");
        let removed = self
            .inner
            .lock()
            .collections
            .get_mut(&collection)
            .and_then(|documents| documents.remove(&DocumentId::from(id)));
        self.writes.send_modify(|version| *version += 1);
        removed
    }

    pub fn limited_reads(&self) -> usize {
        self.inner.lock().limited_reads
    }

    pub fn count_reads(&self) -> usize {
        self.inner.lock().count_reads
    }

    pub fn point_reads(&self) -> usize {
        self.inner.lock().point_reads
    }

    pub fn subscribes(&self) -> usize {
        self.inner.lock().subscribes
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active.load(atomic::Ordering::SeqCst)
    }

    /// The most subscriptions that were ever open at the same time.
    pub fn peak_subscriptions(&self) -> usize {
        self.subscriptions.peak.load(atomic::Ordering::SeqCst)
    }

    /// The cursor each limited read started after, in issue order.
    pub fn take_read_log(&self) -> Vec<Option<TestCursor>> {
        std::mem::take(&mut self.inner.lock().read_log)
    }

    /// Fail the next `n` limited or point reads.
    pub fn fail_next_reads(&self, n: usize) {
        self.inner.lock().failing_reads = n;
    }

    pub fn fail_counts(&self, failing: bool) {
        self.inner.lock().failing_counts = failing;
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.inner.lock().failing_subscribes = n;
    }

    /// Make every open subscription yield an error and end.
    pub fn interrupt_subscriptions(&self) {
        self.inner.lock().interrupts += 1;
        self.writes.send_modify(|version| *version += 1);
    }

    /// Hold every subsequent limited read until it is released.
    pub fn pause_reads(&self) {
        self.inner.lock().paused = true;
    }

    pub fn pending_reads(&self) -> usize {
        self.inner.lock().pending_reads.len()
    }

    /// Release the `i`th currently held read. Later reads shift down by one.
    pub fn release_read(&self, i: usize) {
        let read = self.inner.lock().pending_reads.remove(i);
        let _ = read.send(());
    }

    pub async fn wait_for_pending_reads(&self, n: usize) {
        self.wait_until(|store| store.pending_reads() >= n).await;
    }

    pub async fn wait_for_active_subscriptions(&self, n: usize) {
        self.wait_until(|store| store.active_subscriptions() == n).await;
    }

    pub async fn wait_until(&self, condition: impl Fn(&Self) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition(self) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Test timed out waiting on the store");
    }

    fn store_unavailable() -> anyhow::Error {
        ErrorMetadata::overloaded("StoreUnavailable", "The document store is unavailable").into()
    }
}

fn matches(document: &TestDocument, filter: &Filter) -> bool {
    let Some(value) = document.field(&filter.field) else {
        return false;
    };
    let contains = |list: &JsonValue, needle: &JsonValue| {
        list.as_array()
            .is_some_and(|list| list.iter().any(|v| compare_values(v, needle).is_eq()))
    };
    let ordering = compare_values(&value, &filter.value);
    match filter.operator {
        FilterOperator::Eq => ordering.is_eq(),
        FilterOperator::NotEq => !ordering.is_eq(),
        FilterOperator::Lt => ordering.is_lt(),
        FilterOperator::Lte => ordering.is_le(),
        FilterOperator::Gt => ordering.is_gt(),
        FilterOperator::Gte => ordering.is_ge(),
        FilterOperator::In => contains(&filter.value, &value),
        FilterOperator::NotIn => !contains(&filter.value, &value),
        FilterOperator::ArrayContains => contains(&value, &filter.value),
        FilterOperator::ArrayContainsAny => filter
            .value
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| contains(&value, c))),
    }
}

fn compare_positions(
    order: &Order,
    a: (&JsonValue, &DocumentId),
    b: (&JsonValue, &DocumentId),
) -> Ordering {
    order
        .direction
        .apply(compare_values(a.0, b.0).then_with(|| a.1.cmp(b.1)))
}

impl InMemoryStoreInner {
    fn matching<'a>(
        &'a self,
        collection: &CollectionPath,
        filters: &'a [Filter],
    ) -> impl Iterator<Item = &'a TestDocument> + 'a {
        self.collections
            .get(collection)
            .into_iter()
            .flat_map(|documents| documents.values())
            .filter(move |document| filters.iter().all(|filter| matches(document, filter)))
    }

    fn run_query(
        &self,
        query: &TestQuery,
        after: Option<&TestCursor>,
        limit: usize,
    ) -> ReadPage<TestDocument, TestCursor> {
        // Documents without the order field are not part of the result set.
        let mut positioned: Vec<_> = self
            .matching(&query.collection, &query.filters)
            .filter_map(|document| Some((document.field(&query.order.field)?, document)))
            .collect();
        positioned.sort_by(|(a, x), (b, y)| {
            compare_positions(&query.order, (a, &x.id), (b, &y.id))
        });
        let page: Vec<_> = positioned
            .into_iter()
            .filter(|(value, document)| {
                after.is_none_or(|cursor| {
                    compare_positions(
                        &query.order,
                        (value, &document.id),
                        (&cursor.order_value, &cursor.id),
                    )
                    .is_gt()
                })
            })
            .take(limit)
            .collect();
        let end_cursor = page.last().map(|(value, document)| TestCursor {
            order_value: value.clone(),
            id: document.id.clone(),
        });
        ReadPage {
            documents: page.into_iter().map(|(_, document)| document.clone()).collect(),
            end_cursor,
        }
    }
}

/// Decrements the active subscription count when the stream is dropped.
struct SubscriptionGuard(Arc<SubscriptionCounts>);

impl SubscriptionGuard {
    fn new(counts: Arc<SubscriptionCounts>) -> Self {
        let active = counts.active.fetch_add(1, atomic::Ordering::SeqCst) + 1;
        counts.peak.fetch_max(active, atomic::Ordering::SeqCst);
        Self(counts)
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, atomic::Ordering::SeqCst);
    }
}

struct SubscriptionState {
    inner: Arc<Mutex<InMemoryStoreInner>>,
    writes: watch::Receiver<u64>,
    query: TestQuery,
    after: Option<TestCursor>,
    limit: usize,
    interrupts: u64,
    first: bool,
    done: bool,
    _guard: SubscriptionGuard,
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    type Cursor = TestCursor;
    type Document = TestDocument;
    type Query = TestQuery;
    type Subscription = BoxStream<'static, anyhow::Result<Vec<TestDocument>>>;

    fn query(&self, collection: &CollectionPath, filters: &[Filter], order: &Order) -> TestQuery {
        TestQuery {
            collection: collection.clone(),
            filters: filters.to_vec(),
            order: order.clone(),
        }
    }

    async fn limited_read(
        &self,
        query: &TestQuery,
        after: Option<&TestCursor>,
        limit: usize,
    ) -> anyhow::Result<ReadPage<TestDocument, TestCursor>> {
        let held = {
            let mut inner = self.inner.lock();
            inner.limited_reads += 1;
            inner.read_log.push(after.cloned());
            if inner.failing_reads > 0 {
                inner.failing_reads -= 1;
                return Err(Self::store_unavailable());
            }
            if inner.paused {
                let (tx, rx) = oneshot::channel();
                inner.pending_reads.push(tx);
                Some(rx)
            } else {
                None
            }
        };
        if let Some(held) = held {
            let _ = held.await;
        }
        Ok(self.inner.lock().run_query(query, after, limit))
    }

    async fn count_read(
        &self,
        collection: &CollectionPath,
        filters: &[Filter],
    ) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        inner.count_reads += 1;
        if inner.failing_counts {
            return Err(Self::store_unavailable());
        }
        Ok(inner.matching(collection, filters).count() as u64)
    }

    async fn subscribe(
        &self,
        query: &TestQuery,
        after: Option<TestCursor>,
        limit: usize,
    ) -> anyhow::Result<Self::Subscription> {
        let interrupts = {
            let mut inner = self.inner.lock();
            inner.subscribes += 1;
            if inner.failing_subscribes > 0 {
                inner.failing_subscribes -= 1;
                return Err(Self::store_unavailable());
            }
            inner.interrupts
        };
        let state = SubscriptionState {
            inner: self.inner.clone(),
            writes: self.writes.subscribe(),
            query: query.clone(),
            after,
            limit,
            interrupts,
            first: true,
            done: false,
            _guard: SubscriptionGuard::new(self.subscriptions.clone()),
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            if state.first {
                state.first = false;
                state.writes.borrow_and_update();
            } else if state.writes.changed().await.is_err() {
                return None;
            }
            let result = {
                let inner = state.inner.lock();
                if inner.interrupts != state.interrupts {
                    state.done = true;
                    Err(anyhow::anyhow!(ErrorMetadata::overloaded(
                        "SubscriptionLost",
                        "The live query was interrupted"
                    )))
                } else {
                    Ok(inner
                        .run_query(&state.query, state.after.as_ref(), state.limit)
                        .documents)
                }
            };
            Some((result, state))
        });
        Ok(stream.boxed())
    }

    async fn read_document(
        &self,
        collection: &CollectionPath,
        id: &DocumentId,
    ) -> anyhow::Result<Option<TestDocument>> {
        let mut inner = self.inner.lock();
        inner.point_reads += 1;
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(Self::store_unavailable());
        }
        Ok(inner
            .collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{
        InMemoryStore,
        TestDocument,
    };
    use crate::{
        shape::{
            FilterOperator,
            OrderDirection,
            QueryShape,
        },
        store::DocumentStore,
    };

    fn ids(documents: &[TestDocument]) -> Vec<&str> {
        documents.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_filters_and_descending_order() -> anyhow::Result<()> {
        let store = InMemoryStore::new();
        store.insert("orders", TestDocument::new("a", json!({ "status": "paid", "total": 5 })));
        store.insert("orders", TestDocument::new("b", json!({ "status": "open", "total": 9 })));
        store.insert("orders", TestDocument::new("c", json!({ "status": "paid", "total": 7 })));
        store.insert("orders", TestDocument::new("d", json!({ "status": "paid" })));

        let shape = QueryShape::builder("orders")
            .filter("status", FilterOperator::Eq, "paid")
            .order_by("total", OrderDirection::Desc)
            .build()?;
        let query = store.query(shape.collection(), shape.filters(), shape.order());
        let page = store.limited_read(&query, None, 10).await?;
        // "d" has no total, so it is not ordered and not returned.
        assert_eq!(ids(&page.documents), vec!["c", "a"]);
        assert_eq!(store.count_read(shape.collection(), shape.filters()).await?, 3);

        let after = store.limited_read(&query, page.end_cursor.as_ref(), 10).await?;
        assert!(after.documents.is_empty());
        assert_eq!(after.end_cursor, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_subscription_follows_writes() -> anyhow::Result<()> {
        let store = InMemoryStore::new();
        store.seed_numbered("products", 2);
        let shape = QueryShape::builder("products").order_by("n", OrderDirection::Asc).build()?;
        let query = store.query(shape.collection(), shape.filters(), shape.order());

        let mut subscription = store.subscribe(&query, None, 2).await?;
        assert_eq!(store.active_subscriptions(), 1);
        let initial = subscription.next().await.unwrap()?;
        assert_eq!(ids(&initial), vec!["doc0001", "doc0002"]);

        store.insert("products", TestDocument::new("first", json!({ "n": 0 })));
        let updated = subscription.next().await.unwrap()?;
        assert_eq!(ids(&updated), vec!["first", "doc0001"]);

        store.interrupt_subscriptions();
        assert!(subscription.next().await.unwrap().is_err());
        assert!(subscription.next().await.is_none());

        drop(subscription);
        assert_eq!(store.active_subscriptions(), 0);
        Ok(())
    }
}
