//! Cursor chains: random access over a forward-only store.
//!
//! The chain is an arena indexed by page number. Slot 0 is the start of the
//! collection, slot `i` is the boundary after page `i`. Reaching page N for
//! the first time costs N bounded reads; afterwards any page at or below the
//! deepest known boundary costs exactly one.

use anyhow::Context;
use errors::ErrorMetadataAnyhowExt;

use crate::store::DocumentStore;

/// Where page `i + 1` starts, as recorded after reading page `i`.
#[derive(Clone, Debug, PartialEq)]
pub enum Boundary<C> {
    /// Slot 0: the start of the collection.
    Start,
    /// Page `i` was full; page `i + 1` starts after this cursor.
    After(C),
    /// Page `i` came back short, so the collection ends at page `i`.
    End,
}

/// One page of documents as surfaced to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct PageResult<D> {
    pub items: Vec<D>,
    /// True iff fewer than `page_size` documents were returned.
    pub is_last_page: bool,
}

impl<D> PageResult<D> {
    /// The result for a page past the known end of the collection.
    pub fn beyond_end() -> Self {
        Self {
            items: vec![],
            is_last_page: true,
        }
    }
}

pub enum WalkOutcome<D, C> {
    Reached {
        result: PageResult<D>,
        /// Cursor the target page was read after, `None` for page 1.
        start: Option<C>,
    },
    /// The collection ends before the target page.
    BeyondEnd,
    /// A newer request took over while a read was in flight.
    Superseded,
}

enum Recorded {
    New,
    Confirmed,
    Conflict,
}

#[derive(Debug)]
pub struct CursorChain<C> {
    boundaries: Vec<Boundary<C>>,
}

impl<C: Clone + PartialEq> CursorChain<C> {
    pub fn new() -> Self {
        Self {
            boundaries: vec![Boundary::Start],
        }
    }

    /// Number of pages whose trailing boundary is known.
    pub fn known_pages(&self) -> usize {
        self.boundaries.len() - 1
    }

    /// The last page of the collection, if a short page has been seen.
    pub fn end_page(&self) -> Option<usize> {
        match self.boundaries.last() {
            Some(Boundary::End) => Some(self.known_pages()),
            _ => None,
        }
    }

    pub fn boundary(&self, page: usize) -> Option<&Boundary<C>> {
        self.boundaries.get(page)
    }

    /// Drop every boundary but the start sentinel.
    pub fn invalidate(&mut self) {
        self.boundaries.truncate(1);
    }

    fn record(&mut self, page: usize, boundary: Boundary<C>) -> Recorded {
        match self.boundaries.get(page) {
            None => {
                debug_assert_eq!(page, self.boundaries.len());
                self.boundaries.push(boundary);
                Recorded::New
            },
            Some(existing) if *existing == boundary => Recorded::Confirmed,
            Some(_) => Recorded::Conflict,
        }
    }

    /// Read forward from the deepest known boundary below `target` until
    /// `target` itself has been read, recording every boundary on the way.
    ///
    /// `is_current` is checked after every read; once it returns false the
    /// walk stops without recording anything further. A read error aborts
    /// the walk and leaves all previously recorded boundaries in place.
    pub async fn walk<S>(
        &mut self,
        store: &S,
        query: &S::Query,
        page_size: usize,
        target: usize,
        is_current: impl Fn() -> bool,
    ) -> anyhow::Result<WalkOutcome<S::Document, C>>
    where
        S: DocumentStore<Cursor = C>,
    {
        anyhow::ensure!(target >= 1, "page numbers start at 1");
        if let Some(end) = self.end_page() {
            if target > end {
                return Ok(WalkOutcome::BeyondEnd);
            }
        }
        let mut page = self.known_pages().min(target - 1) + 1;
        loop {
            let start = match &self.boundaries[page - 1] {
                Boundary::Start => None,
                Boundary::After(cursor) => Some(cursor.clone()),
                Boundary::End => return Ok(WalkOutcome::BeyondEnd),
            };
            tracing::debug!(page, target, "Reading page to extend cursor chain");
            let read = store
                .limited_read(query, start.as_ref(), page_size)
                .await
                .map_err(|e| {
                    e.wrap_error_message(|msg| format!("Failed to read page {page}: {msg}"))
                })?;
            if !is_current() {
                return Ok(WalkOutcome::Superseded);
            }
            let is_last_page = read.documents.len() < page_size;
            let boundary = if is_last_page {
                Boundary::End
            } else {
                let cursor = read.end_cursor.with_context(|| {
                    format!("Store returned a full page {page} without an end cursor")
                })?;
                Boundary::After(cursor)
            };
            match self.record(page, boundary) {
                Recorded::New | Recorded::Confirmed => (),
                Recorded::Conflict => {
                    // Every boundary after this one was derived from stale
                    // data, and the chain is never partially truncated.
                    tracing::debug!(page, "Page boundary moved, discarding cursor chain");
                    self.invalidate();
                    if page < target {
                        page = 1;
                        continue;
                    }
                },
            }
            if page == target {
                return Ok(WalkOutcome::Reached {
                    result: PageResult {
                        items: read.documents,
                        is_last_page,
                    },
                    start,
                });
            }
            if is_last_page {
                return Ok(WalkOutcome::BeyondEnd);
            }
            page += 1;
        }
    }
}

impl<C: Clone + PartialEq> Default for CursorChain<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicBool,
        Ordering,
    };

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    use super::{
        Boundary,
        CursorChain,
        WalkOutcome,
    };
    use crate::{
        shape::{
            Filter,
            Order,
        },
        store::DocumentStore,
        testing::{
            InMemoryStore,
            TestCursor,
            TestDocument,
            TestQuery,
        },
    };

    fn store_with(count: usize) -> (InMemoryStore, TestQuery) {
        let store = InMemoryStore::new();
        store.seed_numbered("products", count);
        let query = store.query(
            &"products".parse().unwrap(),
            &Vec::<Filter>::new(),
            &Order {
                field: "n".parse().unwrap(),
                direction: Default::default(),
            },
        );
        (store, query)
    }

    fn numbers(result: &[TestDocument]) -> Vec<i64> {
        result
            .iter()
            .map(|doc| doc.fields["n"].as_i64().unwrap())
            .collect()
    }

    async fn walk(
        chain: &mut CursorChain<TestCursor>,
        store: &InMemoryStore,
        query: &TestQuery,
        page_size: usize,
        target: usize,
    ) -> anyhow::Result<Option<Vec<i64>>> {
        match chain.walk(store, query, page_size, target, || true).await? {
            WalkOutcome::Reached { result, .. } => Ok(Some(numbers(&result.items))),
            WalkOutcome::BeyondEnd => Ok(None),
            WalkOutcome::Superseded => anyhow::bail!("walk should not be superseded"),
        }
    }

    #[tokio::test]
    async fn test_jump_then_revisit() -> anyhow::Result<()> {
        let (store, query) = store_with(5);
        let mut chain = CursorChain::new();

        assert_eq!(walk(&mut chain, &store, &query, 2, 1).await?, Some(vec![1, 2]));
        assert_eq!(store.limited_reads(), 1);

        assert_eq!(walk(&mut chain, &store, &query, 2, 3).await?, Some(vec![5]));
        assert_eq!(store.limited_reads(), 3);
        assert_eq!(chain.known_pages(), 3);
        assert_eq!(chain.end_page(), Some(3));

        assert_eq!(walk(&mut chain, &store, &query, 2, 2).await?, Some(vec![3, 4]));
        assert_eq!(store.limited_reads(), 4);

        // Nothing exists past the recorded end, so no read is issued.
        assert_eq!(walk(&mut chain, &store, &query, 2, 7).await?, None);
        assert_eq!(store.limited_reads(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_walk_stops_at_end_of_collection() -> anyhow::Result<()> {
        let (store, query) = store_with(3);
        let mut chain = CursorChain::new();
        assert_eq!(walk(&mut chain, &store, &query, 2, 5).await?, None);
        // Page 1 full, page 2 short: the walk stops there.
        assert_eq!(store.limited_reads(), 2);
        assert_eq!(chain.end_page(), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_page() -> anyhow::Result<()> {
        let (store, query) = store_with(4);
        let mut chain = CursorChain::new();
        assert_eq!(walk(&mut chain, &store, &query, 2, 2).await?, Some(vec![3, 4]));
        assert_eq!(chain.end_page(), None);
        assert_eq!(walk(&mut chain, &store, &query, 2, 3).await?, Some(vec![]));
        assert_eq!(chain.end_page(), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_failure_keeps_confirmed_boundaries() -> anyhow::Result<()> {
        let (store, query) = store_with(10);
        let mut chain = CursorChain::new();
        walk(&mut chain, &store, &query, 2, 2).await?;
        assert_eq!(chain.known_pages(), 2);

        store.fail_next_reads(1);
        assert!(walk(&mut chain, &store, &query, 2, 4).await.is_err());
        assert_eq!(chain.known_pages(), 2);

        let reads = store.limited_reads();
        assert_eq!(walk(&mut chain, &store, &query, 2, 4).await?, Some(vec![7, 8]));
        assert_eq!(store.limited_reads(), reads + 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_superseded_walk_records_nothing_further() -> anyhow::Result<()> {
        let (store, query) = store_with(10);
        let mut chain = CursorChain::new();
        let current = AtomicBool::new(true);
        let outcome = chain
            .walk(&store, &query, 2, 4, || {
                // Flip after the first read completes.
                current.swap(false, Ordering::SeqCst)
            })
            .await?;
        assert!(matches!(outcome, WalkOutcome::Superseded));
        assert_eq!(chain.known_pages(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_moved_boundary_discards_whole_chain() -> anyhow::Result<()> {
        let (store, query) = store_with(10);
        let mut chain = CursorChain::new();
        walk(&mut chain, &store, &query, 2, 4).await?;
        assert_eq!(chain.known_pages(), 4);

        // A new document lands on page 2, shifting its boundary.
        store.insert("products", TestDocument::new("extra", json!({ "n": 3.5 })));
        let WalkOutcome::Reached { result, .. } = chain.walk(&store, &query, 2, 2, || true).await?
        else {
            anyhow::bail!("page 2 should exist");
        };
        assert_eq!(result.items[1].id.as_str(), "extra");
        assert_eq!(chain.known_pages(), 0);
        assert_eq!(chain.boundary(0), Some(&Boundary::Start));
        Ok(())
    }

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, cases: 64, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_sequential_visits_cost_one_read_per_page(
            count in 0usize..40,
            page_size in 1usize..6,
            pages in 1usize..12,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (store, query) = store_with(count);
                let mut chain = CursorChain::new();
                let last_page = count / page_size + 1;
                for page in 1..=pages.min(last_page) {
                    walk(&mut chain, &store, &query, page_size, page).await.unwrap();
                }
                prop_assert_eq!(store.limited_reads(), pages.min(last_page));
                Ok(())
            })?;
        }

        #[test]
        fn test_direct_jump_costs_target_reads(
            count in 0usize..40,
            page_size in 1usize..6,
            target in 1usize..12,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (store, query) = store_with(count);
                let mut chain = CursorChain::new();
                let last_page = count / page_size + 1;
                walk(&mut chain, &store, &query, page_size, target).await.unwrap();
                prop_assert_eq!(store.limited_reads(), target.min(last_page));

                // Revisiting any page at or below the target costs one read.
                let before = store.limited_reads();
                let revisit = target.min(last_page);
                walk(&mut chain, &store, &query, page_size, revisit).await.unwrap();
                prop_assert_eq!(store.limited_reads(), before + 1);
                Ok(())
            })?;
        }
    }
}
