//! Walks an order listing backed by an in-memory store.
//!
//! cargo run -p cursor_pagination --example storefront_orders --features testing
//!
//! Set RUST_LOG=cursor_pagination=debug to watch the cursor chain being
//! extended one page at a time.

use std::sync::Arc;

use cursor_pagination::{
    orders::OrderListingQuery,
    testing::{
        InMemoryStore,
        TestDocument,
    },
    Session,
};
use serde_json::json;

const STATUSES: [&str; 3] = ["paid", "shipped", "refunded"];

fn print_page(session: &Session<InMemoryStore>, label: &str) {
    let state = session.state();
    println!(
        "{label}: page {} of {} ({} orders total, more: {})",
        state.current_page,
        session.total_pages(),
        state.total_items,
        state.has_more,
    );
    for order in &state.data {
        println!(
            "  {} {} createdAt={}",
            order.id, order.fields["status"], order.fields["createdAt"]
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = cmd_util::env::config_tool();

    let store = InMemoryStore::new();
    for i in 0..23 {
        store.insert(
            "orders",
            TestDocument::new(
                format!("order_{i:03}"),
                json!({
                    "status": STATUSES[i % STATUSES.len()],
                    "userId": format!("user_{}", i % 4),
                    "createdAt": 1_700_000_000 + i * 60,
                }),
            ),
        );
    }
    let store = Arc::new(store);

    let listing = OrderListingQuery {
        status: Some("paid".to_owned()),
        page_size: Some(3),
        ..Default::default()
    };
    let session = Session::open(store.clone(), listing.into_request()?).await;
    print_page(&session, "First page");

    // Jumping ahead reads every page up to the target once.
    session.load_page(3).await?;
    print_page(&session, "Jumped");
    println!("  ({} bounded reads so far)", store.limited_reads());

    // Going back is a single read from a cached boundary.
    session.load_page(2).await?;
    print_page(&session, "Back");
    println!("  ({} bounded reads so far)", store.limited_reads());

    let lookup = OrderListingQuery {
        order_id: Some("order_007".to_owned()),
        ..Default::default()
    };
    let single = Session::open(store, lookup.into_request()?).await;
    print_page(&single, "Lookup");
    Ok(())
}
