//! Order listings: newest orders first, optionally narrowed to one status or
//! customer, or a single order looked up by id.

use serde::Deserialize;

use crate::{
    session::SessionRequest,
    shape::{
        FilterOperator,
        OrderDirection,
        QueryShape,
        DEFAULT_PAGE_SIZE,
    },
    store::DocumentId,
};

pub const ORDERS_COLLECTION: &str = "orders";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const STATUS_FIELD: &str = "status";
pub const CUSTOMER_FIELD: &str = "userId";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderListingQuery {
    /// When present, the listing shows only this order and the other fields
    /// are ignored.
    pub order_id: Option<String>,
    pub status: Option<String>,
    pub customer_id: Option<String>,
    pub page_size: Option<usize>,
}

impl OrderListingQuery {
    pub fn into_request(self) -> anyhow::Result<SessionRequest> {
        if let Some(order_id) = self.order_id {
            return Ok(SessionRequest::SingleDocument {
                collection: ORDERS_COLLECTION.parse()?,
                id: DocumentId::new(order_id),
            });
        }
        let mut builder = QueryShape::builder(ORDERS_COLLECTION)
            .order_by(CREATED_AT_FIELD, OrderDirection::Desc)
            .page_size(self.page_size.unwrap_or(DEFAULT_PAGE_SIZE));
        if let Some(status) = self.status {
            builder = builder.filter(STATUS_FIELD, FilterOperator::Eq, status);
        }
        if let Some(customer_id) = self.customer_id {
            builder = builder.filter(CUSTOMER_FIELD, FilterOperator::Eq, customer_id);
        }
        Ok(SessionRequest::List(builder.build()?))
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::OrderListingQuery;
    use crate::{
        session::SessionRequest,
        shape::{
            FilterOperator,
            OrderDirection,
            QueryShape,
        },
    };

    #[test]
    fn test_listing_query_builds_newest_first_shape() -> anyhow::Result<()> {
        let query: OrderListingQuery = serde_json::from_value(json!({
            "status": "paid",
            "customerId": "user_7",
            "pageSize": 25,
        }))?;
        let expected = QueryShape::builder("orders")
            .filter("userId", FilterOperator::Eq, "user_7")
            .filter("status", FilterOperator::Eq, "paid")
            .order_by("createdAt", OrderDirection::Desc)
            .page_size(25)
            .build()?;
        assert_eq!(query.into_request()?, SessionRequest::List(expected));
        Ok(())
    }

    #[test]
    fn test_order_id_selects_single_document_mode() -> anyhow::Result<()> {
        let query = OrderListingQuery {
            order_id: Some("order_42".to_owned()),
            status: Some("paid".to_owned()),
            ..Default::default()
        };
        let SessionRequest::SingleDocument { collection, id } = query.into_request()? else {
            anyhow::bail!("expected single document mode");
        };
        assert_eq!(collection.as_str(), "orders");
        assert_eq!(id.as_str(), "order_42");
        Ok(())
    }

    #[test]
    fn test_zero_page_size_is_rejected() {
        let query = OrderListingQuery {
            page_size: Some(0),
            ..Default::default()
        };
        let err = query.into_request().unwrap_err();
        assert_eq!(err.short_msg(), "InvalidPageSize");
    }
}
