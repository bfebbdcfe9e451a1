//! Query shapes: the immutable description of one paginated listing.
//!
//! A shape binds a collection, a set of filters, an ordering and a page size.
//! Cursors obtained under one shape are never valid under another, so sessions
//! compare shapes to decide when their cursor chain must be thrown away. That
//! comparison has to be structural and insensitive to the order in which the
//! caller happened to list its filters, which is why filters are normalized
//! when a shape is built.

use std::{
    cmp::Ordering,
    fmt,
    str::FromStr,
};

use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::knobs::PAGINATION_MAX_PAGE_SIZE;

/// Field path that addresses the document id rather than a stored field.
pub const DOCUMENT_ID_FIELD: &str = "_id";

/// Page size used when a shape is built without an explicit one.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Slash separated path to a collection, e.g. `products` or
/// `stores/42/listings`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl FromStr for CollectionPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if s.is_empty() || s.split('/').any(|segment| segment.trim().is_empty()) {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidCollectionPath",
                format!("Collection path {s:?} must be non-empty and contain no empty segments"),
            ));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for CollectionPath {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        s.parse()
    }
}

impl From<CollectionPath> for String {
    fn from(path: CollectionPath) -> Self {
        path.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dotted path to a (possibly nested) document field, e.g. `price` or
/// `shipping.country`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(String);

impl FieldPath {
    pub fn document_id() -> Self {
        Self(DOCUMENT_ID_FIELD.to_owned())
    }

    pub fn is_document_id(&self) -> bool {
        self.0 == DOCUMENT_ID_FIELD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl FromStr for FieldPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if s.is_empty() || s.split('.').any(|component| component.trim().is_empty()) {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidFieldPath",
                format!("Field path {s:?} must be non-empty and contain no empty components"),
            ));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for FieldPath {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        s.parse()
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    ArrayContains,
    ArrayContainsAny,
}

impl FilterOperator {
    /// Operators whose operand is a list of candidate values.
    pub fn takes_list(&self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        )
    }
}

/// A single `(field, operator, value)` constraint.
///
/// Equality and ordering are defined through [`compare_values`], so `1` and
/// `1.0` compare equal and list operands compare as sets once normalized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Filter {
    pub field: FieldPath,
    pub operator: FilterOperator,
    pub value: JsonValue,
}

impl Filter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: JsonValue) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    fn normalize(mut self) -> anyhow::Result<Self> {
        if self.operator.takes_list() {
            let JsonValue::Array(ref mut values) = self.value else {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "InvalidFilterValue",
                    format!(
                        "Filter {:?} on {} requires a list operand, got {}",
                        self.operator, self.field, self.value
                    ),
                ));
            };
            values.sort_by(compare_values);
            values.dedup_by(|a, b| compare_values(a, b).is_eq());
        }
        Ok(self)
    }
}

impl Ord for Filter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.field
            .cmp(&other.field)
            .then(self.operator.cmp(&other.operator))
            .then_with(|| compare_values(&self.value, &other.value))
    }
}

impl PartialOrd for Filter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for Filter {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    /// Turn an ascending comparison into one in this direction.
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            OrderDirection::Asc => ordering,
            OrderDirection::Desc => ordering.reverse(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Order {
    pub field: FieldPath,
    pub direction: OrderDirection,
}

impl Default for Order {
    fn default() -> Self {
        Self {
            field: FieldPath::document_id(),
            direction: OrderDirection::Asc,
        }
    }
}

/// The immutable tuple identifying one pagination session: collection,
/// filters, ordering and page size.
///
/// Shapes can only be created through [`QueryShape::builder`], which
/// validates and normalizes them, so derived equality is structural equality.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryShape {
    collection: CollectionPath,
    filters: Vec<Filter>,
    order: Order,
    page_size: usize,
}

impl QueryShape {
    pub fn builder(collection: impl Into<String>) -> QueryShapeBuilder {
        QueryShapeBuilder {
            collection: collection.into(),
            filters: vec![],
            order: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    /// Filters in normalized order.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn order(&self) -> &Order {
        &self.order
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages needed to show `total_items` documents.
    pub fn total_pages(&self, total_items: u64) -> u64 {
        total_items.div_ceil(self.page_size as u64)
    }
}

impl fmt::Display for QueryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.collection)?;
        for filter in &self.filters {
            write!(f, " where {} {:?} {}", filter.field, filter.operator, filter.value)?;
        }
        write!(
            f,
            " order by {} {:?} limit {}",
            self.order.field, self.order.direction, self.page_size
        )
    }
}

pub struct QueryShapeBuilder {
    collection: String,
    filters: Vec<(String, FilterOperator, JsonValue)>,
    order: Option<(String, OrderDirection)>,
    page_size: usize,
}

impl QueryShapeBuilder {
    pub fn filter(
        mut self,
        field: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<JsonValue>,
    ) -> Self {
        self.filters.push((field.into(), operator, value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.order = Some((field.into(), direction));
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn build(self) -> anyhow::Result<QueryShape> {
        let collection = self.collection.parse()?;
        if self.page_size == 0 {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidPageSize",
                "Page size must be at least 1",
            ));
        }
        let max_page_size = *PAGINATION_MAX_PAGE_SIZE;
        if self.page_size > max_page_size {
            anyhow::bail!(ErrorMetadata::pagination_limit(
                "PageSizeTooLarge",
                format!(
                    "Page size {} exceeds the maximum of {max_page_size}",
                    self.page_size
                ),
            ));
        }
        let order = match self.order {
            Some((field, direction)) => Order {
                field: field.parse()?,
                direction,
            },
            None => Order::default(),
        };
        let mut filters = self
            .filters
            .into_iter()
            .map(|(field, operator, value)| {
                Filter::new(field.parse()?, operator, value).normalize()
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        filters.sort();
        filters.dedup();
        Ok(QueryShape {
            collection,
            filters,
            order,
            page_size: self.page_size,
        })
    }
}

/// Compares by exact numeric value. Routing mixed integer/float pairs through
/// `f64` would round large integers and break transitivity.
fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    fn integer(n: &serde_json::Number) -> Option<i128> {
        n.as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
    }
    // JSON numbers are always finite, so `as_f64` only fails for integers.
    let float = |n: &serde_json::Number| n.as_f64().unwrap_or_default();
    match (integer(a), integer(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(a), None) => compare_integer_to_float(a, float(b)),
        (None, Some(b)) => compare_integer_to_float(b, float(a)).reverse(),
        (None, None) => float(a).partial_cmp(&float(b)).unwrap_or(Ordering::Equal),
    }
}

fn compare_integer_to_float(integer: i128, float: f64) -> Ordering {
    const I128_BOUND: f64 = 170141183460469231731687303715884105728.0; // 2^127
    let whole = float.trunc();
    if whole >= I128_BOUND {
        return Ordering::Less;
    }
    if whole < -I128_BOUND {
        return Ordering::Greater;
    }
    // In range and integral, so the cast is exact.
    integer.cmp(&(whole as i128)).then_with(|| {
        if float > whole {
            Ordering::Less
        } else if float < whole {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    })
}

/// Total order over JSON values used for filter normalization and by stores
/// that sort documents: null < bool < number < string < array < object.
/// Numbers compare by numeric value regardless of representation.
pub fn compare_values(a: &JsonValue, b: &JsonValue) -> Ordering {
    fn type_tag(v: &JsonValue) -> usize {
        match v {
            JsonValue::Null => 1,
            JsonValue::Bool(..) => 2,
            JsonValue::Number(..) => 3,
            JsonValue::String(..) => 4,
            JsonValue::Array(..) => 5,
            JsonValue::Object(..) => 6,
        }
    }
    let tag_cmp = type_tag(a).cmp(&type_tag(b));
    if !tag_cmp.is_eq() {
        return tag_cmp;
    }
    match (a, b) {
        (JsonValue::Null, JsonValue::Null) => Ordering::Equal,
        (JsonValue::Bool(a), JsonValue::Bool(b)) => a.cmp(b),
        (JsonValue::Number(a), JsonValue::Number(b)) => compare_numbers(a, b),
        (JsonValue::String(a), JsonValue::String(b)) => a.cmp(b),
        (JsonValue::Array(a), JsonValue::Array(b)) => {
            for (a, b) in a.iter().zip(b.iter()) {
                let ordering = compare_values(a, b);
                if !ordering.is_eq() {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        },
        (JsonValue::Object(a), JsonValue::Object(b)) => {
            let mut a: Vec<_> = a.iter().collect();
            let mut b: Vec<_> = b.iter().collect();
            a.sort_by(|x, y| x.0.cmp(y.0));
            b.sort_by(|x, y| x.0.cmp(y.0));
            for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
                let ordering = ak.cmp(bk).then_with(|| compare_values(av, bv));
                if !ordering.is_eq() {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        },
        _ => tag_cmp,
    }
}
