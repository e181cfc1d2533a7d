use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::filter::{FilterExpression, FilterOp, OrderExpression, SortDirection, SortKey};
use crate::registry::{self, FilterStrategy};
use crate::schema::SchemaSnapshot;
use crate::settings::QuerySettings;

const RESERVED_PARAMS: [&str; 6] = ["search", "sort", "order", "page", "perPage", "trashed"];

/// A list request as the caller phrased it. Nothing here is trusted until `build_query`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowQuery {
    pub search: Option<String>,
    pub filters: BTreeMap<String, Value>,
    pub sort: Option<String>,
    pub order: Option<SortDirection>,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
    pub include_trashed: bool,
}

fn parse_param(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str(trimmed) {
            return parsed;
        }
    }
    Value::String(raw.to_string())
}

impl RowQuery {
    /// Reads query-string parameters. `price[from]=1&price[to]=5` becomes a range object and
    /// JSON arrays/objects are accepted verbatim.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let mut query = RowQuery {
            search: params.get("search").cloned(),
            sort: params.get("sort").cloned(),
            order: params.get("order").and_then(|o| SortDirection::from_str(o).ok()),
            page: params.get("page").and_then(|p| p.trim().parse().ok()),
            per_page: params.get("perPage").and_then(|p| p.trim().parse().ok()),
            include_trashed: params.get("trashed").is_some_and(|t| t.trim().eq_ignore_ascii_case("true")),
            ..RowQuery::default()
        };
        for (key, raw) in params.iter().filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str())) {
            match key.strip_suffix(']').and_then(|k| k.split_once('[')) {
                Some((field, bound)) => {
                    let entry = query.filters.entry(field.to_string()).or_insert_with(|| Value::Object(Default::default()));
                    if let Value::Object(bounds) = entry {
                        bounds.insert(bound.to_string(), parse_param(raw));
                    }
                }
                None => {
                    query.filters.insert(key.clone(), parse_param(raw));
                }
            }
        }
        query
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.insert(field.into(), value);
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(field.into());
        self.order = Some(direction);
        self
    }

    pub fn with_trashed(mut self) -> Self {
        self.include_trashed = true;
        self
    }

    pub fn paged(mut self, page: u64, per_page: u64) -> Self {
        self.page = Some(page);
        self.per_page = Some(per_page);
        self
    }
}

fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn filter_for(slug: &str, strategy: FilterStrategy, value: &Value) -> Option<FilterExpression> {
    let expr = match (strategy, value) {
        (FilterStrategy::None, _) | (_, Value::Null) => return None,
        (FilterStrategy::Text, Value::String(term)) if term.trim().is_empty() => return None,
        (FilterStrategy::Text, Value::String(term)) => FilterExpression::field(slug, FilterOp::contains(term.trim())),
        (FilterStrategy::Text, other) => FilterExpression::field(slug, FilterOp::contains(&other.to_string())),
        (FilterStrategy::Exact, Value::Array(items)) => FilterExpression::field(slug, FilterOp::In(items.clone())),
        (FilterStrategy::Exact, other) => FilterExpression::field(slug, FilterOp::Eq(other.clone())),
        (FilterStrategy::Reference, other) => FilterExpression::field(slug, FilterOp::In(as_list(other))),
        (FilterStrategy::Range, Value::Object(bounds)) => {
            let mut expr = FilterExpression::All;
            if let Some(from) = bounds.get("from").filter(|v| !v.is_null()) {
                expr = expr.and(FilterExpression::field(slug, FilterOp::Ge(from.clone())));
            }
            if let Some(to) = bounds.get("to").filter(|v| !v.is_null()) {
                expr = expr.and(FilterExpression::field(slug, FilterOp::Le(to.clone())));
            }
            if expr == FilterExpression::All {
                return None;
            }
            expr
        }
        (FilterStrategy::Range, Value::Array(items)) => FilterExpression::field(slug, FilterOp::In(items.clone())),
        (FilterStrategy::Range, other) => FilterExpression::field(slug, FilterOp::Eq(other.clone())),
    };
    Some(expr)
}

/// Translates a request into a predicate over declared, filterable attributes only.
pub fn build_query(query: &RowQuery, schema: &SchemaSnapshot) -> FilterExpression {
    let mut expr = FilterExpression::All;

    if let Some(term) = query.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let alternatives = schema
            .attributes
            .iter()
            .filter(|a| a.filterable && registry::spec(a.kind).text_like)
            .map(|a| FilterExpression::field(a.slug.clone(), FilterOp::contains(term)))
            .collect();
        expr = expr.and(FilterExpression::Or(alternatives));
    }

    for (key, value) in &query.filters {
        let Some(attr) = schema.attribute(key).filter(|a| a.filterable) else { continue };
        if let Some(condition) = filter_for(&attr.slug, registry::spec(attr.kind).filter, value) {
            expr = expr.and(condition);
        }
    }

    if !query.include_trashed {
        expr = expr.and(FilterExpression::Trashed(false));
    }
    expr
}

pub fn build_order(query: &RowQuery, schema: &SchemaSnapshot) -> OrderExpression {
    let key = match query.sort.as_deref().map(str::trim) {
        Some("createdAt") => Some(SortKey::CreatedAt),
        Some("updatedAt") => Some(SortKey::UpdatedAt),
        Some(slug) => schema.attribute(slug).filter(|a| registry::spec(a.kind).sortable).map(|a| SortKey::Field(a.slug.clone())),
        None => None,
    };
    match key {
        Some(key) => OrderExpression::by(key, query.order.unwrap_or_default()),
        None => OrderExpression::by(SortKey::CreatedAt, query.order.unwrap_or(SortDirection::Desc)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub per_page: u64,
}

impl PageRequest {
    pub fn from_query(query: &RowQuery, settings: &QuerySettings) -> Self {
        PageRequest {
            page: query.page.unwrap_or(1).max(1),
            per_page: query.per_page.unwrap_or(settings.default_per_page).clamp(1, settings.max_per_page.max(1)),
        }
    }

    fn offset(&self) -> usize {
        usize::try_from(self.page.saturating_sub(1).saturating_mul(self.per_page)).unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub last_page: u64,
    pub first_page: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

impl<T> Page<T> {
    /// Cuts one page out of an already ordered result.
    pub fn slice(items: Vec<T>, request: PageRequest) -> Self {
        let total = items.len() as u64;
        let last_page = total.div_ceil(request.per_page).max(1);
        let data = items.into_iter().skip(request.offset()).take(request.per_page as usize).collect();
        Page {
            data,
            meta: PageMeta { total, page: request.page, per_page: request.per_page, last_page, first_page: 1 },
        }
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        let data = self.data.into_iter().map(f).collect::<Result<Vec<_>, E>>()?;
        Ok(Page { data, meta: self.meta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldConfig, FieldKind};
    use crate::schema::{compile, tests::field};
    use serde_json::json;

    fn filterable() -> FieldConfig {
        FieldConfig { filterable: true, ..FieldConfig::default() }
    }

    fn schema() -> SchemaSnapshot {
        compile(&[
            field("f1", "name", FieldKind::ShortText, filterable()),
            field("f2", "notes", FieldKind::LongText, FieldConfig::default()),
            field("f3", "price", FieldKind::Number, filterable()),
            field("f4", "color", FieldKind::Dropdown, filterable()),
            field("f5", "maker", FieldKind::Relationship, FieldConfig { target_table: Some("t".into()), filterable: true, ..FieldConfig::default() }),
            field("f6", "photo", FieldKind::Attachment, filterable()),
        ])
    }

    #[test]
    fn undeclared_and_internal_keys_never_reach_the_predicate() {
        let query = RowQuery::default()
            .filter("name", json!("chair"))
            .filter("notes", json!("secret"))
            .filter("createdBy", json!("u1"))
            .filter("$where", json!("1 == 1"))
            .filter("photo", json!("a1"));
        let expr = build_query(&query, &schema());
        let declared: Vec<String> = schema().slugs();
        assert!(expr.field_keys().iter().all(|k| declared.contains(k)));
        assert_eq!(expr.field_keys().into_iter().collect::<Vec<_>>(), vec!["name".to_string()]);
    }

    #[test]
    fn whitespace_search_is_no_search() {
        let expr = build_query(&RowQuery::default().search("   "), &schema());
        assert_eq!(expr, FilterExpression::Trashed(false));
    }

    #[test]
    fn search_spans_filterable_text_fields_only() {
        let expr = build_query(&RowQuery::default().search(" Café "), &schema());
        let expected = FilterExpression::Or(vec![FilterExpression::field("name", FilterOp::contains("Café"))]).and(FilterExpression::Trashed(false));
        assert_eq!(expr, expected);
    }

    #[test]
    fn search_without_searchable_fields_matches_nothing() {
        let schema = compile(&[field("f3", "price", FieldKind::Number, filterable())]);
        let expr = build_query(&RowQuery::default().search("x").with_trashed(), &schema);
        assert_eq!(expr, FilterExpression::Or(vec![]));
    }

    #[test]
    fn strategies_shape_the_operator() {
        let query = RowQuery::default()
            .filter("price", json!({"from": 10, "to": 20}))
            .filter("color", json!(["red", "blue"]))
            .filter("maker", json!("m1"))
            .with_trashed();
        let expr = build_query(&query, &schema());
        let expected = FilterExpression::And(vec![
            FilterExpression::field("color", FilterOp::In(vec![json!("red"), json!("blue")])),
            FilterExpression::field("maker", FilterOp::In(vec![json!("m1")])),
            FilterExpression::field("price", FilterOp::Ge(json!(10))),
            FilterExpression::field("price", FilterOp::Le(json!(20))),
        ]);
        assert_eq!(expr, expected);
    }

    #[test]
    fn params_are_split_into_reserved_and_filters() {
        let params: HashMap<String, String> = [
            ("search", "chair"),
            ("page", "2"),
            ("perPage", "5"),
            ("order", "desc"),
            ("trashed", "true"),
            ("price[from]", "10"),
            ("color", "[\"red\"]"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let query = RowQuery::from_params(&params);
        assert_eq!(query.search.as_deref(), Some("chair"));
        assert_eq!((query.page, query.per_page), (Some(2), Some(5)));
        assert_eq!(query.order, Some(SortDirection::Desc));
        assert!(query.include_trashed);
        assert_eq!(query.filters["price"], json!({"from": "10"}));
        assert_eq!(query.filters["color"], json!(["red"]));
    }

    #[test]
    fn order_falls_back_to_newest_first() {
        let schema = schema();
        assert_eq!(build_order(&RowQuery::default(), &schema), OrderExpression::default());
        let unsortable = RowQuery { sort: Some("notes".into()), ..RowQuery::default() };
        assert_eq!(build_order(&unsortable, &schema), OrderExpression::default());
        let by_price = RowQuery::default().sorted_by("price", SortDirection::Asc);
        assert_eq!(build_order(&by_price, &schema), OrderExpression::by(SortKey::Field("price".into()), SortDirection::Asc));
    }

    #[test]
    fn pages_are_clamped_and_sliced() {
        let settings = QuerySettings { default_per_page: 2, max_per_page: 3 };
        let request = PageRequest::from_query(&RowQuery::default().paged(0, 50), &settings);
        assert_eq!(request, PageRequest { page: 1, per_page: 3 });

        let page = Page::slice((1..=7).collect::<Vec<u32>>(), PageRequest { page: 3, per_page: 3 });
        assert_eq!(page.data, vec![7]);
        assert_eq!(page.meta, PageMeta { total: 7, page: 3, per_page: 3, last_page: 3, first_page: 1 });

        let empty = Page::slice(Vec::<u32>::new(), PageRequest { page: 1, per_page: 3 });
        assert_eq!(empty.meta.last_page, 1);

        let request = PageRequest::from_query(&RowQuery::default().paged(u64::MAX, 3), &settings);
        let beyond = Page::slice((1..=7).collect::<Vec<u32>>(), request);
        assert!(beyond.data.is_empty());
        assert_eq!(beyond.meta.page, u64::MAX);
        assert_eq!(beyond.meta.total, 7);
    }
}
