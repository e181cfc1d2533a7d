use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::str::FromStr;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::model::Row;

/// Case folding plus diacritic stripping, applied to both sides of a text match.
pub fn normalize_text(input: &str) -> String {
    input.nfkd().filter(|c| !is_combining_mark(*c)).collect::<String>().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "asc" | "ascending" | "1" => Ok(SortDirection::Asc),
            "desc" | "descending" | "-1" => Ok(SortDirection::Desc),
            _ => Err(format!("Invalid sort direction: {}", s)),
        }
    }
}

impl SortDirection {
    pub fn apply(self, ord: Ordering) -> Ordering {
        match self {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    In(Vec<Value>),
    /// Needle is stored already normalized.
    Contains(String),
}

impl FilterOp {
    pub fn contains(needle: &str) -> Self {
        FilterOp::Contains(normalize_text(needle))
    }

    /// Array attributes match when any element does; `Ne` requires that none is equal.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (FilterOp::Ne(_), Value::Array(items)) => items.iter().all(|item| self.matches_scalar(item)),
            (_, Value::Array(items)) => items.iter().any(|item| self.matches_scalar(item)),
            _ => self.matches_scalar(value),
        }
    }

    fn matches_scalar(&self, value: &Value) -> bool {
        match self {
            FilterOp::Eq(expected) => loose_eq(value, expected),
            FilterOp::Ne(expected) => !loose_eq(value, expected),
            FilterOp::Lt(expected) => compare_values(value, expected) == Some(Ordering::Less),
            FilterOp::Le(expected) => matches!(compare_values(value, expected), Some(Ordering::Less | Ordering::Equal)),
            FilterOp::Gt(expected) => compare_values(value, expected) == Some(Ordering::Greater),
            FilterOp::Ge(expected) => matches!(compare_values(value, expected), Some(Ordering::Greater | Ordering::Equal)),
            FilterOp::In(options) => options.iter().any(|option| loose_eq(value, option)),
            FilterOp::Contains(needle) => match value {
                Value::String(text) => normalize_text(text).contains(needle.as_str()),
                Value::Number(n) => n.to_string().contains(needle.as_str()),
                _ => false,
            },
        }
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

/// Equality that tolerates query-string typing: `"5"` equals `5`, `"true"` equals `true`.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => parse_number(s).is_some() && parse_number(s) == n.as_f64(),
        (Value::Bool(x), Value::String(s)) | (Value::String(s), Value::Bool(x)) => s.trim().parse::<bool>().ok() == Some(*x),
        _ => a == b,
    }
}

pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Number(n), Value::String(s)) => n.as_f64()?.partial_cmp(&parse_number(s)?),
        (Value::String(s), Value::Number(n)) => parse_number(s)?.partial_cmp(&n.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Storage-native predicate over rows. Field names are attribute keys, never system attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterExpression {
    All,
    And(Vec<FilterExpression>),
    /// An empty `Or` matches nothing.
    Or(Vec<FilterExpression>),
    Field { field: String, op: FilterOp },
    Trashed(bool),
}

impl FilterExpression {
    pub fn field(field: impl Into<String>, op: FilterOp) -> Self {
        FilterExpression::Field { field: field.into(), op }
    }

    pub fn and(self, other: FilterExpression) -> Self {
        match (self, other) {
            (FilterExpression::All, other) | (other, FilterExpression::All) => other,
            (FilterExpression::And(mut left), FilterExpression::And(right)) => {
                left.extend(right);
                FilterExpression::And(left)
            }
            (FilterExpression::And(mut left), other) => {
                left.push(other);
                FilterExpression::And(left)
            }
            (left, right) => FilterExpression::And(vec![left, right]),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            FilterExpression::All => true,
            FilterExpression::And(parts) => parts.iter().all(|p| p.matches(row)),
            FilterExpression::Or(parts) => parts.iter().any(|p| p.matches(row)),
            FilterExpression::Field { field, op } => op.matches(row.attributes.get(field).unwrap_or(&Value::Null)),
            FilterExpression::Trashed(trashed) => row.trashed == *trashed,
        }
    }

    /// Every attribute key the expression reads.
    pub fn field_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys(&self, keys: &mut BTreeSet<String>) {
        match self {
            FilterExpression::And(parts) | FilterExpression::Or(parts) => parts.iter().for_each(|p| p.collect_keys(keys)),
            FilterExpression::Field { field, .. } => {
                keys.insert(field.clone());
            }
            FilterExpression::All | FilterExpression::Trashed(_) => {}
        }
    }

    pub fn constrains_trashed(&self) -> bool {
        match self {
            FilterExpression::Trashed(_) => true,
            FilterExpression::And(parts) => parts.iter().any(|p| p.constrains_trashed()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortKey {
    Field(String),
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderKey {
    pub key: SortKey,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderExpression {
    pub keys: Vec<OrderKey>,
}

impl Default for OrderExpression {
    fn default() -> Self {
        OrderExpression::by(SortKey::CreatedAt, SortDirection::Desc)
    }
}

impl OrderExpression {
    pub fn by(key: SortKey, direction: SortDirection) -> Self {
        OrderExpression { keys: vec![OrderKey { key, direction }] }
    }

    /// Ids are ULIDs, so the id tie-breaker keeps equal keys in creation order.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for order_key in &self.keys {
            let ord = match &order_key.key {
                SortKey::CreatedAt => order_key.direction.apply(a.created_at.cmp(&b.created_at)),
                SortKey::UpdatedAt => order_key.direction.apply(a.updated_at.cmp(&b.updated_at)),
                SortKey::Field(field) => compare_attribute(a.attributes.get(field), b.attributes.get(field), order_key.direction),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        let tie_direction = self.keys.first().map(|k| k.direction).unwrap_or_default();
        tie_direction.apply(a.id.cmp(&b.id))
    }

    pub fn sort(&self, rows: &mut [Row]) {
        rows.sort_by(|a, b| self.compare(a, b));
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Blank values sort last in both directions.
fn compare_attribute(a: Option<&Value>, b: Option<&Value>, direction: SortDirection) -> Ordering {
    match (is_blank(a), is_blank(b)) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let (a, b) = (a.unwrap_or(&Value::Null), b.unwrap_or(&Value::Null));
            let ord = match (a, b) {
                (Value::String(x), Value::String(y)) => normalize_text(x).cmp(&normalize_text(y)),
                _ => compare_values(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string())),
            };
            direction.apply(ord)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn row_with(attrs: Value) -> Row {
        let map: Map<String, Value> = serde_json::from_value(attrs).unwrap();
        Row::new(map, None)
    }

    #[test]
    fn contains_ignores_case_and_diacritics() {
        let op = FilterOp::contains("CAFE");
        assert!(op.matches(&json!("Le Café du coin")));
        assert!(!op.matches(&json!("tea house")));
    }

    #[test]
    fn scalar_ops_are_loosely_typed() {
        assert!(FilterOp::Eq(json!("5")).matches(&json!(5)));
        assert!(FilterOp::Gt(json!(3)).matches(&json!("4")));
        assert!(FilterOp::Eq(json!("true")).matches(&json!(true)));
        assert!(!FilterOp::Lt(json!("abc")).matches(&json!(1)));
    }

    #[test]
    fn array_attributes_match_any_element() {
        assert!(FilterOp::In(vec![json!("b"), json!("z")]).matches(&json!(["a", "b"])));
        assert!(FilterOp::Ne(json!("c")).matches(&json!(["a", "b"])));
        assert!(!FilterOp::Ne(json!("a")).matches(&json!(["a", "b"])));
    }

    #[test]
    fn empty_or_matches_nothing_and_empty_and_everything() {
        let row = row_with(json!({"name": "x"}));
        assert!(!FilterExpression::Or(vec![]).matches(&row));
        assert!(FilterExpression::And(vec![]).matches(&row));
    }

    #[test]
    fn and_flattens_and_collects_keys() {
        let expr = FilterExpression::All
            .and(FilterExpression::field("name", FilterOp::contains("x")))
            .and(FilterExpression::Trashed(false))
            .and(FilterExpression::Or(vec![FilterExpression::field("sku", FilterOp::Eq(json!("V1")))]));
        match &expr {
            FilterExpression::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(expr.field_keys().into_iter().collect::<Vec<_>>(), vec!["name".to_string(), "sku".to_string()]);
        assert!(expr.constrains_trashed());
    }

    #[test]
    fn order_puts_blanks_last_in_both_directions() {
        let mut rows = vec![row_with(json!({"n": 2})), row_with(json!({})), row_with(json!({"n": 10}))];
        OrderExpression::by(SortKey::Field("n".into()), SortDirection::Desc).sort(&mut rows);
        let got: Vec<Value> = rows.iter().map(|r| r.attributes.get("n").cloned().unwrap_or(Value::Null)).collect();
        assert_eq!(got, vec![json!(10), json!(2), Value::Null]);

        OrderExpression::by(SortKey::Field("n".into()), SortDirection::Asc).sort(&mut rows);
        let got: Vec<Value> = rows.iter().map(|r| r.attributes.get("n").cloned().unwrap_or(Value::Null)).collect();
        assert_eq!(got, vec![json!(2), json!(10), Value::Null]);
    }

    #[test]
    fn default_order_is_newest_first() {
        let first = row_with(json!({}));
        let second = row_with(json!({}));
        let mut rows = vec![first.clone(), second.clone()];
        OrderExpression::default().sort(&mut rows);
        assert_eq!(rows[0].id, second.id);
        assert_eq!(rows[1].id, first.id);
    }
}
