//! Filters, sort keys and queries over JSON documents.
//!
//! Field paths are dotted (`"health.status"`). A missing field reads as
//! `null`, so `Filter::all().eq("x", Value::Null)` matches documents that
//! lack `x` entirely.

use std::cmp::Ordering;

use serde_json::Value;

/// Comparison operator used by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Field equals the value.
    Eq,
    /// Field differs from the value.
    Ne,
    /// Field is strictly less than the value.
    Lt,
    /// Field is less than or equal to the value.
    Lte,
    /// Field is strictly greater than the value.
    Gt,
    /// Field is greater than or equal to the value.
    Gte,
}

/// A single `field <op> value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Dotted path of the field to compare.
    pub field: String,
    /// Comparison operator.
    pub op: Comparison,
    /// Right-hand side of the comparison.
    pub value: Value,
}

impl Condition {
    fn matches(&self, document: &Value) -> bool {
        let left = field(document, &self.field).unwrap_or(&Value::Null);
        match self.op {
            Comparison::Eq => left == &self.value,
            Comparison::Ne => left != &self.value,
            Comparison::Lt => compare(left, &self.value) == Some(Ordering::Less),
            Comparison::Lte => matches!(
                compare(left, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Comparison::Gt => compare(left, &self.value) == Some(Ordering::Greater),
            Comparison::Gte => matches!(
                compare(left, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// A conjunction of [`Condition`]s. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// A filter that matches every document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    fn with(mut self, field: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Require `field == value`.
    #[must_use]
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Comparison::Eq, value)
    }

    /// Require `field != value`.
    #[must_use]
    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Comparison::Ne, value)
    }

    /// Require `field < value`.
    #[must_use]
    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Comparison::Lt, value)
    }

    /// Require `field <= value`.
    #[must_use]
    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Comparison::Lte, value)
    }

    /// Require `field > value`.
    #[must_use]
    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Comparison::Gt, value)
    }

    /// Require `field >= value`.
    #[must_use]
    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Comparison::Gte, value)
    }

    /// The conditions making up this filter.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Whether `document` satisfies every condition.
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(document))
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// One key of a multi-key sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Dotted field path.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

/// A filter plus optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Documents must match this filter.
    pub filter: Filter,
    /// Sort keys, applied left to right.
    pub sort: Vec<SortKey>,
    /// Maximum number of documents returned.
    pub limit: Option<usize>,
}

impl Query {
    /// Build a query from a filter.
    #[must_use]
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Append a sort key.
    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            order,
        });
        self
    }

    /// Cap the number of returned documents.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filter, sort and truncate a set of candidate documents.
    ///
    /// The sort is stable, so documents with equal keys keep their
    /// insertion order.
    #[must_use]
    pub fn apply<'a, I>(&self, documents: I) -> Vec<Value>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut matched: Vec<Value> = documents
            .into_iter()
            .filter(|d| self.filter.matches(d))
            .cloned()
            .collect();

        if !self.sort.is_empty() {
            matched.sort_by(|a, b| {
                for key in &self.sort {
                    let left = field(a, &key.field).unwrap_or(&Value::Null);
                    let right = field(b, &key.field).unwrap_or(&Value::Null);
                    let ord = total_order(left, right);
                    let ord = match key.order {
                        SortOrder::Ascending => ord,
                        SortOrder::Descending => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Look up a dotted field path inside a document.
#[must_use]
pub fn field<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| current.get(segment))
}

/// Compare two values of the same JSON type. Mixed types are unordered.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used for sorting: values of different types order by type.
fn total_order(left: &Value, right: &Value) -> Ordering {
    compare(left, right).unwrap_or_else(|| type_rank(left).cmp(&type_rank(right)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_field_lookup() {
        let doc = json!({"health": {"status": "healthy"}});
        assert_eq!(field(&doc, "health.status"), Some(&json!("healthy")));
        assert_eq!(field(&doc, "health.missing"), None);
    }

    #[test]
    fn filter_conjunction() {
        let doc = json!({"enabled": true, "priority": 5, "name": "billing"});
        assert!(Filter::all().matches(&doc));
        assert!(Filter::all().eq("enabled", true).lt("priority", 10).matches(&doc));
        assert!(!Filter::all().eq("enabled", true).gt("priority", 10).matches(&doc));
        assert!(Filter::all().ne("name", "licensing").matches(&doc));
    }

    #[test]
    fn missing_field_reads_as_null() {
        let doc = json!({"name": "a"});
        assert!(Filter::all().eq("expires_at", Value::Null).matches(&doc));
        assert!(!Filter::all().lt("expires_at", 10).matches(&doc));
    }

    #[test]
    fn query_sorts_on_multiple_keys_and_limits() {
        let docs = vec![
            json!({"name": "c", "priority": 1, "created": 3}),
            json!({"name": "a", "priority": 2, "created": 1}),
            json!({"name": "b", "priority": 1, "created": 2}),
        ];
        let query = Query::new(Filter::all())
            .sort_by("priority", SortOrder::Ascending)
            .sort_by("created", SortOrder::Ascending)
            .limit(2);
        let names: Vec<_> = query
            .apply(&docs)
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn descending_sort() {
        let docs = vec![json!({"t": 1}), json!({"t": 3}), json!({"t": 2})];
        let sorted = Query::default().sort_by("t", SortOrder::Descending).apply(&docs);
        assert_eq!(sorted[0]["t"], 3);
        assert_eq!(sorted[2]["t"], 1);
    }
}
