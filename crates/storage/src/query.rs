use std::cmp::Ordering;

use super::types::{FieldValue, StoredDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Equality-filtered, optionally ordered view over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filter: Option<FieldFilter>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filter: None,
            order_by: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.filter = Some(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn matches(&self, document: &StoredDocument) -> bool {
        if document.collection != self.collection {
            return false;
        }

        match &self.filter {
            Some(filter) => document.get(&filter.field) == Some(&filter.value),
            None => true,
        }
    }

    /// Filters and orders `documents`, which must be given in commit order.
    ///
    /// Ties on the order field keep commit order when ascending and reverse it
    /// when descending, so a descending list is exactly the ascending one flipped.
    pub fn apply(&self, documents: Vec<StoredDocument>) -> Vec<StoredDocument> {
        let mut selected = documents
            .into_iter()
            .filter(|document| self.matches(document))
            .collect::<Vec<_>>();

        let Some(order_by) = &self.order_by else {
            return selected;
        };

        match order_by.direction {
            Direction::Ascending => {
                selected.sort_by(|left, right| compare_field(left, right, &order_by.field));
            }
            Direction::Descending => {
                selected.reverse();
                selected.sort_by(|left, right| compare_field(right, left, &order_by.field));
            }
        }

        selected
    }
}

// Documents without the field sort first, ahead of any present value.
fn compare_field(left: &StoredDocument, right: &StoredDocument, field: &str) -> Ordering {
    match (left.get(field), right.get(field)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => left.total_order(right),
    }
}
