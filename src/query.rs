//! Query descriptions: filters, ordering, paging and aggregate options

use crate::constraint::{Filter, Fragment};
use crate::dialect::{document_field, Dialect};
use crate::expression::Expression;
use crate::model::{Entity, ID_COLUMN};
use crate::specifier::Specifier;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn sql(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub property: String,
    pub direction: Direction,
}

/// Filters, sort and paging for one `find_by` call.
///
/// Filters and expressions are AND-joined. Without an explicit order, rows
/// come back by ascending identity, which is insertion order.
#[derive(Debug, Clone)]
pub struct Query<E> {
    filters: Vec<Filter<E>>,
    expressions: Vec<Expression>,
    order: Vec<Order>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl<E> Default for Query<E> {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            expressions: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

impl<E: Entity> Query<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, constraint: impl Into<Filter<E>>) -> Self {
        self.filters.push(constraint.into());
        self
    }

    pub fn matching(mut self, expression: Expression) -> Self {
        self.expressions.push(expression);
        self
    }

    pub fn order_by<T>(mut self, specifier: &Specifier<E, T>, direction: Direction) -> Self {
        self.order.push(Order { property: specifier.name().to_string(), direction });
        self
    }

    pub fn ascending<T>(self, specifier: &Specifier<E, T>) -> Self {
        self.order_by(specifier, Direction::Ascending)
    }

    pub fn descending<T>(self, specifier: &Specifier<E, T>) -> Self {
        self.order_by(specifier, Direction::Descending)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit_value(&self) -> Option<usize> {
        self.limit.filter(|n| *n > 0)
    }

    pub fn offset_value(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    fn fragments(&self, dialect: Dialect) -> Result<Vec<Fragment>> {
        let mut fragments = self
            .filters
            .iter()
            .map(|f| f.render(dialect))
            .collect::<Result<Vec<_>>>()?;
        for expression in &self.expressions {
            fragments.push(expression.render::<E>(dialect)?);
        }
        Ok(fragments)
    }

    /// ` WHERE ...` clause, or empty when unfiltered
    pub fn compile_where(&self, dialect: Dialect) -> Result<String> {
        let parts = self
            .fragments(dialect)?
            .into_iter()
            .filter_map(|f| match f {
                Fragment::Sql(sql) => Some(sql),
                Fragment::Document(_) => None,
            })
            .collect::<Vec<_>>();
        if parts.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!(" WHERE {}", parts.join(" AND ")))
        }
    }

    /// ` ORDER BY ...`, always ending with the identity column
    pub fn compile_order(&self, dialect: Dialect) -> Result<String> {
        let mut parts = Vec::new();
        for order in self.resolved_order()? {
            parts.push(format!("{} {}", dialect.column(&order.property), order.direction.sql()));
        }
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }

    /// Filter document for document stores
    pub fn compile_document(&self, dialect: Dialect) -> Result<serde_json::Value> {
        let mut docs = self
            .fragments(dialect)?
            .into_iter()
            .filter_map(|f| match f {
                Fragment::Document(doc) => Some(doc),
                Fragment::Sql(_) => None,
            })
            .collect::<Vec<_>>();
        Ok(match docs.len() {
            0 => serde_json::json!({}),
            1 => docs.remove(0),
            _ => serde_json::json!({ "$and": docs }),
        })
    }

    /// Sort keys for document stores: (field, ascending)
    pub fn document_sort(&self) -> Result<Vec<(String, bool)>> {
        Ok(self
            .resolved_order()?
            .into_iter()
            .map(|o| (document_field(&o.property).to_string(), o.direction == Direction::Ascending))
            .collect())
    }

    fn resolved_order(&self) -> Result<Vec<Order>> {
        let model = E::model();
        let mut order = Vec::with_capacity(self.order.len() + 1);
        for o in &self.order {
            if o.property != ID_COLUMN {
                model.require(&o.property)?;
            }
            order.push(o.clone());
        }
        if !order.iter().any(|o| o.property == ID_COLUMN) {
            order.push(Order { property: ID_COLUMN.to_string(), direction: Direction::Ascending });
        }
        Ok(order)
    }
}

/// Options for `average`.
///
/// `range(from, to)` turns the global average into a sliding window of rows
/// `from..=to` relative to the current row (negative is preceding), ordered by
/// `order_by` or identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvgOption {
    pub distinct: bool,
    pub range: Option<(i64, i64)>,
    pub order_by: Option<String>,
}

impl AvgOption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn range(mut self, from: i64, to: i64) -> Self {
        self.range = Some((from, to));
        self
    }

    pub fn order_by<E, T>(mut self, specifier: &Specifier<E, T>) -> Self {
        self.order_by = Some(specifier.name().to_string());
        self
    }

    /// `ROWS BETWEEN ... AND ...` frame for the configured range
    pub fn frame(&self) -> Result<Option<String>> {
        let Some((from, to)) = self.range else {
            return Ok(None);
        };
        if from > to {
            return Err(Error::MalformedConfiguration(format!(
                "average range start {} is after end {}",
                from, to
            )));
        }
        Ok(Some(format!("ROWS BETWEEN {} AND {}", frame_bound(from), frame_bound(to))))
    }
}

fn frame_bound(offset: i64) -> String {
    match offset {
        0 => "CURRENT ROW".to_string(),
        n if n < 0 => format!("{} PRECEDING", n.unsigned_abs()),
        n => format!("{} FOLLOWING", n),
    }
}
