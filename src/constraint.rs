//! Typed predicate builders
//!
//! A [`Constraint`] binds one [`Specifier`] and accumulates predicate terms.
//! Terms are stored unrendered; rendering against a [`Dialect`] is pure and
//! produces either a SQL boolean expression or a document filter. All terms
//! of a constraint are joined with AND.

use crate::dialect::{document_field, Dialect};
use crate::model::Entity;
use crate::specifier::Specifier;
use crate::value::{Field, Numeric, Temporal, Value};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::marker::PhantomData;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    pub fn sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }

    pub fn mongo(&self) -> &'static str {
        match self {
            Op::Eq => "$eq",
            Op::Ne => "$ne",
            Op::Lt => "$lt",
            Op::Le => "$lte",
            Op::Gt => "$gt",
            Op::Ge => "$gte",
        }
    }

    pub fn from_mongo(op: &str) -> Option<Op> {
        match op {
            "$eq" => Some(Op::Eq),
            "$ne" => Some(Op::Ne),
            "$lt" => Some(Op::Lt),
            "$lte" => Some(Op::Le),
            "$gt" => Some(Op::Gt),
            "$gte" => Some(Op::Ge),
            _ => None,
        }
    }

    /// Whether `left op right` holds given `left.cmp(right)`
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Op::Eq => ordering == Ordering::Equal,
            Op::Ne => ordering != Ordering::Equal,
            Op::Lt => ordering == Ordering::Less,
            Op::Le => ordering != Ordering::Greater,
            Op::Gt => ordering == Ordering::Greater,
            Op::Ge => ordering != Ordering::Less,
        }
    }
}

/// Rendered predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Sql(String),
    Document(serde_json::Value),
}

impl Fragment {
    pub fn as_sql(&self) -> Option<&str> {
        match self {
            Fragment::Sql(sql) => Some(sql),
            Fragment::Document(_) => None,
        }
    }

    pub fn as_document(&self) -> Option<&serde_json::Value> {
        match self {
            Fragment::Document(doc) => Some(doc),
            Fragment::Sql(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Term {
    Null,
    NotNull,
    Compare(Op, Value),
    OneOf(Vec<Value>),
    Contains(String),
    Empty,
    NotEmpty,
    Regex(String),
    Length(Op, i64),
    ListSize(Op, i64),
    ListContains(String),
}

/// Predicate on one property of `E` with value type `T`
#[derive(Debug, Clone)]
pub struct Constraint<E, T> {
    specifier: Specifier<E, T>,
    terms: Vec<Term>,
}

impl<E: Entity, T: Field> Constraint<E, T> {
    pub fn new(specifier: Specifier<E, T>) -> Self {
        Self { specifier, terms: Vec::new() }
    }

    pub fn specifier(&self) -> &Specifier<E, T> {
        &self.specifier
    }

    /// Number of accumulated terms
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_unconstrained(&self) -> bool {
        self.terms.is_empty()
    }

    fn push(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    pub fn is(self, value: T) -> Self {
        self.push(Term::Compare(Op::Eq, value.to_value()))
    }

    pub fn is_not(self, value: T) -> Self {
        self.push(Term::Compare(Op::Ne, value.to_value()))
    }

    pub fn is_null(self) -> Self {
        self.push(Term::Null)
    }

    pub fn is_not_null(self) -> Self {
        self.push(Term::NotNull)
    }

    pub fn one_of(self, values: impl IntoIterator<Item = T>) -> Self {
        let values = values.into_iter().map(|v| v.to_value()).collect();
        self.push(Term::OneOf(values))
    }

    pub fn render(&self, dialect: Dialect) -> Result<Fragment> {
        render(dialect, self.specifier.name(), &self.terms)
    }
}

impl<E: Entity, T: Numeric> Constraint<E, T> {
    pub fn is_less_than(self, value: T) -> Self {
        self.push(Term::Compare(Op::Lt, value.to_value()))
    }

    pub fn is_less_than_or_equal(self, value: T) -> Self {
        self.push(Term::Compare(Op::Le, value.to_value()))
    }

    pub fn is_greater_than(self, value: T) -> Self {
        self.push(Term::Compare(Op::Gt, value.to_value()))
    }

    pub fn is_greater_than_or_equal(self, value: T) -> Self {
        self.push(Term::Compare(Op::Ge, value.to_value()))
    }
}

impl<E: Entity> Constraint<E, String> {
    /// Substring match
    pub fn contains(self, needle: impl Into<String>) -> Self {
        self.push(Term::Contains(needle.into()))
    }

    pub fn regex(self, pattern: impl Into<String>) -> Self {
        self.push(Term::Regex(pattern.into()))
    }

    pub fn is_empty(self) -> Self {
        self.push(Term::Empty)
    }

    pub fn is_not_empty(self) -> Self {
        self.push(Term::NotEmpty)
    }

    pub fn has_length(self, length: i64) -> Self {
        self.push(Term::Length(Op::Eq, length))
    }

    pub fn is_shorter_than(self, length: i64) -> Self {
        self.push(Term::Length(Op::Lt, length))
    }

    pub fn is_or_shorter_than(self, length: i64) -> Self {
        self.push(Term::Length(Op::Le, length))
    }

    pub fn is_longer_than(self, length: i64) -> Self {
        self.push(Term::Length(Op::Gt, length))
    }

    pub fn is_or_longer_than(self, length: i64) -> Self {
        self.push(Term::Length(Op::Ge, length))
    }
}

impl<E: Entity, T: Temporal> Constraint<E, T> {
    pub fn is_before(self, value: T) -> Self {
        self.push(Term::Compare(Op::Lt, value.to_value()))
    }

    pub fn is_before_or_same(self, value: T) -> Self {
        self.push(Term::Compare(Op::Le, value.to_value()))
    }

    pub fn is_after(self, value: T) -> Self {
        self.push(Term::Compare(Op::Gt, value.to_value()))
    }

    pub fn is_after_or_same(self, value: T) -> Self {
        self.push(Term::Compare(Op::Ge, value.to_value()))
    }
}

impl<E: Entity> Constraint<E, Vec<String>> {
    /// List has exactly `n` elements
    pub fn size(self, n: i64) -> Self {
        self.push(Term::ListSize(Op::Eq, n))
    }

    pub fn is_more_than(self, n: i64) -> Self {
        self.push(Term::ListSize(Op::Gt, n))
    }

    pub fn is_less_than(self, n: i64) -> Self {
        self.push(Term::ListSize(Op::Lt, n))
    }

    pub fn is_or_more_than(self, n: i64) -> Self {
        self.push(Term::ListSize(Op::Ge, n))
    }

    pub fn is_or_less_than(self, n: i64) -> Self {
        self.push(Term::ListSize(Op::Le, n))
    }

    pub fn contains(self, element: impl Into<String>) -> Self {
        self.push(Term::ListContains(element.into()))
    }
}

/// Constraint with its value type erased, so filters on different
/// properties can share one query
#[derive(Debug, Clone)]
pub struct Filter<E> {
    property: Cow<'static, str>,
    terms: Vec<Term>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Entity> Filter<E> {
    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn render(&self, dialect: Dialect) -> Result<Fragment> {
        E::model().require(&self.property)?;
        render(dialect, &self.property, &self.terms)
    }
}

impl<E: Entity, T: Field> From<Constraint<E, T>> for Filter<E> {
    fn from(constraint: Constraint<E, T>) -> Self {
        Self {
            property: Cow::Owned(constraint.specifier.name().to_string()),
            terms: constraint.terms,
            _marker: PhantomData,
        }
    }
}

fn render(dialect: Dialect, property: &str, terms: &[Term]) -> Result<Fragment> {
    if dialect.is_document() {
        let field = document_field(property);
        let mut docs = terms
            .iter()
            .map(|term| term_document(field, term))
            .collect::<Vec<_>>();
        let doc = match docs.len() {
            0 => json!({}),
            1 => docs.remove(0),
            _ => json!({ "$and": docs }),
        };
        return Ok(Fragment::Document(doc));
    }

    let column = dialect.column(property);
    let parts = terms
        .iter()
        .map(|term| term_sql(dialect, &column, term))
        .collect::<Result<Vec<_>>>()?;
    if parts.is_empty() {
        Ok(Fragment::Sql("1=1".to_string()))
    } else {
        Ok(Fragment::Sql(parts.join(" AND ")))
    }
}

pub(crate) fn compare_sql(dialect: Dialect, column: &str, op: Op, value: &Value) -> String {
    match (op, value) {
        (Op::Eq, Value::Null) => format!("{} IS NULL", column),
        (Op::Ne, Value::Null) => format!("{} IS NOT NULL", column),
        _ => format!("{} {} {}", column, op.sql(), dialect.literal(value)),
    }
}

fn term_sql(dialect: Dialect, column: &str, term: &Term) -> Result<String> {
    let sql = match term {
        Term::Null => format!("{} IS NULL", column),
        Term::NotNull => format!("{} IS NOT NULL", column),
        Term::Compare(op, value) => compare_sql(dialect, column, *op, value),
        Term::OneOf(values) if values.is_empty() => "1=0".to_string(),
        Term::OneOf(values) => format!(
            "{} IN ({})",
            column,
            values.iter().map(|v| dialect.literal(v)).collect::<Vec<_>>().join(", ")
        ),
        Term::Contains(needle) => format!(
            "{} LIKE {} ESCAPE {}",
            column,
            dialect.string_literal(&format!("%{}%", like_escape(needle))),
            dialect.string_literal("\\")
        ),
        Term::Empty => format!("{} = ''", column),
        Term::NotEmpty => format!("{} != ''", column),
        Term::Regex(pattern) => dialect
            .command_regex(column, pattern)
            .ok_or_else(|| Error::unsupported(dialect, "regex match"))?,
        Term::Length(op, n) => format!("{}({}) {} {}", dialect.length_function(), column, op.sql(), n),
        Term::ListSize(op, n) => {
            let length = dialect
                .command_list_length(column)
                .ok_or_else(|| Error::unsupported(dialect, "list length predicates"))?;
            format!("{} {} {}", length, op.sql(), n)
        }
        Term::ListContains(element) => dialect
            .command_list_contains(column, element)
            .ok_or_else(|| Error::unsupported(dialect, "list contains predicates"))?,
    };
    Ok(sql)
}

/// Escape LIKE wildcards so the needle matches literally under `ESCAPE '\'`
fn like_escape(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn field_document(field: &str, condition: serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(field.to_string(), condition);
    serde_json::Value::Object(map)
}

fn op_document(op: Op, operand: serde_json::Value) -> serde_json::Value {
    field_document(op.mongo(), operand)
}

/// `{$expr: {<op>: [{<function>: "$field"}, n]}}`
fn expr_document(function: &str, field: &str, op: Op, n: i64) -> serde_json::Value {
    let measured = field_document(function, json!(format!("${}", field)));
    json!({ "$expr": op_document(op, json!([measured, n])) })
}

fn term_document(field: &str, term: &Term) -> serde_json::Value {
    match term {
        Term::Null => field_document(field, json!({ "$eq": null })),
        Term::NotNull => field_document(field, json!({ "$ne": null })),
        Term::Compare(op, value) => field_document(field, op_document(*op, value.to_json())),
        Term::OneOf(values) => field_document(
            field,
            json!({ "$in": values.iter().map(Value::to_json).collect::<Vec<_>>() }),
        ),
        Term::Contains(needle) => {
            field_document(field, json!({ "$regex": regex::escape(needle) }))
        }
        Term::Empty => field_document(field, json!({ "$eq": "" })),
        Term::NotEmpty => field_document(field, json!({ "$ne": "" })),
        Term::Regex(pattern) => field_document(field, json!({ "$regex": pattern })),
        Term::Length(op, n) => expr_document("$strLenCP", field, *op, *n),
        Term::ListSize(Op::Eq, n) => field_document(field, json!({ "$size": n })),
        Term::ListSize(op, n) => expr_document("$size", field, *op, *n),
        // equality against an array field matches any element
        Term::ListContains(element) => field_document(field, json!({ "$eq": element })),
    }
}
