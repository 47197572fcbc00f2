//! Boolean expression trees over named properties
//!
//! Produced by predicate translators outside this crate. Unlike constraints,
//! a tree may contain OR and NOT; it always renders to one fragment.

use crate::constraint::{compare_sql, Fragment, Op};
use crate::dialect::{document_field, Dialect};
use crate::model::Entity;
use crate::value::Value;
use crate::Result;
use serde_json::json;

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Compare { property: String, op: Op, literal: Value },
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
}

impl Expression {
    pub fn compare(property: impl Into<String>, op: Op, literal: impl Into<Value>) -> Self {
        Expression::Compare { property: property.into(), op, literal: literal.into() }
    }

    pub fn and(self, other: Expression) -> Self {
        match self {
            Expression::And(mut terms) => {
                terms.push(other);
                Expression::And(terms)
            }
            first => Expression::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Expression) -> Self {
        match self {
            Expression::Or(mut terms) => {
                terms.push(other);
                Expression::Or(terms)
            }
            first => Expression::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expression::Not(Box::new(self))
    }

    /// Every property the tree references
    pub fn properties(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_properties(&mut out);
        out
    }

    fn collect_properties<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::Compare { property, .. } => out.push(property),
            Expression::And(terms) | Expression::Or(terms) => {
                terms.iter().for_each(|t| t.collect_properties(out))
            }
            Expression::Not(inner) => inner.collect_properties(out),
        }
    }

    /// Render for entity `E`, rejecting properties `E` does not declare
    pub fn render<E: Entity>(&self, dialect: Dialect) -> Result<Fragment> {
        let model = E::model();
        for property in self.properties() {
            if property != crate::model::ID_COLUMN {
                model.require(property)?;
            }
        }
        if dialect.is_document() {
            Ok(Fragment::Document(self.document()))
        } else {
            Ok(Fragment::Sql(self.sql(dialect)))
        }
    }

    fn sql(&self, dialect: Dialect) -> String {
        match self {
            Expression::Compare { property, op, literal } => {
                compare_sql(dialect, &dialect.column(property), *op, literal)
            }
            Expression::And(terms) => join_sql(dialect, terms, " AND ", "1=1"),
            Expression::Or(terms) => join_sql(dialect, terms, " OR ", "1=0"),
            Expression::Not(inner) => format!("NOT ({})", inner.sql(dialect)),
        }
    }

    fn document(&self) -> serde_json::Value {
        match self {
            Expression::Compare { property, op, literal } => {
                let mut condition = serde_json::Map::new();
                condition.insert(op.mongo().to_string(), literal.to_json());
                let mut doc = serde_json::Map::new();
                doc.insert(document_field(property).to_string(), serde_json::Value::Object(condition));
                serde_json::Value::Object(doc)
            }
            Expression::And(terms) => {
                json!({ "$and": terms.iter().map(Expression::document).collect::<Vec<_>>() })
            }
            Expression::Or(terms) => {
                json!({ "$or": terms.iter().map(Expression::document).collect::<Vec<_>>() })
            }
            // top-level negation in a filter document is $nor
            Expression::Not(inner) => json!({ "$nor": [inner.document()] }),
        }
    }
}

fn join_sql(dialect: Dialect, terms: &[Expression], separator: &str, empty: &str) -> String {
    if terms.is_empty() {
        return empty.to_string();
    }
    let parts = terms.iter().map(|t| t.sql(dialect)).collect::<Vec<_>>();
    format!("({})", parts.join(separator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::Person;
    use crate::Error;

    fn young_or_named_ada() -> Expression {
        Expression::compare("age", Op::Lt, 20).or(Expression::compare("name", Op::Eq, "ada"))
    }

    #[test]
    fn test_sql_rendering_allows_or() {
        let expr = young_or_named_ada().and(Expression::compare("age", Op::Ne, 5).not());
        let fragment = expr.render::<Person>(Dialect::Sqlite).unwrap();
        assert_eq!(
            fragment.as_sql().unwrap(),
            "((`age` < 20 OR `name` = 'ada') AND NOT (`age` != 5))"
        );
    }

    #[test]
    fn test_document_rendering() {
        let fragment = young_or_named_ada().render::<Person>(Dialect::Mongo).unwrap();
        assert_eq!(
            fragment.as_document().unwrap(),
            &json!({ "$or": [{ "age": { "$lt": 20 } }, { "name": { "$eq": "ada" } }] })
        );
    }

    #[test]
    fn test_unknown_property_is_rejected() {
        let expr = Expression::compare("height", Op::Gt, 2);
        assert!(matches!(expr.render::<Person>(Dialect::H2), Err(Error::UnknownProperty { .. })));
    }

    #[test]
    fn test_identity_may_be_referenced() {
        let expr = Expression::compare("id", Op::Eq, 3i64);
        assert_eq!(expr.render::<Person>(Dialect::Mongo).unwrap().as_document().unwrap(), &json!({ "_id": { "$eq": 3 } }));
    }
}
