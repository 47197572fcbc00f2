//! In-process document engine for `mongodb:mem:` URLs
//!
//! Evaluates the same filter documents the Mongo dialect renders:
//! `$eq $ne $lt $lte $gt $gte $in $nin $exists $regex $size $not` on fields,
//! `$and $or $nor` at the top level, and `$expr` with `$strLenCP` / `$size`.

use super::{Connection, Document, DocumentConnection, Driver};
use crate::constraint::Op;
use crate::dialect::Dialect;
use crate::{Error, Result};
use regex::Regex;
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

pub struct MemoryDocumentDriver;

impl Driver for MemoryDocumentDriver {
    fn name(&self) -> &'static str {
        "memory-documents"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Mongo
    }

    fn accepts(&self, url: &str) -> bool {
        url.starts_with("mongodb:mem:")
    }

    fn connect(&self, _url: &str) -> Result<Connection> {
        Ok(Connection::Document(Box::new(MemoryDocumentStore::default())))
    }
}

/// Collections of documents keyed by identity
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: HashMap<String, BTreeMap<i64, Document>>,
}

impl MemoryDocumentStore {
    fn matching<'a>(
        &'a self,
        collection: &str,
        filter: &Json,
    ) -> Result<Vec<(&'a i64, &'a Document)>> {
        let mut out = Vec::new();
        if let Some(docs) = self.collections.get(collection) {
            for (id, doc) in docs {
                if matches(doc, filter)? {
                    out.push((id, doc));
                }
            }
        }
        Ok(out)
    }
}

impl DocumentConnection for MemoryDocumentStore {
    fn replace(&mut self, collection: &str, id: i64, mut document: Document) -> Result<()> {
        document.insert("_id".to_string(), Json::from(id));
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, document);
        Ok(())
    }

    fn find(
        &mut self,
        collection: &str,
        filter: &Json,
        sort: &[(String, bool)],
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let mut docs = self
            .matching(collection, filter)?
            .into_iter()
            .map(|(_, doc)| doc.clone())
            .collect::<Vec<_>>();

        docs.sort_by(|a, b| {
            for (field, ascending) in sort {
                let ordering = order_values(a.get(field), b.get(field));
                if ordering != Ordering::Equal {
                    return if *ascending { ordering } else { ordering.reverse() };
                }
            }
            Ordering::Equal
        });

        let docs = docs.into_iter().skip(skip);
        Ok(match limit {
            Some(n) => docs.take(n).collect(),
            None => docs.collect(),
        })
    }

    fn update_fields(&mut self, collection: &str, id: i64, fields: Document) -> Result<bool> {
        let Some(doc) = self.collections.get_mut(collection).and_then(|c| c.get_mut(&id)) else {
            return Ok(false);
        };
        doc.extend(fields);
        Ok(true)
    }

    fn delete(&mut self, collection: &str, filter: &Json) -> Result<usize> {
        let ids = self
            .matching(collection, filter)?
            .into_iter()
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        if let Some(docs) = self.collections.get_mut(collection) {
            for id in &ids {
                docs.remove(id);
            }
        }
        Ok(ids.len())
    }

    fn count(&mut self, collection: &str, filter: &Json) -> Result<usize> {
        Ok(self.matching(collection, filter)?.len())
    }
}

fn unsupported(what: &str) -> Error {
    Error::Backend(format!("unsupported filter operator {}", what))
}

fn as_array(value: &Json) -> Result<&Vec<Json>> {
    value
        .as_array()
        .ok_or_else(|| Error::Backend(format!("expected an array, got {}", value)))
}

/// Whether a document satisfies a filter document
pub fn matches(doc: &Document, filter: &Json) -> Result<bool> {
    let clauses = filter
        .as_object()
        .ok_or_else(|| Error::Backend(format!("filter must be an object, got {}", filter)))?;

    for (key, condition) in clauses {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in as_array(condition)? {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => any_match(doc, condition)?,
            "$nor" => !any_match(doc, condition)?,
            "$expr" => eval_expr(doc, condition)?,
            op if op.starts_with('$') => return Err(unsupported(op)),
            field => field_matches(doc.get(field), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_match(doc: &Document, condition: &Json) -> Result<bool> {
    for sub in as_array(condition)? {
        if matches(doc, sub)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_object(condition: &Json) -> bool {
    condition
        .as_object()
        .is_some_and(|ops| !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')))
}

fn field_matches(value: Option<&Json>, condition: &Json) -> Result<bool> {
    if !is_operator_object(condition) {
        return Ok(equals(value, condition));
    }
    let Some(ops) = condition.as_object() else {
        return Ok(false);
    };

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$in" => as_array(operand)?.iter().any(|o| equals(value, o)),
            "$nin" => !as_array(operand)?.iter().any(|o| equals(value, o)),
            "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| Error::Backend("$regex needs a string".into()))?;
                let re = Regex::new(pattern).map_err(|e| Error::Backend(e.to_string()))?;
                value.and_then(Json::as_str).is_some_and(|s| re.is_match(s))
            }
            "$size" => {
                let len = value.and_then(Json::as_array).map(|a| a.len() as u64);
                len.is_some() && len == operand.as_u64()
            }
            "$not" => !field_matches(value, operand)?,
            "$eq" => equals(value, operand),
            "$ne" => !equals(value, operand),
            other => match Op::from_mongo(other) {
                Some(cmp) => value
                    .and_then(|v| compare(v, operand))
                    .is_some_and(|ordering| cmp.holds(ordering)),
                None => return Err(unsupported(other)),
            },
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with array-contains semantics for scalar operands
fn equals(value: Option<&Json>, operand: &Json) -> bool {
    match (value, operand) {
        (None, Json::Null) | (Some(Json::Null), Json::Null) => true,
        (None, _) => false,
        (Some(Json::Array(items)), scalar) if !scalar.is_array() => {
            items.iter().any(|item| same(item, scalar))
        }
        (Some(v), o) => same(v, o),
    }
}

fn same(a: &Json, b: &Json) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Json, b: &Json) -> Option<Ordering> {
    match (a, b) {
        (Json::Number(_), Json::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        (Json::Bool(x), Json::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Sort order; missing and null sort first
fn order_values(a: Option<&Json>, b: Option<&Json>) -> Ordering {
    let rank = |v: Option<&Json>| match v {
        None | Some(Json::Null) => 0,
        Some(_) => 1,
    };
    match (a, b) {
        (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// `$expr` support: `{<cmp>: [operand, operand]}`
fn eval_expr(doc: &Document, expr: &Json) -> Result<bool> {
    let ops = expr
        .as_object()
        .ok_or_else(|| Error::Backend(format!("$expr must be an object, got {}", expr)))?;
    for (op, operands) in ops {
        let cmp = Op::from_mongo(op).ok_or_else(|| unsupported(op))?;
        let operands = as_array(operands)?;
        let [left, right] = operands.as_slice() else {
            return Err(Error::Backend(format!("{} takes two operands", op)));
        };
        let left = eval_operand(doc, left)?;
        let right = eval_operand(doc, right)?;
        let ok = match (left, right) {
            (Some(l), Some(r)) => compare(&l, &r).is_some_and(|o| cmp.holds(o)),
            _ => false,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_operand(doc: &Document, operand: &Json) -> Result<Option<Json>> {
    match operand {
        Json::String(s) if s.starts_with('$') => Ok(doc.get(&s[1..]).cloned()),
        Json::Object(map) if map.len() == 1 => {
            let Some((function, argument)) = map.iter().next() else {
                return Ok(None);
            };
            let argument = eval_operand(doc, argument)?;
            match function.as_str() {
                "$strLenCP" => Ok(argument
                    .as_ref()
                    .and_then(Json::as_str)
                    .map(|s| Json::from(s.chars().count()))),
                "$size" => Ok(argument
                    .as_ref()
                    .and_then(Json::as_array)
                    .map(|a| Json::from(a.len()))),
                other => Err(unsupported(other)),
            }
        }
        literal => Ok(Some(literal.clone())),
    }
}
