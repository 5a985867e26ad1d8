//! Predicate handling: compatibility checking, flattening of the where tree
//! into filter parameters, and static primary-key resolution.
//!
//! The api only understands a conjunction of per-column filters, so anything
//! with a disjunction or a negated conjunction is rejected up front rather
//! than silently returning wrong rows.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::{
    error::RestError,
    query::{Connector, Lookup, LookupOp, Query, Rhs, WhereNode, WherePart},
    schema::RestSchema,
    value::Pk,
};

use super::alias::AliasResolver;

/// Query-string parameters in insertion order. Repeated keys keep every
/// value.
pub type Params = IndexMap<String, Vec<String>>;

/// Outcome of the compatibility check for a query that is expressible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compat {
    Supported,
    /// the predicate contains a node that can never match, the query needs
    /// no request at all
    NoRows,
}

/// check that a query stays inside the supported algebra.
///
/// `tolerate_distinct` is set for queries whose duplicate elimination is
/// performed client side, such as static key resolution.
pub fn check_compatibility(query: &Query, tolerate_distinct: bool) -> Result<Compat, RestError> {
    if query.group_by {
        return Err(RestError::UnsupportedQuery("group by".to_owned()));
    }
    if query.distinct && !tolerate_distinct {
        return Err(RestError::UnsupportedQuery("distinct".to_owned()));
    }

    let mut compat = Compat::Supported;
    let mut stack: Vec<&WhereNode> = vec![&query.where_clause];
    while let Some(node) = stack.pop() {
        // a single child needs no connector, a conjunction is fine as long
        // as it is not negated as a whole
        let simple = node.children.len() <= 1
            || (node.connector == Connector::And && !node.negated);
        if !simple {
            let what = match node.connector {
                Connector::Or => "OR in queryset",
                Connector::And => "NOT (.. AND ..) in queryset",
            };
            return Err(RestError::UnsupportedQuery(what.to_owned()));
        }
        for child in &node.children {
            match child {
                WherePart::Node(inner) => stack.push(inner),
                WherePart::Leaf(lookup) => {
                    if !lookup.rhs.is_direct_value() {
                        return Err(RestError::UnsupportedQuery(
                            "nested queryset".to_owned(),
                        ));
                    }
                }
                WherePart::Nothing => compat = Compat::NoRows,
            }
        }
    }
    Ok(compat)
}

/// a `col = X AND col IS NOT NULL` pair produced for exact lookups on
/// nullable columns. it collapses back to the single exact comparison.
fn extract_exact_pair(node: &WhereNode) -> Option<&Lookup> {
    if node.children.len() != 2 {
        return None;
    }
    match (&node.children[0], &node.children[1]) {
        (WherePart::Leaf(exact), WherePart::Leaf(isnull))
            if exact.op == LookupOp::Exact
                && isnull.op == LookupOp::IsNull
                && exact.lhs == isnull.lhs =>
        {
            Some(exact)
        }
        _ => None,
    }
}

/// flatten the where tree into `(negated, lookup)` leaves.
pub fn flatten_where(node: &WhereNode) -> Vec<(bool, &Lookup)> {
    fn collect<'w>(node: &'w WhereNode, negated: bool, out: &mut Vec<(bool, &'w Lookup)>) {
        let negated = negated ^ node.negated;
        if let Some(exact) = extract_exact_pair(node) {
            out.push((negated, exact));
            return;
        }
        for child in &node.children {
            match child {
                WherePart::Node(inner) => collect(inner, negated, out),
                WherePart::Leaf(lookup) => out.push((negated, lookup)),
                WherePart::Nothing => {}
            }
        }
    }
    let mut out = Vec::new();
    collect(node, false, &mut out);
    out
}

fn render_value(value: &serde_json::Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// compile the where tree into `filter{...}` parameters.
///
/// `Ok(None)` means the predicate requires two different exact values for
/// the same column, so no row can ever match.
pub fn build_filter_params(
    resolver: &AliasResolver<'_>,
    query: &Query,
) -> Result<Option<Params>, RestError> {
    let mut params = Params::new();
    for (negated, lookup) in flatten_where(&query.where_clause) {
        let path = resolver.rest_path(&lookup.lhs)?;
        let key = if lookup.op == LookupOp::Exact {
            format!("filter{{{}{}}}", if negated { "-" } else { "" }, path)
        } else {
            format!(
                "filter{{{}{}.{}}}",
                if negated { "-" } else { "" },
                path,
                lookup.op
            )
        };
        let values: Vec<String> = match &lookup.rhs {
            Rhs::Value(value) => vec![render_value(value)],
            Rhs::Values(values) => values.iter().map(render_value).collect(),
            Rhs::Subquery => {
                return Err(RestError::UnsupportedQuery("nested queryset".to_owned()))
            }
        };
        let entry = params.entry(key).or_default();
        if lookup.op == LookupOp::Exact && !negated && !entry.is_empty() && *entry != values {
            // two different exact requirements on one column
            return Ok(None);
        }
        entry.extend(values);
    }
    Ok(Some(params))
}

/// true when any leaf of the predicate targets the root model's primary
/// key.
pub fn references_primary_key(
    resolver: &AliasResolver<'_>,
    query: &Query,
    schema: &RestSchema,
) -> Result<bool, RestError> {
    let model = schema.model(&query.model)?;
    let pk_storage = model.storage_name(&model.primary_key);
    for (_, lookup) in flatten_where(&query.where_clause) {
        let (alias, name) = resolver.resolve_path(&lookup.lhs)?;
        if alias.is_root() && name == pk_storage {
            return Ok(true);
        }
    }
    Ok(false)
}

/// try to resolve the exact set of primary keys the predicate selects,
/// without a request.
///
/// `Ok(None)` means the keys cannot be known statically. Only non-negated
/// exact, in and integer-range lookups on the root primary key qualify, and
/// the tree must use a single connector throughout.
pub fn resolve_primary_keys(
    resolver: &AliasResolver<'_>,
    query: &Query,
    schema: &RestSchema,
) -> Result<Option<BTreeSet<Pk>>, RestError> {
    let model = schema.model(&query.model)?;
    let pk_storage = model.storage_name(&model.primary_key).to_owned();

    let mut connector: Option<Connector> = None;
    let mut resolved: Option<BTreeSet<Pk>> = None;
    let mut stack: Vec<&WhereNode> = vec![&query.where_clause];
    while let Some(node) = stack.pop() {
        if node.negated {
            return Ok(None);
        }
        if node.children.len() > 1 {
            match connector {
                None => connector = Some(node.connector),
                Some(seen) if seen == node.connector => {}
                Some(_) => return Ok(None),
            }
        }
        for child in &node.children {
            let lookup = match child {
                WherePart::Node(inner) => {
                    stack.push(inner);
                    continue;
                }
                WherePart::Leaf(lookup) => lookup,
                WherePart::Nothing => return Ok(None),
            };
            let (alias, name) = resolver.resolve_path(&lookup.lhs)?;
            if !alias.is_root() || name != pk_storage {
                return Ok(None);
            }
            let keys = match (lookup.op, &lookup.rhs) {
                (LookupOp::Exact, Rhs::Value(value)) => match Pk::from_json(value) {
                    Some(pk) => BTreeSet::from([pk]),
                    None => return Ok(None),
                },
                (LookupOp::In, Rhs::Values(values)) => {
                    let mut keys = BTreeSet::new();
                    for value in values {
                        match Pk::from_json(value) {
                            Some(pk) => {
                                keys.insert(pk);
                            }
                            None => return Ok(None),
                        }
                    }
                    keys
                }
                (LookupOp::Range, Rhs::Values(bounds)) => match bounds.as_slice() {
                    [low, high] => match (low.as_i64(), high.as_i64()) {
                        (Some(low), Some(high)) => (low..=high).map(Pk::Int).collect(),
                        _ => return Ok(None),
                    },
                    _ => return Ok(None),
                },
                _ => return Ok(None),
            };
            resolved = Some(match (resolved, connector) {
                (None, _) => keys,
                (Some(acc), Some(Connector::Or)) => acc.union(&keys).cloned().collect(),
                (Some(acc), _) => acc.intersection(&keys).cloned().collect(),
            });
        }
    }
    match resolved {
        Some(keys) if !keys.is_empty() => Ok(Some(keys)),
        _ => Ok(None),
    }
}
