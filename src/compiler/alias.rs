//! Resolution of the join graph onto the target resource's attribute graph.
//!
//! The upstream builder enumerates joins in whatever order it visited them,
//! which does not respect parent-before-child. Resolution therefore runs as a
//! work queue with a failure counter: a node whose parent is not resolved yet
//! goes back to the other end of the queue, and the counter only trips when a
//! full pass produces no progress, which means the graph is truly
//! unresolvable.

use std::{cell::Cell, collections::HashMap, sync::Arc};

use indexmap::IndexMap;

use crate::{
    error::RestError,
    query::{ColumnRef, Query},
    schema::RestSchema,
};

/// One resolved node of the join graph.
///
/// Immutable once constructed. Identity is structural (same model, parent
/// chain and field), which makes aliases usable as map and set keys and makes
/// resolution independent of the input join order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alias {
    /// the model at this node
    pub model: String,
    /// the owning alias, None for the root resource
    pub parent: Option<Arc<Alias>>,
    /// the field on the parent model that reaches this node
    pub field: Option<String>,
    /// the attribute name this hop contributes to dotted paths
    pub attrname: Option<String>,
    /// when this alias stands for an auto-generated link table, the owning
    /// many-to-many field it collapses into
    pub m2m: Option<String>,
}

impl Alias {
    fn root(model: &str) -> Self {
        Alias {
            model: model.to_owned(),
            parent: None,
            field: None,
            attrname: None,
            m2m: None,
        }
    }

    pub const fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// the chain of ancestors of an alias, root first, ending with the alias
/// itself.
pub fn ancestors(alias: &Arc<Alias>) -> Vec<Arc<Alias>> {
    let mut res = vec![Arc::clone(alias)];
    let mut current = Arc::clone(alias);
    while let Some(parent) = current.parent.clone() {
        res.insert(0, Arc::clone(&parent));
        current = parent;
    }
    res
}

/// resolve the join graph of a query into a map from join alias to resolved
/// `Alias`, tolerating arbitrary input order.
pub fn resolve_aliases(
    query: &Query,
    schema: &RestSchema,
) -> Result<IndexMap<String, Arc<Alias>>, RestError> {
    let mut aliases: IndexMap<String, Arc<Alias>> = IndexMap::new();
    // for each link-table alias, the owning many-to-many field and the
    // pre-passthrough parent every hop through it gets redirected to
    let mut m2m_resolved: HashMap<String, (String, Arc<Alias>)> = HashMap::new();
    let mut queue: Vec<&crate::query::JoinEntry> = query.joins.iter().collect();
    let mut current_fail = 0usize;

    while current_fail <= queue.len() {
        let Some(entry) = queue.pop() else { break };
        let join = match &entry.parent {
            None => {
                // the base table
                aliases.insert(entry.alias.clone(), Arc::new(Alias::root(&query.model)));
                current_fail = 0;
                continue;
            }
            Some(join) => join,
        };
        let parent_alias = match aliases.get(&join.parent_alias) {
            Some(parent) => Arc::clone(parent),
            None => {
                // the parent is not resolved yet, retry after the rest
                queue.insert(0, entry);
                current_fail += 1;
                continue;
            }
        };

        let model = schema.model(&entry.model)?;
        let mut m2m_field = None;
        if model.link_table {
            let owning = schema.owning_many_to_many(model, &parent_alias.model)?;
            m2m_resolved.insert(entry.alias.clone(), (owning.clone(), Arc::clone(&parent_alias)));
            m2m_field = Some(owning);
        }

        // not a many-to-many hop itself, but possibly following one: hops
        // out of a collapsed link table get rewired onto the owning field
        let (field, parent) = match m2m_resolved.get(&join.parent_alias) {
            Some((field, parent)) => (field.clone(), Arc::clone(parent)),
            None => (join.field.clone(), parent_alias),
        };
        aliases.insert(
            entry.alias.clone(),
            Arc::new(Alias {
                model: entry.model.clone(),
                parent: Some(parent),
                field: Some(field.clone()),
                attrname: Some(field),
                m2m: m2m_field,
            }),
        );
        current_fail = 0;
    }

    if !queue.is_empty() {
        return Err(RestError::Resolution(
            queue.iter().map(|entry| entry.alias.clone()).collect(),
        ));
    }
    Ok(aliases)
}

/// Resolves column references against the alias map of one query.
///
/// Also records whether any prefetch-marker column was seen, so the request
/// compiler can emit the `filter_to_prefetch` hint.
pub struct AliasResolver<'q> {
    schema: &'q RestSchema,
    aliases: IndexMap<String, Arc<Alias>>,
    saw_prefetch: Cell<bool>,
}

impl<'q> AliasResolver<'q> {
    pub fn new(query: &'q Query, schema: &'q RestSchema) -> Result<Self, RestError> {
        Ok(AliasResolver {
            schema,
            aliases: resolve_aliases(query, schema)?,
            saw_prefetch: Cell::new(false),
        })
    }

    pub fn aliases(&self) -> &IndexMap<String, Arc<Alias>> {
        &self.aliases
    }

    pub fn saw_prefetch(&self) -> bool {
        self.saw_prefetch.get()
    }

    fn alias(&self, name: &str) -> Result<&Arc<Alias>, RestError> {
        self.aliases
            .get(name)
            .ok_or_else(|| RestError::Resolution(vec![name.to_owned()]))
    }

    /// resolve a column down to its terminal alias and attribute name,
    /// collapsing a terminal link-table hop onto its owning field.
    pub fn resolve_path(&self, col: &ColumnRef) -> Result<(Arc<Alias>, String), RestError> {
        let (current, field) = match col {
            ColumnRef::Column { alias, name } => {
                let current = Arc::clone(self.alias(alias)?);
                let storage = self.schema.model(&current.model)?.storage_name(name).to_owned();
                (current, storage)
            }
            ColumnRef::Transform { base, name } => {
                // transforms are passed as-is to the api as a dotted suffix
                let (current, path) = self.resolve_path(base)?;
                (current, format!("{}.{}", path, name))
            }
            ColumnRef::Prefetch { alias, name } => {
                self.saw_prefetch.set(true);
                let current = Arc::clone(self.alias(alias)?);
                let storage = self.schema.model(&current.model)?.storage_name(name).to_owned();
                (current, storage)
            }
        };
        if let Some(owning) = &current.m2m {
            let parent = current
                .parent
                .clone()
                .ok_or_else(|| RestError::Internal("link-table alias without parent".to_owned()))?;
            return Ok((parent, owning.clone()));
        }
        Ok((current, field))
    }

    /// the dotted path of a column relative to the root resource.
    pub fn rest_path(&self, col: &ColumnRef) -> Result<String, RestError> {
        let (alias, attname) = self.resolve_path(col)?;
        let mut parts: Vec<String> = ancestors(&alias)
            .iter()
            .filter_map(|a| a.attrname.clone())
            .collect();
        parts.push(attname);
        Ok(parts.join("."))
    }
}

/// A rooted tree over the aliases touched by a query, ordered so every
/// alias's parent precedes it.
#[derive(Debug)]
pub struct AliasTree {
    pub alias: Arc<Alias>,
    pub children: Vec<AliasTree>,
}

/// build the alias tree covering the given terminal aliases.
pub fn build_alias_tree(terminals: &[Arc<Alias>]) -> Option<AliasTree> {
    let mut nodes: Vec<(Arc<Alias>, Vec<usize>)> = Vec::new();
    let mut index: HashMap<Arc<Alias>, usize> = HashMap::new();
    let mut root = None;

    for terminal in terminals {
        for alias in ancestors(terminal) {
            if index.contains_key(&alias) {
                continue;
            }
            let id = nodes.len();
            nodes.push((Arc::clone(&alias), Vec::new()));
            index.insert(Arc::clone(&alias), id);
            match &alias.parent {
                Some(parent) => {
                    let parent_id = index[parent];
                    nodes[parent_id].1.push(id);
                }
                None => root = Some(id),
            }
        }
    }

    fn build(nodes: &[(Arc<Alias>, Vec<usize>)], id: usize) -> AliasTree {
        let (alias, children) = &nodes[id];
        AliasTree {
            alias: Arc::clone(alias),
            children: children.iter().map(|&child| build(nodes, child)).collect(),
        }
    }

    root.map(|root| build(&nodes, root))
}

/// flatten the tree depth-first pre-order, giving the order in which join
/// expansion must visit the aliases.
pub fn flatten_alias_tree(tree: &AliasTree) -> Vec<Arc<Alias>> {
    let mut out = Vec::new();
    let mut stack = vec![tree];
    while let Some(node) = stack.pop() {
        out.push(Arc::clone(&node.alias));
        for child in node.children.iter().rev() {
            stack.push(child);
        }
    }
    out
}
