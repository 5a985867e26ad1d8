//! The abstract query tree the compiler consumes.
//!
//! This is the input interface of the crate: an upstream query builder hands
//! over an already-built tree of joins, predicates, selected columns and
//! ordering. The compiler never mutates it.

use indexmap::IndexMap;
use serde_json::Value;

/// A relational read query against one target model.
#[derive(Debug, Clone)]
pub struct Query {
    /// the target model name
    pub model: String,
    /// the join graph, in whatever order the upstream builder enumerated it
    pub joins: Vec<JoinEntry>,
    /// the selected columns, each attached to a join alias
    pub select: Vec<ColumnRef>,
    pub where_clause: WhereNode,
    pub order_by: Vec<OrderBy>,
    /// row offset of the requested window
    pub low_mark: u64,
    /// exclusive upper bound on the row count, None for "no limit"
    pub high_mark: Option<u64>,
    pub distinct: bool,
    pub group_by: bool,
}

impl Query {
    /// a query selecting nothing, filtering nothing, over a single base
    /// table aliased by the model name.
    pub fn base(model: &str) -> Self {
        Query {
            model: model.to_owned(),
            joins: vec![JoinEntry::base(model, model)],
            select: Vec::new(),
            where_clause: WhereNode::and(Vec::new()),
            order_by: Vec::new(),
            low_mark: 0,
            high_mark: None,
            distinct: false,
            group_by: false,
        }
    }

    /// the alias of the base table entry, if the join graph has one.
    pub fn base_alias(&self) -> Option<&str> {
        self.joins
            .iter()
            .find(|entry| entry.parent.is_none())
            .map(|entry| entry.alias.as_str())
    }
}

/// One node of the join graph.
#[derive(Debug, Clone)]
pub struct JoinEntry {
    /// the alias naming this node, referenced by `ColumnRef::Column`
    pub alias: String,
    /// the model at this node
    pub model: String,
    /// None for the base table
    pub parent: Option<JoinParent>,
}

#[derive(Debug, Clone)]
pub struct JoinParent {
    pub parent_alias: String,
    /// the field on the parent model that reaches this node
    pub field: String,
}

impl JoinEntry {
    pub fn base(alias: &str, model: &str) -> Self {
        JoinEntry {
            alias: alias.to_owned(),
            model: model.to_owned(),
            parent: None,
        }
    }

    pub fn joined(alias: &str, model: &str, parent_alias: &str, field: &str) -> Self {
        JoinEntry {
            alias: alias.to_owned(),
            model: model.to_owned(),
            parent: Some(JoinParent {
                parent_alias: parent_alias.to_owned(),
                field: field.to_owned(),
            }),
        }
    }
}

/// A reference to one column of one join alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Column {
        alias: String,
        name: String,
    },
    /// a server-side transform chained onto a column, passed through as a
    /// dotted suffix (`date.year` and the like)
    Transform {
        base: Box<ColumnRef>,
        name: String,
    },
    /// a raw-sql derived column produced by a prefetch-style secondary
    /// query. compiling one flags the request with `filter_to_prefetch`
    Prefetch {
        alias: String,
        name: String,
    },
}

impl ColumnRef {
    pub fn column(alias: &str, name: &str) -> Self {
        ColumnRef::Column {
            alias: alias.to_owned(),
            name: name.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// A node of the predicate tree: a connector, a negation flag, and children
/// that are either sub-trees or leaf comparisons.
#[derive(Debug, Clone)]
pub struct WhereNode {
    pub connector: Connector,
    pub negated: bool,
    pub children: Vec<WherePart>,
}

impl WhereNode {
    pub fn and(children: Vec<WherePart>) -> Self {
        WhereNode {
            connector: Connector::And,
            negated: false,
            children,
        }
    }

    pub fn or(children: Vec<WherePart>) -> Self {
        WhereNode {
            connector: Connector::Or,
            negated: false,
            children,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negated = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum WherePart {
    Node(WhereNode),
    Leaf(Lookup),
    /// a node that can never match any row
    Nothing,
}

/// A leaf comparison.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub lhs: ColumnRef,
    pub op: LookupOp,
    pub rhs: Rhs,
}

impl Lookup {
    pub fn exact(lhs: ColumnRef, value: Value) -> Self {
        Lookup {
            lhs,
            op: LookupOp::Exact,
            rhs: Rhs::Value(value),
        }
    }

    pub fn is_in(lhs: ColumnRef, values: Vec<Value>) -> Self {
        Lookup {
            lhs,
            op: LookupOp::In,
            rhs: Rhs::Values(values),
        }
    }

    pub fn range(lhs: ColumnRef, low: Value, high: Value) -> Self {
        Lookup {
            lhs,
            op: LookupOp::Range,
            rhs: Rhs::Values(vec![low, high]),
        }
    }
}

/// The right-hand side of a leaf comparison.
#[derive(Debug, Clone)]
pub enum Rhs {
    Value(Value),
    Values(Vec<Value>),
    /// the comparison references another query. rejected at
    /// compatibility-check time
    Subquery,
}

impl Rhs {
    pub const fn is_direct_value(&self) -> bool {
        !matches!(self, Rhs::Subquery)
    }
}

/// The lookup operators with their dynamic-rest wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LookupOp {
    Exact,
    In,
    Range,
    IsNull,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    IContains,
    StartsWith,
    EndsWith,
}

/// One object of a bulk or single insert.
#[derive(Debug, Clone, Default)]
pub struct InsertObject {
    pub data: IndexMap<String, Value>,
    pub files: IndexMap<String, FilePayload>,
}

#[derive(Debug, Clone)]
pub struct InsertQuery {
    pub model: String,
    pub objs: Vec<InsertObject>,
    /// when true the caller needs the created ids back, which forbids the
    /// bulk representation
    pub return_id: bool,
}

#[derive(Debug, Clone)]
pub struct UpdateQuery {
    pub model: String,
    pub joins: Vec<JoinEntry>,
    pub where_clause: WhereNode,
    pub values: IndexMap<String, Value>,
    pub files: IndexMap<String, FilePayload>,
}

#[derive(Debug, Clone)]
pub struct DeleteQuery {
    pub model: String,
    pub joins: Vec<JoinEntry>,
    pub where_clause: WhereNode,
}

/// An uploadable file value carried by an insert or update.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}
