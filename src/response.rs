//! Reassembly of relational rows out of flat JSON responses.
//!
//! The api returns one collection per resource plus a root collection, with
//! relations carried as primary keys. `ResponseIndex` indexes the embedded
//! collections by key, `RowStream` walks the root records, follows relation
//! keys through the index, fans out over to-many relations and converts each
//! cell to its native representation. Extra pages are fetched lazily while
//! the stream is pulled.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use indexmap::IndexMap;
use serde_json::Value;

use crate::{
    compiler::{alias::Alias, predicate::Params},
    error::RestError,
    schema::{FieldKind, ModelSchema, RestSchema},
    transport::{middleware::ApiResponse, response_message, ApiConnection},
    value::{DbValue, Pk},
};

/// Fetches the remaining pages of a windowed list response.
pub struct Paginator<'c> {
    connection: &'c ApiConnection,
    path: String,
    params: Params,
    next_page: u64,
    last_page: u64,
}

impl<'c> Paginator<'c> {
    /// build a paginator from the `meta` object of the first page.
    ///
    /// `high_mark` bounds how many rows the caller asked for. The page size
    /// it converts to comes from the response, not the request: the server
    /// may have clamped the requested one.
    pub fn new(
        connection: &'c ApiConnection,
        path: String,
        params: Params,
        meta: &Value,
        high_mark: Option<u64>,
    ) -> Option<Self> {
        let page = meta.get("page")?.as_u64()?;
        let total_pages = meta.get("total_pages")?.as_u64()?;
        let per_page = meta.get("per_page").and_then(Value::as_u64);
        let last_page = match (high_mark, per_page) {
            (Some(high), Some(per)) if per > 0 => total_pages.min((high + per - 1) / per),
            _ => total_pages,
        };
        if page >= last_page {
            return None;
        }
        Some(Paginator {
            connection,
            path,
            params,
            next_page: page + 1,
            last_page,
        })
    }

    /// fetch the next page, None when the window is exhausted.
    pub fn next_json(&mut self) -> Option<Result<Value, RestError>> {
        if self.next_page > self.last_page {
            return None;
        }
        self.params
            .insert("page".to_owned(), vec![self.next_page.to_string()]);
        self.next_page += 1;
        Some(self.fetch())
    }

    fn fetch(&self) -> Result<Value, RestError> {
        let response = self.connection.get(&self.path, &self.params)?;
        if response.status != 200 {
            return Err(RestError::ExecutionFailed {
                method: "GET".to_owned(),
                url: self.path.clone(),
                message: response_message(&response),
            });
        }
        parse_json(&self.path, &response)
    }
}

pub fn parse_json(url: &str, response: &ApiResponse) -> Result<Value, RestError> {
    response.json().map_err(|err| RestError::InvalidJson {
        url: url.to_owned(),
        message: err.to_string(),
    })
}

/// One page of a response, with its embedded collections indexed by primary
/// key on demand.
pub struct ResponseIndex {
    json: Value,
    many: bool,
    cache: RefCell<HashMap<String, IndexMap<Pk, Value>>>,
}

impl ResponseIndex {
    pub fn new(json: Value, many: bool) -> Self {
        ResponseIndex {
            json,
            many,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn meta(&self) -> Option<&Value> {
        self.json.get("meta")
    }

    /// the records of the root resource, in response order.
    pub fn root_records(&self, model: &ModelSchema) -> Result<Vec<Value>, RestError> {
        let name = model.resource_name(self.many);
        match self.json.get(&name) {
            Some(Value::Array(records)) if self.many => Ok(records.clone()),
            Some(record) if !self.many => Ok(vec![record.clone()]),
            _ => Err(RestError::MissingResourceKey {
                resource: name,
                keys: self.top_level_keys(),
            }),
        }
    }

    fn top_level_keys(&self) -> Vec<String> {
        match self.json.as_object() {
            Some(object) => object.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// find the record of `model` with the given key among the embedded
    /// collections.
    pub fn lookup(&self, model: &ModelSchema, pk: &Pk) -> Result<Value, RestError> {
        let plural = model.resource_name(true);
        {
            let mut cache = self.cache.borrow_mut();
            if !cache.contains_key(&plural) {
                let indexed = self.index_collection(model, &plural)?;
                cache.insert(plural.clone(), indexed);
            }
        }
        let cache = self.cache.borrow();
        cache[&plural]
            .get(pk)
            .cloned()
            .ok_or_else(|| RestError::MissingId {
                model: model.name.clone(),
                pk: pk.to_string(),
            })
    }

    /// index the collection under its plural key, merged with the auxiliary
    /// `+`-prefixed collection carrying related records outside the
    /// requested window.
    fn index_collection(
        &self,
        model: &ModelSchema,
        plural: &str,
    ) -> Result<IndexMap<Pk, Value>, RestError> {
        let pk_key = model.storage_name(&model.primary_key);
        let mut indexed = IndexMap::new();
        for key in [plural.to_owned(), format!("+{}", plural)] {
            let records = match self.json.get(&key) {
                Some(Value::Array(records)) => records,
                _ => continue,
            };
            for record in records {
                let pk = record
                    .get(pk_key)
                    .and_then(Pk::from_json)
                    .ok_or_else(|| RestError::MissingId {
                        model: model.name.clone(),
                        pk: format!("<{}>", pk_key),
                    })?;
                indexed.insert(pk, record.clone());
            }
        }
        Ok(indexed)
    }
}

/// A lazily-produced stream of native-typed rows.
///
/// Pulling the stream drives pagination: dropping it early performs no
/// further request.
pub struct RowStream<'c> {
    schema: &'c RestSchema,
    root_model: String,
    select: Vec<(Arc<Alias>, String)>,
    alias_order: Vec<Arc<Alias>>,
    index: ResponseIndex,
    root_queue: VecDeque<Value>,
    row_queue: VecDeque<Vec<DbValue>>,
    paginator: Option<Paginator<'c>>,
    done: bool,
}

impl<'c> RowStream<'c> {
    pub fn new(
        schema: &'c RestSchema,
        root_model: &str,
        select: Vec<(Arc<Alias>, String)>,
        alias_order: Vec<Arc<Alias>>,
        index: ResponseIndex,
        paginator: Option<Paginator<'c>>,
    ) -> Result<Self, RestError> {
        let records = index.root_records(schema.model(root_model)?)?;
        Ok(RowStream {
            schema,
            root_model: root_model.to_owned(),
            select,
            alias_order,
            index,
            root_queue: records.into(),
            row_queue: VecDeque::new(),
            paginator,
            done: false,
        })
    }

    /// a stream over no rows at all.
    pub fn empty(schema: &'c RestSchema) -> Self {
        RowStream {
            schema,
            root_model: String::new(),
            select: Vec::new(),
            alias_order: Vec::new(),
            index: ResponseIndex::new(Value::Null, true),
            root_queue: VecDeque::new(),
            row_queue: VecDeque::new(),
            paginator: None,
            done: true,
        }
    }

    fn advance_page(&mut self) -> Result<bool, RestError> {
        let json = match self.paginator.as_mut().and_then(Paginator::next_json) {
            Some(json) => json?,
            None => return Ok(false),
        };
        // the per-page key index dies with the page
        self.index = ResponseIndex::new(json, true);
        let records = self
            .index
            .root_records(self.schema.model(&self.root_model)?)?;
        self.root_queue = records.into();
        Ok(true)
    }

    /// bind every alias of the join graph for one root record, fanning out
    /// over to-many hops.
    fn bind_aliases(
        &self,
        record: &Value,
    ) -> Result<Vec<HashMap<Arc<Alias>, Value>>, RestError> {
        let mut bindings = Vec::new();
        if let Some(root) = self.alias_order.first() {
            bindings.push(HashMap::from([(Arc::clone(root), record.clone())]));
        }
        for alias in self.alias_order.iter().skip(1) {
            let parent = match &alias.parent {
                Some(parent) => parent,
                None => continue,
            };
            let field = alias.field.as_deref().unwrap_or_default();
            let parent_model = self.schema.model(&parent.model)?;
            let storage = parent_model.storage_name(field).to_owned();
            let child_model = self.schema.model(&alias.model)?;

            let mut expanded = Vec::new();
            for binding in bindings {
                let raw = binding
                    .get(parent)
                    .and_then(|parent_obj| parent_obj.get(&storage))
                    .cloned()
                    .unwrap_or(Value::Null);
                for value in self.follow_relation(child_model, &parent.model, &storage, &raw)? {
                    let mut next = binding.clone();
                    next.insert(Arc::clone(alias), value);
                    expanded.push(next);
                }
            }
            bindings = expanded;
        }
        Ok(bindings)
    }

    /// resolve a relation cell into the records it points at. a null or
    /// absent relation dangles as an empty object so the projected columns
    /// come out null.
    fn follow_relation(
        &self,
        child_model: &ModelSchema,
        parent_model: &str,
        column: &str,
        raw: &Value,
    ) -> Result<Vec<Value>, RestError> {
        match raw {
            Value::Null => Ok(vec![Value::Object(Default::default())]),
            Value::Array(keys) => {
                let mut records = Vec::with_capacity(keys.len());
                for key in keys {
                    records.push(self.follow_key(child_model, parent_model, column, key)?);
                }
                Ok(records)
            }
            key => Ok(vec![self.follow_key(child_model, parent_model, column, key)?]),
        }
    }

    fn follow_key(
        &self,
        child_model: &ModelSchema,
        parent_model: &str,
        column: &str,
        key: &Value,
    ) -> Result<Value, RestError> {
        let pk = Pk::from_json(key).ok_or_else(|| RestError::UnsupportedShape {
            model: parent_model.to_owned(),
            column: column.to_owned(),
            value: key.to_string(),
        })?;
        self.index.lookup(child_model, &pk)
    }

    /// project the selected columns out of one set of bindings. a to-many
    /// column fans the row out over its members.
    fn project(&self, binding: &HashMap<Arc<Alias>, Value>) -> Result<Vec<Vec<DbValue>>, RestError> {
        let mut rows: Vec<Vec<DbValue>> = vec![Vec::with_capacity(self.select.len())];
        for (alias, column) in &self.select {
            let model = self.schema.model(&alias.model)?;
            let raw = binding
                .get(alias)
                .and_then(|obj| obj.get(column))
                .cloned()
                .unwrap_or(Value::Null);

            let candidates = self.cell_values(model, column, &raw)?;
            let mut expanded = Vec::with_capacity(rows.len() * candidates.len());
            for row in &rows {
                for candidate in &candidates {
                    let mut next = row.clone();
                    next.push(candidate.clone());
                    expanded.push(next);
                }
            }
            rows = expanded;
        }
        Ok(rows)
    }

    fn cell_values(
        &self,
        model: &ModelSchema,
        column: &str,
        raw: &Value,
    ) -> Result<Vec<DbValue>, RestError> {
        let unsupported = || RestError::UnsupportedShape {
            model: model.name.clone(),
            column: column.to_owned(),
            value: raw.to_string(),
        };
        match model.field_by_storage_name(column).map(|(_, f)| &f.kind) {
            Some(FieldKind::Scalar { scalar }) => {
                Ok(vec![scalar.convert(raw).ok_or_else(unsupported)?])
            }
            Some(FieldKind::ManyToMany { .. }) => match raw {
                Value::Null => Ok(vec![DbValue::Null]),
                Value::Array(members) => members
                    .iter()
                    .map(|member| DbValue::from_raw(member).ok_or_else(unsupported))
                    .collect(),
                _ => Err(unsupported()),
            },
            // foreign keys, files and undeclared columns carry their wire
            // value as-is
            _ => Ok(vec![DbValue::from_raw(raw).ok_or_else(unsupported)?]),
        }
    }

    fn expand_record(&self, record: &Value) -> Result<Vec<Vec<DbValue>>, RestError> {
        if self.select.is_empty() {
            // counting queries select nothing, each record is one row
            return Ok(vec![Vec::new()]);
        }
        let mut rows = Vec::new();
        for binding in self.bind_aliases(record)? {
            rows.extend(self.project(&binding)?);
        }
        Ok(rows)
    }
}

impl Iterator for RowStream<'_> {
    type Item = Result<Vec<DbValue>, RestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.row_queue.pop_front() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            if let Some(record) = self.root_queue.pop_front() {
                match self.expand_record(&record) {
                    Ok(rows) => self.row_queue.extend(rows),
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
                continue;
            }
            match self.advance_page() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
