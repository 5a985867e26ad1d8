//! The public operations: select, insert, update and delete.
//!
//! `RestDatabase` owns a connection and a schema catalog. Reads compile to
//! parameterized GETs and come back as a lazy `RowStream`. Writes address
//! rows by key: the predicate of an update or delete is first resolved to a
//! set of primary keys, statically when possible, with a key-only GET
//! otherwise.

use std::{collections::BTreeSet, sync::Arc};

use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::{
    compiler::{
        alias::{build_alias_tree, flatten_alias_tree, Alias, AliasResolver},
        predicate::{flatten_where, Compat, Params},
        QueryCompiler,
    },
    error::RestError,
    query::{DeleteQuery, InsertObject, InsertQuery, LookupOp, Query, Rhs, UpdateQuery, WhereNode},
    response::{parse_json, Paginator, ResponseIndex, RowStream},
    schema::{FieldKind, ModelSchema, RestSchema, ThroughSide},
    transport::{middleware::ApiResponse, response_message, url_with_params, ApiConnection},
    value::{DbValue, Pk},
};

pub struct RestDatabase {
    connection: ApiConnection,
    schema: RestSchema,
}

impl RestDatabase {
    pub fn new(connection: ApiConnection, schema: RestSchema) -> Self {
        RestDatabase { connection, schema }
    }

    pub fn connection(&self) -> &ApiConnection {
        &self.connection
    }

    pub fn schema(&self) -> &RestSchema {
        &self.schema
    }

    /// execute a read query. rows are produced lazily, further pages are
    /// only fetched while the stream is pulled.
    pub fn select(&self, query: &Query) -> Result<RowStream<'_>, RestError> {
        let compiler = QueryCompiler::new(query, &self.schema)?;
        if compiler.check_compatibility(false)? == Compat::NoRows || compiler.window_is_empty() {
            return Ok(RowStream::empty(&self.schema));
        }
        let model = self.schema.model(&query.model)?;
        let (select, alias_order) = resolve_select(compiler.resolver(), query)?;

        if query.low_mark == 0 {
            // a predicate pinning exactly one key addresses the row
            // directly. when the keys cannot be known statically but the
            // predicate does constrain the key, a key-only pre-lookup
            // decides between the single-row and list forms
            match compiler.static_primary_keys()? {
                Some(keys) if keys.len() == 1 => {
                    let pk = keys.into_iter().next().ok_or_else(|| {
                        RestError::Internal("key set checked non-empty".to_owned())
                    })?;
                    return self.select_single(query, model, &compiler, &pk, select, alias_order);
                }
                Some(_) => {}
                None if compiler.targets_primary_key()? => {
                    let probe = probe_query(&query.model, &query.joins, &query.where_clause);
                    let ids = self.resolve_ids(&probe)?;
                    if ids.is_empty() {
                        return Ok(RowStream::empty(&self.schema));
                    }
                    if ids.len() == 1 {
                        let pk = ids.into_iter().next().ok_or_else(|| {
                            RestError::Internal("key set checked non-empty".to_owned())
                        })?;
                        return self
                            .select_single(query, model, &compiler, &pk, select, alias_order);
                    }
                }
                None => {}
            }
        }

        let params = match compiler.build_params()? {
            Some(params) => params,
            None => return Ok(RowStream::empty(&self.schema)),
        };
        let path = model.resource_path(None);
        let response = self.connection.get(&path, &params)?;
        if response.status == 404 || response.status == 204 {
            return Ok(RowStream::empty(&self.schema));
        }
        self.expect_status(&[200], "GET", &path, &params, &response)?;
        let index = ResponseIndex::new(parse_json(&path, &response)?, true);
        let paginator = index.meta().and_then(|meta| {
            Paginator::new(
                &self.connection,
                path.clone(),
                params.clone(),
                meta,
                query.high_mark,
            )
        });
        RowStream::new(&self.schema, &query.model, select, alias_order, index, paginator)
    }

    fn select_single(
        &self,
        query: &Query,
        model: &ModelSchema,
        compiler: &QueryCompiler<'_>,
        pk: &Pk,
        select: Vec<(Arc<Alias>, String)>,
        alias_order: Vec<Arc<Alias>>,
    ) -> Result<RowStream<'_>, RestError> {
        let path = model.resource_path(Some(pk));
        let params = compiler.build_single_params()?;
        let response = self.connection.get(&path, &params)?;
        if response.status == 404 || response.status == 204 {
            return Ok(RowStream::empty(&self.schema));
        }
        self.expect_status(&[200], "GET", &path, &params, &response)?;
        let index = ResponseIndex::new(parse_json(&path, &response)?, false);
        RowStream::new(&self.schema, &query.model, select, alias_order, index, None)
    }

    /// execute a read query and collect every row.
    pub fn select_rows(&self, query: &Query) -> Result<Vec<Vec<DbValue>>, RestError> {
        self.select(query)?.collect()
    }

    /// insert rows, returning the server's representation of each created
    /// row in input order, with server-computed fields merged in. inserting
    /// into a link table rewrites the owning records instead.
    pub fn insert(
        &self,
        query: &InsertQuery,
    ) -> Result<Vec<IndexMap<String, DbValue>>, RestError> {
        let model = self.schema.model(&query.model)?;
        if model.link_table {
            self.insert_through(model, &query.objs)?;
            return Ok(Vec::new());
        }
        let has_files = query.objs.iter().any(|obj| !obj.files.is_empty());
        if !query.return_id && !has_files && query.objs.len() > 1 {
            return self.insert_bulk(model, &query.objs);
        }
        let mut created = Vec::with_capacity(query.objs.len());
        for obj in &query.objs {
            created.push(self.insert_one(model, obj)?);
        }
        Ok(created)
    }

    fn insert_bulk(
        &self,
        model: &ModelSchema,
        objs: &[InsertObject],
    ) -> Result<Vec<IndexMap<String, DbValue>>, RestError> {
        let plural = model.resource_name(true);
        let rows: Vec<Value> = objs
            .iter()
            .map(|obj| storage_object(model, &obj.data))
            .collect();
        let path = model.resource_path(None);
        let params = Params::new();
        let response = self
            .connection
            .post(&path, &params, &json!({ plural.clone(): rows }))?;
        self.expect_status(&[200, 201], "POST", &path, &params, &response)?;
        let body = parse_json(&path, &response)?;
        let records = match body.get(&plural) {
            Some(Value::Array(records)) => records,
            _ => {
                return Err(RestError::MissingResourceKey {
                    resource: plural,
                    keys: top_level_keys(&body),
                })
            }
        };
        // the api returns the created rows in request order
        Ok(records.iter().map(|record| typed_row(model, record)).collect())
    }

    /// a file-bearing create uploads the multipart body first, the data
    /// follows as a refining patch on the created row.
    fn insert_one(
        &self,
        model: &ModelSchema,
        obj: &InsertObject,
    ) -> Result<IndexMap<String, DbValue>, RestError> {
        let singular = model.resource_name(false);
        let path = model.resource_path(None);
        let params = Params::new();
        let body = json!({ singular.clone(): storage_object(model, &obj.data) });

        if obj.files.is_empty() {
            let response = self.connection.post(&path, &params, &body)?;
            self.expect_status(&[200, 201], "POST", &path, &params, &response)?;
            return self.merged_row(model, &singular, &path, &response);
        }

        let response = self.connection.post_multipart(&path, &params, &obj.files)?;
        self.expect_status(&[200, 201], "POST", &path, &params, &response)?;
        let created = parse_json(&path, &response)?;
        let pk = record_pk(model, created.get(&singular))?;
        let row_path = model.resource_path(Some(&pk));
        let response = self.connection.patch(&row_path, &params, &body)?;
        self.expect_status(&[200, 202, 204], "PATCH", &row_path, &params, &response)?;
        self.merged_row(model, &singular, &row_path, &response)
    }

    /// association rows collapse to a read-modify-write of the owning
    /// record's member list. a concurrent writer between the read and the
    /// write can lose members, the api offers nothing to fence this.
    fn insert_through(
        &self,
        through: &ModelSchema,
        objs: &[InsertObject],
    ) -> Result<(), RestError> {
        let owner = self.pick_owning_side(through, objs)?;
        let other_fk = other_fk_field(through, &owner.fk_field)?;
        let mut groups: IndexMap<Pk, Vec<Value>> = IndexMap::new();
        for obj in objs {
            let owner_pk = obj
                .data
                .get(&owner.fk_field)
                .and_then(Pk::from_json)
                .ok_or_else(|| {
                    RestError::Schema(format!(
                        "association row for {} is missing {}",
                        through.name, owner.fk_field
                    ))
                })?;
            let related = obj.data.get(&other_fk).cloned().ok_or_else(|| {
                RestError::Schema(format!(
                    "association row for {} is missing {}",
                    through.name, other_fk
                ))
            })?;
            groups.entry(owner_pk).or_default().push(related);
        }

        let owner_model = self.schema.model(&owner.related_model)?;
        let storage = owner_model.storage_name(&owner.owning_field).to_owned();
        for (pk, additions) in groups {
            let mut members = self.relation_members(owner_model, &pk, &storage)?;
            for value in additions {
                if !members.contains(&value) {
                    members.push(value);
                }
            }
            self.write_relation_members(owner_model, &pk, &storage, members)?;
        }
        Ok(())
    }

    /// group by the owning side with the fewest distinct keys, so the
    /// fewest records get rewritten.
    fn pick_owning_side(
        &self,
        through: &ModelSchema,
        objs: &[InsertObject],
    ) -> Result<ThroughSide, RestError> {
        let distinct = |side: &ThroughSide| {
            objs.iter()
                .filter_map(|obj| obj.data.get(&side.fk_field))
                .map(Value::to_string)
                .collect::<BTreeSet<_>>()
                .len()
        };
        self.schema
            .many_to_many_sides(through)?
            .into_iter()
            .min_by_key(distinct)
            .ok_or_else(|| {
                RestError::Schema(format!(
                    "can't find a many-to-many field using the link table {}",
                    through.name
                ))
            })
    }

    fn relation_members(
        &self,
        model: &ModelSchema,
        pk: &Pk,
        storage: &str,
    ) -> Result<Vec<Value>, RestError> {
        let path = model.resource_path(Some(pk));
        let mut params = Params::new();
        params.insert("exclude[]".to_owned(), vec!["*".to_owned()]);
        params.insert("include[]".to_owned(), vec![storage.to_owned()]);
        let response = self.connection.get(&path, &params)?;
        self.expect_status(&[200], "GET", &path, &params, &response)?;
        let body = parse_json(&path, &response)?;
        let singular = model.resource_name(false);
        match body.get(&singular).and_then(|record| record.get(storage)) {
            Some(Value::Array(members)) => Ok(members.clone()),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(RestError::UnsupportedShape {
                model: model.name.clone(),
                column: storage.to_owned(),
                value: other.to_string(),
            }),
        }
    }

    fn write_relation_members(
        &self,
        model: &ModelSchema,
        pk: &Pk,
        storage: &str,
        members: Vec<Value>,
    ) -> Result<(), RestError> {
        let path = model.resource_path(Some(pk));
        let params = Params::new();
        let singular = model.resource_name(false);
        let body = json!({ singular: { storage: members } });
        let response = self.connection.patch(&path, &params, &body)?;
        self.expect_status(&[200, 202, 204], "PATCH", &path, &params, &response)
    }

    /// update the rows the predicate selects, one PATCH per row. returns
    /// the merged representations the api sent back.
    pub fn update(
        &self,
        query: &UpdateQuery,
    ) -> Result<Vec<IndexMap<String, DbValue>>, RestError> {
        let model = self.schema.model(&query.model)?;
        let probe = probe_query(&query.model, &query.joins, &query.where_clause);
        let ids = self.resolve_ids(&probe)?;

        let singular = model.resource_name(false);
        let body = json!({ singular.clone(): storage_object(model, &query.values) });
        let mut merged = Vec::with_capacity(ids.len());
        for pk in ids {
            let path = model.resource_path(Some(&pk));
            let params = Params::new();
            let response = self.connection.patch(&path, &params, &body)?;
            self.expect_status(&[200, 202, 204], "PATCH", &path, &params, &response)?;
            if !query.files.is_empty() {
                let response = self
                    .connection
                    .patch_multipart(&path, &params, &query.files)?;
                self.expect_status(&[200, 202, 204], "PATCH", &path, &params, &response)?;
            }
            merged.push(self.merged_row(model, &singular, &path, &response)?);
        }
        Ok(merged)
    }

    fn merged_row(
        &self,
        model: &ModelSchema,
        singular: &str,
        path: &str,
        response: &ApiResponse,
    ) -> Result<IndexMap<String, DbValue>, RestError> {
        if !matches!(response.status, 200 | 201) || response.body.is_empty() {
            return Ok(IndexMap::new());
        }
        let body = parse_json(path, response)?;
        match body.get(singular) {
            Some(record) => Ok(typed_row(model, record)),
            None => Ok(IndexMap::new()),
        }
    }

    /// delete the rows the predicate selects. deleting association rows
    /// rewrites the owning record's member list instead. returns the
    /// number of rows affected.
    pub fn delete(&self, query: &DeleteQuery) -> Result<u64, RestError> {
        let model = self.schema.model(&query.model)?;
        if model.link_table {
            return self.delete_through(model, query);
        }
        let probe = probe_query(&query.model, &query.joins, &query.where_clause);
        let ids = self.resolve_ids(&probe)?;
        let count = ids.len() as u64;
        for pk in ids {
            let path = model.resource_path(Some(&pk));
            let params = Params::new();
            let response = self.connection.delete(&path, &params)?;
            self.expect_status(&[200, 202, 204], "DELETE", &path, &params, &response)?;
        }
        Ok(count)
    }

    /// association deletes name one owning row and a set of members to
    /// drop, or no member set at all to clear the relation.
    fn delete_through(&self, through: &ModelSchema, query: &DeleteQuery) -> Result<u64, RestError> {
        let sides = self.schema.many_to_many_sides(through)?;
        let probe = probe_query(&query.model, &query.joins, &query.where_clause);
        let resolver = AliasResolver::new(&probe, &self.schema)?;

        let mut constraints: IndexMap<String, (LookupOp, BTreeSet<Pk>)> = IndexMap::new();
        for (negated, lookup) in flatten_where(&query.where_clause) {
            if negated {
                return Err(RestError::UnsupportedQuery(
                    "negated association delete".to_owned(),
                ));
            }
            let (alias, field) = resolver.resolve_path(&lookup.lhs)?;
            if !alias.is_root() {
                return Err(RestError::UnsupportedQuery(
                    "joined association delete".to_owned(),
                ));
            }
            let keys = match (&lookup.op, &lookup.rhs) {
                (LookupOp::Exact, Rhs::Value(value)) => pk_set(std::slice::from_ref(value))?,
                (LookupOp::In, Rhs::Values(values)) => pk_set(values)?,
                _ => {
                    return Err(RestError::UnsupportedQuery(
                        "association delete lookup".to_owned(),
                    ))
                }
            };
            constraints.insert(field, (lookup.op, keys));
        }

        let owner = sides.iter().find(|side| {
            matches!(
                constraints.get(&side.fk_field),
                Some((LookupOp::Exact, keys)) if keys.len() == 1
            )
        });
        let owner = match owner {
            Some(owner) => owner,
            // no pinned owner means the owning rows themselves are being
            // deleted and the api cascades over their association rows,
            // there is nothing left to rewrite
            None => return Ok(0),
        };
        let other_fk = other_fk_field(through, &owner.fk_field)?;
        let owner_pk = constraints[&owner.fk_field]
            .1
            .iter()
            .next()
            .cloned()
            .ok_or_else(|| RestError::Internal("owner key checked non-empty".to_owned()))?;
        let removals = constraints.get(&other_fk).map(|(_, keys)| keys.clone());

        let owner_model = self.schema.model(&owner.related_model)?;
        let storage = owner_model.storage_name(&owner.owning_field).to_owned();
        let current = self.relation_members(owner_model, &owner_pk, &storage)?;
        let remaining: Vec<Value> = match &removals {
            // no member constraint clears the whole relation
            None => Vec::new(),
            Some(keys) => current
                .iter()
                .filter(|member| match Pk::from_json(member) {
                    Some(pk) => !keys.contains(&pk),
                    None => true,
                })
                .cloned()
                .collect(),
        };
        let removed = (current.len() - remaining.len()) as u64;
        self.write_relation_members(owner_model, &owner_pk, &storage, remaining)?;
        Ok(removed)
    }

    /// resolve the predicate of a write query to the set of affected keys,
    /// statically when the predicate allows it.
    pub fn resolve_ids(&self, query: &Query) -> Result<BTreeSet<Pk>, RestError> {
        let compiler = QueryCompiler::new(query, &self.schema)?;
        // static resolution first: it also handles all-OR key predicates
        // the filter compiler cannot express
        if let Some(keys) = compiler.static_primary_keys()? {
            return Ok(keys);
        }
        if compiler.check_compatibility(true)? == Compat::NoRows {
            return Ok(BTreeSet::new());
        }
        let model = self.schema.model(&query.model)?;
        let params = match compiler.build_params()? {
            Some(params) => params,
            None => return Ok(BTreeSet::new()),
        };
        let path = model.resource_path(None);
        let response = self.connection.get(&path, &params)?;
        if response.status == 404 || response.status == 204 {
            return Ok(BTreeSet::new());
        }
        self.expect_status(&[200], "GET", &path, &params, &response)?;
        let index = ResponseIndex::new(parse_json(&path, &response)?, true);

        let mut ids = BTreeSet::new();
        page_ids(&index, model, &mut ids)?;
        let mut paginator = index.meta().and_then(|meta| {
            Paginator::new(&self.connection, path.clone(), params.clone(), meta, None)
        });
        while let Some(json) = paginator.as_mut().and_then(Paginator::next_json) {
            let index = ResponseIndex::new(json?, true);
            page_ids(&index, model, &mut ids)?;
        }
        Ok(ids)
    }

    fn expect_status(
        &self,
        accepted: &[u16],
        method: &str,
        path: &str,
        params: &Params,
        response: &ApiResponse,
    ) -> Result<(), RestError> {
        if accepted.contains(&response.status) {
            return Ok(());
        }
        Err(RestError::ExecutionFailed {
            method: method.to_owned(),
            url: url_with_params(path, params),
            message: response_message(response),
        })
    }
}

/// the foreign key of a link table pointing away from the owning side.
fn other_fk_field(through: &ModelSchema, owner_fk: &str) -> Result<String, RestError> {
    through
        .fields
        .iter()
        .find(|(name, field)| {
            name.as_str() != owner_fk && matches!(field.kind, FieldKind::ForeignKey { .. })
        })
        .map(|(name, _)| name.clone())
        .ok_or_else(|| {
            RestError::Schema(format!(
                "the link table {} has no second foreign key",
                through.name
            ))
        })
}

fn probe_query(model: &str, joins: &[crate::query::JoinEntry], where_clause: &WhereNode) -> Query {
    let mut query = Query::base(model);
    if !joins.is_empty() {
        query.joins = joins.to_vec();
    }
    query.where_clause = where_clause.clone();
    query
}

/// the data object with its keys translated to storage names.
fn storage_object(model: &ModelSchema, data: &IndexMap<String, Value>) -> Value {
    let mut object = serde_json::Map::with_capacity(data.len());
    for (field, value) in data {
        object.insert(model.storage_name(field).to_owned(), value.clone());
    }
    Value::Object(object)
}

/// a response record converted to natively typed cells, keyed by storage
/// column. cells with undecodable shapes are skipped.
fn typed_row(model: &ModelSchema, record: &Value) -> IndexMap<String, DbValue> {
    let record = match record.as_object() {
        Some(record) => record,
        None => return IndexMap::new(),
    };
    let mut row = IndexMap::with_capacity(record.len());
    for (column, raw) in record {
        let value = match model.field_by_storage_name(column).map(|(_, f)| &f.kind) {
            Some(FieldKind::Scalar { scalar }) => scalar.convert(raw),
            _ => DbValue::from_raw(raw),
        };
        if let Some(value) = value {
            row.insert(column.clone(), value);
        }
    }
    row
}

fn record_pk(model: &ModelSchema, record: Option<&Value>) -> Result<Pk, RestError> {
    let pk_key = model.storage_name(&model.primary_key);
    record
        .and_then(|record| record.get(pk_key))
        .and_then(Pk::from_json)
        .ok_or_else(|| RestError::MissingId {
            model: model.name.clone(),
            pk: format!("<{}>", pk_key),
        })
}

fn top_level_keys(body: &Value) -> Vec<String> {
    match body.as_object() {
        Some(object) => object.keys().cloned().collect(),
        None => Vec::new(),
    }
}

fn pk_set(values: &[Value]) -> Result<BTreeSet<Pk>, RestError> {
    values
        .iter()
        .map(|value| {
            Pk::from_json(value).ok_or_else(|| {
                RestError::UnsupportedQuery("association delete key".to_owned())
            })
        })
        .collect()
}

fn page_ids(
    index: &ResponseIndex,
    model: &ModelSchema,
    out: &mut BTreeSet<Pk>,
) -> Result<(), RestError> {
    let pk_key = model.storage_name(&model.primary_key);
    for record in index.root_records(model)? {
        let pk = record
            .get(pk_key)
            .and_then(Pk::from_json)
            .ok_or_else(|| RestError::MissingId {
                model: model.name.clone(),
                pk: format!("<{}>", pk_key),
            })?;
        out.insert(pk);
    }
    Ok(())
}

fn resolve_select(
    resolver: &AliasResolver<'_>,
    query: &Query,
) -> Result<(Vec<(Arc<Alias>, String)>, Vec<Arc<Alias>>), RestError> {
    let mut select = Vec::with_capacity(query.select.len());
    let mut terminals = Vec::new();
    for col in &query.select {
        let (alias, name) = resolver.resolve_path(col)?;
        terminals.push(Arc::clone(&alias));
        select.push((alias, name));
    }
    let alias_order = match build_alias_tree(&terminals) {
        Some(tree) => flatten_alias_tree(&tree),
        None => Vec::new(),
    };
    Ok((select, alias_order))
}
