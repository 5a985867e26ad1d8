//! Compilation of abstract queries into request parameters.
//!
//! A read query compiles into a flat set of query-string parameters:
//! `filter{...}` entries for the predicate, `include[]`/`exclude[]` for the
//! projection, `sort[]` for the ordering and `page`/`per_page` for the
//! window. The compiler never performs requests itself.

pub mod alias;
pub mod predicate;
pub mod projection;
pub mod window;

use std::collections::BTreeSet;

use crate::{error::RestError, query::Query, schema::RestSchema, value::Pk};

use self::{
    alias::AliasResolver,
    predicate::{Compat, Params},
    window::Window,
};

pub struct QueryCompiler<'q> {
    query: &'q Query,
    schema: &'q RestSchema,
    resolver: AliasResolver<'q>,
}

impl<'q> QueryCompiler<'q> {
    pub fn new(query: &'q Query, schema: &'q RestSchema) -> Result<Self, RestError> {
        Ok(QueryCompiler {
            query,
            schema,
            resolver: AliasResolver::new(query, schema)?,
        })
    }

    pub fn resolver(&self) -> &AliasResolver<'q> {
        &self.resolver
    }

    pub fn check_compatibility(&self, tolerate_distinct: bool) -> Result<Compat, RestError> {
        predicate::check_compatibility(self.query, tolerate_distinct)
    }

    /// the page window the query asks for, if it is bounded.
    pub fn window(&self) -> Result<Option<Window>, RestError> {
        if self.query.low_mark != 0 && self.query.high_mark.is_none() {
            return Err(RestError::UnsupportedQuery(
                "offset without limit".to_owned(),
            ));
        }
        Ok(window::build_window(self.query.low_mark, self.query.high_mark))
    }

    /// true when the requested window contains no row at all.
    pub fn window_is_empty(&self) -> bool {
        window::window_is_empty(self.query)
    }

    /// build the full parameter set for a list request.
    ///
    /// `Ok(None)` means the predicate is provably unsatisfiable and the
    /// result is empty without any request.
    pub fn build_params(&self) -> Result<Option<Params>, RestError> {
        let mut params = match predicate::build_filter_params(&self.resolver, self.query)? {
            Some(params) => params,
            None => return Ok(None),
        };
        projection::build_include_exclude(&self.resolver, self.query, self.schema)?
            .write_params(&mut params);
        window::build_sort_params(&self.resolver, &self.query.order_by, &mut params)?;
        if let Some(window) = self.window()? {
            window::write_window_params(&window, &mut params);
        }
        if self.resolver.saw_prefetch() {
            params.insert("filter_to_prefetch".to_owned(), vec!["true".to_owned()]);
        }
        Ok(Some(params))
    }

    /// parameters for addressing one row by key: projection only, no
    /// filters and no window.
    pub fn build_single_params(&self) -> Result<Params, RestError> {
        let mut params = Params::new();
        projection::build_include_exclude(&self.resolver, self.query, self.schema)?
            .write_params(&mut params);
        Ok(params)
    }

    /// the exact primary keys the predicate selects, when they are knowable
    /// without a request.
    pub fn static_primary_keys(&self) -> Result<Option<BTreeSet<Pk>>, RestError> {
        predicate::resolve_primary_keys(&self.resolver, self.query, self.schema)
    }

    /// true when the predicate constrains the root primary key at all.
    pub fn targets_primary_key(&self) -> Result<bool, RestError> {
        predicate::references_primary_key(&self.resolver, self.query, self.schema)
    }
}
