//! Projection compilation: turn the selected columns into `include[]` and
//! `exclude[]` parameters.
//!
//! The api defaults to returning every field, so each touched resource gets
//! a wildcard exclude and every wanted field an explicit include. Primary
//! keys are always included: reassembly needs them to tie the embedded
//! collections back together.

use std::{collections::BTreeSet, sync::Arc};

use crate::{error::RestError, query::Query, schema::RestSchema};

use super::{
    alias::{ancestors, Alias, AliasResolver},
    predicate::Params,
};

/// The computed projection parameters. Sets keep the wire order
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeExclude {
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
}

impl IncludeExclude {
    pub fn write_params(&self, params: &mut Params) {
        if !self.exclude.is_empty() {
            params.insert(
                "exclude[]".to_owned(),
                self.exclude.iter().cloned().collect(),
            );
        }
        if !self.include.is_empty() {
            params.insert(
                "include[]".to_owned(),
                self.include.iter().cloned().collect(),
            );
        }
    }
}

/// dotted path of an alias relative to the root, empty for the root itself.
fn alias_prefix(alias: &Arc<Alias>) -> String {
    ancestors(alias)
        .iter()
        .filter_map(|a| a.attrname.clone())
        .collect::<Vec<_>>()
        .join(".")
}

/// compute the include and exclude sets for the selected columns.
pub fn build_include_exclude(
    resolver: &AliasResolver<'_>,
    query: &Query,
    schema: &RestSchema,
) -> Result<IncludeExclude, RestError> {
    let mut include = BTreeSet::new();
    let mut exclude = BTreeSet::new();
    // relation paths must not survive as includes of their own, only their
    // fields do
    let mut bases = BTreeSet::new();
    let mut touched: BTreeSet<String> = BTreeSet::new();
    let mut aliases: Vec<Arc<Alias>> = Vec::new();

    for col in &query.select {
        let (alias, name) = resolver.resolve_path(col)?;
        let prefix = alias_prefix(&alias);
        include.insert(if prefix.is_empty() {
            name
        } else {
            format!("{}.{}", prefix, name)
        });
        for ancestor in ancestors(&alias) {
            let key = alias_prefix(&ancestor);
            if touched.insert(key) {
                aliases.push(ancestor);
            }
        }
    }
    if touched.is_empty() {
        // nothing selected, still scope the response down to the root keys
        if let Some(base) = resolver.aliases().values().find(|a| a.is_root()) {
            aliases.push(Arc::clone(base));
        }
    }

    for alias in aliases {
        let prefix = alias_prefix(&alias);
        let model = schema.model(&alias.model)?;
        let pk = model.storage_name(&model.primary_key);
        if prefix.is_empty() {
            exclude.insert("*".to_owned());
            include.insert(pk.to_owned());
        } else {
            exclude.insert(format!("{}.*", prefix));
            include.insert(format!("{}.{}", prefix, pk));
            bases.insert(prefix);
        }
    }

    include = include.difference(&bases).cloned().collect();
    Ok(IncludeExclude { include, exclude })
}
