//! The capability catalog the compiler consumes instead of runtime model
//! reflection.
//!
//! For every field of every model the catalog answers: its storage name,
//! whether it is a relation, whether that relation is to-one or to-many, the
//! related model, and, for many-to-many relations, the auto-generated link
//! table carrying the association rows. The catalog is serde-deserializable
//! so callers may load it from configuration.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{error::RestError, value::Pk, value::ScalarType};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestSchema {
    pub models: IndexMap<String, ModelSchema>,
}

impl RestSchema {
    pub fn model(&self, name: &str) -> Result<&ModelSchema, RestError> {
        self.models
            .get(name)
            .ok_or_else(|| RestError::Schema(format!("the model {} is not in the catalog", name)))
    }

    /// for a link-table model, return both sides of the many-to-many
    /// relation it carries.
    pub fn many_to_many_sides(&self, through: &ModelSchema) -> Result<Vec<ThroughSide>, RestError> {
        let mut sides = Vec::new();
        for (fk_name, fk) in &through.fields {
            let related = match &fk.kind {
                FieldKind::ForeignKey { to } => self.model(to)?,
                _ => continue,
            };
            for (m2m_name, field) in &related.fields {
                if let FieldKind::ManyToMany {
                    through: Some(through_name),
                    ..
                } = &field.kind
                {
                    if through_name == &through.name {
                        sides.push(ThroughSide {
                            fk_field: fk_name.to_owned(),
                            related_model: related.name.to_owned(),
                            owning_field: m2m_name.to_owned(),
                        });
                        break;
                    }
                }
            }
        }
        if sides.is_empty() {
            return Err(RestError::Schema(format!(
                "can't find a many-to-many field using the link table {}",
                through.name
            )));
        }
        Ok(sides)
    }

    /// the owning many-to-many field reached when collapsing `through` onto
    /// the model owning the relation.
    pub fn owning_many_to_many(
        &self,
        through: &ModelSchema,
        owner_model: &str,
    ) -> Result<String, RestError> {
        self.many_to_many_sides(through)?
            .into_iter()
            .find(|side| side.related_model == owner_model)
            .map(|side| side.owning_field)
            .ok_or_else(|| {
                RestError::Schema(format!(
                    "the link table {} has no side owned by {}",
                    through.name, owner_model
                ))
            })
    }
}

/// one side of a many-to-many relation carried by a link table:
/// the foreign key on the link table, the model it points at, and the
/// many-to-many field declared on that model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughSide {
    pub fk_field: String,
    pub related_model: String,
    pub owning_field: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSchema {
    /// The model name, also the map key in the catalog
    pub name: String,
    /// Optional resource name override. Defaults to the lowercased model name
    pub resource_name: Option<String>,
    /// Optional plural resource name override. Defaults to the resource name plus an "s"
    pub resource_name_plural: Option<String>,
    /// Optional resource path override. Defaults to the singular resource name
    pub resource_path: Option<String>,
    /// The primary key field name
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    pub fields: IndexMap<String, FieldSchema>,
    /// true when this model stands for an auto-generated many-to-many link
    /// table which is not an addressable resource on the api
    #[serde(default)]
    pub link_table: bool,
}

fn default_primary_key() -> String {
    "id".to_owned()
}

impl ModelSchema {
    /// the JSON key under which rows of this model appear in request and
    /// response bodies.
    pub fn resource_name(&self, many: bool) -> String {
        let singular = self
            .resource_name
            .clone()
            .unwrap_or_else(|| self.name.to_lowercase());
        if many {
            self.resource_name_plural
                .clone()
                .unwrap_or_else(|| singular + "s")
        } else {
            singular
        }
    }

    /// the resource path relative to the base of the api, with the primary
    /// key appended when addressing a single row.
    pub fn resource_path(&self, pk: Option<&Pk>) -> String {
        let mut ret = self
            .resource_path
            .clone()
            .unwrap_or_else(|| self.resource_name(false));
        if let Some(pk) = pk {
            ret.push_str(&format!("/{}/", pk));
        }
        ret
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    /// the field matching a storage column, falling back to the attribute
    /// name for relation fields serialized under their declared name.
    pub fn field_by_storage_name<'a>(&'a self, column: &str) -> Option<(&'a str, &'a FieldSchema)> {
        self.fields
            .iter()
            .find(|(name, field)| field.column.as_deref().unwrap_or(name) == column)
            .map(|(name, field)| (name.as_str(), field))
    }

    /// the name under which a field's value is stored in the flat JSON
    /// representation.
    pub fn storage_name<'a>(&'a self, field_name: &'a str) -> &'a str {
        match self.field(field_name) {
            Some(field) => field.column.as_deref().unwrap_or(field_name),
            None => field_name,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Optional storage column override. Defaults to the field name
    pub column: Option<String>,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldSchema {
    pub fn scalar(scalar: ScalarType) -> Self {
        FieldSchema {
            column: None,
            kind: FieldKind::Scalar { scalar },
        }
    }

    pub fn foreign_key(to: &str) -> Self {
        FieldSchema {
            column: None,
            kind: FieldKind::ForeignKey { to: to.to_owned() },
        }
    }

    pub fn many_to_many(to: &str, through: Option<&str>) -> Self {
        FieldSchema {
            column: None,
            kind: FieldKind::ManyToMany {
                to: to.to_owned(),
                through: through.map(str::to_owned),
            },
        }
    }

    pub const fn is_concrete(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Scalar { .. } | FieldKind::ForeignKey { .. } | FieldKind::File
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Scalar { scalar: ScalarType },
    ForeignKey { to: String },
    ManyToMany { to: String, through: Option<String> },
    File,
}
