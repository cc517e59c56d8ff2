//! Relation graph: which fields mirror which, derived from schema metadata.

use std::collections::BTreeMap;

use tether_core::{Cardinality, FieldType, Schema, TetherError, TetherResult};

/// The mirrored side of a relational field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OppositeSide {
    pub collection: String,
    pub field: String,
    pub cardinality: Cardinality,
}

/// One relational field, annotated with where its back-reference lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationEdge {
    pub collection: String,
    pub field: String,
    /// This side's cardinality.
    pub cardinality: Cardinality,
    pub opposite: OppositeSide,
}

/// Relational fields per collection.
///
/// Built once from a [`Schema`]. Fields without a link config never appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationGraph {
    edges: BTreeMap<String, Vec<RelationEdge>>,
}

impl RelationGraph {
    /// Resolve every link config in `schema`.
    ///
    /// Fails when a link points at an unknown collection or field
    /// (`NotFound`), or when a declared cardinality contradicts the field type
    /// (`Validation`).
    pub fn resolve(schema: &Schema) -> TetherResult<Self> {
        let mut edges: BTreeMap<String, Vec<RelationEdge>> = BTreeMap::new();

        for collection in schema.collections() {
            for decl in collection.relational_fields() {
                let Some(link) = &decl.link else { continue };

                check_cardinality(&collection.name, &decl.name, decl.field_type, link.cardinality)?;

                let target = schema.collection(&link.collection).ok_or_else(|| {
                    TetherError::not_found(format!(
                        "`{}.{}` links to unknown collection `{}`",
                        collection.name, decl.name, link.collection
                    ))
                })?;
                let mirror = target.get(&link.related_field).ok_or_else(|| {
                    TetherError::not_found(format!(
                        "`{}.{}` links to unknown field `{}.{}`",
                        collection.name, decl.name, link.collection, link.related_field
                    ))
                })?;

                let opposite_cardinality = match &mirror.link {
                    Some(back) => {
                        check_cardinality(&target.name, &mirror.name, mirror.field_type, back.cardinality)?;
                        back.cardinality
                    }
                    None => mirror.field_type.cardinality(),
                };

                edges.entry(collection.name.clone()).or_default().push(RelationEdge {
                    collection: collection.name.clone(),
                    field: decl.name.clone(),
                    cardinality: link.cardinality,
                    opposite: OppositeSide {
                        collection: target.name.clone(),
                        field: mirror.name.clone(),
                        cardinality: opposite_cardinality,
                    },
                });
            }
        }

        Ok(Self { edges })
    }

    /// Relational fields of `collection`, in declaration order.
    pub fn edges(&self, collection: &str) -> &[RelationEdge] {
        self.edges.get(collection).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge(&self, collection: &str, field: &str) -> Option<&RelationEdge> {
        self.edges(collection).iter().find(|e| e.field == field)
    }

    /// Collections that declare at least one relational field.
    pub fn linked_collections(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

fn check_cardinality(
    collection: &str,
    field: &str,
    field_type: FieldType,
    cardinality: Cardinality,
) -> TetherResult<()> {
    let ok = match cardinality {
        Cardinality::Many => field_type == FieldType::Array,
        Cardinality::One => matches!(field_type, FieldType::Id | FieldType::String),
    };
    if ok {
        Ok(())
    } else {
        Err(TetherError::validation(format!(
            "`{collection}.{field}` declared {cardinality:?} but typed {field_type:?}"
        )))
    }
}
