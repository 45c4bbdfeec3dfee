//! ElasticsearchCluster spec validation
//!
//! Structural checks that must pass before any convergence attempt. The
//! validator is pure and reports the first violation it finds.

use crate::crd::{ElasticsearchClusterSpec, NodePool, NodeRole};
use std::collections::HashSet;
use thiserror::Error;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// A structural problem in a cluster spec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("cluster version number must be specified")]
    MissingVersion,

    #[error("invalid role '{0}' specified. must be one of 'data', 'client' or 'master'")]
    InvalidRole(String),

    #[error("node pool '{0}': a non-stateful node pool cannot have persistence enabled")]
    PersistenceWithoutState(String),

    #[error("duplicate node pool name '{0}'")]
    DuplicatePool(String),

    #[error("{field}: {message}")]
    Field { field: String, message: String },
}

/// Validate a cluster spec, returning the first violation.
///
/// Version is checked first, then every node pool in declaration order, then
/// field-level constraints (names, replica bounds, quantities).
pub fn verify_cluster(spec: &ElasticsearchClusterSpec) -> Result<(), SpecError> {
    if spec.version.is_empty() {
        return Err(SpecError::MissingVersion);
    }

    for pool in &spec.node_pools {
        verify_node_pool(pool)?;
    }

    let mut seen = HashSet::new();
    for pool in &spec.node_pools {
        if !seen.insert(pool.name.as_str()) {
            return Err(SpecError::DuplicatePool(pool.name.clone()));
        }
    }

    if let Err(errors) = spec.validate() {
        if let Some(err) = first_field_error("spec", &errors) {
            return Err(err);
        }
    }

    Ok(())
}

/// Validate the roles and storage policy of a single node pool
pub fn verify_node_pool(pool: &NodePool) -> Result<(), SpecError> {
    for role in &pool.roles {
        if NodeRole::parse(role).is_none() {
            return Err(SpecError::InvalidRole(role.clone()));
        }
    }

    if let Some(state) = &pool.state {
        if !state.stateful && state.persistence.enabled {
            return Err(SpecError::PersistenceWithoutState(pool.name.clone()));
        }
    }

    Ok(())
}

/// Flatten nested `validator` errors down to the first leaf, with its path
fn first_field_error(path: &str, errors: &ValidationErrors) -> Option<SpecError> {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    fields.into_iter().find_map(|(field, kind)| {
        let path = format!("{}.{}", path, field);
        match kind {
            ValidationErrorsKind::Field(errs) => errs.first().map(|e| SpecError::Field {
                field: path,
                message: e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string()),
            }),
            ValidationErrorsKind::Struct(inner) => first_field_error(&path, inner),
            ValidationErrorsKind::List(items) => items
                .iter()
                .find_map(|(idx, inner)| first_field_error(&format!("{}[{}]", path, idx), inner)),
        }
    })
}
