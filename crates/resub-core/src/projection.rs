//! Field projection over JSON payloads.
//!
//! A subscription may ask for a subset of the resource body using dot paths
//! (`metadata.size`) and named fragments. Fragments are resolved once, when
//! the subscription is created, into a flat list of unique paths.
//!
//! Inside `fields`, an entry of the form `...name` references the fragment
//! `name` and is replaced by its paths at that position. Fragments that are
//! not referenced are appended in declaration order.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

/// Named, reusable lists of field paths.
pub type Fragments = IndexMap<String, Vec<String>>;

const FRAGMENT_SPREAD: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldSelectionError {
    #[error("invalid field path `{0}`")]
    InvalidPath(String),

    #[error("unknown fragment `{0}`")]
    UnknownFragment(String),

    #[error("fragment `{0}` collides with an explicit field")]
    FragmentCollision(String),
}

/// Flatten explicit fields and fragments into one list of unique paths.
///
/// Returns `Ok(None)` when nothing was selected, meaning "full payload".
pub fn resolve_fields(
    fields: Option<&[String]>,
    fragments: Option<&Fragments>,
) -> Result<Option<Vec<String>>, FieldSelectionError> {
    let fields = fields.unwrap_or_default();
    let empty = Fragments::new();
    let fragments = fragments.unwrap_or(&empty);

    for name in fragments.keys() {
        if name.is_empty() {
            return Err(FieldSelectionError::UnknownFragment(name.clone()));
        }
        if fields.iter().any(|f| f == name) {
            return Err(FieldSelectionError::FragmentCollision(name.clone()));
        }
    }

    let mut resolved = Vec::new();
    let mut seen = HashSet::new();
    let mut used_fragments = HashSet::new();

    let mut push = |path: &str, resolved: &mut Vec<String>| -> Result<(), FieldSelectionError> {
        validate_path(path)?;
        if seen.insert(path.to_string()) {
            resolved.push(path.to_string());
        }
        Ok(())
    };

    for field in fields {
        if let Some(name) = field.strip_prefix(FRAGMENT_SPREAD) {
            let paths = fragments
                .get(name)
                .ok_or_else(|| FieldSelectionError::UnknownFragment(name.to_string()))?;
            used_fragments.insert(name);
            for path in paths {
                push(path, &mut resolved)?;
            }
        } else {
            push(field, &mut resolved)?;
        }
    }

    for (name, paths) in fragments {
        if used_fragments.contains(name.as_str()) {
            continue;
        }
        for path in paths {
            push(path, &mut resolved)?;
        }
    }

    if resolved.is_empty() {
        Ok(None)
    } else {
        Ok(Some(resolved))
    }
}

fn validate_path(path: &str) -> Result<(), FieldSelectionError> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(FieldSelectionError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Reduce `payload` to the given dot paths.
///
/// Missing paths, and paths that run through a non-object value, are left out.
/// Paths sharing a prefix are merged into one nested object. An empty `fields`
/// list returns the payload unchanged.
pub fn project(payload: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return payload.clone();
    }

    let mut projected = Value::Object(Map::new());
    for path in fields {
        if let Some(value) = get_path(payload, path) {
            insert_path(&mut projected, path, value.clone());
        }
    }
    projected
}

/// Look up a dot path.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |node, key| node.as_object()?.get(key))
}

/// Mutable variant of [`get_path`].
pub fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .try_fold(value, |node, key| node.as_object_mut()?.get_mut(key))
}

fn insert_path(target: &mut Value, path: &str, value: Value) {
    let mut keys = path.split('.').peekable();
    let mut node = target;

    while let Some(key) = keys.next() {
        let Some(object) = node.as_object_mut() else {
            return;
        };
        if keys.peek().is_none() {
            object.insert(key.to_string(), value);
            return;
        }
        node = object
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
