//! The Diff Engine (spec: §4.3).
//!
//! Produces a minimal patch `Δ` from a before/after pair so writes can
//! be expressed compactly and auditably, operating on the same
//! `bson::Bson` intermediate representation the teacher crate uses for
//! every wire-level document. The engine never mutates its inputs and
//! its output ordering is deterministic (lexicographic by path) so
//! tests and audit logs are stable.

use std::collections::BTreeSet;

use bson::{Bson, Document as BsonDocument};

use crate::document::Document;
use crate::error::{Result, StoreError};

/// One field-path operation in a diff (spec: §3 `Diff Δ`).
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    /// Set the scalar, map, or whole-array value at `path`.
    Set { path: String, value: Bson },
    /// Remove the field at `path` entirely.
    Unset { path: String },
    /// Add `element` to the array at `path`.
    ArrayAdd { path: String, element: Bson },
    /// Remove the array element at `path` keyed by `element_key`.
    ArrayRemove { path: String, element_key: Bson },
    /// Recursively patch the array element at `path` keyed by
    /// `element_key` with the nested diff `inner`.
    ArrayUpdate {
        path: String,
        element_key: Bson,
        inner: Box<Diff>,
    },
}

impl DiffOp {
    fn sort_key(&self) -> &str {
        match self {
            DiffOp::Set { path, .. }
            | DiffOp::Unset { path }
            | DiffOp::ArrayAdd { path, .. }
            | DiffOp::ArrayRemove { path, .. }
            | DiffOp::ArrayUpdate { path, .. } => path,
        }
    }
}

/// A structural patch document: an ordered, deduplicated set of
/// field-path operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub ops: Vec<DiffOp>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn push_sorted(mut ops: Vec<DiffOp>) -> Self {
        ops.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
        Diff { ops }
    }
}

/// Compute the minimal diff between two documents of the same type.
///
/// `id_field` names the field used as a stable element identifier when
/// diffing arrays (spec §9 open question (a)); when an array's elements
/// are not all documents carrying that field, the whole array is
/// replaced with a single `Set`.
pub fn diff<D: Document>(before: &D, after: &D, id_field: &str) -> Result<Diff> {
    let before_bson = to_bson(before)?;
    let after_bson = to_bson(after)?;
    let mut ops = Vec::new();
    diff_values("", &before_bson, &after_bson, id_field, &mut ops);
    Ok(Diff::push_sorted(ops))
}

/// Apply `delta` to `before`, returning the patched document.
///
/// Used by tests and by callers that want to verify `apply(diff, pre)`
/// reproduces the post-image (spec P2/P4), and by audit tooling that
/// wants to replay a diff without re-running the original mutation.
pub fn apply<D: Document>(before: &D, delta: &Diff, id_field: &str) -> Result<D> {
    let mut bson = to_bson(before)?;
    for op in &delta.ops {
        apply_op(&mut bson, op, id_field);
    }
    bson::from_bson(bson)
        .map_err(|e| StoreError::ValidationError(format!("failed to rebuild document after apply: {e}")))
}

fn to_bson<D: Document>(doc: &D) -> Result<Bson> {
    bson::to_bson(doc)
        .map_err(|e| StoreError::ValidationError(format!("document is not structurally serializable: {e}")))
}

fn diff_values(path: &str, before: &Bson, after: &Bson, id_field: &str, ops: &mut Vec<DiffOp>) {
    if before == after {
        return;
    }

    match (before, after) {
        (Bson::Document(b), Bson::Document(a)) => diff_documents(path, b, a, id_field, ops),
        (Bson::Array(b), Bson::Array(a)) => diff_arrays(path, b, a, id_field, ops),
        _ => ops.push(DiffOp::Set {
            path: path.to_string(),
            value: after.clone(),
        }),
    }
}

fn diff_documents(path: &str, before: &BsonDocument, after: &BsonDocument, id_field: &str, ops: &mut Vec<DiffOp>) {
    let mut keys: BTreeSet<&str> = BTreeSet::new();
    keys.extend(before.keys().map(String::as_str));
    keys.extend(after.keys().map(String::as_str));

    for key in keys {
        let child_path = join_path(path, key);
        match (before.get(key), after.get(key)) {
            (Some(b), Some(a)) => diff_values(&child_path, b, a, id_field, ops),
            (Some(_), None) => ops.push(DiffOp::Unset { path: child_path }),
            (None, Some(a)) => ops.push(DiffOp::Set {
                path: child_path,
                value: a.clone(),
            }),
            (None, None) => unreachable!("key came from one of the two maps"),
        }
    }
}

fn diff_arrays(path: &str, before: &[Bson], after: &[Bson], id_field: &str, ops: &mut Vec<DiffOp>) {
    match (element_keys(before, id_field), element_keys(after, id_field)) {
        (Some(before_keyed), Some(after_keyed)) => {
            let before_keys: BTreeSet<&str> = before_keyed.iter().map(|(k, _, _)| k.as_str()).collect();
            let after_keys: BTreeSet<&str> = after_keyed.iter().map(|(k, _, _)| k.as_str()).collect();

            for (key, key_bson, _elem) in &before_keyed {
                if !after_keys.contains(key.as_str()) {
                    ops.push(DiffOp::ArrayRemove {
                        path: path.to_string(),
                        element_key: key_bson.clone(),
                    });
                }
            }
            for (key, _key_bson, elem) in &after_keyed {
                if !before_keys.contains(key.as_str()) {
                    ops.push(DiffOp::ArrayAdd {
                        path: path.to_string(),
                        element: elem.clone(),
                    });
                }
            }
            for (key, key_bson, after_elem) in &after_keyed {
                if let Some((_, _, before_elem)) = before_keyed.iter().find(|(k, _, _)| k == key) {
                    let mut inner_ops = Vec::new();
                    diff_values("", before_elem, after_elem, id_field, &mut inner_ops);
                    if !inner_ops.is_empty() {
                        ops.push(DiffOp::ArrayUpdate {
                            path: path.to_string(),
                            element_key: key_bson.clone(),
                            inner: Box::new(Diff::push_sorted(inner_ops)),
                        });
                    }
                }
            }
        }
        _ => ops.push(DiffOp::Set {
            path: path.to_string(),
            value: Bson::Array(after.to_vec()),
        }),
    }
}

/// If every element of `items` is a document carrying `id_field`,
/// return `(canonical_key_string, key_bson, element)` for each; `None`
/// if key-based diffing does not apply and the caller should fall back
/// to whole-array replacement. Elements are cloned up front so the
/// comparison loops above never juggle nested references.
fn element_keys(items: &[Bson], id_field: &str) -> Option<Vec<(String, Bson, Bson)>> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let doc = item.as_document()?;
        let key = doc.get(id_field)?;
        out.push((canonical_key(key), key.clone(), item.clone()));
    }
    Some(out)
}

/// A canonical string form of a BSON value suitable for use as an
/// equality key. `Bson` does not implement `Hash`/`Eq` (it wraps `f64`),
/// so array-element identifiers are compared through this string form
/// instead of being used directly as map keys.
fn canonical_key(value: &Bson) -> String {
    match value {
        Bson::String(s) => format!("s:{s}"),
        Bson::Int32(i) => format!("i:{i}"),
        Bson::Int64(i) => format!("i:{i}"),
        Bson::Double(f) => format!("f:{f}"),
        Bson::ObjectId(id) => format!("o:{id}"),
        Bson::Boolean(b) => format!("b:{b}"),
        other => format!("x:{other:?}"),
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn apply_op(root: &mut Bson, op: &DiffOp, id_field: &str) {
    match op {
        DiffOp::Set { path, value } => set_path(root, path, value.clone()),
        DiffOp::Unset { path } => unset_path(root, path),
        DiffOp::ArrayAdd { path, element } => {
            if let Some(Bson::Array(arr)) = get_path_mut(root, path) {
                arr.push(element.clone());
            }
        }
        DiffOp::ArrayRemove { path, element_key } => {
            if let Some(Bson::Array(arr)) = get_path_mut(root, path) {
                let target = canonical_key(element_key);
                arr.retain(|item| element_key_of(item, id_field).as_deref() != Some(target.as_str()));
            }
        }
        DiffOp::ArrayUpdate {
            path,
            element_key,
            inner,
        } => {
            if let Some(Bson::Array(arr)) = get_path_mut(root, path) {
                let target = canonical_key(element_key);
                for item in arr.iter_mut() {
                    if element_key_of(item, id_field).as_deref() == Some(target.as_str()) {
                        for nested in &inner.ops {
                            apply_op(item, nested, id_field);
                        }
                    }
                }
            }
        }
    }
}

fn element_key_of(item: &Bson, id_field: &str) -> Option<String> {
    item.as_document().and_then(|d| d.get(id_field)).map(canonical_key)
}

fn set_path(root: &mut Bson, path: &str, value: Bson) {
    if path.is_empty() {
        *root = value;
        return;
    }
    let parts: Vec<&str> = path.split('.').collect();
    let mut cursor = root;
    for (i, part) in parts.iter().enumerate() {
        if !matches!(cursor, Bson::Document(_)) {
            *cursor = Bson::Document(BsonDocument::new());
        }
        let Bson::Document(doc) = cursor else { unreachable!() };
        if i == parts.len() - 1 {
            doc.insert(*part, value);
            return;
        }
        cursor = doc.entry(part.to_string()).or_insert_with(|| Bson::Document(BsonDocument::new()));
    }
}

fn unset_path(root: &mut Bson, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cursor = root;
    for (i, part) in parts.iter().enumerate() {
        let Bson::Document(doc) = cursor else { return };
        if i == parts.len() - 1 {
            doc.remove(*part);
            return;
        }
        match doc.get_mut(*part) {
            Some(next) => cursor = next,
            None => return,
        }
    }
}

fn get_path_mut<'a>(root: &'a mut Bson, path: &str) -> Option<&'a mut Bson> {
    let mut cursor = root;
    for part in path.split('.') {
        cursor = match cursor {
            Bson::Document(doc) => doc.get_mut(part)?,
            _ => return None,
        };
    }
    Some(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        qty: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        version: i64,
        name: String,
        tags: Vec<String>,
        items: Vec<Item>,
    }

    fn sample() -> Doc {
        Doc {
            id: "1".into(),
            version: 1,
            name: "widget".into(),
            tags: vec!["a".into(), "b".into()],
            items: vec![
                Item { id: "x".into(), qty: 1 },
                Item { id: "y".into(), qty: 2 },
            ],
        }
    }

    #[test]
    fn identical_documents_have_no_diff() {
        let a = sample();
        let b = sample();
        let delta = diff(&a, &b, "id").unwrap();
        assert!(delta.is_empty());
    }

    #[test]
    fn scalar_change_emits_set() {
        let a = sample();
        let mut b = sample();
        b.name = "gadget".into();
        let delta = diff(&a, &b, "id").unwrap();
        assert_eq!(delta.ops.len(), 1);
        match &delta.ops[0] {
            DiffOp::Set { path, value } => {
                assert_eq!(path, "name");
                assert_eq!(value, &Bson::String("gadget".into()));
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn array_without_ids_replaces_whole_array() {
        let a = sample();
        let mut b = sample();
        b.tags.push("c".into());
        let delta = diff(&a, &b, "id").unwrap();
        assert_eq!(delta.ops.len(), 1);
        assert!(matches!(&delta.ops[0], DiffOp::Set { path, .. } if path == "tags"));
    }

    #[test]
    fn array_with_ids_diffs_element_by_element() {
        let a = sample();
        let mut b = sample();
        b.items[0].qty = 99;
        b.items.push(Item { id: "z".into(), qty: 5 });
        let delta = diff(&a, &b, "id").unwrap();
        assert_eq!(delta.ops.len(), 2);
        assert!(delta
            .ops
            .iter()
            .any(|op| matches!(op, DiffOp::ArrayUpdate { path, .. } if path == "items")));
        assert!(delta
            .ops
            .iter()
            .any(|op| matches!(op, DiffOp::ArrayAdd { path, .. } if path == "items")));
    }

    #[test]
    fn apply_reproduces_after_ignoring_version() {
        let a = sample();
        let mut b = sample();
        b.name = "gadget".into();
        b.items[1].qty = 42;
        let delta = diff(&a, &b, "id").unwrap();
        let patched: Doc = apply(&a, &delta, "id").unwrap();
        assert_eq!(patched.name, b.name);
        assert_eq!(patched.items, b.items);
    }

    #[test]
    fn diff_is_deterministically_ordered() {
        let a = sample();
        let mut b = sample();
        b.name = "gadget".into();
        b.tags.push("z".into());
        let d1 = diff(&a, &b, "id").unwrap();
        let d2 = diff(&a, &b, "id").unwrap();
        let paths1: Vec<&str> = d1.ops.iter().map(DiffOp::sort_key).collect();
        let paths2: Vec<&str> = d2.ops.iter().map(DiffOp::sort_key).collect();
        assert_eq!(paths1, paths2);
        let mut sorted = paths1.clone();
        sorted.sort();
        assert_eq!(paths1, sorted);
    }
}
