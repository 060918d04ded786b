//! The Version Reflector (spec: §4.2).
//!
//! The Store is generic over `D`; this module is the one place that
//! knows how to read and write the version field declared by
//! [`crate::config::StoreConfig::version_field`] on an arbitrary `D`,
//! translating through the same `bson::Bson` structural path the
//! teacher's own BSON (de)serialization uses (`bson::to_bson`/
//! `bson::from_bson`, as in the teacher's
//! `change_stream/mod.rs::update_buffer`), rather than assuming the
//! in-language field name lines up with the stored name.

use std::any::{Any, TypeId};
use std::marker::PhantomData;

use bson::Bson;
use dashmap::DashMap;

use crate::document::Document;
use crate::error::{Result, StoreError};

/// The result of walking a document type's structure once at
/// registration time: whether the configured field name resolves to an
/// integer on this type. Cached per `TypeId` so later calls skip
/// re-validating and just round-trip through BSON.
#[derive(Debug, Clone, Copy)]
struct FieldDescriptor {
    confirmed_integer: bool,
}

/// Resolves and rewrites the version field on arbitrary document values.
///
/// One `VersionReflector` is shared by a `Store<D>` instance; the
/// descriptor cache lets concurrent callers resolve the same `D` without
/// repeating the structural walk (spec: "caches the located field
/// descriptor keyed by the document type, and reuses it thereafter").
pub struct VersionReflector {
    field: String,
    descriptors: DashMap<TypeId, FieldDescriptor>,
}

impl VersionReflector {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descriptors: DashMap::new(),
        }
    }

    /// Read the current version of `doc`.
    ///
    /// Fails with [`StoreError::VersionFieldMissing`] if the configured
    /// field is absent or not integer-typed the first time this `D` is
    /// seen; the Store propagates this as a configuration error (spec:
    /// §4.2).
    pub fn get_version<D: Document + Any>(&self, doc: &D) -> Result<i64> {
        let bson = bson::to_bson(doc).map_err(|e| {
            StoreError::ValidationError(format!("document is not structurally serializable: {e}"))
        })?;
        let value = self.field_value(&bson)?;
        let version = value
            .as_i64()
            .or_else(|| value.as_i32().map(i64::from))
            .ok_or_else(|| StoreError::VersionFieldMissing {
                field: self.field.clone(),
            })?;
        self.remember::<D>(true);
        Ok(version)
    }

    /// Return a clone of `doc` with the version field set to `new_version`.
    ///
    /// All other fields are preserved verbatim: the rewrite goes
    /// through a full BSON round-trip (serialize, patch one field,
    /// deserialize) rather than attempting partial mutation, so the
    /// Store never needs per-type setters.
    pub fn set_version<D: Document + Any>(&self, doc: &D, new_version: i64) -> Result<D> {
        let mut bson = bson::to_bson(doc).map_err(|e| {
            StoreError::ValidationError(format!("document is not structurally serializable: {e}"))
        })?;
        match &mut bson {
            Bson::Document(map) => {
                map.insert(self.field.clone(), Bson::Int64(new_version));
            }
            _ => {
                return Err(StoreError::ValidationError(
                    "document does not serialize to a BSON document".to_string(),
                ))
            }
        }
        let updated: D = bson::from_bson(bson).map_err(|e| {
            StoreError::ValidationError(format!("failed to rebuild document after version rewrite: {e}"))
        })?;
        self.remember::<D>(true);
        Ok(updated)
    }

    /// Validate, without rewriting, that `D` declares the version field
    /// (used by `Create` per spec: "ValidationError if the version
    /// field is unset by configuration").
    pub fn ensure_declared<D: Document + Any>(&self, doc: &D) -> Result<()> {
        self.get_version(doc).map(|_| ())
    }

    fn field_value<'a>(&self, bson: &'a Bson) -> Result<&'a Bson> {
        match bson {
            Bson::Document(map) => map.get(&self.field).ok_or_else(|| StoreError::VersionFieldMissing {
                field: self.field.clone(),
            }),
            _ => Err(StoreError::ValidationError(
                "document does not serialize to a BSON document".to_string(),
            )),
        }
    }

    fn remember<D: Any>(&self, confirmed_integer: bool) {
        self.descriptors
            .entry(TypeId::of::<D>())
            .or_insert(FieldDescriptor { confirmed_integer });
    }
}

/// Typed convenience wrapper binding a [`VersionReflector`] to one `D`,
/// used internally by `Store<D>` so call sites don't repeat turbofish.
pub(crate) struct TypedReflector<D> {
    inner: VersionReflector,
    _marker: PhantomData<fn() -> D>,
}

impl<D: Document + Any> TypedReflector<D> {
    pub(crate) fn new(field: impl Into<String>) -> Self {
        Self {
            inner: VersionReflector::new(field),
            _marker: PhantomData,
        }
    }

    pub(crate) fn get(&self, doc: &D) -> Result<i64> {
        self.inner.get_version(doc)
    }

    pub(crate) fn set(&self, doc: &D, new_version: i64) -> Result<D> {
        self.inner.set_version(doc, new_version)
    }

    pub(crate) fn ensure_declared(&self, doc: &D) -> Result<()> {
        self.inner.ensure_declared(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        id: String,
        version: i64,
        name: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct NoVersion {
        id: String,
    }

    #[test]
    fn reads_and_writes_version() {
        let reflector = VersionReflector::new("version");
        let w = Widget {
            id: "a".into(),
            version: 3,
            name: "bolt".into(),
        };
        assert_eq!(reflector.get_version(&w).unwrap(), 3);
        let bumped = reflector.set_version(&w, 4).unwrap();
        assert_eq!(bumped.version, 4);
        assert_eq!(bumped.name, "bolt");
        assert_eq!(bumped.id, "a");
    }

    #[test]
    fn missing_field_is_an_error() {
        let reflector = VersionReflector::new("version");
        let w = NoVersion { id: "a".into() };
        let err = reflector.get_version(&w).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[test]
    fn honors_a_differently_named_field() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Clocked {
            id: String,
            vector_clock: i64,
        }
        let reflector = VersionReflector::new("vector_clock");
        let c = Clocked {
            id: "a".into(),
            vector_clock: 1,
        };
        assert_eq!(reflector.get_version(&c).unwrap(), 1);
    }
}
