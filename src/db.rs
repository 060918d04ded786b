//! The abstract database capability the Store depends on (spec: §6.2).
//!
//! This is the only surface the Store touches below itself; the wire
//! driver, connection pooling, and any concrete backing (MongoDB,
//! another document database, or a fake for tests) live entirely
//! behind this trait. Naming mirrors the teacher's own CRUD/aggregate
//! vocabulary (`insertOne`, `findOne`, `updateOne`, `findOneAndUpsert`,
//! `$changeStream`), generalized to be backend-agnostic.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::document::{Document, Id};
use crate::error::Result;
use crate::watch::RawChangeEvent;

/// A predicate identifying exactly one document by id and, for
/// CAS-guarded writes, by the version it was last read at.
#[derive(Debug, Clone)]
pub struct Predicate<K> {
    pub id: K,
    /// `Some(version)` for a CAS-guarded write; `None` for an
    /// unconditional match by id alone (e.g. a plain `Delete(id)` with
    /// no version supplied).
    pub expected_version: Option<i64>,
}

impl<K> Predicate<K> {
    pub fn by_id(id: K) -> Self {
        Self {
            id,
            expected_version: None,
        }
    }

    pub fn with_version(id: K, version: i64) -> Self {
        Self {
            id,
            expected_version: Some(version),
        }
    }
}

/// Field-level set/unset clauses derived from a [`crate::diff::Diff`]
/// plus the Store-added version bump (spec §4.4 step 5).
#[derive(Debug, Clone, Default)]
pub struct UpdateClauses {
    pub set: Vec<(String, bson::Bson)>,
    pub unset: Vec<String>,
}

/// Options controlling how a change stream is opened (spec §6.1
/// `watchFullDocument`, and the resume point).
#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOpenOptions {
    pub full_document: bool,
    pub resume_token: Option<bson::Bson>,
}

/// The abstract database capability required from the collaborator
/// (spec §6.2). One implementation is supplied per concrete backing;
/// `K` is that backing's id type and `D` the document type stored in a
/// given logical collection.
#[async_trait]
pub trait Database<K, D>: Send + Sync
where
    K: Id,
    D: Document,
{
    /// Insert `doc`, returning its assigned id.
    ///
    /// `writer_tag` is the calling `Store` instance's per-process write
    /// marker (spec §4.5 "External-origin policy"); a conforming
    /// implementation stamps it onto the change-feed event this
    /// mutation produces (`RawChangeEvent::writer_tag`) so the watch
    /// router can recognize the event as locally originated.
    ///
    /// Fails with a `StoreError` whose `kind()` is `AlreadyExists` on a
    /// duplicate id.
    async fn insert_one(&self, doc: &D, writer_tag: &str) -> Result<K>;

    /// Fetch the document with the given id.
    ///
    /// Fails with `kind() == NotFound` if absent.
    async fn find_one(&self, id: &K) -> Result<D>;

    /// Run `filter` against the collection. Lazy and finite; not
    /// restartable (spec: "FindMany... delegates to the DB").
    async fn find_many(&self, filter: bson::Document) -> Result<BoxStream<'static, Result<D>>>;

    /// Apply `clauses` to the document matched by `predicate`, stamping
    /// the produced change-feed event with `writer_tag` (see
    /// `insert_one`).
    ///
    /// Returns the number of documents matched (0 or 1, since
    /// `predicate` identifies at most one document). A `matched == 0`
    /// result when `predicate.expected_version` was set means the CAS
    /// check failed; the Store turns this into `VersionMismatch`.
    async fn update_one(&self, predicate: Predicate<K>, clauses: UpdateClauses, writer_tag: &str) -> Result<u64>;

    /// Replace the document matched by `predicate` with `doc` in full,
    /// stamping the produced change-feed event with `writer_tag` (see
    /// `insert_one`).
    async fn replace_one(&self, predicate: Predicate<K>, doc: &D, writer_tag: &str) -> Result<u64>;

    /// Delete the document matched by `predicate`, stamping the
    /// produced change-feed event with `writer_tag` (see `insert_one`).
    async fn delete_one(&self, predicate: Predicate<K>, writer_tag: &str) -> Result<u64>;

    /// Insert `doc` if its id is absent, or otherwise apply `clauses`
    /// to the existing document under the same CAS predicate as
    /// `update_one` (spec: `Upsert` "uses the DB's find-one-and-upsert
    /// primitive with version 1 on insert and the CAS predicate on
    /// match"). Stamps the produced change-feed event with
    /// `writer_tag` (see `insert_one`).
    async fn find_one_and_upsert(
        &self,
        predicate: Predicate<K>,
        doc: &D,
        clauses: UpdateClauses,
        writer_tag: &str,
    ) -> Result<D>;

    /// Open a change feed over this collection.
    ///
    /// Fails with `kind() == Fatal` wrapping a backend-specific
    /// "resume point invalid" signal if `options.resume_token` is
    /// beyond the backend's history window; the watch router treats
    /// that specific condition as a trigger for a `Resync` (spec
    /// §4.5).
    async fn open_change_stream(
        &self,
        pipeline: Vec<bson::Document>,
        options: ChangeStreamOpenOptions,
    ) -> Result<BoxStream<'static, Result<RawChangeEvent<K, D>>>>;
}
