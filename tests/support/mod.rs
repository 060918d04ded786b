//! An in-memory `Database` fake used only by the integration tests in
//! this directory. Not part of the published crate: exercises the
//! `Database` contract (spec §6.2) well enough to drive the Store's
//! CAS loop and watch router without a real backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use docstore::{
    ChangeStreamOpenOptions, Database, Operation, Predicate, RawChangeEvent, Result, StoreError, UpdateClauses,
    VersionReflector,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDoc {
    pub id: String,
    pub version: i64,
    pub counter: i64,
    pub name: String,
}

struct Inner {
    docs: HashMap<String, TestDoc>,
    log: Vec<(i64, RawChangeEvent<String, TestDoc>)>,
    next_seq: i64,
    history_floor: i64,
    subscribers: Vec<mpsc::UnboundedSender<RawChangeEvent<String, TestDoc>>>,
    next_id: u64,
    /// When `Some(n)`, the next `n` CAS-guarded `update_one` calls
    /// report a phantom mismatch regardless of the supplied predicate,
    /// simulating an always-winning concurrent writer (spec E4).
    phantom_writer_rounds: u32,
}

/// An in-memory fake satisfying [`Database<String, TestDoc>`].
pub struct FakeDb {
    inner: AsyncMutex<Inner>,
    reflector: VersionReflector,
}

impl FakeDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: AsyncMutex::new(Inner {
                docs: HashMap::new(),
                log: Vec::new(),
                next_seq: 0,
                history_floor: 0,
                subscribers: Vec::new(),
                next_id: 1,
                phantom_writer_rounds: 0,
            }),
            reflector: VersionReflector::new("version"),
        })
    }

    /// Force the next `rounds` CAS-guarded updates to report zero
    /// matched, regardless of whether the caller's expected version is
    /// correct (spec E4: "retry exhaustion").
    pub async fn simulate_phantom_writer(&self, rounds: u32) {
        self.inner.lock().await.phantom_writer_rounds = rounds;
    }

    /// Mutate a stored document directly, bypassing the Store
    /// entirely, to simulate an external writer (spec E6).
    pub async fn write_externally(&self, id: &str, new_version: i64) {
        let mut inner = self.inner.lock().await;
        if let Some(doc) = inner.docs.get_mut(id) {
            doc.version = new_version;
            let event = RawChangeEvent {
                operation: Operation::Update,
                id: id.to_string(),
                data: Some(doc.clone()),
                resume_token: bson::Bson::Int64(inner.next_seq),
                writer_tag: None,
                timestamp: chrono::Utc::now(),
            };
            publish(&mut inner, event);
        }
    }

    async fn emit(
        &self,
        inner: &mut Inner,
        operation: Operation,
        id: String,
        data: Option<TestDoc>,
        writer_tag: Option<String>,
    ) {
        let event = RawChangeEvent {
            operation,
            id,
            data,
            resume_token: bson::Bson::Int64(inner.next_seq),
            writer_tag,
            timestamp: chrono::Utc::now(),
        };
        publish(inner, event);
    }
}

fn publish(inner: &mut Inner, event: RawChangeEvent<String, TestDoc>) {
    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.log.push((seq, event.clone()));
    inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
}

#[async_trait]
impl Database<String, TestDoc> for FakeDb {
    async fn insert_one(&self, doc: &TestDoc, writer_tag: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let id = if doc.id.is_empty() {
            let assigned = format!("doc-{}", inner.next_id);
            inner.next_id += 1;
            assigned
        } else {
            doc.id.clone()
        };
        if inner.docs.contains_key(&id) {
            return Err(StoreError::AlreadyExists { id: id.clone() });
        }
        let mut stored = doc.clone();
        stored.id = id.clone();
        inner.docs.insert(id.clone(), stored.clone());
        self.emit(&mut inner, Operation::Create, id.clone(), Some(stored), Some(writer_tag.to_string()))
            .await;
        Ok(id)
    }

    async fn find_one(&self, id: &String) -> Result<TestDoc> {
        let inner = self.inner.lock().await;
        inner
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })
    }

    async fn find_many(&self, filter: bson::Document) -> Result<BoxStream<'static, Result<TestDoc>>> {
        let inner = self.inner.lock().await;
        let matches: Vec<Result<TestDoc>> = inner
            .docs
            .values()
            .filter(|doc| matches_filter(doc, &filter))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(futures::stream::iter(matches)))
    }

    async fn update_one(&self, predicate: Predicate<String>, clauses: UpdateClauses, writer_tag: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.phantom_writer_rounds > 0 {
            inner.phantom_writer_rounds -= 1;
            return Ok(0);
        }
        let Some(current) = inner.docs.get(&predicate.id).cloned() else {
            return Ok(0);
        };
        if let Some(expected) = predicate.expected_version {
            let actual = self.reflector.get_version(&current)?;
            if actual != expected {
                return Ok(0);
            }
        }
        let patched = apply_clauses(&current, &clauses)?;
        inner.docs.insert(predicate.id.clone(), patched.clone());
        self.emit(&mut inner, Operation::Update, predicate.id, Some(patched), Some(writer_tag.to_string()))
            .await;
        Ok(1)
    }

    async fn replace_one(&self, predicate: Predicate<String>, doc: &TestDoc, writer_tag: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.docs.get(&predicate.id).cloned() else {
            return Ok(0);
        };
        if let Some(expected) = predicate.expected_version {
            if self.reflector.get_version(&current)? != expected {
                return Ok(0);
            }
        }
        let mut replacement = doc.clone();
        replacement.id = predicate.id.clone();
        inner.docs.insert(predicate.id.clone(), replacement.clone());
        self.emit(&mut inner, Operation::Replace, predicate.id, Some(replacement), Some(writer_tag.to_string()))
            .await;
        Ok(1)
    }

    async fn delete_one(&self, predicate: Predicate<String>, writer_tag: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.docs.get(&predicate.id).cloned() else {
            return Ok(0);
        };
        if let Some(expected) = predicate.expected_version {
            if self.reflector.get_version(&current)? != expected {
                return Ok(0);
            }
        }
        inner.docs.remove(&predicate.id);
        self.emit(&mut inner, Operation::Delete, predicate.id, None, Some(writer_tag.to_string()))
            .await;
        Ok(1)
    }

    async fn find_one_and_upsert(
        &self,
        predicate: Predicate<String>,
        doc: &TestDoc,
        clauses: UpdateClauses,
        writer_tag: &str,
    ) -> Result<TestDoc> {
        let mut inner = self.inner.lock().await;
        match inner.docs.get(&predicate.id).cloned() {
            None => {
                let mut stored = doc.clone();
                stored.id = predicate.id.clone();
                inner.docs.insert(predicate.id.clone(), stored.clone());
                self.emit(
                    &mut inner,
                    Operation::Create,
                    predicate.id,
                    Some(stored.clone()),
                    Some(writer_tag.to_string()),
                )
                .await;
                Ok(stored)
            }
            Some(current) => {
                if let Some(expected) = predicate.expected_version {
                    let actual = self.reflector.get_version(&current)?;
                    if actual != expected {
                        return Err(StoreError::VersionMismatch {
                            id: predicate.id.clone(),
                            expected,
                            found: Some(actual),
                        });
                    }
                }
                let patched = apply_clauses(&current, &clauses)?;
                inner.docs.insert(predicate.id.clone(), patched.clone());
                self.emit(
                    &mut inner,
                    Operation::Update,
                    predicate.id,
                    Some(patched.clone()),
                    Some(writer_tag.to_string()),
                )
                .await;
                Ok(patched)
            }
        }
    }

    async fn open_change_stream(
        &self,
        _pipeline: Vec<bson::Document>,
        options: ChangeStreamOpenOptions,
    ) -> Result<BoxStream<'static, Result<RawChangeEvent<String, TestDoc>>>> {
        let mut inner = self.inner.lock().await;
        let start_seq = match &options.resume_token {
            None => inner.history_floor,
            Some(token) => {
                let seq = token
                    .as_i64()
                    .ok_or_else(|| StoreError::ValidationError("resume token is not an integer".into()))?;
                if seq < inner.history_floor {
                    return Err(StoreError::ResumePointInvalid);
                }
                seq + 1
            }
        };

        let replay: Vec<Result<RawChangeEvent<String, TestDoc>>> = inner
            .log
            .iter()
            .filter(|(seq, _)| *seq >= start_seq)
            .map(|(_, event)| Ok(event.clone()))
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.push(tx);
        drop(inner);

        let live = tokio_stream::wrappers::UnboundedReceiverStream::new(rx).map(Ok);
        Ok(Box::pin(futures::stream::iter(replay).chain(live)))
    }
}

fn matches_filter(doc: &TestDoc, filter: &bson::Document) -> bool {
    if filter.is_empty() {
        return true;
    }
    let Ok(bson::Bson::Document(as_doc)) = bson::to_bson(doc) else {
        return false;
    };
    filter.iter().all(|(k, v)| as_doc.get(k) == Some(v))
}

fn apply_clauses(doc: &TestDoc, clauses: &UpdateClauses) -> Result<TestDoc> {
    let mut bson = bson::to_bson(doc)
        .map_err(|e| StoreError::ValidationError(format!("test document not serializable: {e}")))?;
    let bson::Bson::Document(map) = &mut bson else {
        return Err(StoreError::ValidationError("test document is not a map".into()));
    };
    for (path, value) in &clauses.set {
        map.insert(path.clone(), value.clone());
    }
    for path in &clauses.unset {
        map.remove(path);
    }
    bson::from_bson(bson).map_err(|e| StoreError::ValidationError(format!("failed to rebuild test document: {e}")))
}
