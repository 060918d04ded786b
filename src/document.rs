//! The document type the Store is generic over (spec: §3, §9 "Generic
//! document type").
//!
//! In target languages with static generics this is direct; here `D`
//! is any type satisfying [`Document`], and the version reflector
//! resolves the version field by structural introspection rather than
//! by requiring `D` to name it through a trait method, so user types
//! need no Store-specific boilerplate beyond the usual `serde` derive.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

/// Bound satisfied by any value the Store can manage.
///
/// The Store never retains a `D` beyond deep-copying it at interface
/// boundaries (spec I4), so `Clone` here is the deep-copy discipline:
/// implementors must not wrap shared mutable state (e.g. `Rc<RefCell<_>>`)
/// behind a shallow `Clone`.
pub trait Document: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Document for T where T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Bound satisfied by any id type a [`crate::db::Database`] collaborator
/// may hand back from `insertOne`/generate for a document.
pub trait Id: Clone + Debug + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Id for T where T: Clone + Debug + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static {}
