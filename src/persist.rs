//! The persistence contract (spec.md §6, "Persistence hook"): the minimum
//! surface the scheduler requires from a work item a host application wants
//! to serialize. The JSON format and type-code registry themselves are out
//! of scope (spec.md §1) — this module specifies only the trait a
//! persistable work item implements and the export side of the two bulk
//! operations spec.md §6 names. The re-insert side
//! (`Scheduler::bulk_import`) lives on `Scheduler` itself, since it needs no
//! persistence-specific types — it is exactly `call_at` applied in order.

use std::collections::BTreeMap;

use crate::error::FritterError;
use crate::time::TimeValue;
use crate::work::Invocable;

/// A primitive leaf value a [`PersistableWork`] item encodes itself into.
/// Deliberately not `serde_json::Value`: the contract asks for "primitive
/// leaves", and pulling in a JSON value type for a contract-only trait would
/// carry more than this crate requires (the JSON format itself is an
/// external collaborator).
#[derive(Debug, Clone, PartialEq)]
pub enum PersistValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// The minimum surface a work item must provide to be persisted: a stable
/// type-code string plus a flat key-value encoding. Deserialization is a
/// free function the host application's type-code registry supplies
/// ([`decode`] below is the shape that registry entry takes), since
/// reconstructing a `Box<dyn Invocable>` from a type code generally needs
/// caller-supplied context (database handles, service clients) that this
/// crate has no business owning.
pub trait PersistableWork: Invocable {
    /// A stable identifier for this work item's concrete type, used to pick
    /// the matching decoder out of the host's registry. Must not change
    /// across versions of the persisted format.
    fn type_code(&self) -> &'static str;

    /// A flat encoding of this item's state, primitive leaves only.
    fn encode(&self) -> BTreeMap<String, PersistValue>;
}

/// The signature a type-code registry entry has: given the encoded map and
/// caller-supplied context `Ctx`, reconstruct the boxed work item. The
/// registry itself (a `type_code -> decoder` table) is the host
/// application's concern; this crate only names the shape.
pub type Decoder<Ctx> =
    fn(&BTreeMap<String, PersistValue>, &Ctx) -> Result<Box<dyn Invocable>, FritterError>;

/// One exported row: a live call's deadline, the type code its work item
/// reports, and its encoding. Canceled records are never produced by a live
/// scheduler, so there is nothing to omit here by construction — the
/// contract's "canceled records are omitted" is satisfied for free by only
/// ever walking the queue's live contents.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedCall<T: TimeValue> {
    pub deadline: T,
    pub type_code: &'static str,
    pub payload: BTreeMap<String, PersistValue>,
}

/// Encodes every live call in `items` (already in `(deadline,
/// original-insertion-order)` order, as a `Scheduler`'s own iteration would
/// produce) into the wire-agnostic [`PersistedCall`] shape a persistence
/// layer can hand to its own JSON/KV writer.
pub fn export_calls<T, W>(items: impl IntoIterator<Item = (T, W)>) -> Vec<PersistedCall<T>>
where
    T: TimeValue,
    W: PersistableWork,
{
    items
        .into_iter()
        .map(|(deadline, work)| PersistedCall {
            deadline,
            type_code: work.type_code(),
            payload: work.encode(),
        })
        .collect()
}
