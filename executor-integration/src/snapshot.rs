use derive_more::{Constructor, From};
use serde::{Deserialize, Serialize};

/// A value loaded from, or about to be written to, durable storage.
///
/// Wrapping persisted values in `Snapshot` keeps "this came from the State
/// Store" distinct at the type level from "this is the live in-memory value",
/// per `spec.md` §9's "prototype-restoration" design note: a snapshot carries
/// its own schema instead of needing class identity re-attached after load.
#[derive(
    Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor, From,
)]
pub struct Snapshot<T>(pub T);

impl<T> Snapshot<T> {
    pub fn value(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    pub fn map<F, N>(self, op: F) -> Snapshot<N>
    where
        F: FnOnce(T) -> N,
    {
        Snapshot(op(self.0))
    }
}
