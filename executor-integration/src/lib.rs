//! Transport-agnostic channel and snapshot primitives used to wire the Hub
//! Client, Notifier Hub and Trade Queue together (`spec.md` §2 data flow).
//!
//! Nothing in this crate knows about signals, trades or exchanges: it only
//! supplies the plumbing (an unbounded mpsc wrapper with a uniform `Tx` trait,
//! and a `Snapshot<T>` newtype used by the State Store) that the higher crates
//! build on.

/// [`Tx`]/[`UnboundedRx`] channel wrapper used for every internal queue.
pub mod channel;

/// [`IntegrationError`] — the crate's single fallible-operation currency.
pub mod error;

/// [`Snapshot`] newtype, used by the State Store to tag a loaded/persisted value.
pub mod snapshot;

pub use channel::{Channel, Tx, UnboundedRx, UnboundedTx};
pub use error::IntegrationError;
pub use snapshot::Snapshot;

/// Marker for errors that can never succeed on retry (e.g. a closed channel).
///
/// Mirrors the teacher's `Unrecoverable` trait: callers use it to decide
/// whether a failure is worth logging-and-continuing or should propagate.
pub trait Unrecoverable {
    fn is_unrecoverable(&self) -> bool;
}
