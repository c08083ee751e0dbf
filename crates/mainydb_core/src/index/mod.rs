//! Secondary indexes.

mod engine;
mod key;

pub use engine::{Index, IndexDef, IndexKind, IndexSet, ID_INDEX};
pub use key::{DocId, IndexKey};
