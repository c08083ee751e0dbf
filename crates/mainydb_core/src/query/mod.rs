//! Filter compilation and matching.

pub(crate) mod filter;
mod projection;

pub use filter::{ElemPredicate, FieldCond, Filter};
pub use projection::Projection;
