//! Data models for chryso.

pub mod query;

pub use query::{RowSet, SqlParam};
