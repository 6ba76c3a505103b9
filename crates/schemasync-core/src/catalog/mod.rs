//! Schema catalog.
//!
//! Tables, columns and foreign-key relations, plus the validated
//! [`SchemaModel`] every lifecycle operation is handed.

mod column;
mod relation;
mod schema;
mod table;
mod types;

pub use crate::error::SchemaError;
pub use column::ColumnDef;
pub use relation::RelationDef;
pub use schema::{SchemaBuilder, SchemaModel};
pub use table::TableDef;
pub use types::ColumnKind;
