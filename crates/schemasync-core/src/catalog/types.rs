//! Column data kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Data kinds every backend is expected to support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Short UTF-8 string.
    String,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit floating point.
    Float,
    /// Boolean.
    Boolean,
    /// Calendar date.
    Date,
    /// Unbounded UTF-8 text.
    LargeText,
}

impl ColumnKind {
    /// Check if this kind is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Integer | ColumnKind::Float)
    }

    /// Check if this kind holds text.
    pub fn is_text(&self) -> bool {
        matches!(self, ColumnKind::String | ColumnKind::LargeText)
    }

    /// Check if values of this kind can match values of `other`.
    pub fn is_compatible(&self, other: ColumnKind) -> bool {
        *self == other || (self.is_text() && other.is_text())
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::String => write!(f, "string"),
            ColumnKind::Integer => write!(f, "integer"),
            ColumnKind::Float => write!(f, "float"),
            ColumnKind::Boolean => write!(f, "boolean"),
            ColumnKind::Date => write!(f, "date"),
            ColumnKind::LargeText => write!(f, "large_text"),
        }
    }
}
