use thiserror::Error;

use crate::marks::MarkType;
use crate::EditorId;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("mark type `{mark}` is not registered in the document schema")]
    Schema { mark: MarkType },
    #[error("range {from}..{to} is outside the document (size {size})")]
    InvalidRange { from: usize, to: usize, size: usize },
    #[error("range {from}..{to} does not lie inside a single text block")]
    RangeSpansBlocks { from: usize, to: usize },
    #[error("range {from}..{to} overlaps the longer highlight `{existing}`")]
    ShadowedHighlight {
        from: usize,
        to: usize,
        existing: String,
    },
    #[error("selection is empty")]
    EmptySelection,
    #[error("no open editor with id {0}")]
    UnknownEditor(EditorId),
    #[error("failed to decode document: {0}")]
    Decode(String),
}
