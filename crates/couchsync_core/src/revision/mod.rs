//! Revision model: ids, documents and per-document revision trees.

mod document;
mod rev_id;
mod tree;

pub use document::{
    Attachment, DocumentBody, DocumentRevision, Encoding, IncomingAttachment,
    UnsavedAttachment, attachment_key,
};
pub use rev_id::RevisionId;
pub use tree::{RevisionTree, pick_winner};
