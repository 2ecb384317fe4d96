//! Database entity models

pub mod document;

pub use document::{
    ActiveModel as DocumentActiveModel, Column as DocumentColumn, DocumentState,
    Entity as DocumentEntity, Model as Document, Role,
};
