//! Request handlers

pub mod comparisons;
pub mod documents;
pub mod health;
