//! # safeline-shared
//!
//! Types shared by the store and client crates: identifiers, roles, the
//! persisted record schemas, well-known constants and the error taxonomy.

pub mod constants;
pub mod error;
pub mod records;
pub mod types;

pub use error::*;
pub use records::*;
pub use types::*;
