//! Script handling: statement splitting and statement identity.
mod tokenizer;

pub use tokenizer::*;

use sha2::{Digest, Sha256};

/// Content hash identifying a statement in the bookkeeping tables.
pub fn statement_hash(statement: &str) -> String {
    hex::encode(Sha256::digest(statement.as_bytes()))
}
