//! Script verification, signature hashing and input signing.

pub mod interpreter;
pub mod opcodes;
mod secp;
pub mod sighash;
pub mod sign;
pub mod standard;
