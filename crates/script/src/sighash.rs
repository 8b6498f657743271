//! Legacy signature hashing.
//!
//! The signed preimage is the transaction serialization (timestamp included) with every
//! input script blanked except the one being signed, which carries the script code. The
//! sighash type selects which inputs and outputs are committed to.

use beand_consensus::Hash256;
use beand_primitives::encoding::{Encodable, Encoder};
use beand_primitives::hash::sha256d;
use beand_primitives::transaction::Transaction;

use crate::opcodes::{Instructions, OP_CODESEPARATOR};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashError {
    InputIndexOutOfRange,
    MissingOutput,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
            SighashError::MissingOutput => write!(f, "no matching output for SIGHASH_SINGLE"),
        }
    }
}

impl std::error::Error for SighashError {}

pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }
    let hash_single = sighash_type.base_type() == SIGHASH_SINGLE;
    let hash_none = sighash_type.base_type() == SIGHASH_NONE;
    if hash_single && input_index >= tx.vout.len() {
        return Err(SighashError::MissingOutput);
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let script_code = strip_code_separators(script_code);

    let mut encoder = Encoder::with_capacity(tx.serialized_size() + script_code.len() + 4);
    encoder.write_i32_le(tx.version);
    encoder.write_u32_le(tx.time);

    let signing_inputs: Vec<usize> = if anyone_can_pay {
        vec![input_index]
    } else {
        (0..tx.vin.len()).collect()
    };
    encoder.write_varint(signing_inputs.len() as u64);
    for index in signing_inputs {
        let input = &tx.vin[index];
        input.prevout.consensus_encode(&mut encoder);
        let is_signing = index == input_index;
        if is_signing {
            encoder.write_var_bytes(&script_code);
        } else {
            encoder.write_varint(0);
        }
        if !is_signing && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.vout.len()
    };
    encoder.write_varint(output_count as u64);
    for (index, output) in tx.vout.iter().take(output_count).enumerate() {
        if hash_single && index != input_index {
            encoder.write_i64_le(-1);
            encoder.write_varint(0);
        } else {
            output.consensus_encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    Ok(sha256d(&encoder.into_inner()))
}

fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut ops = Instructions::new(script);
    loop {
        let start = ops.position();
        match ops.next() {
            None => break,
            Some(Ok(op)) if op.opcode == OP_CODESEPARATOR && op.data.is_none() => {}
            Some(Ok(_)) => out.extend_from_slice(&script[start..ops.position()]),
            Some(Err(_)) => {
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
    }
    out
}
