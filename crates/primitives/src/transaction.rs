//! Transaction types and serialization.
//!
//! Transactions carry their own timestamp (`time`) between the version and the inputs.
//! The timestamp takes part in the txid, in signature hashing and in coin-age accounting.

use beand_consensus::constants::LOCKTIME_THRESHOLD;
use beand_consensus::money::{checked_money_add, Amount};
use beand_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const CURRENT_TX_VERSION: i32 = 1;
pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            prevout: OutPoint::consensus_decode(decoder)?,
            script_sig: decoder.read_var_bytes()?,
            sequence: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// Zero value with an empty script. Marks coinstake and proof-of-stake coinbase slots.
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            value: decoder.read_i64_le()?,
            script_pubkey: decoder.read_var_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode_vec())
    }

    pub fn consensus_encode_vec(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.estimated_size());
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode_vec().len()
    }

    fn estimated_size(&self) -> usize {
        let inputs: usize = self.vin.iter().map(|i| 41 + i.script_sig.len()).sum();
        let outputs: usize = self.vout.iter().map(|o| 9 + o.script_pubkey.len()).sum();
        16 + inputs + outputs
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// First input spends a real output, at least two outputs, and the first output is empty.
    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    /// Sum of output values; `None` when an output or a partial sum leaves the money range.
    pub fn value_out(&self) -> Option<Amount> {
        self.vout
            .iter()
            .try_fold(0, |acc: Amount, out| checked_money_add(acc, out.value))
    }

    pub fn is_final(&self, height: i32, block_time: u32) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let threshold = if self.lock_time < LOCKTIME_THRESHOLD {
            height.max(0) as u32
        } else {
            block_time
        };
        if self.lock_time < threshold {
            return true;
        }
        self.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.time);
        encoder.write_vec(&self.vin);
        encoder.write_vec(&self.vout);
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            time: decoder.read_u32_le()?,
            vin: decoder.read_vec()?,
            vout: decoder.read_vec()?,
            lock_time: decoder.read_u32_le()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};

    fn spend(prev: u8, index: u32) -> TxIn {
        TxIn::new(
            OutPoint {
                hash: [prev; 32],
                index,
            },
            vec![0x51],
        )
    }

    #[test]
    fn time_is_serialized_after_version() {
        let tx = Transaction {
            version: 1,
            time: 0x0a0b_0c0d,
            vin: vec![],
            vout: vec![],
            lock_time: 0,
        };
        let bytes = encode(&tx);
        assert_eq!(bytes, vec![1, 0, 0, 0, 0x0d, 0x0c, 0x0b, 0x0a, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode::<Transaction>(&bytes).expect("decode"), tx);
    }

    #[test]
    fn coinstake_shape() {
        let mut tx = Transaction {
            version: 1,
            time: 100,
            vin: vec![spend(1, 0)],
            vout: vec![
                TxOut::empty(),
                TxOut {
                    value: 5,
                    script_pubkey: vec![0x51],
                },
            ],
            lock_time: 0,
        };
        assert!(tx.is_coinstake());
        assert!(!tx.is_coinbase());

        tx.vout[0].value = 1;
        assert!(!tx.is_coinstake());
    }

    #[test]
    fn value_out_rejects_overflow() {
        let tx = Transaction {
            version: 1,
            time: 0,
            vin: vec![spend(1, 0)],
            vout: vec![
                TxOut {
                    value: beand_consensus::money::MAX_MONEY,
                    script_pubkey: vec![],
                },
                TxOut {
                    value: 1,
                    script_pubkey: vec![],
                },
            ],
            lock_time: 0,
        };
        assert_eq!(tx.value_out(), None);
    }

    #[test]
    fn lock_time_finality() {
        let mut tx = Transaction {
            version: 1,
            time: 0,
            vin: vec![spend(2, 1)],
            vout: vec![],
            lock_time: 50,
        };
        tx.vin[0].sequence = 0;
        assert!(!tx.is_final(50, 0));
        assert!(tx.is_final(51, 0));
        tx.vin[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final(10, 0));
    }
}
