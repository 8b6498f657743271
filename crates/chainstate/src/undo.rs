//! Undo records: what a connected block took out of the ledger.
//!
//! Disconnecting a block puts these entries back. Records are written to the `rev` flat
//! files next to the block data and located through the block index.

use beand_primitives::encoding::{
    decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use beand_primitives::outpoint::OutPoint;

use crate::utxo::UtxoEntry;

const UNDO_FORMAT: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

impl Encodable for SpentOutput {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.outpoint.consensus_encode(encoder);
        encoder.write_var_bytes(&self.entry.encode());
    }
}

impl Decodable for SpentOutput {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let outpoint = OutPoint::consensus_decode(decoder)?;
        let entry = UtxoEntry::decode(&decoder.read_var_bytes()?)
            .map_err(|_| DecodeError::InvalidData("corrupt ledger entry in undo record"))?;
        Ok(Self { outpoint, entry })
    }
}

/// Ledger entries a connected block consumed, in spend order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub spent: Vec<SpentOutput>,
}

impl Encodable for BlockUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(UNDO_FORMAT);
        encoder.write_vec(&self.spent);
    }
}

impl Decodable for BlockUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        if decoder.read_u8()? != UNDO_FORMAT {
            return Err(DecodeError::InvalidData("unknown undo record format"));
        }
        Ok(Self {
            spent: decoder.read_vec()?,
        })
    }
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> BlockUndo {
        BlockUndo {
            spent: vec![SpentOutput {
                outpoint: OutPoint::new([6u8; 32], 3),
                entry: UtxoEntry {
                    value: 12,
                    script_pubkey: vec![0x51],
                    height: 8,
                    is_coinbase: false,
                    is_coinstake: true,
                    tx_time: 99,
                },
            }],
        }
    }

    #[test]
    fn unknown_format_byte_is_rejected() {
        let mut bytes = record().encode();
        assert_eq!(BlockUndo::decode(&bytes), Ok(record()));
        bytes[0] = 7;
        assert!(matches!(
            BlockUndo::decode(&bytes),
            Err(DecodeError::InvalidData(_))
        ));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = record().encode();
        bytes.push(0);
        assert_eq!(BlockUndo::decode(&bytes), Err(DecodeError::TrailingBytes));
    }
}
