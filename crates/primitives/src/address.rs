//! Base58Check addresses, WIF secrets and the standard output scripts they map to.

use std::fmt;

use beand_consensus::Base58Prefixes;

use crate::hash::{hash160, sha256d};

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AddressError {
    InvalidLength,
    InvalidCharacter,
    InvalidChecksum,
    UnknownPrefix,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::InvalidLength => write!(f, "invalid payload length"),
            AddressError::InvalidCharacter => write!(f, "invalid base58 character"),
            AddressError::InvalidChecksum => write!(f, "invalid checksum"),
            AddressError::UnknownPrefix => write!(f, "unknown version byte"),
        }
    }
}

impl std::error::Error for AddressError {}

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn p2sh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, 0x14]);
    script.extend_from_slice(hash);
    script.push(OP_EQUAL);
    script
}

/// `<pubkey> OP_CHECKSIG`, the form stake outputs pay to.
pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn pubkey_to_p2pkh_script(pubkey: &[u8]) -> Vec<u8> {
    p2pkh_script(&hash160(pubkey))
}

pub fn address_to_script_pubkey(
    address: &str,
    prefixes: &Base58Prefixes,
) -> Result<Vec<u8>, AddressError> {
    let payload = base58check_decode(address)?;
    let (version, body) = payload.split_first().ok_or(AddressError::InvalidLength)?;
    let hash: [u8; 20] = body.try_into().map_err(|_| AddressError::InvalidLength)?;
    if *version == prefixes.pubkey_address {
        Ok(p2pkh_script(&hash))
    } else if *version == prefixes.script_address {
        Ok(p2sh_script(&hash))
    } else {
        Err(AddressError::UnknownPrefix)
    }
}

pub fn script_pubkey_to_address(script: &[u8], prefixes: &Base58Prefixes) -> Option<String> {
    let (version, hash) = match script {
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            (prefixes.pubkey_address, hash)
        }
        [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => {
            (prefixes.script_address, hash)
        }
        _ => return None,
    };
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(hash);
    Some(base58check_encode(&payload))
}

pub fn secret_key_to_wif(secret: &[u8; 32], prefixes: &Base58Prefixes, compressed: bool) -> String {
    let mut payload = Vec::with_capacity(34);
    payload.push(prefixes.secret_key);
    payload.extend_from_slice(secret);
    if compressed {
        payload.push(0x01);
    }
    base58check_encode(&payload)
}

/// Returns the secret and whether its public key is used in compressed form.
pub fn wif_to_secret_key(
    wif: &str,
    prefixes: &Base58Prefixes,
) -> Result<([u8; 32], bool), AddressError> {
    let payload = base58check_decode(wif)?;
    let (version, body) = payload.split_first().ok_or(AddressError::InvalidLength)?;
    if *version != prefixes.secret_key {
        return Err(AddressError::UnknownPrefix);
    }
    let (secret, compressed) = match body {
        [secret @ ..] if secret.len() == 32 => (secret, false),
        [secret @ .., 0x01] if secret.len() == 32 => (secret, true),
        _ => return Err(AddressError::InvalidLength),
    };
    let mut out = [0u8; 32];
    out.copy_from_slice(secret);
    Ok((out, compressed))
}

fn base58check_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    let bytes = base58_decode(input)?;
    if bytes.len() < 4 {
        return Err(AddressError::InvalidLength);
    }
    let (payload, checksum) = bytes.split_at(bytes.len() - 4);
    if checksum != &sha256d(payload)[..4] {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

fn base58check_encode(payload: &[u8]) -> String {
    let mut data = payload.to_vec();
    data.extend_from_slice(&sha256d(payload)[..4]);
    base58_encode(&data)
}

fn base58_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    if input.is_empty() {
        return Err(AddressError::InvalidLength);
    }
    // Big-endian base-256 accumulator.
    let mut bytes: Vec<u8> = Vec::with_capacity(input.len());
    for ch in input.bytes() {
        let mut carry = ALPHABET
            .iter()
            .position(|value| *value == ch)
            .ok_or(AddressError::InvalidCharacter)? as u32;
        for byte in bytes.iter_mut().rev() {
            carry += u32::from(*byte) * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let leading_zeros = input.bytes().take_while(|b| *b == b'1').count();
    let mut out = vec![0u8; leading_zeros];
    out.extend_from_slice(&bytes);
    Ok(out)
}

fn base58_encode(data: &[u8]) -> String {
    let mut digits: Vec<u8> = Vec::with_capacity(data.len() * 138 / 100 + 1);
    for byte in data {
        let mut carry = u32::from(*byte);
        for digit in digits.iter_mut().rev() {
            carry += u32::from(*digit) * 256;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.insert(0, (carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading_zeros = data.iter().take_while(|b| **b == 0).count();
    let mut out = String::with_capacity(leading_zeros + digits.len());
    out.extend(std::iter::repeat('1').take(leading_zeros));
    out.extend(digits.iter().map(|digit| ALPHABET[*digit as usize] as char));
    out
}
