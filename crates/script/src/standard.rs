//! Standard script templates, push encoding and signature-operation counting.

use crate::opcodes::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    Multisig,
    NullData,
    Unknown,
}

/// Multisig scripts without a decodable key count are charged this many sigops.
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else if script.first() == Some(&OP_RETURN) {
        ScriptType::NullData
    } else if is_bare_multisig(script) {
        ScriptType::Multisig
    } else {
        ScriptType::Unknown
    }
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };

    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG
}

fn is_bare_multisig(script: &[u8]) -> bool {
    let ops = match parse_ops(script) {
        Some(ops) if ops.len() >= 4 => ops,
        _ => return false,
    };
    let (Some(m), Some(n)) = (small_int(ops[0].0), small_int(ops[ops.len() - 2].0)) else {
        return false;
    };
    let keys = &ops[1..ops.len() - 2];
    ops[ops.len() - 1].0 == OP_CHECKMULTISIG
        && m >= 1
        && m <= n
        && n as usize == keys.len()
        && keys
            .iter()
            .all(|(_, data)| matches!(data.map(<[u8]>::len), Some(33) | Some(65)))
}

/// The script that pushes `data` with the shortest encoding.
pub fn push_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    match data.len() {
        len @ 0..=0x4b => out.push(len as u8),
        len @ 0x4c..=0xff => {
            out.push(OP_PUSHDATA1);
            out.push(len as u8);
        }
        len @ 0x100..=0xffff => {
            out.push(OP_PUSHDATA2);
            out.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            out.push(OP_PUSHDATA4);
            out.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
    out
}

/// Splits a script into `(opcode, pushed data)` pairs. `None` on a truncated push.
pub fn parse_ops(script: &[u8]) -> Option<Vec<(u8, Option<&[u8]>)>> {
    Instructions::new(script)
        .map(|op| op.ok().map(|op| (op.opcode, op.data)))
        .collect()
}

/// Signature operations in `script`.
///
/// With `accurate`, a multisig preceded by a small integer counts that many keys; otherwise
/// every multisig counts the maximum. Counting stops at a truncated push.
pub fn sigop_count(script: &[u8], accurate: bool) -> usize {
    let mut count = 0usize;
    let mut last_opcode = None;
    for op in Instructions::new(script).map_while(Result::ok) {
        match op.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode.and_then(small_int) {
                    Some(keys) if accurate && keys > 0 => keys as usize,
                    _ => MAX_PUBKEYS_PER_MULTISIG,
                }
            }
            _ => {}
        }
        last_opcode = Some(op.opcode);
    }
    count
}

/// Accurate sigops of the redeem script pushed last by `script_sig`.
pub fn p2sh_sigop_count(script_sig: &[u8]) -> usize {
    let Some(ops) = parse_ops(script_sig) else {
        return 0;
    };
    if ops.iter().any(|(opcode, _)| *opcode > OP_16) {
        return 0;
    }
    match ops.last() {
        Some((_, Some(redeem))) => sigop_count(redeem, true),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_picks_shortest_form() {
        assert_eq!(push_data(&[7u8; 3])[0], 3);
        assert_eq!(&push_data(&[7u8; 80])[..2], &[OP_PUSHDATA1, 80]);
        assert_eq!(&push_data(&[7u8; 300])[..3], &[OP_PUSHDATA2, 0x2c, 0x01]);
    }

    #[test]
    fn multisig_sigops() {
        let mut script = vec![0x52];
        for _ in 0..3 {
            script.push(33);
            script.extend_from_slice(&[0x02; 33]);
        }
        script.extend_from_slice(&[0x53, OP_CHECKMULTISIG]);
        assert_eq!(classify_script_pubkey(&script), ScriptType::Multisig);
        assert_eq!(sigop_count(&script, true), 3);
        assert_eq!(sigop_count(&script, false), MAX_PUBKEYS_PER_MULTISIG);

        let script_sig = [vec![OP_0], push_data(&script)].concat();
        assert_eq!(p2sh_sigop_count(&script_sig), 3);
    }

    #[test]
    fn truncated_push_stops_counting() {
        assert_eq!(sigop_count(&[OP_CHECKSIG, 0x05, 0x01], false), 1);
        assert!(parse_ops(&[0x05, 0x01]).is_none());
    }
}
