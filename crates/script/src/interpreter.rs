//! Script interpreter.
//!
//! `scriptSig` runs first, then `scriptPubKey` on the stack it left behind. When P2SH is
//! enabled and the output is a script hash, the last item `scriptSig` pushed is run as the
//! redeem script against the rest of that stack. Signature checks hash the spending
//! transaction with the legacy algorithm, timestamp included.

use beand_consensus::constants::MAX_SCRIPT_SIZE;
use beand_primitives::hash::{hash160, sha256, sha256d};
use beand_primitives::transaction::Transaction;
use ripemd::{Digest, Ripemd160};
use secp256k1::{ecdsa::Signature, Message, PublicKey};
use sha1::Sha1;

use crate::opcodes::*;
use crate::secp::secp256k1_verify;
use crate::sighash::{signature_hash, SighashType, SIGHASH_ALL, SIGHASH_SINGLE};
use crate::standard::{is_p2sh, push_data};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;

/// Rules every block enforces.
pub const BLOCK_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
/// Extra policy applied to loose transactions entering the mempool.
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = BLOCK_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK;

pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
pub const MAX_OPS_PER_SCRIPT: usize = 201;
pub const MAX_STACK_SIZE: usize = 1000;
const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;
const MAX_NUM_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    BadOpcode,
    DisabledOpcode,
    UpgradableNop,
    UnbalancedConditional,
    InvalidStackOperation,
    InvalidAltstackOperation,
    NumberOverflow,
    Verify(u8),
    PubkeyCount,
    SigCount,
    SigEncoding,
    PubkeyEncoding,
    SigHashType,
    SigCheck,
    SigPushOnly,
    NullDummy,
    MinimalData,
    CleanStack,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::OpReturn => write!(f, "OP_RETURN executed"),
            ScriptError::ScriptSize => write!(f, "script too large"),
            ScriptError::PushSize => write!(f, "push larger than {MAX_SCRIPT_ELEMENT_SIZE} bytes"),
            ScriptError::OpCount => write!(f, "more than {MAX_OPS_PER_SCRIPT} opcodes"),
            ScriptError::StackSize => write!(f, "stack larger than {MAX_STACK_SIZE} items"),
            ScriptError::BadOpcode => write!(f, "invalid opcode"),
            ScriptError::DisabledOpcode => write!(f, "disabled opcode"),
            ScriptError::UpgradableNop => write!(f, "upgradable NOP executed"),
            ScriptError::UnbalancedConditional => write!(f, "unbalanced conditional"),
            ScriptError::InvalidStackOperation => write!(f, "stack underflow"),
            ScriptError::InvalidAltstackOperation => write!(f, "altstack underflow"),
            ScriptError::NumberOverflow => write!(f, "numeric operand too large"),
            ScriptError::Verify(opcode) => write!(f, "verify opcode 0x{opcode:02x} failed"),
            ScriptError::PubkeyCount => write!(f, "invalid public key count"),
            ScriptError::SigCount => write!(f, "invalid signature count"),
            ScriptError::SigEncoding => write!(f, "invalid signature encoding"),
            ScriptError::PubkeyEncoding => write!(f, "invalid public key encoding"),
            ScriptError::SigHashType => write!(f, "invalid sighash type"),
            ScriptError::SigCheck => write!(f, "signature check failed"),
            ScriptError::SigPushOnly => write!(f, "scriptSig is not push-only"),
            ScriptError::NullDummy => write!(f, "multisig dummy element is not empty"),
            ScriptError::MinimalData => write!(f, "non-minimal push or number"),
            ScriptError::CleanStack => write!(f, "stack not clean after evaluation"),
        }
    }
}

impl std::error::Error for ScriptError {}

pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    let sig_push_only = is_push_only(script_sig);
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !sig_push_only {
        return Err(ScriptError::SigPushOnly);
    }

    let checker = SignatureChecker {
        tx,
        input_index,
        flags,
    };
    let mut machine = Machine::new(&checker, Vec::new());
    machine.run(script_sig)?;
    let after_sig = machine.stack.clone();
    machine.run(script_pubkey)?;
    if !machine.top_is_true() {
        return Err(ScriptError::EvalFalse);
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if !sig_push_only {
            return Err(ScriptError::SigPushOnly);
        }
        let mut stack = after_sig;
        let redeem_script = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
        machine = Machine::new(&checker, stack);
        machine.run(&redeem_script)?;
        if !machine.top_is_true() {
            return Err(ScriptError::EvalFalse);
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && machine.stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

struct SignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    flags: ScriptFlags,
}

impl SignatureChecker<'_> {
    fn enforces(&self, flag: ScriptFlags) -> bool {
        (self.flags & flag) != 0
    }

    /// `Ok(false)` for a well-formed signature that does not verify.
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8]) -> Result<bool, ScriptError> {
        let Some((&hash_type, der)) = sig.split_last() else {
            return Ok(false);
        };
        let hash_type = u32::from(hash_type);
        if self.enforces(SCRIPT_VERIFY_STRICTENC) {
            let base = SighashType(hash_type).base_type();
            if !(SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base) {
                return Err(ScriptError::SigHashType);
            }
            if !is_strict_der(der) {
                return Err(ScriptError::SigEncoding);
            }
            if !matches!(
                (pubkey.len(), pubkey.first().copied()),
                (33, Some(0x02 | 0x03)) | (65, Some(0x04))
            ) {
                return Err(ScriptError::PubkeyEncoding);
            }
        }

        let Ok(signature) = Signature::from_der(der) else {
            if self.enforces(SCRIPT_VERIFY_STRICTENC) {
                return Err(ScriptError::SigEncoding);
            }
            return Ok(false);
        };
        let mut low_s = signature;
        low_s.normalize_s();
        if self.enforces(SCRIPT_VERIFY_LOW_S) && low_s != signature {
            return Err(ScriptError::SigEncoding);
        }
        let Ok(key) = PublicKey::from_slice(pubkey) else {
            return Ok(false);
        };

        let script_code = find_and_delete(script_code, &push_data(sig));
        let Ok(digest) = signature_hash(
            self.tx,
            self.input_index,
            &script_code,
            SighashType(hash_type),
        ) else {
            return Ok(false);
        };
        Ok(secp256k1_verify()
            .verify_ecdsa(&Message::from_digest(digest), &low_s, &key)
            .is_ok())
    }
}

/// Evaluation state for one script run.
struct Machine<'c> {
    checker: &'c SignatureChecker<'c>,
    stack: Vec<Vec<u8>>,
    alt: Vec<Vec<u8>>,
    /// One entry per open `OP_IF`, true while that branch executes.
    branches: Vec<bool>,
    op_count: usize,
}

impl<'c> Machine<'c> {
    fn new(checker: &'c SignatureChecker<'c>, stack: Vec<Vec<u8>>) -> Self {
        Self {
            checker,
            stack,
            alt: Vec::new(),
            branches: Vec::new(),
            op_count: 0,
        }
    }

    fn top_is_true(&self) -> bool {
        self.stack.last().is_some_and(|top| cast_to_bool(top))
    }

    fn run(&mut self, script: &[u8]) -> Result<(), ScriptError> {
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptSize);
        }
        self.alt.clear();
        self.branches.clear();
        self.op_count = 0;

        let mut code_start = 0usize;
        let mut instructions = Instructions::new(script);
        while let Some(next) = instructions.next() {
            let Instruction { opcode, data } = next.map_err(|_| ScriptError::BadOpcode)?;
            let executing = self.branches.iter().all(|taken| *taken);

            if data.is_some_and(|data| data.len() > MAX_SCRIPT_ELEMENT_SIZE) {
                return Err(ScriptError::PushSize);
            }
            if opcode > OP_16 {
                self.op_count += 1;
                if self.op_count > MAX_OPS_PER_SCRIPT {
                    return Err(ScriptError::OpCount);
                }
            }
            if is_disabled(opcode) || matches!(opcode, OP_VERIF | OP_VERNOTIF) {
                return Err(ScriptError::DisabledOpcode);
            }

            match data {
                Some(data) if executing => {
                    if self.checker.enforces(SCRIPT_VERIFY_MINIMALDATA)
                        && !is_minimal_push(data, opcode)
                    {
                        return Err(ScriptError::MinimalData);
                    }
                    self.stack.push(data.to_vec());
                }
                Some(_) => {}
                None if executing || (OP_IF..=OP_ENDIF).contains(&opcode) => {
                    if opcode == OP_CODESEPARATOR {
                        code_start = instructions.position();
                    } else {
                        self.execute(opcode, &script[code_start..])?;
                    }
                }
                None => {}
            }

            if self.stack.len() + self.alt.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackSize);
            }
        }

        if !self.branches.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.stack.pop().ok_or(ScriptError::InvalidStackOperation)
    }

    /// The item `depth` places below the top (0 is the top).
    fn peek(&self, depth: usize) -> Result<&Vec<u8>, ScriptError> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|index| &self.stack[index])
            .ok_or(ScriptError::InvalidStackOperation)
    }

    fn require(&self, items: usize) -> Result<(), ScriptError> {
        if self.stack.len() < items {
            return Err(ScriptError::InvalidStackOperation);
        }
        Ok(())
    }

    fn pop_num(&mut self) -> Result<i64, ScriptError> {
        let bytes = self.pop()?;
        decode_num(&bytes, self.checker.enforces(SCRIPT_VERIFY_MINIMALDATA))
    }

    fn push_num(&mut self, value: i64) {
        self.stack.push(encode_num(value));
    }

    fn push_bool(&mut self, value: bool) {
        self.stack.push(if value { vec![1] } else { Vec::new() });
    }

    /// Runs a non-push opcode. Conditionals are dispatched here even inside a skipped branch.
    fn execute(&mut self, opcode: u8, script_code: &[u8]) -> Result<(), ScriptError> {
        match opcode {
            OP_0 => self.stack.push(Vec::new()),
            OP_1NEGATE => self.push_num(-1),
            OP_1..=OP_16 => self.push_num(i64::from(opcode - OP_1 + 1)),

            OP_NOP => {}
            OP_NOP1..=OP_NOP10 => {
                if self.checker.enforces(SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
                    return Err(ScriptError::UpgradableNop);
                }
            }
            OP_IF | OP_NOTIF => {
                let mut taken = false;
                if self.branches.iter().all(|taken| *taken) {
                    taken = cast_to_bool(&self.pop()?);
                    if opcode == OP_NOTIF {
                        taken = !taken;
                    }
                }
                self.branches.push(taken);
            }
            OP_ELSE => {
                let last = self
                    .branches
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *last = !*last;
            }
            OP_ENDIF => {
                self.branches
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }
            OP_VERIFY => {
                if !cast_to_bool(&self.pop()?) {
                    return Err(ScriptError::Verify(opcode));
                }
            }
            OP_RETURN => return Err(ScriptError::OpReturn),

            OP_TOALTSTACK => {
                let item = self.pop()?;
                self.alt.push(item);
            }
            OP_FROMALTSTACK => {
                let item = self
                    .alt
                    .pop()
                    .ok_or(ScriptError::InvalidAltstackOperation)?;
                self.stack.push(item);
            }
            OP_2DROP => {
                self.require(2)?;
                self.stack.truncate(self.stack.len() - 2);
            }
            OP_2DUP | OP_3DUP => {
                let count = if opcode == OP_2DUP { 2 } else { 3 };
                self.require(count)?;
                let copied = self.stack[self.stack.len() - count..].to_vec();
                self.stack.extend(copied);
            }
            OP_2OVER => {
                self.require(4)?;
                let at = self.stack.len() - 4;
                let copied = self.stack[at..at + 2].to_vec();
                self.stack.extend(copied);
            }
            OP_2ROT => {
                self.require(6)?;
                let at = self.stack.len() - 6;
                let moved: Vec<_> = self.stack.drain(at..at + 2).collect();
                self.stack.extend(moved);
            }
            OP_2SWAP => {
                self.require(4)?;
                let len = self.stack.len();
                self.stack[len - 4..].rotate_left(2);
            }
            OP_IFDUP => {
                let top = self.peek(0)?.clone();
                if cast_to_bool(&top) {
                    self.stack.push(top);
                }
            }
            OP_DEPTH => self.push_num(self.stack.len() as i64),
            OP_DROP => {
                self.pop()?;
            }
            OP_DUP => {
                let top = self.peek(0)?.clone();
                self.stack.push(top);
            }
            OP_NIP => {
                self.require(2)?;
                let at = self.stack.len() - 2;
                self.stack.remove(at);
            }
            OP_OVER => {
                let item = self.peek(1)?.clone();
                self.stack.push(item);
            }
            OP_PICK | OP_ROLL => {
                let depth = self.pop_num()?;
                let depth =
                    usize::try_from(depth).map_err(|_| ScriptError::InvalidStackOperation)?;
                let item = self.peek(depth)?.clone();
                if opcode == OP_ROLL {
                    let at = self.stack.len() - depth - 1;
                    self.stack.remove(at);
                }
                self.stack.push(item);
            }
            OP_ROT => {
                self.require(3)?;
                let len = self.stack.len();
                self.stack[len - 3..].rotate_left(1);
            }
            OP_SWAP => {
                self.require(2)?;
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            OP_TUCK => {
                self.require(2)?;
                let top = self.peek(0)?.clone();
                let at = self.stack.len() - 2;
                self.stack.insert(at, top);
            }
            OP_SIZE => {
                let len = self.peek(0)?.len();
                self.push_num(len as i64);
            }

            OP_EQUAL | OP_EQUALVERIFY => {
                let a = self.pop()?;
                let b = self.pop()?;
                if opcode == OP_EQUALVERIFY {
                    if a != b {
                        return Err(ScriptError::Verify(opcode));
                    }
                } else {
                    self.push_bool(a == b);
                }
            }

            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let n = self.pop_num()?;
                let result = match opcode {
                    OP_1ADD => n + 1,
                    OP_1SUB => n - 1,
                    OP_NEGATE => -n,
                    OP_ABS => n.abs(),
                    OP_NOT => i64::from(n == 0),
                    _ => i64::from(n != 0),
                };
                self.push_num(result);
            }
            OP_ADD..=OP_SUB | OP_BOOLAND..=OP_MAX => {
                let b = self.pop_num()?;
                let a = self.pop_num()?;
                let result = match opcode {
                    OP_ADD => a + b,
                    OP_SUB => a - b,
                    OP_BOOLAND => i64::from(a != 0 && b != 0),
                    OP_BOOLOR => i64::from(a != 0 || b != 0),
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => i64::from(a == b),
                    OP_NUMNOTEQUAL => i64::from(a != b),
                    OP_LESSTHAN => i64::from(a < b),
                    OP_GREATERTHAN => i64::from(a > b),
                    OP_LESSTHANOREQUAL => i64::from(a <= b),
                    OP_GREATERTHANOREQUAL => i64::from(a >= b),
                    OP_MIN => a.min(b),
                    _ => a.max(b),
                };
                if opcode == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::Verify(opcode));
                    }
                } else {
                    self.push_num(result);
                }
            }
            OP_WITHIN => {
                let max = self.pop_num()?;
                let min = self.pop_num()?;
                let value = self.pop_num()?;
                self.push_bool(min <= value && value < max);
            }

            OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                let data = self.pop()?;
                let digest = match opcode {
                    OP_RIPEMD160 => Ripemd160::digest(&data).to_vec(),
                    OP_SHA1 => Sha1::digest(&data).to_vec(),
                    OP_SHA256 => sha256(&data).to_vec(),
                    OP_HASH160 => hash160(&data).to_vec(),
                    _ => sha256d(&data).to_vec(),
                };
                self.stack.push(digest);
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let pubkey = self.pop()?;
                let sig = self.pop()?;
                let ok = self.checker.check_sig(&sig, &pubkey, script_code)?;
                if opcode == OP_CHECKSIGVERIFY {
                    if !ok {
                        return Err(ScriptError::SigCheck);
                    }
                } else {
                    self.push_bool(ok);
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let ok = self.check_multisig(script_code)?;
                if opcode == OP_CHECKMULTISIGVERIFY {
                    if !ok {
                        return Err(ScriptError::SigCheck);
                    }
                } else {
                    self.push_bool(ok);
                }
            }

            _ => {
                beand_log::log_debug!("invalid opcode 0x{opcode:02x} executed");
                return Err(ScriptError::BadOpcode);
            }
        }
        Ok(())
    }

    /// Pops `dummy sig.. m key.. n` and matches signatures to keys in order.
    fn check_multisig(&mut self, script_code: &[u8]) -> Result<bool, ScriptError> {
        let key_count = self.pop_num()?;
        if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&key_count) {
            return Err(ScriptError::PubkeyCount);
        }
        self.op_count += key_count as usize;
        if self.op_count > MAX_OPS_PER_SCRIPT {
            return Err(ScriptError::OpCount);
        }
        self.require(key_count as usize)?;
        let keys = self.stack.split_off(self.stack.len() - key_count as usize);

        let sig_count = self.pop_num()?;
        if !(0..=key_count).contains(&sig_count) {
            return Err(ScriptError::SigCount);
        }
        self.require(sig_count as usize)?;
        let sigs = self.stack.split_off(self.stack.len() - sig_count as usize);

        let dummy = self.pop()?;
        if self.checker.enforces(SCRIPT_VERIFY_NULLDUMMY) && !dummy.is_empty() {
            return Err(ScriptError::NullDummy);
        }

        let mut script_code = script_code.to_vec();
        for sig in &sigs {
            script_code = find_and_delete(&script_code, &push_data(sig));
        }
        let mut sig_index = sigs.len();
        let mut key_index = keys.len();
        while sig_index > 0 {
            if key_index < sig_index {
                return Ok(false);
            }
            if self
                .checker
                .check_sig(&sigs[sig_index - 1], &keys[key_index - 1], &script_code)?
            {
                sig_index -= 1;
            }
            key_index -= 1;
        }
        Ok(true)
    }
}

fn cast_to_bool(data: &[u8]) -> bool {
    match data.split_last() {
        Some((&last, rest)) => rest.iter().any(|byte| *byte != 0) || (last & 0x7f) != 0,
        None => false,
    }
}

fn decode_num(data: &[u8], require_minimal: bool) -> Result<i64, ScriptError> {
    if data.len() > MAX_NUM_SIZE {
        return Err(ScriptError::NumberOverflow);
    }
    let Some((&last, rest)) = data.split_last() else {
        return Ok(0);
    };
    if require_minimal && (last & 0x7f) == 0 && rest.last().map_or(true, |byte| byte & 0x80 == 0) {
        return Err(ScriptError::MinimalData);
    }
    let magnitude = data
        .iter()
        .enumerate()
        .fold(0i64, |acc, (index, byte)| acc | (i64::from(*byte) << (8 * index)));
    if last & 0x80 != 0 {
        Ok(-(magnitude & !(0x80i64 << (8 * (data.len() - 1)))))
    } else {
        Ok(magnitude)
    }
}

fn encode_num(value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut magnitude = value.unsigned_abs();
    while magnitude > 0 {
        out.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    let negative = value < 0;
    match out.last_mut() {
        Some(last) if *last & 0x80 != 0 => out.push(if negative { 0x80 } else { 0 }),
        Some(last) if negative => *last |= 0x80,
        _ => {}
    }
    out
}

fn is_push_only(script: &[u8]) -> bool {
    Instructions::new(script).all(|next| {
        next.is_ok_and(|instruction| {
            instruction.data.is_some() || instruction.opcode <= OP_16
        })
    })
}

/// Whether `data` was pushed with the shortest encoding available.
fn is_minimal_push(data: &[u8], opcode: u8) -> bool {
    match data {
        [] => opcode == OP_0,
        [value @ 1..=16] => opcode == OP_1 + value - 1,
        [0x81] => opcode == OP_1NEGATE,
        _ if data.len() <= 0x4b => opcode as usize == data.len(),
        _ if data.len() <= 0xff => opcode == OP_PUSHDATA1,
        _ if data.len() <= 0xffff => opcode == OP_PUSHDATA2,
        _ => true,
    }
}

/// Drops every instruction of `script` that is exactly the push `pattern`.
fn find_and_delete(script: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut instructions = Instructions::new(script);
    let mut start = 0usize;
    while let Some(next) = instructions.next() {
        let end = instructions.position();
        if next.is_err() {
            out.extend_from_slice(&script[start..]);
            return out;
        }
        if &script[start..end] != pattern {
            out.extend_from_slice(&script[start..end]);
        }
        start = end;
    }
    out
}

/// Strict DER: `0x30 len 0x02 rlen r 0x02 slen s` with minimal positive integers.
fn is_strict_der(sig: &[u8]) -> bool {
    let [0x30, total, 0x02, r_len, rest @ ..] = sig else {
        return false;
    };
    if sig.len() > 72 || *total as usize != sig.len() - 2 {
        return false;
    }
    let r_len = *r_len as usize;
    if r_len == 0 || rest.len() < r_len + 2 {
        return false;
    }
    let (r, tail) = rest.split_at(r_len);
    let [0x02, s_len, s @ ..] = tail else {
        return false;
    };
    if *s_len as usize != s.len() || s.is_empty() {
        return false;
    }
    let minimal = |int: &[u8]| int[0] & 0x80 == 0 && !(int.len() > 1 && int[0] == 0 && int[1] & 0x80 == 0);
    minimal(r) && minimal(s)
}
