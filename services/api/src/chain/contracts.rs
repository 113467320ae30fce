//! Wire encoding for contract-call arguments and read-only call results.
//!
//! Values are the tagged Clarity variants the contracts understand. Parsing
//! of node responses happens here and nowhere else; callers only ever see
//! `ClarityValue` or a typed error code.

use anyhow::{anyhow, bail, Context};
use sha2::{Digest, Sha256};

const TYPE_INT: u8 = 0x00;
const TYPE_UINT: u8 = 0x01;
const TYPE_BUFFER: u8 = 0x02;
const TYPE_BOOL_TRUE: u8 = 0x03;
const TYPE_BOOL_FALSE: u8 = 0x04;
const TYPE_PRINCIPAL: u8 = 0x05;
const TYPE_RESPONSE_OK: u8 = 0x07;
const TYPE_RESPONSE_ERR: u8 = 0x08;
const TYPE_NONE: u8 = 0x09;
const TYPE_SOME: u8 = 0x0a;
const TYPE_TUPLE: u8 = 0x0c;
const TYPE_STRING_ASCII: u8 = 0x0d;

#[derive(Debug, Clone, PartialEq)]
pub enum ClarityValue {
    Int(i128),
    Uint(u128),
    Buffer(Vec<u8>),
    Bool(bool),
    Principal { version: u8, hash160: [u8; 20] },
    ResponseOk(Box<ClarityValue>),
    ResponseErr(Box<ClarityValue>),
    None,
    Some(Box<ClarityValue>),
    Tuple(Vec<(String, ClarityValue)>),
    StringAscii(String),
}

impl ClarityValue {
    pub fn uint(value: u128) -> Self {
        ClarityValue::Uint(value)
    }

    pub fn principal(address: &str) -> anyhow::Result<Self> {
        let (version, hash160) = decode_stacks_address(address)?;
        Ok(ClarityValue::Principal { version, hash160 })
    }

    /// Fixed-width ASCII argument, right-padded with spaces.
    pub fn padded_ascii(value: &str, width: usize) -> anyhow::Result<Self> {
        if value.len() > width {
            bail!("string argument '{value}' exceeds width {width}");
        }
        if !value.is_ascii() {
            bail!("string argument '{value}' is not ASCII");
        }
        let mut padded = String::with_capacity(width);
        padded.push_str(value);
        while padded.len() < width {
            padded.push(' ');
        }
        Ok(ClarityValue::StringAscii(padded))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        match self {
            ClarityValue::Int(v) => {
                out.push(TYPE_INT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            ClarityValue::Uint(v) => {
                out.push(TYPE_UINT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            ClarityValue::Buffer(bytes) => {
                out.push(TYPE_BUFFER);
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            ClarityValue::Bool(true) => out.push(TYPE_BOOL_TRUE),
            ClarityValue::Bool(false) => out.push(TYPE_BOOL_FALSE),
            ClarityValue::Principal { version, hash160 } => {
                out.push(TYPE_PRINCIPAL);
                out.push(*version);
                out.extend_from_slice(hash160);
            }
            ClarityValue::ResponseOk(inner) => {
                out.push(TYPE_RESPONSE_OK);
                inner.serialize_into(out);
            }
            ClarityValue::ResponseErr(inner) => {
                out.push(TYPE_RESPONSE_ERR);
                inner.serialize_into(out);
            }
            ClarityValue::None => out.push(TYPE_NONE),
            ClarityValue::Some(inner) => {
                out.push(TYPE_SOME);
                inner.serialize_into(out);
            }
            ClarityValue::Tuple(entries) => {
                out.push(TYPE_TUPLE);
                out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
                for (name, value) in entries {
                    out.push(name.len() as u8);
                    out.extend_from_slice(name.as_bytes());
                    value.serialize_into(out);
                }
            }
            ClarityValue::StringAscii(value) => {
                out.push(TYPE_STRING_ASCII);
                out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                out.extend_from_slice(value.as_bytes());
            }
        }
    }

    pub fn deserialize(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let value = cursor.read_value()?;
        Ok(value)
    }

    pub fn expect_uint(&self) -> anyhow::Result<u128> {
        match self {
            ClarityValue::Uint(v) => Ok(*v),
            other => bail!("expected uint, got {other:?}"),
        }
    }

    pub fn tuple_get(&self, key: &str) -> anyhow::Result<&ClarityValue> {
        match self {
            ClarityValue::Tuple(entries) => entries
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, v)| v)
                .ok_or_else(|| anyhow!("tuple missing key '{key}'")),
            other => bail!("expected tuple, got {other:?}"),
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        if self.pos + n > self.bytes.len() {
            bail!("truncated clarity value");
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> anyhow::Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("4 bytes");
        Ok(u32::from_be_bytes(bytes))
    }

    fn read_value(&mut self) -> anyhow::Result<ClarityValue> {
        let tag = self.read_u8()?;
        match tag {
            TYPE_INT => {
                let bytes: [u8; 16] = self.take(16)?.try_into().expect("16 bytes");
                Ok(ClarityValue::Int(i128::from_be_bytes(bytes)))
            }
            TYPE_UINT => {
                let bytes: [u8; 16] = self.take(16)?.try_into().expect("16 bytes");
                Ok(ClarityValue::Uint(u128::from_be_bytes(bytes)))
            }
            TYPE_BUFFER => {
                let len = self.read_u32()? as usize;
                Ok(ClarityValue::Buffer(self.take(len)?.to_vec()))
            }
            TYPE_BOOL_TRUE => Ok(ClarityValue::Bool(true)),
            TYPE_BOOL_FALSE => Ok(ClarityValue::Bool(false)),
            TYPE_PRINCIPAL => {
                let version = self.read_u8()?;
                let hash160: [u8; 20] = self.take(20)?.try_into().expect("20 bytes");
                Ok(ClarityValue::Principal { version, hash160 })
            }
            TYPE_RESPONSE_OK => Ok(ClarityValue::ResponseOk(Box::new(self.read_value()?))),
            TYPE_RESPONSE_ERR => Ok(ClarityValue::ResponseErr(Box::new(self.read_value()?))),
            TYPE_NONE => Ok(ClarityValue::None),
            TYPE_SOME => Ok(ClarityValue::Some(Box::new(self.read_value()?))),
            TYPE_TUPLE => {
                let count = self.read_u32()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let name_len = self.read_u8()? as usize;
                    let name = String::from_utf8(self.take(name_len)?.to_vec())
                        .context("tuple key is not utf8")?;
                    entries.push((name, self.read_value()?));
                }
                Ok(ClarityValue::Tuple(entries))
            }
            TYPE_STRING_ASCII => {
                let len = self.read_u32()? as usize;
                let value = String::from_utf8(self.take(len)?.to_vec())
                    .context("string-ascii is not utf8")?;
                Ok(ClarityValue::StringAscii(value))
            }
            other => bail!("unknown clarity type tag 0x{other:02x}"),
        }
    }
}

/// A fully specified contract call, ready for signing.
#[derive(Debug, Clone)]
pub struct ContractCall {
    pub contract_address: String,
    pub contract_name: String,
    pub function_name: String,
    pub args: Vec<ClarityValue>,
}

impl ContractCall {
    /// `contract_id` is `ADDRESS.name`.
    pub fn new(contract_id: &str, function_name: &str, args: Vec<ClarityValue>) -> anyhow::Result<Self> {
        let (address, name) = contract_id
            .split_once('.')
            .ok_or_else(|| anyhow!("malformed contract id: {contract_id}"))?;
        Ok(Self {
            contract_address: address.to_string(),
            contract_name: name.to_string(),
            function_name: function_name.to_string(),
            args,
        })
    }

    pub fn serialize_payload(&self) -> anyhow::Result<Vec<u8>> {
        let (version, hash160) = decode_stacks_address(&self.contract_address)?;
        let mut out = Vec::new();
        out.push(version);
        out.extend_from_slice(&hash160);
        out.push(self.contract_name.len() as u8);
        out.extend_from_slice(self.contract_name.as_bytes());
        out.push(self.function_name.len() as u8);
        out.extend_from_slice(self.function_name.as_bytes());
        out.extend_from_slice(&(self.args.len() as u32).to_be_bytes());
        for arg in &self.args {
            out.extend_from_slice(&arg.serialize());
        }
        Ok(out)
    }
}

const C32_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn c32_index(c: char) -> anyhow::Result<u32> {
    let normalized = match c.to_ascii_uppercase() {
        'O' => '0',
        'L' | 'I' => '1',
        other => other,
    };
    C32_ALPHABET
        .iter()
        .position(|&a| a as char == normalized)
        .map(|i| i as u32)
        .ok_or_else(|| anyhow!("invalid c32 character '{c}'"))
}

fn c32_decode(input: &str) -> anyhow::Result<Vec<u8>> {
    let mut acc: u64 = 0;
    let mut bits = 0u32;
    let mut out = Vec::new();
    for c in input.chars() {
        acc = (acc << 5) | u64::from(c32_index(c)?);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Ok(out)
}

fn c32_encode(bytes: &[u8]) -> String {
    let mut acc: u64 = 0;
    let mut bits = 0u32;
    let mut out = String::new();
    for &b in bytes {
        acc = (acc << 8) | u64::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(C32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
            acc &= (1 << bits) - 1;
        }
    }
    if bits > 0 {
        out.push(C32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn address_checksum(version: u8, hash160: &[u8; 20]) -> [u8; 4] {
    let mut preimage = Vec::with_capacity(21);
    preimage.push(version);
    preimage.extend_from_slice(hash160);
    let first = Sha256::digest(&preimage);
    let second = Sha256::digest(first);
    [second[0], second[1], second[2], second[3]]
}

/// Decode `S<version><payload>` into the version byte and hash160,
/// verifying the 4-byte double-sha checksum.
pub fn decode_stacks_address(address: &str) -> anyhow::Result<(u8, [u8; 20])> {
    let rest = address
        .strip_prefix('S')
        .ok_or_else(|| anyhow!("address must start with 'S': {address}"))?;
    let mut chars = rest.chars();
    let version_char = chars
        .next()
        .ok_or_else(|| anyhow!("address too short: {address}"))?;
    let version = c32_index(version_char)? as u8;

    let payload = c32_decode(chars.as_str())?;
    if payload.len() < 24 {
        bail!("address payload too short: {address}");
    }
    // hash160 plus the 4-byte checksum, whatever padding the decode left.
    let trimmed = &payload[payload.len() - 24..];
    let hash160: [u8; 20] = trimmed[..20].try_into().expect("20 bytes");
    let checksum: [u8; 4] = trimmed[20..].try_into().expect("4 bytes");
    if checksum != address_checksum(version, &hash160) {
        bail!("address checksum mismatch: {address}");
    }
    Ok((version, hash160))
}

pub fn encode_stacks_address(version: u8, hash160: &[u8; 20]) -> String {
    let checksum = address_checksum(version, hash160);
    let mut payload = Vec::with_capacity(24);
    payload.extend_from_slice(hash160);
    payload.extend_from_slice(&checksum);
    format!(
        "S{}{}",
        C32_ALPHABET[version as usize] as char,
        c32_encode(&payload)
    )
}

/// Contract error codes surfaced by the oracle reads.
pub const ERR_PRICE_STALE: u128 = 102;
pub const ERR_NO_PRICE_DATA: u128 = 104;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address() -> String {
        encode_stacks_address(26, &[0x42; 20])
    }

    #[test]
    fn address_round_trips() {
        let addr = test_address();
        let (version, hash160) = decode_stacks_address(&addr).unwrap();
        assert_eq!(version, 26);
        assert_eq!(hash160, [0x42; 20]);
        assert_eq!(encode_stacks_address(version, &hash160), addr);
    }

    #[test]
    fn corrupted_address_fails_checksum() {
        let addr = test_address();
        let mut corrupted = addr.clone();
        let last = corrupted.pop().unwrap();
        let replacement = if last == 'A' { 'B' } else { 'A' };
        corrupted.push(replacement);
        assert!(decode_stacks_address(&corrupted).is_err());
    }

    #[test]
    fn uint_serialization_round_trips() {
        let value = ClarityValue::Uint(5_001_363_953_488);
        let bytes = value.serialize();
        assert_eq!(bytes[0], TYPE_UINT);
        assert_eq!(bytes.len(), 17);
        assert_eq!(ClarityValue::deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn padded_ascii_pads_right() {
        let value = ClarityValue::padded_ascii("PUT", 8).unwrap();
        match &value {
            ClarityValue::StringAscii(s) => assert_eq!(s, "PUT     "),
            other => panic!("unexpected {other:?}"),
        }
        let too_long = ClarityValue::padded_ascii("conservative-extra-long", 10);
        assert!(too_long.is_err());
    }

    #[test]
    fn response_tuple_round_trips() {
        let value = ClarityValue::ResponseOk(Box::new(ClarityValue::Tuple(vec![
            ("price".to_string(), ClarityValue::Uint(5_000_000_000_000)),
            ("timestamp".to_string(), ClarityValue::Uint(1_700_000_000)),
        ])));
        let decoded = ClarityValue::deserialize(&value.serialize()).unwrap();
        assert_eq!(decoded, value);
        match decoded {
            ClarityValue::ResponseOk(inner) => {
                assert_eq!(inner.tuple_get("price").unwrap().expect_uint().unwrap(), 5_000_000_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn contract_call_payload_orders_args() {
        let addr = test_address();
        let call = ContractCall::new(
            &format!("{addr}.bithedge-oracle"),
            "set-aggregated-price",
            vec![ClarityValue::Uint(5_001_363_953_488)],
        )
        .unwrap();
        let payload = call.serialize_payload().unwrap();
        assert!(payload.len() > 21);
        // contract name follows the 21-byte principal
        let name_len = payload[21] as usize;
        assert_eq!(
            &payload[22..22 + name_len],
            b"bithedge-oracle"
        );
    }
}
