//! Minimal DER writer.
//!
//! Only the handful of universal types needed for a PKCS#10 request are
//! covered. Every writer returns a complete TLV; constructed values are built
//! by concatenating already-encoded children.

use crate::{Error, Result};

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0c;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_IA5_STRING: u8 = 0x16;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Encodes a definite length in minimal form.
pub fn length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }

    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let significant = &bytes[skip..];

    let mut out = Vec::with_capacity(1 + significant.len());
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
    out
}

/// Encodes a tag-length-value triple.
pub fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let len = length(value.len());
    let mut out = Vec::with_capacity(1 + len.len() + value.len());
    out.push(tag);
    out.extend_from_slice(&len);
    out.extend_from_slice(value);
    out
}

/// SEQUENCE of already-encoded elements.
pub fn sequence(elements: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &elements.concat())
}

/// SET of already-encoded elements, sorted as DER requires.
pub fn set(elements: &[&[u8]]) -> Vec<u8> {
    let mut sorted = elements.to_vec();
    sorted.sort();
    tlv(TAG_SET, &sorted.concat())
}

/// INTEGER from unsigned big-endian magnitude.
pub fn unsigned_integer(magnitude: &[u8]) -> Vec<u8> {
    let skip = magnitude
        .iter()
        .take_while(|b| **b == 0)
        .count()
        .min(magnitude.len().saturating_sub(1));
    let trimmed = &magnitude[skip..];

    match trimmed.first() {
        None => tlv(TAG_INTEGER, &[0]),
        Some(first) if first & 0x80 != 0 => {
            let mut value = Vec::with_capacity(trimmed.len() + 1);
            value.push(0);
            value.extend_from_slice(trimmed);
            tlv(TAG_INTEGER, &value)
        }
        Some(_) => tlv(TAG_INTEGER, trimmed),
    }
}

/// Small non-negative INTEGER.
pub fn small_integer(value: u64) -> Vec<u8> {
    unsigned_integer(&value.to_be_bytes())
}

/// OBJECT IDENTIFIER from its arcs.
pub fn oid(arcs: &[u64]) -> Result<Vec<u8>> {
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(Error::InvariantViolation(format!("invalid OID arcs: {arcs:?}")));
    }

    let mut value = Vec::new();
    let first = arcs[0]
        .checked_mul(40)
        .and_then(|v| v.checked_add(arcs[1]))
        .ok_or_else(|| Error::InvariantViolation("OID arc overflow".to_string()))?;
    push_base128(&mut value, first);
    for arc in &arcs[2..] {
        push_base128(&mut value, *arc);
    }

    Ok(tlv(TAG_OID, &value))
}

fn push_base128(out: &mut Vec<u8>, mut arc: u64) {
    let mut stack = [0u8; 10];
    let mut n = 0;
    loop {
        stack[n] = (arc & 0x7f) as u8;
        n += 1;
        arc >>= 7;
        if arc == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let continuation = if i == 0 { 0 } else { 0x80 };
        out.push(stack[i] | continuation);
    }
}

/// BIT STRING with zero unused bits.
pub fn bit_string(bytes: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(bytes.len() + 1);
    value.push(0);
    value.extend_from_slice(bytes);
    tlv(TAG_BIT_STRING, &value)
}

pub fn null() -> Vec<u8> {
    vec![TAG_NULL, 0]
}

pub fn utf8_string(value: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, value.as_bytes())
}

pub fn ia5_string(value: &str) -> Result<Vec<u8>> {
    if !value.is_ascii() {
        return Err(Error::InvariantViolation(
            "IA5String must be ASCII".to_string(),
        ));
    }
    Ok(tlv(TAG_IA5_STRING, value.as_bytes()))
}

/// PrintableString, or an error if `value` uses characters outside its alphabet.
pub fn printable_string(value: &str) -> Result<Vec<u8>> {
    if !is_printable(value) {
        return Err(Error::InvariantViolation(format!(
            "not a PrintableString: {value:?}"
        )));
    }
    Ok(tlv(TAG_PRINTABLE_STRING, value.as_bytes()))
}

/// DirectoryString: PrintableString when the alphabet allows it, UTF8String otherwise.
pub fn directory_string(value: &str) -> Vec<u8> {
    if is_printable(value) {
        tlv(TAG_PRINTABLE_STRING, value.as_bytes())
    } else {
        utf8_string(value)
    }
}

/// Whether every character of `value` is in the PrintableString alphabet.
pub fn is_printable(value: &str) -> bool {
    value.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b' ' | b'\'' | b'(' | b')' | b'+' | b',' | b'-' | b'.' | b'/' | b':' | b'=' | b'?'
            )
    })
}

/// Constructed context-specific tag `[n]`.
pub fn context_constructed(n: u8, content: &[u8]) -> Vec<u8> {
    tlv(0xa0 | (n & 0x1f), content)
}

/// One decoded TLV.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

/// Reads one TLV from the front of `input`, returning it and the remainder.
#[cfg(test)]
pub(crate) fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8])> {
    let malformed = |what: &str| Error::InvalidResponse(format!("malformed DER: {what}"));

    let (&tag, rest) = input.split_first().ok_or_else(|| malformed("empty input"))?;
    if tag & 0x1f == 0x1f {
        return Err(malformed("high tag numbers are not supported"));
    }
    let (&first, rest) = rest.split_first().ok_or_else(|| malformed("missing length"))?;

    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > std::mem::size_of::<usize>() || rest.len() < count {
            return Err(malformed("bad long-form length"));
        }
        let (len_bytes, rest) = rest.split_at(count);
        let len = len_bytes
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, rest)
    };

    if rest.len() < len {
        return Err(malformed("length exceeds input"));
    }
    let (value, rest) = rest.split_at(len);
    Ok((Tlv { tag, value }, rest))
}

/// Reads every TLV in `input`.
#[cfg(test)]
pub(crate) fn read_all(mut input: &[u8]) -> Result<Vec<Tlv<'_>>> {
    let mut out = Vec::new();
    while !input.is_empty() {
        let (item, rest) = read_tlv(input)?;
        out.push(item);
        input = rest;
    }
    Ok(out)
}
