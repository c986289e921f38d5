//! Wire primitives shared by the handshake, demuxer and control codecs.
//!
//! Everything on the wire is big-endian. Beyond the fixed-width integers,
//! the protocol uses three composite field shapes:
//!
//! - `fixed_string(N)`: N bytes, NUL-padded UTF-8, trailing NULs stripped
//! - `len32_blob` / `len32_string`: `u32` length prefix + that many bytes
//! - `len16_blob` / `len16_string`: `u16` length prefix + that many bytes
//!
//! Decoders report [`ScryError::TruncatedFrame`] when a field runs past the
//! available bytes, which incremental parsers treat as "wait for more
//! input", and [`ScryError::MalformedFrame`] /
//! [`ScryError::PayloadTooLarge`] for impossible values.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ScryError;

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), ScryError> {
    if buf.remaining() < needed {
        return Err(ScryError::TruncatedFrame {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

// ── Integer decoders ─────────────────────────────────────────────

pub fn get_u8(buf: &mut impl Buf) -> Result<u8, ScryError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut impl Buf) -> Result<u16, ScryError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut impl Buf) -> Result<u32, ScryError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut impl Buf) -> Result<u64, ScryError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn get_i16(buf: &mut impl Buf) -> Result<i16, ScryError> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

pub fn get_i32(buf: &mut impl Buf) -> Result<i32, ScryError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut impl Buf) -> Result<i64, ScryError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

/// A `bool` is a single byte; any nonzero value reads as `true`.
pub fn get_bool(buf: &mut impl Buf) -> Result<bool, ScryError> {
    Ok(get_u8(buf)? != 0)
}

// ── Composite decoders ───────────────────────────────────────────

/// Read `len` bytes of NUL-padded UTF-8 and strip the padding.
pub fn get_fixed_string(buf: &mut impl Buf, len: usize) -> Result<String, ScryError> {
    ensure(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    raw.truncate(end);
    Ok(String::from_utf8(raw)?)
}

/// Read a `u32`-length-prefixed blob, enforcing `cap`.
pub fn get_len32_blob(buf: &mut impl Buf, cap: usize) -> Result<Bytes, ScryError> {
    let len = get_u32(buf)? as usize;
    if len > cap {
        return Err(ScryError::PayloadTooLarge { size: len, cap });
    }
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// Read a `u32`-length-prefixed UTF-8 string, enforcing `cap`.
pub fn get_len32_string(buf: &mut impl Buf, cap: usize) -> Result<String, ScryError> {
    let raw = get_len32_blob(buf, cap)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

/// Read a `u16`-length-prefixed blob.
pub fn get_len16_blob(buf: &mut impl Buf) -> Result<Bytes, ScryError> {
    let len = get_u16(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// Read a `u16`-length-prefixed UTF-8 string.
pub fn get_len16_string(buf: &mut impl Buf) -> Result<String, ScryError> {
    let raw = get_len16_blob(buf)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

// ── Encoders ─────────────────────────────────────────────────────

pub fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(value as u8);
}

/// Write a string into a fixed `len`-byte field, NUL-padded.
///
/// Input longer than `len` is truncated at a UTF-8 boundary.
pub fn put_fixed_string(dst: &mut BytesMut, value: &str, len: usize) {
    let mut bytes = value.as_bytes();
    if bytes.len() > len {
        let mut end = len;
        while end > 0 && !value.is_char_boundary(end) {
            end -= 1;
        }
        bytes = &bytes[..end];
    }
    dst.put_slice(bytes);
    dst.put_bytes(0, len - bytes.len());
}

pub fn put_len32_blob(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

pub fn put_len32_string(dst: &mut BytesMut, value: &str) {
    put_len32_blob(dst, value.as_bytes());
}

pub fn put_len16_blob(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u16(value.len() as u16);
    dst.put_slice(value);
}

pub fn put_len16_string(dst: &mut BytesMut, value: &str) {
    put_len16_blob(dst, value.as_bytes());
}
