//! Primitive encodings shared by handshake, response and resultset parsing

use bytes::{BufMut, BytesMut};

/// Marker byte used in place of a length for SQL NULL in text rows
pub const NULL_MARKER: u8 = 0xFB;

/// Read a length-encoded integer, returning the value and bytes consumed
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first {
        0..=0xFA => Some((first as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => {
            Some((u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64, 4))
        }
        0xFE if data.len() >= 9 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[1..9]);
            Some((u64::from_le_bytes(raw), 9))
        }
        _ => None,
    }
}

/// Read a length-encoded string. `Ok(None)` is SQL NULL.
pub fn read_lenenc_bytes(data: &[u8]) -> Option<(Option<&[u8]>, usize)> {
    if data.first() == Some(&NULL_MARKER) {
        return Some((None, 1));
    }
    let (len, header) = read_lenenc_int(data)?;
    let end = header.checked_add(len as usize)?;
    if data.len() < end {
        return None;
    }
    Some((Some(&data[header..end]), end))
}

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 1 << 16 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 1 << 24 {
        buf.put_u8(0xFD);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Encode a length-encoded string, `None` as SQL NULL
pub fn put_lenenc_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            put_lenenc_int(buf, bytes.len() as u64);
            buf.extend_from_slice(bytes);
        }
        None => buf.put_u8(NULL_MARKER),
    }
}

/// Split a null-terminated string off the front of `data`
pub fn read_null_terminated(data: &[u8]) -> Option<(&[u8], usize)> {
    let end = data.iter().position(|&b| b == 0)?;
    Some((&data[..end], end + 1))
}
