//! Generic response packets and the structural markers a proxy needs to
//! follow a reply without decoding its rows.

use bytes::{Buf, BufMut, BytesMut};

use super::packet::{capabilities::CLIENT_PROTOCOL_41, status, Packet};
use super::wire::{put_lenenc_int, read_lenenc_int};

pub const OK_HEADER: u8 = 0x00;
pub const ERR_HEADER: u8 = 0xFF;
pub const EOF_HEADER: u8 = 0xFE;
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;

/// OK packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(OK_HEADER);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }
        Packet::new(sequence_id, buf.freeze())
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error_code);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }
        buf.extend_from_slice(self.error_message.as_bytes());
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&ERR_HEADER) || payload.len() < 3 {
            return None;
        }
        let mut buf = &payload[1..];
        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if buf.first() == Some(&b'#') && buf.len() >= 6 {
            (
                String::from_utf8_lossy(&buf[1..6]).into_owned(),
                String::from_utf8_lossy(&buf[6..]).into_owned(),
            )
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).into_owned())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// EOF packets are at most 5 bytes in protocol 4.1; anything longer starting
/// with 0xFE is a row whose first column has an 8-byte length.
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

/// LOCAL INFILE request: the server asks the client to stream a file
pub fn is_local_infile_request(payload: &[u8]) -> bool {
    payload.first() == Some(&LOCAL_INFILE_HEADER)
}

/// Status flags of an OK or EOF packet
pub fn status_flags(payload: &[u8]) -> Option<u16> {
    match payload.first()? {
        &EOF_HEADER if payload.len() >= 5 => Some(u16::from_le_bytes([payload[3], payload[4]])),
        &OK_HEADER => {
            let (_, affected) = read_lenenc_int(&payload[1..])?;
            let (_, insert_id) = read_lenenc_int(&payload[1 + affected..])?;
            let at = 1 + affected + insert_id;
            if payload.len() < at + 2 {
                return None;
            }
            Some(u16::from_le_bytes([payload[at], payload[at + 1]]))
        }
        _ => None,
    }
}

/// True when an OK/EOF announces another result set in the same reply
pub fn more_results_exist(payload: &[u8]) -> bool {
    status_flags(payload)
        .map(|flags| flags & status::SERVER_MORE_RESULTS_EXISTS != 0)
        .unwrap_or(false)
}

/// Column and parameter counts of a COM_STMT_PREPARE OK response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub columns: u16,
    pub params: u16,
}

impl PrepareOk {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&OK_HEADER) || payload.len() < 9 {
            return None;
        }
        let mut buf = &payload[1..];
        Some(Self {
            statement_id: buf.get_u32_le(),
            columns: buf.get_u16_le(),
            params: buf.get_u16_le(),
        })
    }
}
