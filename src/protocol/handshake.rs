use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, status, Packet};
use super::wire::{read_lenenc_int, read_null_terminated};

const NATIVE_PASSWORD: &str = "mysql_native_password";

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Handshake the proxy presents to its clients
    pub fn new(connection_id: u32) -> Self {
        let mut scramble1 = [0u8; 8];
        let mut scramble2 = vec![0u8; 12];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut scramble1);
        rng.fill_bytes(&mut scramble2);
        // The scramble is sent null-terminated, so it must not contain zeros
        for byte in scramble1.iter_mut().chain(scramble2.iter_mut()) {
            if *byte == 0 {
                *byte = 1;
            }
        }

        Self {
            protocol_version: 10,
            server_version: concat!("8.0.0-rwsplit-", env!("CARGO_PKG_VERSION")).to_string(),
            connection_id,
            auth_plugin_data_part1: scramble1,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_data_part2: scramble2,
            auth_plugin_name: NATIVE_PASSWORD.to_string(),
        }
    }

    /// Full 20-byte scramble
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);
        buf.extend_from_slice(&self.auth_plugin_data_part1);
        buf.put_u8(0);
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le((self.capability_flags >> 16) as u16);

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            let len = self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1;
            buf.put_u8(len as u8);
        } else {
            buf.put_u8(0);
        }
        buf.extend_from_slice(&[0u8; 10]);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
            buf.put_u8(0);
        }
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    /// Parse the handshake a backend sends on connect
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;
        if buf.remaining() < 1 {
            return None;
        }
        let protocol_version = buf.get_u8();

        let (version, used) = read_null_terminated(buf)?;
        let server_version = String::from_utf8_lossy(version).into_owned();
        buf.advance(used);

        // connection id, scramble part 1, filler, caps, charset, status, caps, scramble len, reserved
        if buf.remaining() < 4 + 8 + 1 + 2 + 1 + 2 + 2 + 1 + 10 {
            return None;
        }
        let connection_id = buf.get_u32_le();
        let mut auth_plugin_data_part1 = [0u8; 8];
        buf.copy_to_slice(&mut auth_plugin_data_part1);
        buf.advance(1);

        let caps_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let caps_upper = buf.get_u16_le() as u32;
        let capability_flags = caps_lower | (caps_upper << 16);
        let auth_plugin_data_len = buf.get_u8() as usize;
        buf.advance(10);

        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_plugin_data_len.saturating_sub(8)).min(buf.len());
            let data_len = buf[..len].iter().position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data_part2.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..end]).into_owned()
        } else {
            NATIVE_PASSWORD.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }
        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();
        buf.advance(23);

        let (user, used) = read_null_terminated(buf)?;
        let username = String::from_utf8_lossy(user).into_owned();
        buf.advance(used);

        let auth_response = if capability_flags
            & (CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA | CLIENT_SECURE_CONNECTION)
            != 0
        {
            let (len, header) = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
                read_lenenc_int(buf)?
            } else {
                (*buf.first()? as u64, 1)
            };
            let end = header + len as usize;
            if buf.len() < end {
                return None;
            }
            let data = buf[header..end].to_vec();
            buf.advance(end);
            data
        } else {
            let (data, used) = read_null_terminated(buf).unwrap_or((buf, buf.len()));
            let data = data.to_vec();
            buf.advance(used.min(buf.len()));
            data
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let (db, used) = read_null_terminated(buf).unwrap_or((buf, buf.len()));
            let db = String::from_utf8_lossy(db).into_owned();
            buf.advance(used.min(buf.len()));
            Some(db).filter(|d| !d.is_empty())
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..end]).into_owned()
        } else {
            NATIVE_PASSWORD.to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Compute the mysql_native_password token:
/// SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(stage2);
    let salted = hasher.finalize();

    stage1.iter().zip(salted.iter()).map(|(a, b)| a ^ b).collect()
}
