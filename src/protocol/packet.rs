use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Largest payload a single packet can carry. A packet of exactly this
/// size is followed by a continuation packet.
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        dst.reserve(PACKET_HEADER_SIZE + len);
        dst.put_uint_le(len as u64, 3);
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        if src.len() < PACKET_HEADER_SIZE + len {
            src.reserve(PACKET_HEADER_SIZE + len - src.len());
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }

    /// Command byte of a client packet
    pub fn command(&self) -> Command {
        self.payload.first().copied().map(Command::from).unwrap_or(Command::Unknown)
    }

    /// True when another packet carrying the rest of this payload follows
    pub fn is_continued(&self) -> bool {
        self.payload.len() == MAX_PACKET_SIZE
    }
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities negotiated on both the client and the backend side.
    ///
    /// CLIENT_DEPRECATE_EOF is never offered: reply tracking relies on the
    /// EOF packet that terminates column definitions and rows.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags carried by OK and EOF packets
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

macro_rules! commands {
    ($($name:ident = $byte:literal => $label:literal,)*) => {
        /// MySQL command types
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Command {
            $($name = $byte,)*
            Unknown = 0xff,
        }

        impl From<u8> for Command {
            fn from(value: u8) -> Self {
                match value {
                    $($byte => Command::$name,)*
                    _ => Command::Unknown,
                }
            }
        }

        impl Command {
            /// Protocol name of the command, as used in logs
            pub fn name(self) -> &'static str {
                match self {
                    $(Command::$name => $label,)*
                    Command::Unknown => "COM_UNKNOWN",
                }
            }
        }
    };
}

commands! {
    Sleep = 0x00 => "COM_SLEEP",
    Quit = 0x01 => "COM_QUIT",
    InitDb = 0x02 => "COM_INIT_DB",
    Query = 0x03 => "COM_QUERY",
    FieldList = 0x04 => "COM_FIELD_LIST",
    CreateDb = 0x05 => "COM_CREATE_DB",
    DropDb = 0x06 => "COM_DROP_DB",
    Refresh = 0x07 => "COM_REFRESH",
    Shutdown = 0x08 => "COM_SHUTDOWN",
    Statistics = 0x09 => "COM_STATISTICS",
    ProcessInfo = 0x0a => "COM_PROCESS_INFO",
    Connect = 0x0b => "COM_CONNECT",
    ProcessKill = 0x0c => "COM_PROCESS_KILL",
    Debug = 0x0d => "COM_DEBUG",
    Ping = 0x0e => "COM_PING",
    Time = 0x0f => "COM_TIME",
    DelayedInsert = 0x10 => "COM_DELAYED_INSERT",
    ChangeUser = 0x11 => "COM_CHANGE_USER",
    BinlogDump = 0x12 => "COM_BINLOG_DUMP",
    TableDump = 0x13 => "COM_TABLE_DUMP",
    ConnectOut = 0x14 => "COM_CONNECT_OUT",
    RegisterSlave = 0x15 => "COM_REGISTER_SLAVE",
    StmtPrepare = 0x16 => "COM_STMT_PREPARE",
    StmtExecute = 0x17 => "COM_STMT_EXECUTE",
    StmtSendLongData = 0x18 => "COM_STMT_SEND_LONG_DATA",
    StmtClose = 0x19 => "COM_STMT_CLOSE",
    StmtReset = 0x1a => "COM_STMT_RESET",
    SetOption = 0x1b => "COM_SET_OPTION",
    StmtFetch = 0x1c => "COM_STMT_FETCH",
    Daemon = 0x1d => "COM_DAEMON",
    BinlogDumpGtid = 0x1e => "COM_BINLOG_DUMP_GTID",
    ResetConnection = 0x1f => "COM_RESET_CONNECTION",
}

impl Command {
    /// Commands the server never answers
    pub fn expects_reply(self) -> bool {
        !matches!(self, Command::StmtClose | Command::StmtSendLongData | Command::Quit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_full_payload() {
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00, 0x00, 0x03, b'S'][..]);
        assert!(Packet::decode(&mut buf).is_none());

        buf.extend_from_slice(b"ELE");
        let packet = Packet::decode(&mut buf).unwrap();
        assert_eq!(packet.sequence_id, 0);
        assert_eq!(&packet.payload[..], b"\x03SELE");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_header() {
        let mut buf = BytesMut::new();
        Packet::new(3, vec![0x0e]).encode(&mut buf);
        assert_eq!(&buf[..], &[0x01, 0x00, 0x00, 0x03, 0x0e]);
    }

    #[test]
    fn test_command_byte() {
        assert_eq!(Packet::new(0, vec![0x03, b'x']).command(), Command::Query);
        assert_eq!(Packet::new(0, Vec::new()).command(), Command::Unknown);
        assert_eq!(Command::from(0x16).name(), "COM_STMT_PREPARE");
        assert!(!Command::StmtClose.expects_reply());
        assert!(Command::StmtExecute.expects_reply());
    }
}
