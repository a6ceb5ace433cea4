pub mod codec;
pub mod handshake;
pub mod packet;
pub mod response;
pub mod resultset;
pub mod wire;

pub use codec::PacketCodec;
pub use handshake::{compute_auth_response, HandshakeResponse, InitialHandshake};
pub use packet::{capabilities, Command, Packet, MAX_PACKET_SIZE};
pub use response::{is_eof_packet, is_err_packet, is_ok_packet, ErrPacket, OkPacket};
