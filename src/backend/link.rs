use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::config::BackendConfig;
use crate::health::Server;
use crate::protocol::{
    capabilities, compute_auth_response, is_err_packet, is_ok_packet, ErrPacket,
    HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};

pub type LinkSink = SplitSink<Framed<TcpStream, PacketCodec>, Packet>;
pub type LinkStream = SplitStream<Framed<TcpStream, PacketCodec>>;

/// An authenticated physical connection to one backend server
pub struct BackendLink {
    framed: Framed<TcpStream, PacketCodec>,
    server_version: String,
    thread_id: u32,
}

impl BackendLink {
    /// Connect and authenticate with the configured backend credentials
    pub async fn connect(
        server: &Server,
        config: &BackendConfig,
        database: Option<&str>,
    ) -> Result<Self, ConnectionError> {
        let addr = server.addr();
        debug!(server = %server.name(), addr = %addr, "Connecting to backend");

        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Timeout(addr.clone()))?
            .map_err(|e| {
                error!(server = %server.name(), error = %e, "Failed to connect to backend");
                ConnectionError::Connect(e.to_string())
            })?;
        stream.set_nodelay(true).ok();

        let mut framed = Framed::new(stream, PacketCodec);

        let handshake_packet = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if is_err_packet(&handshake_packet.payload) {
            let err = ErrPacket::parse(&handshake_packet.payload)
                .map(|e| e.error_message)
                .unwrap_or_default();
            return Err(ConnectionError::Refused(err));
        }

        let backend_handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            server = %server.name(),
            server_version = %backend_handshake.server_version,
            "Received backend handshake"
        );

        let auth_response =
            compute_auth_response(&config.password, &backend_handshake.auth_plugin_data());
        let db = database
            .map(str::to_string)
            .or_else(|| config.database.clone());

        let mut caps = capabilities::DEFAULT_CAPABILITIES & backend_handshake.capability_flags;
        if db.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        } else {
            caps &= !capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: config.user.clone(),
            auth_response,
            database: db,
            auth_plugin_name: backend_handshake.auth_plugin_name.clone(),
        };

        framed
            .send(response.encode(1))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let reply = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            error!(
                server = %server.name(),
                error_code = err.error_code,
                error_message = %err.error_message,
                "Backend authentication failed"
            );
            return Err(ConnectionError::Auth(err.error_message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(ConnectionError::Protocol(
                "Unsupported authentication exchange".into(),
            ));
        }

        debug!(server = %server.name(), thread_id = backend_handshake.connection_id, "Backend authenticated");

        Ok(Self {
            framed,
            server_version: backend_handshake.server_version,
            thread_id: backend_handshake.connection_id,
        })
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.framed
            .send(packet)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }

    pub async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            None => Err(ConnectionError::Disconnected),
        }
    }

    /// Split into independently owned write and read halves
    pub fn split(self) -> (LinkSink, LinkStream) {
        self.framed.split()
    }
}

/// Connection errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Connection refused by server: {0}")]
    Refused(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection disconnected")]
    Disconnected,
}
