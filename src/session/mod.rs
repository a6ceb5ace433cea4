//! Client sessions
//!
//! `Session` owns the sockets: it authenticates the client, opens the
//! backend links and shuttles packets. Every routing and consistency
//! decision is made by `RouterSession`, which answers each event with a list
//! of `Action`s for the driver to carry out.

mod load_data;
mod routing;
mod sescmd;
mod state;

pub use load_data::LoadDataError;
pub use routing::{Action, RouterSession};
pub use state::SessionState;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendId, BackendLink, ConnectionError, LinkSink, LinkStream};
use crate::config::{AuthConfig, FailureMode, ServerRole};
use crate::health::Server;
use crate::metrics::metrics;
use crate::protocol::{compute_auth_response, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec};
use crate::router::RouterInstance;

/// Backend events are buffered up to this many packets
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Handle a single client session
pub struct Session {
    pub id: u32,
    router: Arc<RouterInstance>,
    auth: Option<AuthConfig>,
}

impl Session {
    pub fn new(id: u32, router: Arc<RouterInstance>, auth: Option<AuthConfig>) -> Self {
        Self { id, router, auth }
    }

    /// Run the session until the client leaves or the session is terminated
    #[instrument(skip_all, fields(session_id = self.id))]
    pub async fn run<S>(self, client_stream: S, peer_host: String) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut client = Framed::new(client_stream, PacketCodec);

        let handshake = InitialHandshake::new(self.id);
        let scramble = handshake.auth_plugin_data();
        client.send(handshake.encode()).await?;

        let response_packet = client.next().await.ok_or(SessionError::ClientDisconnected)??;
        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("Invalid handshake response".into()))?;
        debug!(
            session_id = self.id,
            username = %response.username,
            database = ?response.database,
            "Received handshake response"
        );
        let capabilities = response.capability_flags;

        if let Err(e) = self.authenticate(&response, &scramble) {
            let err = ErrPacket::new(1045, "28000", &e.to_string());
            client.send(err.encode(2, capabilities)).await?;
            return Err(e);
        }

        let links = match self.connect_initial(response.database.as_deref()).await {
            Ok(links) => links,
            Err(e) => {
                let err = ErrPacket::new(2003, "HY000", &e.to_string());
                client.send(err.encode(2, capabilities)).await?;
                return Err(e);
            }
        };

        client.send(OkPacket::new().encode(2, capabilities)).await?;
        info!(
            session_id = self.id,
            username = %response.username,
            host = %peer_host,
            backends = links.len(),
            "Client authenticated"
        );

        let _registration = self.router.register_session(self.id, &response.username, &peer_host);
        metrics().record_session_started();

        let state = SessionState::new(response.username.clone(), peer_host.clone(), response.database.clone(), capabilities);
        let filters = self.router.filters_for(&response.username, &peer_host);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let mut driver = Driver {
            id: self.id,
            core: RouterSession::new(self.id, self.router.clone(), state, filters),
            router: self.router.clone(),
            database: response.database,
            client,
            links: HashMap::new(),
            events_tx,
            events_rx,
            connects: FuturesUnordered::new(),
        };

        let result = driver.serve(links).await;
        let core = &driver.core;
        debug!(
            session_id = core.id(),
            history = core.history().len(),
            backends = core.backends().len(),
            master = ?core.master(),
            in_transaction = core.state().in_transaction(),
            pending = core.is_busy() || core.queued() > 0,
            load_data = ?core.load_state(),
            finished = core.is_finished(),
            "Session closing"
        );
        metrics().record_session_closed();
        result
    }

    fn authenticate(&self, response: &HandshakeResponse, scramble: &[u8]) -> Result<(), SessionError> {
        let Some(auth) = &self.auth else {
            return Ok(());
        };
        if auth.user != response.username {
            return Err(SessionError::Auth(format!("Access denied for user '{}'", response.username)));
        }
        if compute_auth_response(&auth.password, scramble) != response.auth_response {
            return Err(SessionError::Auth(format!(
                "Access denied for user '{}' (using password: {})",
                response.username,
                if response.auth_response.is_empty() { "NO" } else { "YES" }
            )));
        }
        Ok(())
    }

    /// Open links to the master and the initial slaves concurrently
    async fn connect_initial(&self, database: Option<&str>) -> Result<Vec<Connected>, SessionError> {
        let (master, slaves) = self.router.initial_servers();
        let mut wanted: Vec<(Arc<Server>, ServerRole)> = Vec::new();
        if let Some(master) = master {
            wanted.push((master, ServerRole::Master));
        }
        wanted.extend(slaves.into_iter().map(|s| (s, ServerRole::Slave)));

        let config = self.router.backend_config().clone();
        let attempts = wanted.into_iter().map(|(server, role)| {
            let config = config.clone();
            let database = database.map(str::to_string);
            async move {
                let result = BackendLink::connect(&server, &config, database.as_deref()).await;
                Connected { server, role, result }
            }
        });

        let mut links = Vec::new();
        let mut have_master = false;
        for connected in join_all(attempts).await {
            match &connected.result {
                Ok(_) => have_master |= connected.role == ServerRole::Master,
                Err(e) => {
                    warn!(session_id = self.id, server = %connected.server.name(), error = %e, "Initial backend connection failed");
                    metrics().record_backend_failure(connected.role.as_str());
                    continue;
                }
            }
            links.push(connected);
        }

        if links.is_empty() {
            return Err(SessionError::NoBackend("no backend servers available".into()));
        }
        if !have_master && self.router.config().master_failure_mode == FailureMode::FailInstantly {
            return Err(SessionError::NoBackend("master server is not available".into()));
        }
        Ok(links)
    }
}

/// Outcome of one backend connection attempt
struct Connected {
    server: Arc<Server>,
    role: ServerRole,
    result: Result<BackendLink, ConnectionError>,
}

#[derive(Debug)]
enum BackendMessage {
    Packet(BackendId, Packet),
    Failed(BackendId, String),
}

/// Write half of an attached link; the read half lives in its own task
struct LinkHandle {
    sink: LinkSink,
    reader: JoinHandle<()>,
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

enum Flow {
    Continue,
    Done,
}

struct Driver<S> {
    id: u32,
    core: RouterSession,
    router: Arc<RouterInstance>,
    /// Database from the handshake; later changes reach new links by replay
    database: Option<String>,
    client: Framed<S, PacketCodec>,
    links: HashMap<BackendId, LinkHandle>,
    events_tx: mpsc::Sender<BackendMessage>,
    events_rx: mpsc::Receiver<BackendMessage>,
    connects: FuturesUnordered<BoxFuture<'static, Connected>>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn serve(&mut self, initial: Vec<Connected>) -> Result<(), SessionError> {
        for connected in initial {
            if let Flow::Done = self.on_connected(connected).await? {
                return Ok(());
            }
        }

        loop {
            let actions = tokio::select! {
                packet = self.client.next() => match packet {
                    Some(Ok(packet)) => self.core.on_client_packet(packet),
                    Some(Err(e)) => {
                        warn!(session_id = self.id, error = %e, "Client read error");
                        return Err(e.into());
                    }
                    None => {
                        info!(session_id = self.id, "Client disconnected");
                        return Ok(());
                    }
                },
                Some(message) = self.events_rx.recv() => match message {
                    BackendMessage::Packet(id, packet) => self.core.on_backend_packet(id, packet),
                    BackendMessage::Failed(id, reason) => self.core.on_backend_failure(id, &reason),
                },
                Some(connected) = self.connects.next(), if !self.connects.is_empty() => {
                    match self.on_connected(connected).await? {
                        Flow::Continue => continue,
                        Flow::Done => return Ok(()),
                    }
                }
            };
            if let Flow::Done = self.apply(actions).await? {
                return Ok(());
            }
        }
    }

    async fn on_connected(&mut self, connected: Connected) -> Result<Flow, SessionError> {
        let Connected { server, role, result } = connected;
        let link = match result {
            Ok(link) => link,
            Err(e) => {
                let actions = self.core.on_connect_failed(&server, role, &e.to_string());
                return self.apply(actions).await;
            }
        };
        debug!(
            session_id = self.id,
            server = %server.name(),
            server_version = %link.server_version(),
            thread_id = link.thread_id(),
            "Backend link open"
        );
        let (id, actions) = self.core.attach(server, role);
        let (sink, stream) = link.split();
        let reader = spawn_reader(id, stream, self.events_tx.clone());
        self.links.insert(id, LinkHandle { sink, reader });
        self.apply(actions).await
    }

    fn spawn_connect(&mut self, server: Arc<Server>, role: ServerRole) {
        let config = self.router.backend_config().clone();
        let database = self.database.clone();
        self.connects.push(
            async move {
                let result = BackendLink::connect(&server, &config, database.as_deref()).await;
                Connected { server, role, result }
            }
            .boxed(),
        );
    }

    async fn apply(&mut self, actions: Vec<Action>) -> Result<Flow, SessionError> {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send { backend, packet } => {
                    let Some(link) = self.links.get_mut(&backend) else {
                        continue;
                    };
                    if let Err(e) = link.sink.send(packet).await {
                        queue.extend(self.core.on_backend_failure(backend, &e.to_string()));
                    }
                }
                Action::Reply(packet) => self.client.send(packet).await?,
                Action::Connect { server, role } => self.spawn_connect(server, role),
                Action::Close(backend) => {
                    self.links.remove(&backend);
                }
                Action::Quit => return Ok(Flow::Done),
                Action::Terminate(reason) => {
                    info!(session_id = self.id, reason = %reason, "Session terminated");
                    return Ok(Flow::Done);
                }
            }
        }
        Ok(Flow::Continue)
    }
}

fn spawn_reader(id: BackendId, mut stream: LinkStream, events: mpsc::Sender<BackendMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = match stream.next().await {
                Some(Ok(packet)) => BackendMessage::Packet(id, packet),
                Some(Err(e)) => BackendMessage::Failed(id, e.to_string()),
                None => BackendMessage::Failed(id, "connection closed by server".into()),
            };
            let last = matches!(message, BackendMessage::Failed(..));
            if events.send(message).await.is_err() || last {
                break;
            }
        }
    })
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Backend connection failed: {0}")]
    NoBackend(String),
}
