//! Routing and consistency core of one client session
//!
//! `RouterSession` owns no sockets. The driver feeds it client packets,
//! backend packets and connection events; it answers with `Action`s for the
//! driver to carry out, in order.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, BackendEvent, BackendId, CompletedReply, ReplyKind, ReplyOutcome, ReplyShape};
use crate::classifier::{QueryClassification, QueryType};
use crate::config::{FailureMode, ServerRole};
use crate::filter::{FilterChain, FilterVerdict};
use crate::health::Server;
use crate::metrics::metrics;
use crate::protocol::{Command, ErrPacket, Packet};
use crate::router::{decide, RouteTarget, RouterInstance, Routing, RoutingContext, RoutingError};

use super::load_data::{LoadData, LoadDataError, LoadDataState};
use super::sescmd::SessionCommandLog;
use super::state::SessionState;

/// Work for the driver
#[derive(Debug)]
pub enum Action {
    Send { backend: BackendId, packet: Packet },
    Reply(Packet),
    /// Open a link to `server` and `attach` it
    Connect { server: Arc<Server>, role: ServerRole },
    Close(BackendId),
    /// The client asked to leave
    Quit,
    Terminate(String),
}

/// A client statement with all its wire fragments
#[derive(Debug)]
struct Statement {
    packets: Vec<Packet>,
    /// Kept when dispatch is deferred
    classification: Option<QueryClassification>,
}

impl Statement {
    fn new(packets: Vec<Packet>) -> Self {
        Self {
            packets,
            classification: None,
        }
    }

    fn first(&self) -> &Packet {
        &self.packets[0]
    }

    /// The statement as one packet, fragments joined
    fn joined(&self) -> Cow<'_, Packet> {
        match self.packets.as_slice() {
            [single] => Cow::Borrowed(single),
            packets => {
                let mut payload = BytesMut::with_capacity(packets.iter().map(|p| p.payload.len()).sum());
                for packet in packets {
                    payload.extend_from_slice(&packet.payload);
                }
                Cow::Owned(Packet::new(0, payload.freeze()))
            }
        }
    }

    /// Sequence id of a reply the router makes up itself
    fn reply_sequence(&self) -> u8 {
        self.packets.last().map_or(1, |p| p.sequence_id.wrapping_add(1))
    }
}

#[derive(Debug)]
enum Route {
    Single {
        backend: BackendId,
        target: RouteTarget,
        /// Backends that already failed this statement
        tried: Vec<BackendId>,
    },
    /// Held back until the keepalive sent to `backend` is answered
    Probing {
        backend: BackendId,
        target: RouteTarget,
        tried: Vec<BackendId>,
    },
    Broadcast {
        position: u64,
        /// Ready backends whose reply is outstanding
        waiting: Vec<BackendId>,
        /// Outcome of the first reply
        first: Option<ReplyOutcome>,
    },
}

#[derive(Debug)]
struct InFlight {
    statement: Statement,
    classification: QueryClassification,
    route: Route,
    started: Instant,
}

enum Step {
    /// Waiting for replies
    Busy,
    /// Answered without a reply pending
    Done,
    /// No backend can take it yet; retry when one finishes replaying
    Deferred(Statement),
}

pub struct RouterSession {
    id: u32,
    router: Arc<RouterInstance>,
    state: SessionState,
    filters: FilterChain,
    /// Attached backends in attach order
    backends: Vec<BackendConnection>,
    master: Option<BackendId>,
    next_backend: u64,
    log: SessionCommandLog,
    load: LoadData,
    queue: VecDeque<Statement>,
    /// Fragments of a statement larger than one packet
    fragments: Option<Vec<Packet>>,
    current: Option<InFlight>,
    actions: Vec<Action>,
    finished: bool,
}

impl RouterSession {
    pub fn new(id: u32, router: Arc<RouterInstance>, state: SessionState, filters: FilterChain) -> Self {
        Self {
            id,
            log: SessionCommandLog::from_config(router.config()),
            router,
            state,
            filters,
            backends: Vec::new(),
            master: None,
            next_backend: 0,
            load: LoadData::default(),
            queue: VecDeque::new(),
            fragments: None,
            current: None,
            actions: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn backends(&self) -> &[BackendConnection] {
        &self.backends
    }

    pub fn backend(&self, id: BackendId) -> Option<&BackendConnection> {
        self.backends.iter().find(|b| b.id() == id)
    }

    fn backend_mut(&mut self, id: BackendId) -> Option<&mut BackendConnection> {
        self.backends.iter_mut().find(|b| b.id() == id)
    }

    pub fn master(&self) -> Option<BackendId> {
        self.master
    }

    pub fn history(&self) -> &SessionCommandLog {
        &self.log
    }

    pub fn load_state(&self) -> LoadDataState {
        self.load.state()
    }

    /// A statement is waiting for replies
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    // ------------------------------------------------------------------
    // Backend attachment
    // ------------------------------------------------------------------

    /// Add a freshly connected backend. It is brought up to date with the
    /// session command history before it takes ordinary statements.
    pub fn attach(&mut self, server: Arc<Server>, role: ServerRole) -> (BackendId, Vec<Action>) {
        let id = BackendId(self.next_backend);
        self.next_backend += 1;
        if self.finished {
            self.actions.push(Action::Close(id));
            return (id, self.take_actions());
        }

        let role = match role {
            ServerRole::Master if self.master.is_some() => ServerRole::Slave,
            role => role,
        };
        let mut conn = BackendConnection::new(id, server, role);

        if self.log.end() > 0 {
            let replay = if self.log.is_disabled() {
                None
            } else {
                self.log.replay_from(0).ok()
            };
            let Some(commands) = replay else {
                warn!(
                    session_id = self.id,
                    backend = %id,
                    server = %conn.name(),
                    history_end = self.log.end(),
                    "Session command history incomplete, backend not attached"
                );
                metrics().record_replay("incomplete");
                self.actions.push(Action::Close(id));
                return (id, self.take_actions());
            };
            conn.start_replay();
            for command in commands {
                self.actions.push(Action::Send {
                    backend: id,
                    packet: Packet::new(0, command.payload().clone()),
                });
                conn.expect_reply(ReplyKind::Replay(command.position()), ReplyShape::Standard);
            }
            debug!(session_id = self.id, backend = %id, commands = conn.outstanding(), "Replaying session commands");
        }

        info!(
            session_id = self.id,
            backend = %id,
            server = %conn.name(),
            role = role.as_str(),
            ready = conn.is_ready(),
            "Backend attached"
        );
        if role == ServerRole::Master {
            self.master = Some(id);
        }
        self.backends.push(conn);
        self.dispatch_next();
        (id, self.take_actions())
    }

    /// A requested connection could not be established
    pub fn on_connect_failed(&mut self, server: &Server, role: ServerRole, reason: &str) -> Vec<Action> {
        warn!(
            session_id = self.id,
            server = %server.name(),
            role = role.as_str(),
            reason,
            "Backend connection failed"
        );
        metrics().record_backend_failure(role.as_str());
        if !self.finished && !self.backends.iter().any(|b| b.is_usable()) {
            self.terminate("no backend connections left".to_string());
        }
        self.dispatch_next();
        self.take_actions()
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    pub fn on_client_packet(&mut self, packet: Packet) -> Vec<Action> {
        if self.finished {
            return Vec::new();
        }

        if self.load.accepting_data() {
            self.forward_load_chunk(packet);
            return self.take_actions();
        }

        match self.fragments.as_mut() {
            Some(fragments) => {
                let last = !packet.is_continued();
                fragments.push(packet);
                if last {
                    let packets = self.fragments.take().unwrap_or_default();
                    self.queue.push_back(Statement::new(packets));
                }
            }
            None if packet.is_continued() => self.fragments = Some(vec![packet]),
            None => self.queue.push_back(Statement::new(vec![packet])),
        }

        self.dispatch_next();
        self.take_actions()
    }

    fn forward_load_chunk(&mut self, packet: Packet) {
        if self.load.is_draining() {
            self.drain_load_chunk(&packet);
            return;
        }
        let routed = self.decide_for(&QueryClassification::raw(), &[]);
        let result = match routed {
            Ok(Routing::Single { backend, .. }) => self
                .load
                .on_chunk(backend, packet.payload.len(), packet.sequence_id)
                .map(|state| (backend, state)),
            Ok(Routing::Broadcast(_)) => Err(LoadDataError::NotAllowed),
            Err(RoutingError::LoadData(e)) => Err(e),
            Err(_) => Err(LoadDataError::TargetLost),
        };

        match result {
            Ok((backend, state)) => {
                self.actions.push(Action::Send { backend, packet });
                if state == LoadDataState::End {
                    if let Some(b) = self.backend_mut(backend) {
                        b.local_infile_sent();
                    }
                    debug!(session_id = self.id, bytes = self.load.bytes(), "LOAD DATA stream complete");
                }
            }
            Err(e) => {
                warn!(session_id = self.id, error = %e, "LOAD DATA stream broken");
                if let Some(target) = self.load.target() {
                    self.backend_failed(target, &e.to_string());
                }
                if !self.load.is_draining() && self.load.accepting_data() {
                    if let Some(current) = self.current.take() {
                        self.state.statement_failed(&current.classification);
                    }
                    self.load.abort(e);
                }
                if self.load.is_draining() {
                    self.drain_load_chunk(&packet);
                }
            }
        }
    }

    /// The stream was abandoned; the statement's single error goes out once
    /// the client has finished uploading
    fn drain_load_chunk(&mut self, packet: &Packet) {
        let Some(reason) = self.load.drain(packet.payload.len(), packet.sequence_id) else {
            return;
        };
        info!(session_id = self.id, reason = %reason, "Abandoned LOAD DATA upload drained");
        let seq = packet.sequence_id.wrapping_add(1);
        self.load_data_error(seq, &reason);
        self.dispatch_next();
    }

    fn load_data_error(&mut self, seq: u8, reason: &LoadDataError) {
        match reason {
            LoadDataError::TargetLost => {
                self.error_reply(seq, 2013, "HY000", "Lost connection to backend server during query", "backend_lost")
            }
            e => self.error_reply(seq, 1105, "HY000", &e.to_string(), "load_data"),
        }
    }

    fn dispatch_next(&mut self) {
        while self.current.is_none() && !self.finished && !self.load.is_draining() {
            let Some(statement) = self.queue.pop_front() else {
                break;
            };
            match self.process_statement(statement) {
                Step::Busy | Step::Done => {}
                Step::Deferred(statement) => {
                    self.queue.push_front(statement);
                    break;
                }
            }
        }
    }

    fn decide_for(&self, classification: &QueryClassification, excluded: &[BackendId]) -> Result<Routing, RoutingError> {
        let ctx = RoutingContext {
            config: self.router.config(),
            backends: &self.backends,
            master: self.master,
            locked_target: self.load.target(),
            stream_chunk: self.load.accepting_data(),
            in_transaction: self.state.in_transaction(),
            locked_to_master: self.state.locked_to_master(),
            temp_tables: self.state.temp_tables(),
            excluded,
        };
        decide(classification, &ctx)
    }

    fn process_statement(&mut self, mut statement: Statement) -> Step {
        let seq = statement.reply_sequence();
        let classification = match statement.classification.take() {
            Some(classification) => classification,
            None => {
                let router = self.router.clone();
                router.stats().record_query();
                let joined = statement.joined();
                let classification = match router.classifier().classify(&joined) {
                    Ok(classification) => classification,
                    Err(e) => {
                        debug!(session_id = self.id, error = %e, "Statement not classified");
                        self.error_reply(seq, 1064, "42000", &e.to_string(), "classification");
                        return Step::Done;
                    }
                };
                match classification.command {
                    Command::Quit => {
                        info!(session_id = self.id, "Client sent COM_QUIT");
                        self.shutdown(Action::Quit);
                        return Step::Done;
                    }
                    Command::ChangeUser => {
                        self.error_reply(seq, 1105, "HY000", "COM_CHANGE_USER is not supported", "unsupported");
                        return Step::Done;
                    }
                    _ => {}
                }
                if let FilterVerdict::Respond(packets) = self.filters.route_query(&joined, &classification) {
                    debug!(session_id = self.id, "Statement answered by a filter");
                    self.actions.extend(packets.into_iter().map(Action::Reply));
                    return Step::Done;
                }
                classification
            }
        };

        let routing = match self.decide_for(&classification, &[]) {
            Ok(routing) => routing,
            Err(RoutingError::NoEligibleBackend(_)) if self.backends.iter().any(|b| b.is_replaying()) => {
                debug!(session_id = self.id, "Waiting for a backend to finish replaying");
                statement.classification = Some(classification);
                return Step::Deferred(statement);
            }
            Err(e) => {
                self.routing_failed(&e, &classification, seq);
                return Step::Done;
            }
        };
        debug!(
            session_id = self.id,
            command = classification.command.name(),
            types = %classification.types,
            tables = ?classification.tables,
            routing = ?routing,
            "Statement routed"
        );

        if classification.is(QueryType::MultiStatement)
            && self.router.config().strict_multi_stmt
            && !self.state.locked_to_master()
        {
            info!(session_id = self.id, "Multi-statement batch, session locked to master");
            self.state.lock_to_master();
        }

        match routing {
            Routing::Single { backend, target } => {
                self.dispatch_single(statement, classification, backend, target, Vec::new(), Instant::now())
            }
            Routing::Broadcast(backends) => self.dispatch_broadcast(statement, classification, backends),
        }
    }

    fn routing_failed(&mut self, error: &RoutingError, classification: &QueryClassification, seq: u8) {
        match error {
            RoutingError::MasterUnavailable => match self.router.config().master_failure_mode {
                FailureMode::FailInstantly | FailureMode::FailOnWrite => {
                    self.terminate(format!("{} attempted without a master", classification.types));
                }
                FailureMode::ErrorOnWrite => self.error_reply(
                    seq,
                    1290,
                    "HY000",
                    "The session has lost its master connection and cannot execute writes",
                    error.kind(),
                ),
            },
            RoutingError::NoEligibleBackend(_) => self.error_reply(seq, 2003, "HY000", &error.to_string(), error.kind()),
            RoutingError::SelectModifiesSessionData => {
                self.error_reply(seq, 1064, "42000", &error.to_string(), error.kind())
            }
            RoutingError::LoadData(_) => self.error_reply(seq, 1105, "HY000", &error.to_string(), error.kind()),
        }
    }

    fn dispatch_single(
        &mut self,
        statement: Statement,
        classification: QueryClassification,
        backend: BackendId,
        target: RouteTarget,
        tried: Vec<BackendId>,
        started: Instant,
    ) -> Step {
        let keepalive = self.router.config().keepalive();
        let Some(conn) = self.backends.iter_mut().find(|b| b.id() == backend) else {
            let seq = statement.reply_sequence();
            self.error_reply(seq, 2003, "HY000", "Selected backend is gone", "no_backend");
            return Step::Done;
        };

        if conn.needs_keepalive(keepalive) {
            debug!(session_id = self.id, backend = %backend, server = %conn.name(), "Idle backend, sending keepalive");
            self.actions.push(Action::Send {
                backend,
                packet: Packet::new(0, vec![Command::Ping as u8]),
            });
            conn.expect_reply(ReplyKind::Probe, ReplyShape::Standard);
            self.current = Some(InFlight {
                statement,
                classification,
                route: Route::Probing { backend, target, tried },
                started,
            });
            return Step::Busy;
        }
        for packet in &statement.packets {
            self.actions.push(Action::Send {
                backend,
                packet: packet.clone(),
            });
        }
        conn.expect_reply(ReplyKind::Client, classification.reply);

        if classification.is(QueryType::LoadData) {
            if let Err(e) = self.load.start(backend) {
                warn!(session_id = self.id, error = %e, "LOAD DATA state not reset");
            }
        }
        metrics().record_route(target.as_str());
        self.router.stats().record_route(target);

        if classification.reply == ReplyShape::None {
            return Step::Done;
        }
        self.current = Some(InFlight {
            statement,
            classification,
            route: Route::Single { backend, target, tried },
            started,
        });
        Step::Busy
    }

    fn dispatch_broadcast(
        &mut self,
        statement: Statement,
        classification: QueryClassification,
        backends: Vec<BackendId>,
    ) -> Step {
        let seq = statement.reply_sequence();
        if statement.packets.len() > 1 {
            self.error_reply(
                seq,
                1105,
                "HY000",
                "Session commands larger than one packet are not supported",
                "sescmd_too_large",
            );
            return Step::Done;
        }
        let packet = statement.first().clone();
        let position = match self.log.append(classification.command, packet.payload.clone()) {
            Ok(position) => position,
            Err(e) => {
                warn!(session_id = self.id, error = %e, "Session command rejected");
                self.error_reply(seq, 1105, "HY000", &e.to_string(), "sescmd_overflow");
                return Step::Done;
            }
        };

        let mut waiting = Vec::new();
        for id in backends {
            let Some(conn) = self.backends.iter_mut().find(|b| b.id() == id) else {
                continue;
            };
            let kind = if conn.is_ready() {
                waiting.push(id);
                ReplyKind::SessionCommand(position)
            } else {
                ReplyKind::Replay(position)
            };
            conn.expect_reply(kind, classification.reply);
            self.actions.push(Action::Send {
                backend: id,
                packet: packet.clone(),
            });
        }
        debug!(session_id = self.id, position, backends = waiting.len(), "Session command broadcast");
        metrics().session_commands_total.inc();
        metrics().record_route(RouteTarget::All.as_str());
        self.router.stats().record_route(RouteTarget::All);

        self.current = Some(InFlight {
            statement,
            classification,
            route: Route::Broadcast {
                position,
                waiting,
                first: None,
            },
            started: Instant::now(),
        });
        Step::Busy
    }

    // ------------------------------------------------------------------
    // Backend side
    // ------------------------------------------------------------------

    pub fn on_backend_packet(&mut self, id: BackendId, packet: Packet) -> Vec<Action> {
        if self.finished {
            return Vec::new();
        }
        let Some(conn) = self.backend_mut(id) else {
            debug!(session_id = self.id, backend = %id, "Packet from a detached backend dropped");
            return Vec::new();
        };
        match conn.on_packet(packet) {
            Ok(BackendEvent::Pending) => {}
            Ok(BackendEvent::LocalInfile(packet)) => self.on_local_infile(id, packet),
            Ok(BackendEvent::Completed(reply)) => match reply.kind {
                ReplyKind::Client => self.on_client_reply(id, reply),
                ReplyKind::SessionCommand(position) => self.on_session_command_reply(id, position, reply),
                ReplyKind::Replay(position) => self.on_replay_reply(id, position, reply.outcome),
                ReplyKind::Probe => self.on_probe_reply(id, reply.outcome),
            },
            Err(violation) => {
                warn!(session_id = self.id, backend = %id, error = %violation, "Backend protocol violation");
                self.backend_failed(id, &violation.to_string());
            }
        }
        self.take_actions()
    }

    fn on_local_infile(&mut self, id: BackendId, packet: Packet) {
        let expected = matches!(
            &self.current,
            Some(InFlight { route: Route::Single { backend, .. }, .. }) if *backend == id
        );
        if !expected || self.backend(id).and_then(|b| b.front_kind()) != Some(ReplyKind::Client) {
            self.backend_failed(id, "unexpected LOCAL INFILE request");
            return;
        }
        if !self.load.is_active() {
            if let Err(e) = self.load.start(id) {
                warn!(session_id = self.id, error = %e, "LOAD DATA state not reset");
            }
        }
        if let Err(e) = self.load.server_requested(id) {
            warn!(session_id = self.id, error = %e, "Unexpected LOCAL INFILE request");
        }
        self.actions.push(Action::Reply(packet));
    }

    fn on_probe_reply(&mut self, id: BackendId, outcome: ReplyOutcome) {
        if outcome.is_err() {
            warn!(session_id = self.id, backend = %id, outcome = %outcome, "Keepalive failed");
            self.backend_failed(id, "keepalive failed");
            return;
        }
        let Some(current) = self.current.take() else {
            return;
        };
        match current.route {
            Route::Probing { backend, target, tried } if backend == id => {
                debug!(session_id = self.id, backend = %id, "Keepalive answered, sending held statement");
                self.dispatch_single(current.statement, current.classification, backend, target, tried, current.started);
                self.dispatch_next();
            }
            route => {
                self.current = Some(InFlight { route, ..current });
            }
        }
    }

    fn on_client_reply(&mut self, id: BackendId, reply: CompletedReply) {
        let Some(current) = self.current.take() else {
            warn!(session_id = self.id, backend = %id, "Reply with no statement in flight dropped");
            return;
        };
        if !matches!(&current.route, Route::Single { backend, .. } if *backend == id) {
            warn!(session_id = self.id, backend = %id, "Reply from a backend the statement was not sent to");
            self.current = Some(current);
            return;
        }

        let mut packets = reply.packets;
        self.filters.client_reply(&mut packets);
        self.actions.extend(packets.into_iter().map(Action::Reply));
        self.finish_statement(current, &reply.outcome);
        self.dispatch_next();
    }

    fn on_session_command_reply(&mut self, id: BackendId, position: u64, reply: CompletedReply) {
        if let Some(conn) = self.backend_mut(id) {
            conn.acknowledge(position);
        }
        self.log.record_outcome(position, &reply.outcome);

        let Some(mut current) = self.current.take() else {
            return;
        };
        let Route::Broadcast { position: live, waiting, first } = &mut current.route else {
            self.current = Some(current);
            return;
        };
        if *live != position {
            self.current = Some(current);
            return;
        }
        waiting.retain(|w| *w != id);

        match first {
            None => {
                *first = Some(reply.outcome.clone());
                let mut packets = reply.packets;
                self.filters.client_reply(&mut packets);
                self.actions.extend(packets.into_iter().map(Action::Reply));
            }
            Some(expected) if !reply.outcome.matches(expected) => {
                let expected = expected.clone();
                let conn = self.backends.iter_mut().find(|b| b.id() == id);
                warn!(
                    session_id = self.id,
                    backend = %id,
                    server = conn.as_ref().map(|c| c.name()).unwrap_or_default(),
                    position,
                    expected = %expected,
                    got = %reply.outcome,
                    "Session command replies diverged"
                );
                metrics().reply_divergence_total.inc();
                if let Some(conn) = conn {
                    conn.set_degraded();
                }
            }
            Some(_) => {}
        }

        if !waiting.is_empty() {
            self.current = Some(current);
            return;
        }
        let outcome = first.clone().unwrap_or(ReplyOutcome::Ok);
        self.log.acknowledge(position);
        self.finish_statement(current, &outcome);
        self.dispatch_next();
    }

    fn on_replay_reply(&mut self, id: BackendId, position: u64, outcome: ReplyOutcome) {
        let expected = self.log.get(position).and_then(|c| c.outcome().cloned());
        if let Some(expected) = expected {
            if !outcome.matches(&expected) {
                warn!(
                    session_id = self.id,
                    backend = %id,
                    position,
                    expected = %expected,
                    got = %outcome,
                    "Replayed session command gave a different result, closing backend"
                );
                metrics().record_replay("mismatch");
                self.close_backend(id);
                self.dispatch_next();
                return;
            }
        }

        let end = self.log.end();
        let Some(conn) = self.backends.iter_mut().find(|b| b.id() == id) else {
            return;
        };
        conn.acknowledge(position);
        if conn.is_replaying() && conn.sescmd_acked() >= end {
            conn.finish_replay();
            info!(session_id = self.id, backend = %id, server = %conn.name(), "Backend caught up with session commands");
            metrics().record_replay("success");
            self.dispatch_next();
        }
    }

    fn finish_statement(&mut self, inflight: InFlight, outcome: &ReplyOutcome) {
        if outcome.is_err() {
            self.state.statement_failed(&inflight.classification);
        } else {
            self.state.statement_succeeded(&inflight.classification);
        }
        if self.load.is_active() && !self.load.is_draining() {
            let bytes = self.load.finish();
            info!(session_id = self.id, bytes, "LOAD DATA LOCAL INFILE finished");
        }
        let target = match inflight.route {
            Route::Single { target, .. } | Route::Probing { target, .. } => target,
            Route::Broadcast { .. } => RouteTarget::All,
        };
        metrics().record_statement_duration(target.as_str(), inflight.started.elapsed().as_secs_f64());
    }

    // ------------------------------------------------------------------
    // Failures
    // ------------------------------------------------------------------

    /// The link to `id` broke
    pub fn on_backend_failure(&mut self, id: BackendId, reason: &str) -> Vec<Action> {
        if !self.finished {
            self.backend_failed(id, reason);
        }
        self.take_actions()
    }

    fn backend_failed(&mut self, id: BackendId, reason: &str) {
        let Some(conn) = self.backend_mut(id) else {
            return;
        };
        if !conn.is_usable() {
            return;
        }
        conn.close();
        let role = conn.role();
        let name = conn.name().to_string();
        warn!(
            session_id = self.id,
            backend = %id,
            server = %name,
            role = role.as_str(),
            reason,
            "Backend connection lost"
        );
        metrics().record_backend_failure(role.as_str());
        self.actions.push(Action::Close(id));

        if self.master == Some(id) {
            self.master = None;
            let mode = self.router.config().master_failure_mode;
            if mode == FailureMode::FailInstantly {
                self.terminate(format!("lost connection to master {}", name));
                return;
            }
            info!(session_id = self.id, server = %name, mode = ?mode, "Master lost, session continues");
        }

        if let Some(current) = self.current.take() {
            match current.route {
                Route::Single { backend, .. } | Route::Probing { backend, .. } if backend == id => {
                    self.retry_or_fail(current, id)
                }
                Route::Broadcast { .. } => self.broadcast_lost_backend(current, id),
                _ => self.current = Some(current),
            }
        }

        if role == ServerRole::Slave && !self.finished {
            let mut attached: Vec<&str> = self.backends.iter().filter(|b| b.is_usable()).map(|b| b.name()).collect();
            attached.push(&name);
            if let Some(server) = self.router.replacement_server(&attached) {
                info!(session_id = self.id, lost = %name, replacement = %server.name(), "Replacing lost slave");
                self.actions.push(Action::Connect {
                    server,
                    role: ServerRole::Slave,
                });
            }
        }

        self.backends.retain(|b| b.is_usable());
        let reconnecting = self.actions.iter().any(|a| matches!(a, Action::Connect { .. }));
        if !self.finished && self.backends.is_empty() && !reconnecting {
            self.terminate("no backend connections left".to_string());
        }
        self.dispatch_next();
    }

    fn retry_or_fail(&mut self, current: InFlight, failed: BackendId) {
        let InFlight {
            statement,
            classification,
            route,
            started,
        } = current;
        let (mut tried, sent) = match route {
            Route::Single { tried, .. } => (tried, true),
            Route::Probing { tried, .. } => (tried, false),
            Route::Broadcast { .. } => (Vec::new(), true),
        };
        tried.push(failed);

        // Never reached the failed backend, so it is routed afresh
        if !sent {
            match self.decide_for(&classification, &tried) {
                Ok(Routing::Single { backend, target }) => {
                    info!(session_id = self.id, failed = %failed, retry = %backend, "Rerouting statement held for a keepalive");
                    self.dispatch_single(statement, classification, backend, target, tried, started);
                }
                Ok(Routing::Broadcast(_)) => {
                    self.state.statement_failed(&classification);
                    let seq = statement.reply_sequence();
                    self.error_reply(seq, 2013, "HY000", "Lost connection to backend server during query", "backend_lost");
                }
                Err(e) => {
                    let seq = statement.reply_sequence();
                    self.state.statement_failed(&classification);
                    self.routing_failed(&e, &classification, seq);
                }
            }
            return;
        }

        let retryable = self.router.config().retry_failed_reads
            && classification.is_read()
            && !self.state.in_transaction()
            && !self.load.is_active();
        if retryable {
            if let Ok(Routing::Single { backend, target }) = self.decide_for(&classification, &tried) {
                info!(session_id = self.id, failed = %failed, retry = %backend, "Retrying read on another backend");
                metrics().read_retries_total.inc();
                self.dispatch_single(statement, classification, backend, target, tried, started);
                return;
            }
        }

        self.state.statement_failed(&classification);
        let mut seq = statement.reply_sequence();
        if self.load.target() == Some(failed) {
            seq = self.load.reply_sequence().unwrap_or(seq);
            if self.load.abort(LoadDataError::TargetLost) {
                info!(session_id = self.id, "LOAD DATA target lost, draining the client upload");
                return;
            }
        }
        self.error_reply(seq, 2013, "HY000", "Lost connection to backend server during query", "backend_lost");
    }

    fn broadcast_lost_backend(&mut self, mut current: InFlight, lost: BackendId) {
        let Route::Broadcast { waiting, first, position } = &mut current.route else {
            self.current = Some(current);
            return;
        };
        waiting.retain(|w| *w != lost);
        if !waiting.is_empty() {
            self.current = Some(current);
            return;
        }
        match first.clone() {
            Some(outcome) => {
                self.log.acknowledge(*position);
                self.finish_statement(current, &outcome);
            }
            None => {
                let seq = current.statement.reply_sequence();
                self.state.statement_failed(&current.classification);
                self.error_reply(seq, 2013, "HY000", "Lost connection to backend server during query", "backend_lost");
            }
        }
    }

    fn close_backend(&mut self, id: BackendId) {
        if let Some(conn) = self.backend_mut(id) {
            conn.close();
        }
        self.actions.push(Action::Close(id));
        if self.master == Some(id) {
            self.master = None;
        }
        self.backends.retain(|b| b.is_usable());
    }

    fn error_reply(&mut self, seq: u8, code: u16, sql_state: &str, message: &str, kind: &str) {
        metrics().record_error(kind);
        let packet = ErrPacket::new(code, sql_state, message).encode(seq, self.state.capability_flags);
        self.actions.push(Action::Reply(packet));
    }

    fn terminate(&mut self, reason: String) {
        warn!(session_id = self.id, reason = %reason, "Terminating session");
        self.shutdown(Action::Terminate(reason));
    }

    /// Abandon everything in flight and stop
    fn shutdown(&mut self, action: Action) {
        self.finished = true;
        self.queue.clear();
        self.current = None;
        self.load.finish();
        for conn in &mut self.backends {
            conn.close();
        }
        self.actions.push(action);
    }
}
