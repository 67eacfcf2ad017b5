//! The task behind a [`Session`](super::Session) handle.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::transport::{ConnectionId, NoticeSink, Transport, TransportEvent, TransportNotice};

use super::command::{Api, Command, Identity, VoteDirection, vote_command};
use super::config::{Credentials, SessionConfig};
use super::endpoint::{Endpoint, select_endpoint};
use super::event::BotEvent;
use super::wire::{self, Body};
use super::{SessionError, SessionStatus};

pub(super) type Responder = oneshot::Sender<Result<Value, SessionError>>;

/// Whether a command needs the current room id filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Scope {
    Global,
    Room,
}

#[derive(Debug)]
pub(super) enum Request {
    Command {
        command: Command,
        scope: Scope,
        responder: Responder,
    },
    Vote {
        direction: VoteDirection,
        responder: Responder,
    },
    JoinRoom {
        room_id: String,
        endpoint: Option<Endpoint>,
        responder: Responder,
    },
    Status(oneshot::Sender<SessionStatus>),
    Disconnect,
}

impl Request {
    /// Resolve the caller's response with `err` without running the request.
    pub(super) fn fail(self, err: SessionError) {
        match self {
            Request::Command { responder, .. }
            | Request::Vote { responder, .. }
            | Request::JoinRoom { responder, .. } => {
                let _ = responder.send(Err(err));
            }
            Request::Status(_) | Request::Disconnect => {}
        }
    }
}

/// Work to do when a response arrives, beyond resolving the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowUp {
    None,
    /// Presence asserted after `no_session`: join the queued room
    JoinQueued,
    /// Room info fetched after a join: announce the room
    AnnounceRoom,
}

#[derive(Debug)]
struct PendingCommand {
    api: Api,
    envelope: Value,
    follow_up: FollowUp,
    responder: Option<Responder>,
}

#[derive(Debug)]
struct QueuedJoin {
    room_id: String,
    responder: Option<Responder>,
}

pub(super) struct SessionActor {
    identity: Identity,
    config: SessionConfig,
    endpoint: Endpoint,
    transport: Option<Transport>,
    next_connection: ConnectionId,
    notices: NoticeSink,
    events: mpsc::UnboundedSender<BotEvent>,
    next_msgid: u64,
    pending: HashMap<u64, PendingCommand>,
    /// Logical connection flag: set by authentication, cleared by
    /// `disconnect()`. Governs reconnect on an unexpected drop.
    connected: bool,
    room_id: Option<String>,
    track_id: Option<String>,
    queued_join: Option<QueuedJoin>,
    last_heartbeat: Option<Instant>,
    last_activity: Option<Instant>,
}

impl SessionActor {
    pub(super) fn new(
        credentials: Credentials,
        config: SessionConfig,
        events: mpsc::UnboundedSender<BotEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportNotice>), SessionError> {
        let endpoint = select_endpoint(&config.endpoints, credentials.room_id.as_deref())
            .cloned()
            .ok_or(SessionError::NoEndpoints)?;
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let queued_join = credentials.room_id.map(|room_id| QueuedJoin {
            room_id,
            responder: None,
        });

        let actor = SessionActor {
            identity: Identity::new(credentials.user_id, credentials.auth_token),
            config,
            endpoint,
            transport: None,
            next_connection: 0,
            notices: notices_tx,
            events,
            next_msgid: 0,
            pending: HashMap::new(),
            connected: false,
            room_id: None,
            track_id: None,
            queued_join,
            last_heartbeat: None,
            last_activity: None,
        };
        Ok((actor, notices_rx))
    }

    /// Connect a fresh transport to the current endpoint.
    pub(super) async fn open_transport(&mut self) -> Result<(), SessionError> {
        self.next_connection += 1;
        let transport = Transport::connect(
            self.next_connection,
            &self.endpoint,
            &self.config.transport,
            self.notices.clone(),
        )
        .await?;
        self.transport = Some(transport);
        Ok(())
    }

    pub(super) async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut notices: mpsc::UnboundedReceiver<TransportNotice>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(notice) = notices.recv() => self.handle_notice(notice).await,
            }
        }

        log::debug!("[Session] all handles dropped, stopping");
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Command {
                command,
                scope,
                responder,
            } => {
                let command = match (scope, &self.room_id) {
                    (Scope::Global, _) => command,
                    (Scope::Room, Some(room_id)) => command.with("roomid", room_id.as_str()),
                    (Scope::Room, None) => {
                        let _ = responder.send(Err(SessionError::NotInRoom));
                        return;
                    }
                };
                self.send(command, Some(responder), FollowUp::None);
            }
            Request::Vote {
                direction,
                responder,
            } => {
                let command = match (&self.room_id, &self.track_id) {
                    (Some(room_id), Some(track_id)) => vote_command(room_id, track_id, direction),
                    (None, _) => {
                        let _ = responder.send(Err(SessionError::NotInRoom));
                        return;
                    }
                    (Some(_), None) => {
                        let _ = responder.send(Err(SessionError::NoTrack));
                        return;
                    }
                };
                self.send(command, Some(responder), FollowUp::None);
            }
            Request::JoinRoom {
                room_id,
                endpoint,
                responder,
            } => self.join_room(room_id, endpoint, responder).await,
            Request::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Request::Disconnect => {
                log::info!("[Session] disconnecting from {}", self.endpoint);
                self.connected = false;
                self.fail_queued_join(SessionError::NotConnected);
                match &self.transport {
                    Some(transport) => transport.close(),
                    None => self.publish(BotEvent::Disconnected),
                }
            }
        }
    }

    async fn join_room(&mut self, room_id: String, endpoint: Option<Endpoint>, responder: Responder) {
        let target = match endpoint {
            Some(endpoint) => endpoint,
            None => match select_endpoint(&self.config.endpoints, Some(&room_id)) {
                Some(endpoint) => endpoint.clone(),
                None => {
                    let _ = responder.send(Err(SessionError::NoEndpoints));
                    return;
                }
            },
        };

        if target == self.endpoint && self.transport.is_some() {
            if self.connected {
                self.send_join(room_id, Some(responder));
            } else {
                // Joined once the server asks for a session.
                self.queue_join(room_id, responder);
            }
            return;
        }

        if target == self.endpoint {
            log::info!("[Session] reopening {} for room {}", target, room_id);
        } else {
            log::info!(
                "[Session] room {} is served by {}, moving from {}",
                room_id,
                target,
                self.endpoint
            );
        }
        if let Some(old) = self.transport.take() {
            old.close();
        }
        self.endpoint = target;
        self.queue_join(room_id, responder);
        if let Err(err) = self.open_transport().await {
            log::warn!("[Session] connecting to {} failed: {}", self.endpoint, err);
            self.connection_lost(err);
        }
    }

    fn queue_join(&mut self, room_id: String, responder: Responder) {
        if let Some(previous) = self.queued_join.replace(QueuedJoin {
            room_id,
            responder: Some(responder),
        }) {
            log::debug!("[Session] queued join of {} superseded", previous.room_id);
        }
    }

    fn send_join(&mut self, room_id: String, responder: Option<Responder>) {
        let command = Command::new(Api::RoomRegister).with("roomid", room_id);
        self.send(command, responder, FollowUp::None);
    }

    fn fail_queued_join(&mut self, err: SessionError) {
        if let Some(QueuedJoin {
            responder: Some(responder),
            ..
        }) = self.queued_join.take()
        {
            let _ = responder.send(Err(err));
        }
    }

    /// Correlate, envelope and send `command`.
    fn send(&mut self, command: Command, responder: Option<Responder>, follow_up: FollowUp) {
        let Some(transport) = &self.transport else {
            if let Some(responder) = responder {
                let _ = responder.send(Err(SessionError::NotConnected));
            }
            return;
        };

        let msgid = self.next_msgid;
        self.next_msgid += 1;
        let api = command.api();
        let envelope = command.into_envelope(msgid, &self.identity);
        log::debug!("[Session] sending {} (msgid {})", api.as_str(), msgid);

        if let Err(err) = transport.send_text(wire::encode(&envelope.to_string())) {
            log::warn!("[Session] {} not sent: {}", api.as_str(), err);
            if let Some(responder) = responder {
                let _ = responder.send(Err(err.into()));
            }
            return;
        }
        self.pending.insert(
            msgid,
            PendingCommand {
                api,
                envelope,
                follow_up,
                responder,
            },
        );
    }

    async fn handle_notice(&mut self, notice: TransportNotice) {
        let current = self.transport.as_ref().map(Transport::id);
        if current != Some(notice.connection) {
            log::debug!(
                "[Session] ignoring {:?} from stale transport #{}",
                notice.event,
                notice.connection
            );
            return;
        }

        match notice.event {
            TransportEvent::Connected => {
                log::info!("[Session] transport #{} open to {}", notice.connection, self.endpoint);
            }
            TransportEvent::Message(text) => self.dispatch(&text),
            TransportEvent::MessageSent => {}
            TransportEvent::Closed => {
                log::info!("[Session] transport #{} closed", notice.connection);
                self.transport = None;
                self.connection_lost(SessionError::NotConnected);
            }
            TransportEvent::Dropped => {
                log::info!("[Session] transport #{} dropped", notice.connection);
                self.transport = None;
                self.reconnect().await;
            }
        }
    }

    async fn reconnect(&mut self) {
        if !self.connected {
            self.connection_lost(SessionError::NotConnected);
            return;
        }

        if self.queued_join.is_none() {
            self.queued_join = self.room_id.clone().map(|room_id| QueuedJoin {
                room_id,
                responder: None,
            });
        }
        log::info!("[Session] reconnecting to {}", self.endpoint);
        if let Err(err) = self.open_transport().await {
            log::warn!("[Session] reconnect to {} failed: {}", self.endpoint, err);
            self.connection_lost(err);
        }
    }

    /// Give up on the connection and tell the consumer.
    fn connection_lost(&mut self, err: SessionError) {
        self.transport = None;
        self.connected = false;
        self.fail_queued_join(err);
        self.publish(BotEvent::Disconnected);
    }

    fn dispatch(&mut self, text: &str) {
        self.last_activity = Some(Instant::now());
        let bodies = match wire::decode(text) {
            Ok(bodies) => bodies,
            Err(err) => {
                log::warn!("[Session] discarding malformed message: {}", err);
                return;
            }
        };

        for body in bodies {
            match wire::classify(body) {
                Body::Heartbeat(beat) => {
                    self.last_heartbeat = Some(Instant::now());
                    if let Some(transport) = &self.transport {
                        let _ = transport.send_text(wire::encode(beat));
                    }
                }
                Body::NoSession => self.on_no_session(),
                Body::Document(json) => match serde_json::from_str::<Value>(json) {
                    Ok(document) => self.on_document(document),
                    Err(err) => log::warn!("[Session] discarding unparsable body: {}", err),
                },
            }
        }
    }

    fn on_no_session(&mut self) {
        if !self.connected {
            self.send(Command::new(Api::Authenticate), None, FollowUp::None);
        }
        let presence =
            Command::new(Api::PresenceUpdate).with("status", self.config.presence_status.as_str());
        self.send(presence, None, FollowUp::JoinQueued);
    }

    fn on_document(&mut self, document: Value) {
        if let Some(msgid) = document.get("msgid").and_then(Value::as_u64) {
            match self.pending.remove(&msgid) {
                Some(pending) => self.on_response(pending, &document),
                None => log::debug!("[Session] no command waiting on msgid {}", msgid),
            }
        }

        let push = document
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_owned);
        if let Some(name) = push {
            self.on_push(&name, document);
        }
    }

    fn on_response(&mut self, pending: PendingCommand, document: &Value) {
        let success = document
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        match pending.api {
            Api::Authenticate if success => {
                self.connected = true;
                self.publish(BotEvent::Authenticated);
            }
            Api::Authenticate => log::warn!("[Session] authentication refused"),
            Api::RoomRegister if success => {
                let room_id = pending
                    .envelope
                    .get("roomid")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                log::info!("[Session] joined room {:?}", room_id);
                self.room_id = room_id.clone();
                self.track_id = None;
                if let Some(room_id) = room_id {
                    let info = Command::new(Api::RoomInfo).with("roomid", room_id);
                    self.send(info, None, FollowUp::AnnounceRoom);
                }
            }
            Api::RoomInfo if success => {
                self.track_id = current_track_id(document);
                if pending.follow_up == FollowUp::AnnounceRoom {
                    self.publish(BotEvent::RoomChanged(document.clone()));
                    if self.track_id.is_some() {
                        self.publish(BotEvent::TrackStarted(document.clone()));
                    } else {
                        self.publish(BotEvent::NoTrackPlaying(document.clone()));
                    }
                }
            }
            Api::RoomDeregister if success => {
                log::info!("[Session] left room {:?}", self.room_id);
                self.room_id = None;
                self.track_id = None;
                self.publish(BotEvent::TrackEnded(document.clone()));
            }
            _ => {}
        }

        if pending.follow_up == FollowUp::JoinQueued {
            match self.queued_join.take() {
                Some(join) => self.send_join(join.room_id, join.responder),
                None => self.publish(BotEvent::ConnectedWithoutRoom),
            }
        }

        if let Some(responder) = pending.responder {
            let _ = responder.send(Ok(document.clone()));
        }
    }

    fn on_push(&mut self, name: &str, document: Value) {
        match name {
            "newsong" => {
                self.track_id = current_track_id(&document);
                self.publish(BotEvent::TrackStarted(document));
            }
            "endsong" => {
                self.track_id = None;
                self.publish(BotEvent::TrackEnded(document));
            }
            "nosong" => {
                self.track_id = None;
                self.publish(BotEvent::TrackEnded(document.clone()));
                self.publish(BotEvent::NoTrackPlaying(document));
            }
            _ => match BotEvent::from_push(name, document) {
                Some(event) => self.publish(event),
                None => log::debug!("[Session] unhandled push event {}", name),
            },
        }
    }

    fn publish(&self, event: BotEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            client_id: self.identity.client_id.clone(),
            user_id: self.identity.user_id.clone(),
            room_id: self.room_id.clone(),
            track_id: self.track_id.clone(),
            authenticated: self.connected,
            endpoint: self.endpoint.clone(),
            transport: self.transport.as_ref().map(|t| (t.id(), t.state())),
            pending_commands: self.pending.len(),
            last_heartbeat: self.last_heartbeat,
            last_activity: self.last_activity,
        }
    }
}

/// Id of the playing track in a room document, if the server sent one.
fn current_track_id(document: &Value) -> Option<String> {
    document
        .pointer("/room/metadata/current_song/_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_current_track_id_tolerates_missing_fields() {
        let doc = json!({"room": {"metadata": {"current_song": {"_id": "t1"}}}});
        assert_eq!(current_track_id(&doc), Some("t1".to_string()));
        assert_eq!(current_track_id(&json!({"room": {"metadata": {}}})), None);
        assert_eq!(current_track_id(&json!({"room": {"metadata": {"current_song": null}}})), None);
        assert_eq!(current_track_id(&json!({})), None);
    }

    #[test]
    fn test_failed_request_resolves_caller() {
        let (tx, mut rx) = oneshot::channel();
        Request::Vote {
            direction: VoteDirection::Up,
            responder: tx,
        }
        .fail(SessionError::Shutdown);
        assert_eq!(rx.try_recv().unwrap(), Err(SessionError::Shutdown));
    }
}
