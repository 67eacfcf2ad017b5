//! Session layer: one logical chat-room client over a [`Transport`].
//!
//! A [`Session`] is a cloneable handle to a task that owns every piece of
//! session state: the correlation table, the current room and track, the
//! authentication flag and the active transport. Handles talk to the task
//! over a channel; the task publishes [`BotEvent`]s on an [`EventStream`].
//!
//! ```text
//!  Session (handle) ──Request──►  SessionActor  ◄──TransportNotice── Transport task
//!                                     │
//!                                     └──BotEvent──► EventStream
//! ```
//!
//! Lifecycle on a fresh connection:
//!
//! 1. The server sends `no_session`.
//! 2. The session sends `user.authenticate` (unless already authenticated)
//!    and `presence.update`.
//! 3. On the presence response, a queued room is joined with
//!    `room.register`, otherwise [`BotEvent::ConnectedWithoutRoom`] fires.
//! 4. A successful `room.register` is followed by `room.info`, which
//!    announces [`BotEvent::RoomChanged`] and the current track.
//!
//! [`Transport`]: crate::transport::Transport

mod actor;
mod command;
mod config;
mod endpoint;
mod event;
pub mod wire;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::transport::{ConnectionId, TransportError, TransportState};

use actor::{Request, Scope, SessionActor};

pub use command::{Api, Command, Identity, Profile, VoteDirection, profile_command, vote_command};
pub use config::{Credentials, DEFAULT_PRESENCE_STATUS, SessionConfig, default_endpoints};
pub use endpoint::{Endpoint, ParseEndpointError, hash_mod, select_endpoint, sha1_hex};
pub use event::{BotEvent, EventStream};

/// Errors returned by session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The transport could not be opened
    Transport(TransportError),
    /// No endpoints are configured
    NoEndpoints,
    /// No transport is open to send on
    NotConnected,
    /// The command needs a room and none is joined
    NotInRoom,
    /// The command needs a playing track and none is known
    NoTrack,
    /// The session task has stopped
    Shutdown,
    /// The command was dropped before the server answered
    NoResponse,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(err) => write!(f, "Transport error: {}", err),
            SessionError::NoEndpoints => write!(f, "No chat endpoints configured"),
            SessionError::NotConnected => write!(f, "Not connected"),
            SessionError::NotInRoom => write!(f, "Not in a room"),
            SessionError::NoTrack => write!(f, "No track is playing"),
            SessionError::Shutdown => write!(f, "Session has shut down"),
            SessionError::NoResponse => write!(f, "Command was never answered"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::Transport(err)
    }
}

/// Server response to one command.
///
/// Resolves with the raw response document once a message carrying the
/// command's `msgid` arrives. Documents with `"success": false` still
/// resolve as `Ok`; inspect the document to tell.
#[derive(Debug)]
#[must_use = "dropping the response only discards the answer, the command is still sent"]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Value, SessionError>>,
}

impl Future for PendingResponse {
    type Output = Result<Value, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SessionError::NoResponse)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Client id stamped on every command
    pub client_id: String,
    /// Account id
    pub user_id: String,
    /// Joined room, if any
    pub room_id: Option<String>,
    /// Playing track, if known
    pub track_id: Option<String>,
    /// Whether authentication succeeded and has not been torn down
    pub authenticated: bool,
    /// Chat server the session is bound to
    pub endpoint: Endpoint,
    /// Active transport id and state
    pub transport: Option<(ConnectionId, TransportState)>,
    /// Commands sent and not yet answered
    pub pending_commands: usize,
    /// Last heartbeat received
    pub last_heartbeat: Option<Instant>,
    /// Last message of any kind received
    pub last_activity: Option<Instant>,
}

/// Handle to a running session.
///
/// Cheap to clone. The session task stops once every handle is dropped.
///
/// # Example
///
/// ```no_run
/// use tt_session::{BotEvent, Credentials, Session, SessionConfig};
///
/// # async fn run() -> Result<(), tt_session::SessionError> {
/// let credentials = Credentials::new("user-id", "auth-token").with_room("room-id");
/// let (session, mut events) = Session::connect(credentials, SessionConfig::default()).await?;
/// while let Some(event) = events.recv().await {
///     if let BotEvent::UserSpoke(doc) = event {
///         if doc["text"] == "hi" {
///             let _ = session.speak("hello!").await?;
///         }
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Session {
    requests: mpsc::UnboundedSender<Request>,
}

impl Session {
    /// Open a transport to the endpoint serving the initial room (a random
    /// endpoint without one) and start the session task.
    ///
    /// The initial room is joined once the server asks for a session.
    pub async fn connect(
        credentials: Credentials,
        config: SessionConfig,
    ) -> Result<(Session, EventStream), SessionError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (mut actor, notices) = SessionActor::new(credentials, config, events_tx)?;
        actor.open_transport().await?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        tokio::spawn(actor.run(requests_rx, notices));

        Ok((
            Session {
                requests: requests_tx,
            },
            EventStream::new(events_rx),
        ))
    }

    fn submit(&self, make: impl FnOnce(actor::Responder) -> Request) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(request)) = self.requests.send(make(tx)) {
            request.fail(SessionError::Shutdown);
        }
        PendingResponse { rx }
    }

    fn global(&self, command: Command) -> PendingResponse {
        self.submit(|responder| Request::Command {
            command,
            scope: Scope::Global,
            responder,
        })
    }

    fn in_room(&self, command: Command) -> PendingResponse {
        self.submit(|responder| Request::Command {
            command,
            scope: Scope::Room,
            responder,
        })
    }

    /// Send `user.authenticate`.
    pub fn authenticate(&self) -> PendingResponse {
        self.global(Command::new(Api::Authenticate))
    }

    /// Send `presence.update` with `status`.
    pub fn set_presence(&self, status: &str) -> PendingResponse {
        self.global(Command::new(Api::PresenceUpdate).with("status", status))
    }

    /// Join `room_id` on the endpoint that serves it.
    ///
    /// When that is a different chat server, the current transport is closed
    /// and the join runs once the new one asks for a session.
    pub fn join_room(&self, room_id: &str) -> PendingResponse {
        let room_id = room_id.to_string();
        self.submit(|responder| Request::JoinRoom {
            room_id,
            endpoint: None,
            responder,
        })
    }

    /// Join `room_id` on an explicit endpoint.
    pub fn join_room_on(&self, room_id: &str, endpoint: Endpoint) -> PendingResponse {
        let room_id = room_id.to_string();
        self.submit(|responder| Request::JoinRoom {
            room_id,
            endpoint: Some(endpoint),
            responder,
        })
    }

    /// Leave the current room.
    pub fn leave_room(&self) -> PendingResponse {
        self.in_room(Command::new(Api::RoomDeregister))
    }

    /// Say `text` in the current room.
    pub fn speak(&self, text: &str) -> PendingResponse {
        self.in_room(Command::new(Api::RoomSpeak).with("text", text))
    }

    /// Vote on the playing track.
    pub fn vote(&self, direction: VoteDirection) -> PendingResponse {
        self.submit(|responder| Request::Vote {
            direction,
            responder,
        })
    }

    /// Step up as a DJ.
    pub fn add_dj(&self) -> PendingResponse {
        self.in_room(Command::new(Api::AddDj))
    }

    /// Step down, or remove `dj_id` from the decks.
    pub fn remove_dj(&self, dj_id: Option<&str>) -> PendingResponse {
        let mut command = Command::new(Api::RemoveDj);
        if let Some(dj_id) = dj_id {
            command = command.with("djid", dj_id);
        }
        self.in_room(command)
    }

    /// Grant `user_id` moderator rights in the current room.
    pub fn add_moderator(&self, user_id: &str) -> PendingResponse {
        self.in_room(Command::new(Api::AddModerator).with("target_userid", user_id))
    }

    /// Revoke `user_id`'s moderator rights in the current room.
    pub fn remove_moderator(&self, user_id: &str) -> PendingResponse {
        self.in_room(Command::new(Api::RemoveModerator).with("target_userid", user_id))
    }

    /// Remove `user_id` from the current room.
    pub fn boot_user(&self, user_id: &str, reason: &str) -> PendingResponse {
        self.in_room(
            Command::new(Api::BootUser)
                .with("target_userid", user_id)
                .with("reason", reason),
        )
    }

    /// Change the display name.
    pub fn modify_name(&self, name: &str) -> PendingResponse {
        self.global(Command::new(Api::UserModify).with("name", name))
    }

    /// Choose an avatar.
    pub fn set_avatar(&self, avatar_id: u32) -> PendingResponse {
        self.global(Command::new(Api::SetAvatar).with("avatarid", avatar_id))
    }

    /// Update public profile fields.
    pub fn modify_profile(&self, profile: &Profile) -> PendingResponse {
        self.global(profile_command(profile))
    }

    /// Report the client type (`mac`, `pc`, `linux`, ...).
    pub fn set_client_type(&self, laptop: &str) -> PendingResponse {
        self.global(Command::new(Api::UserModify).with("laptop", laptop))
    }

    /// List public rooms starting at offset `skip`.
    pub fn list_rooms(&self, skip: u32) -> PendingResponse {
        self.global(Command::new(Api::ListRooms).with("skip", skip))
    }

    /// Fetch the current room's description.
    pub fn room_info(&self) -> PendingResponse {
        self.in_room(Command::new(Api::RoomInfo))
    }

    /// Ask for the server time.
    pub fn room_now(&self) -> PendingResponse {
        self.global(Command::new(Api::RoomNow))
    }

    /// Fetch this account's details.
    pub fn user_info(&self) -> PendingResponse {
        self.global(Command::new(Api::UserInfo))
    }

    /// Fetch the profile of `user_id`, or this account's own profile.
    pub fn user_profile(&self, user_id: Option<&str>) -> PendingResponse {
        let mut command = Command::new(Api::UserProfile);
        if let Some(user_id) = user_id {
            command = command.with("userid", user_id);
        }
        self.global(command)
    }

    /// Become a fan of `user_id`.
    pub fn become_fan(&self, user_id: &str) -> PendingResponse {
        self.global(Command::new(Api::BecomeFan).with("djid", user_id))
    }

    /// Stop being a fan of `user_id`.
    pub fn remove_fan(&self, user_id: &str) -> PendingResponse {
        self.global(Command::new(Api::RemoveFan).with("djid", user_id))
    }

    /// Send a command as built.
    pub fn send(&self, command: Command) -> PendingResponse {
        self.global(command)
    }

    /// Close the transport without reconnecting.
    ///
    /// [`BotEvent::Disconnected`] follows once the close completes.
    pub fn disconnect(&self) {
        let _ = self.requests.send(Request::Disconnect);
    }

    /// Snapshot of the session state.
    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Status(tx))
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }
}
