//! Semantic events published by a session.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

/// Everything a session reports to its consumer.
///
/// Payload-carrying variants hold the raw server document.
#[derive(Debug, Clone, PartialEq)]
pub enum BotEvent {
    /// Authentication succeeded
    Authenticated,
    /// The session is no longer connected and will not reconnect
    Disconnected,
    /// Connected and present, but no room was queued to join
    ConnectedWithoutRoom,
    /// A track began playing
    TrackStarted(Value),
    /// The playing track ended
    TrackEnded(Value),
    /// Nothing is playing in the room
    NoTrackPlaying(Value),
    /// The session moved into a room
    RoomChanged(Value),
    /// Someone entered the room
    UserJoined(Value),
    /// Someone left the room
    UserLeft(Value),
    /// Chat message
    UserSpoke(Value),
    /// A user's details changed
    UserUpdated(Value),
    /// A user was removed from the room
    UserBooted(Value),
    /// Vote tally changed
    VotesUpdated(Value),
    /// A DJ stepped up
    DjAdded(Value),
    /// A DJ stepped down
    DjRemoved(Value),
    /// A moderator was added
    ModeratorAdded(Value),
    /// A moderator was removed
    ModeratorRemoved(Value),
    /// Someone snagged the track
    TrackSnagged(Value),
    /// The server ordered this client off
    ForciblyDisconnected(Value),
}

impl BotEvent {
    /// Map a push-event name that needs no session state.
    pub fn from_push(command: &str, document: Value) -> Option<Self> {
        let event = match command {
            "registered" => BotEvent::UserJoined(document),
            "deregistered" => BotEvent::UserLeft(document),
            "speak" => BotEvent::UserSpoke(document),
            "update_votes" => BotEvent::VotesUpdated(document),
            "booted_user" => BotEvent::UserBooted(document),
            "update_user" => BotEvent::UserUpdated(document),
            "add_dj" => BotEvent::DjAdded(document),
            "rem_dj" => BotEvent::DjRemoved(document),
            "new_moderator" => BotEvent::ModeratorAdded(document),
            "rem_moderator" => BotEvent::ModeratorRemoved(document),
            "snagged" => BotEvent::TrackSnagged(document),
            "killdashnine" => BotEvent::ForciblyDisconnected(document),
            _ => return None,
        };
        Some(event)
    }
}

/// Receiving end of a session's events.
///
/// Ends once the session task has stopped and every queued event was read.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<BotEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<BotEvent>) -> Self {
        EventStream { rx }
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<BotEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is queued.
    pub fn try_recv(&mut self) -> Option<BotEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = BotEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
