//! Connection state machine
//!
//! Pure transition logic, no I/O. The Connection Manager feeds it link events
//! and acts on the returned [`Transition`].

use serde::Serialize;

/// Broker connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A transport is being opened
    Opening,
    /// Opening the transport failed synchronously
    OpenFailed,
    /// Broker acknowledged the connection
    Connected,
    /// Transport is retrying a lost link on its own
    Reconnecting,
    /// Link closed
    Closed,
    /// Client went offline
    Offline,
    /// Transport reported an error
    Error,
    /// Local `disconnect()`
    Disconnect,
}

/// Broker availability change worth telling the user about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Error while the error flag was already set; log quietly
    pub repeated_error: bool,
    pub availability: Option<Availability>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Current state plus the error flag that suppresses repeated error logs
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    state: ConnectionState,
    error_occurred: bool,
    online: bool,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            error_occurred: false,
            online: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error_occurred(&self) -> bool {
        self.error_occurred
    }

    /// `connect()` is a no-op in these states
    pub fn is_connecting_or_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    pub fn apply(&mut self, event: LinkEvent) -> Transition {
        let from = self.state;
        let mut repeated_error = false;
        let mut availability = None;

        match event {
            LinkEvent::Opening => self.state = ConnectionState::Connecting,
            LinkEvent::OpenFailed | LinkEvent::Disconnect => {
                self.state = ConnectionState::Disconnected;
                self.online = false;
            }
            LinkEvent::Connected => {
                if self.error_occurred || from == ConnectionState::Reconnecting {
                    availability = Some(Availability::Online);
                }
                self.state = ConnectionState::Connected;
                self.error_occurred = false;
                self.online = true;
            }
            LinkEvent::Reconnecting => self.state = ConnectionState::Reconnecting,
            LinkEvent::Closed | LinkEvent::Offline => {
                if self.online {
                    availability = Some(Availability::Offline);
                }
                self.state = ConnectionState::Disconnected;
                self.online = false;
            }
            LinkEvent::Error => {
                if self.error_occurred {
                    repeated_error = true;
                } else {
                    self.state = ConnectionState::Error;
                    self.error_occurred = true;
                }
            }
        }

        Transition {
            from,
            to: self.state,
            repeated_error,
            availability,
        }
    }
}
