//! # Observers
//!
//! Callback fan-out for state transitions and per-request lifecycle
//! events. The observer list is copied under a short lock and callbacks
//! run outside it, so an observer may re-register or call back into the
//! client without deadlocking.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Disconnected,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Disconnected => "disconnected",
        }
    }
}

/// Request-start notification payload.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: String,
    pub subdomain: String,
    pub local_port: u16,
    pub method: Option<String>,
    pub path: Option<String>,
    /// UTC milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub enum RequestEvent {
    Started(RequestInfo),
    Finished { id: String },
}

pub type StateObserver = Arc<dyn Fn(ClientState) + Send + Sync>;
pub type RequestObserver = Arc<dyn Fn(&RequestEvent) + Send + Sync>;

#[derive(Default)]
pub struct Observers {
    state: Mutex<Vec<StateObserver>>,
    request: Mutex<Vec<RequestObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_state_change(&self, observer: StateObserver) {
        self.state.lock().expect("observer lock").push(observer);
    }

    pub fn on_request(&self, observer: RequestObserver) {
        self.request.lock().expect("observer lock").push(observer);
    }

    pub fn notify_state(&self, state: ClientState) {
        let observers = self.state.lock().expect("observer lock").clone();
        for observer in observers {
            observer(state);
        }
    }

    pub fn notify_request(&self, event: &RequestEvent) {
        let observers = self.request.lock().expect("observer lock").clone();
        for observer in observers {
            observer(event);
        }
    }
}
