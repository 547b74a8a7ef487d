use rand::Rng;
use uuid::Uuid;

use crate::outbox::Outbox;

pub type ConnId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: ConnId,
    pub username: String,
}

impl Identity {
    pub fn new(username: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
        }
    }

    pub fn guest() -> Self {
        let number = rand::thread_rng().gen_range(0..10000);
        Self::new(&format!("Guest_{number}"))
    }
}

/// One live player channel as seen by the registry.
#[derive(Debug)]
pub struct Connection {
    pub identity: Identity,
    /// `None` until the player joins a room.
    pub room: Option<String>,
    pub ready: bool,
    pub outbox: Outbox,
}

impl Connection {
    pub fn new(identity: Identity, outbox: Outbox) -> Self {
        Self {
            identity,
            room: None,
            ready: false,
            outbox,
        }
    }

    pub fn id(&self) -> ConnId {
        self.identity.id
    }
}
