//! Per-peer storage of the last accepted root announcement.
use std::collections::HashMap;

use crate::message::SwitchAnnouncement;
use crate::port::Port;
use crate::LocalTime;

/// A [`SwitchAnnouncement`] as stored by the tree state actor, tagged with
/// when it was accepted and its receive order (used to break ties between
/// otherwise-equal candidates during parent selection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAnnouncement {
    pub announcement: SwitchAnnouncement,
    pub receive_time: LocalTime,
    pub receive_order: u64,
}

impl StoredAnnouncement {
    pub fn coordinates(&self) -> Vec<Port> {
        self.announcement.coordinates()
    }
}

/// One slot per peer. Replacement is atomic (a single `HashMap` insert);
/// removal happens when the peer disconnects.
#[derive(Debug, Default)]
pub struct AnnouncementStore {
    entries: HashMap<Port, StoredAnnouncement>,
}

impl AnnouncementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, port: Port) -> Option<&StoredAnnouncement> {
        self.entries.get(&port)
    }

    pub fn insert(&mut self, port: Port, stored: StoredAnnouncement) {
        self.entries.insert(port, stored);
    }

    pub fn remove(&mut self, port: Port) -> Option<StoredAnnouncement> {
        self.entries.remove(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Port, &StoredAnnouncement)> {
        self.entries.iter()
    }
}
