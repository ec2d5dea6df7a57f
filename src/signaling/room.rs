use serde::Serialize;
use std::collections::BTreeSet;

use super::messages::{JoinResponse, PresenceUpdate, Role};

/// Signaling scope of one interview
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub interview_id: String,
    /// Assigned by the relay, never self-selected
    pub role: Role,
    /// Other peers currently joined
    pub roster: BTreeSet<String>,
}

impl Room {
    pub fn from_join(response: JoinResponse, interview_id: &str) -> Self {
        Self {
            room_id: response.room_id,
            interview_id: interview_id.to_string(),
            role: response.role,
            roster: response.roster.into_iter().collect(),
        }
    }

    /// Apply a presence update. Returns true if the roster changed.
    pub fn apply_presence(&mut self, update: &PresenceUpdate) -> bool {
        if update.room_id != self.room_id {
            return false;
        }
        if update.joined {
            self.roster.insert(update.peer.clone())
        } else {
            self.roster.remove(&update.peer)
        }
    }

    pub fn has_peers(&self) -> bool {
        !self.roster.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_updates_roster() {
        let mut room = Room::from_join(
            JoinResponse {
                room_id: "r1".to_string(),
                role: Role::Offerer,
                roster: vec![],
            },
            "iv-1",
        );
        assert!(!room.has_peers());

        let joined = PresenceUpdate {
            room_id: "r1".to_string(),
            peer: "candidate".to_string(),
            joined: true,
        };
        assert!(room.apply_presence(&joined));
        assert!(!room.apply_presence(&joined));
        assert!(room.has_peers());

        let other_room = PresenceUpdate {
            room_id: "r2".to_string(),
            ..joined.clone()
        };
        assert!(!room.apply_presence(&other_room));

        let left = PresenceUpdate {
            joined: false,
            ..joined
        };
        assert!(room.apply_presence(&left));
        assert!(!room.has_peers());
    }
}
