use std::collections::{BTreeMap, HashSet};

use super::types::{Participant, PeerId, Role, RoomId};

/// Single mutable source of truth for "which room, which slide, who".
///
/// Every event handler and transport callback reads through this instead
/// of capturing copies, and `epoch` changes on every join and leave so
/// deferred work can tell whether it still belongs to the live session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub room_id: Option<RoomId>,
    pub peer_id: PeerId,
    pub nickname: String,
    pub participants: BTreeMap<PeerId, Participant>,
    /// Peers that left during this session; late events naming them are
    /// ignored until they join again
    pub departed: HashSet<PeerId>,
    pub presenter_id: Option<PeerId>,
    pub slides: Vec<String>,
    pub current_slide: usize,
    pub epoch: u64,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(PeerId::generate())
    }
}

impl SessionContext {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            room_id: None,
            peer_id,
            nickname: String::new(),
            participants: BTreeMap::new(),
            departed: HashSet::new(),
            presenter_id: None,
            slides: Vec::new(),
            current_slide: 0,
            epoch: 0,
        }
    }

    /// Enter a room: fresh epoch, the local peer as the only participant.
    pub fn begin(&mut self, room_id: RoomId, nickname: &str) {
        self.reset();
        self.room_id = Some(room_id);
        self.nickname = nickname.to_string();
        self.participants.insert(
            self.peer_id.clone(),
            Participant::new(self.peer_id.clone(), nickname),
        );
    }

    pub fn reset(&mut self) {
        self.room_id = None;
        self.participants.clear();
        self.departed.clear();
        self.presenter_id = None;
        self.slides.clear();
        self.current_slide = 0;
        self.epoch += 1;
    }

    pub fn has_departed(&self, peer_id: &PeerId) -> bool {
        self.departed.contains(peer_id)
    }

    pub fn in_room(&self, room_id: &RoomId) -> bool {
        self.room_id.as_ref() == Some(room_id)
    }

    pub fn is_presenter(&self) -> bool {
        self.presenter_id.as_ref() == Some(&self.peer_id)
    }

    pub fn local(&self) -> Option<&Participant> {
        self.participants.get(&self.peer_id)
    }

    pub fn local_mut(&mut self) -> Option<&mut Participant> {
        self.participants.get_mut(&self.peer_id)
    }

    pub fn upsert_participant(&mut self, peer_id: PeerId, nickname: Option<&str>) -> &mut Participant {
        let is_presenter = self.presenter_id.as_ref() == Some(&peer_id);
        let participant = self
            .participants
            .entry(peer_id.clone())
            .or_insert_with(|| Participant::new(peer_id.clone(), peer_id.as_str()));
        if let Some(nickname) = nickname {
            participant.nickname = nickname.to_string();
        }
        if is_presenter {
            participant.role = Role::Presenter;
        }
        participant
    }

    /// Drop a participant and remember them as departed; a departing
    /// presenter leaves the seat empty.
    pub fn remove_participant(&mut self, peer_id: &PeerId) -> Option<Participant> {
        let removed = self.participants.remove(peer_id);
        self.departed.insert(peer_id.clone());
        if self.presenter_id.as_ref() == Some(peer_id) {
            self.presenter_id = None;
        }
        removed
    }

    /// Move the presenter role. Unknown peers are added, so `presenter_id`
    /// always names a current participant.
    pub fn set_presenter(&mut self, presenter_id: Option<PeerId>, nickname: Option<&str>) {
        if let Some(ref id) = presenter_id {
            self.upsert_participant(id.clone(), nickname);
        }
        for participant in self.participants.values_mut() {
            participant.role = if Some(&participant.peer_id) == presenter_id.as_ref() {
                Role::Presenter
            } else {
                Role::Viewer
            };
        }
        self.presenter_id = presenter_id;
    }

    /// Replace the deck and rewind to its first slide.
    pub fn set_deck(&mut self, slides: Vec<String>) {
        self.slides = slides;
        self.current_slide = 0;
    }

    pub fn slide_url(&self, index: usize) -> Option<&str> {
        self.slides.get(index).map(String::as_str)
    }

    pub fn is_valid_slide(&self, index: usize) -> bool {
        index < self.slides.len()
    }
}
