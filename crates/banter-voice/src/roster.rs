//! Voice roster — who is in which voice channel, as the client sees it.
//!
//! Merges the authoritative snapshot delivered with the joined payload with
//! live deltas (state updates, speaking, leaves) for presentation. This is
//! the thin reconciler in front of the session controller, not part of the
//! negotiation core.
//!
//! Two indexes for fast lookups:
//! - `by_user`: user_id → RemoteVoiceState
//! - `by_sub_room`: sub_room_id → [user_id]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use banter_common::events::{DispatchEvent, event};
use banter_common::{RoomId, SubRoomId, UserId};

/// One remote participant's voice state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteVoiceState {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub sub_room_id: SubRoomId,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    #[serde(default)]
    pub screen_sharing: bool,
    #[serde(default)]
    pub speaking: bool,
    #[serde(default = "Utc::now")]
    pub joined_at: DateTime<Utc>,
}

/// Change notifications for presentation layers.
#[derive(Debug, Clone)]
pub enum RosterEvent {
    /// The authoritative membership for a sub-room was replaced.
    Replaced { sub_room_id: SubRoomId },
    Joined(RemoteVoiceState),
    Updated(RemoteVoiceState),
    Left { user_id: UserId, sub_room_id: SubRoomId },
}

#[derive(Clone)]
pub struct VoiceRoster {
    by_user: Arc<RwLock<HashMap<UserId, RemoteVoiceState>>>,
    by_sub_room: Arc<RwLock<HashMap<SubRoomId, Vec<UserId>>>>,
    events: broadcast::Sender<RosterEvent>,
}

impl VoiceRoster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            by_user: Arc::new(RwLock::new(HashMap::new())),
            by_sub_room: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RosterEvent> {
        self.events.subscribe()
    }

    /// Replace a sub-room's membership with an authoritative snapshot
    /// (the joined payload). Live deltas merge on top afterwards.
    pub async fn apply_snapshot(&self, sub_room_id: SubRoomId, states: Vec<RemoteVoiceState>) {
        let mut by_user = self.by_user.write().await;
        let mut by_sub_room = self.by_sub_room.write().await;

        if let Some(old_members) = by_sub_room.remove(&sub_room_id) {
            for uid in old_members {
                by_user.remove(&uid);
            }
        }

        let members: Vec<UserId> = states.iter().map(|s| s.user_id).collect();
        for state in states {
            by_user.insert(state.user_id, state);
        }
        by_sub_room.insert(sub_room_id, members);

        let _ = self.events.send(RosterEvent::Replaced { sub_room_id });
    }

    /// Merge one live state delta. Upserts the user, moving them between
    /// sub-rooms when the delta says so.
    pub async fn apply_update(&self, state: RemoteVoiceState) {
        let mut by_user = self.by_user.write().await;
        let mut by_sub_room = self.by_sub_room.write().await;

        let existed = by_user.insert(state.user_id, state.clone());
        if let Some(old) = &existed {
            if old.sub_room_id != state.sub_room_id {
                if let Some(members) = by_sub_room.get_mut(&old.sub_room_id) {
                    members.retain(|u| *u != state.user_id);
                }
            }
        }
        let members = by_sub_room.entry(state.sub_room_id).or_default();
        if !members.contains(&state.user_id) {
            members.push(state.user_id);
        }

        let _ = self.events.send(if existed.is_some() {
            RosterEvent::Updated(state)
        } else {
            RosterEvent::Joined(state)
        });
    }

    /// Remove a user (left voice, or the relay said so).
    pub async fn remove_user(&self, user_id: UserId) -> Option<RemoteVoiceState> {
        let mut by_user = self.by_user.write().await;
        let removed = by_user.remove(&user_id);

        if let Some(ref state) = removed {
            let mut by_sub_room = self.by_sub_room.write().await;
            if let Some(members) = by_sub_room.get_mut(&state.sub_room_id) {
                members.retain(|u| *u != user_id);
                if members.is_empty() {
                    by_sub_room.remove(&state.sub_room_id);
                }
            }
            let _ = self.events.send(RosterEvent::Left {
                user_id,
                sub_room_id: state.sub_room_id,
            });
        }
        removed
    }

    /// Fold one gateway dispatch into the roster.
    pub async fn handle_dispatch(&self, ev: &DispatchEvent) {
        match ev.event.as_str() {
            event::VOICE_STATE_UPDATE => {
                if let Ok(state) = serde_json::from_value::<RemoteVoiceState>(ev.data.clone()) {
                    self.apply_update(state).await;
                }
            }
            event::VOICE_SPEAKING => {
                if let Some(uid) = ev.user_id() {
                    let speaking = ev
                        .data
                        .get("speaking")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let mut by_user = self.by_user.write().await;
                    if let Some(state) = by_user.get_mut(&uid) {
                        state.speaking = speaking;
                        let updated = state.clone();
                        drop(by_user);
                        let _ = self.events.send(RosterEvent::Updated(updated));
                    }
                }
            }
            event::USER_LEFT => {
                if let Some(uid) = ev.user_id() {
                    self.remove_user(uid).await;
                }
            }
            _ => {}
        }
    }

    pub async fn get(&self, user_id: UserId) -> Option<RemoteVoiceState> {
        self.by_user.read().await.get(&user_id).cloned()
    }

    pub async fn members(&self, sub_room_id: SubRoomId) -> Vec<RemoteVoiceState> {
        let by_sub_room = self.by_sub_room.read().await;
        let by_user = self.by_user.read().await;
        by_sub_room
            .get(&sub_room_id)
            .map(|ids| ids.iter().filter_map(|u| by_user.get(u).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn member_count(&self, sub_room_id: SubRoomId) -> usize {
        self.by_sub_room
            .read()
            .await
            .get(&sub_room_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl Default for VoiceRoster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn state(user: UserId, room: RoomId, sub: SubRoomId) -> RemoteVoiceState {
        RemoteVoiceState {
            user_id: user,
            room_id: room,
            sub_room_id: sub,
            muted: false,
            deafened: false,
            screen_sharing: false,
            speaking: false,
            joined_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_then_delta_merge() {
        let roster = VoiceRoster::new();
        let room = Uuid::new_v4();
        let sub = Uuid::new_v4();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        roster
            .apply_snapshot(sub, vec![state(alice, room, sub), state(bob, room, sub)])
            .await;
        assert_eq!(roster.member_count(sub).await, 2);

        // A delta for a newcomer merges on top of the snapshot.
        roster.apply_update(state(carol, room, sub)).await;
        assert_eq!(roster.member_count(sub).await, 3);

        // A delta for a known user updates in place, no duplicate entry.
        let mut muted = state(bob, room, sub);
        muted.muted = true;
        roster.apply_update(muted).await;
        assert_eq!(roster.member_count(sub).await, 3);
        assert!(roster.get(bob).await.unwrap().muted);
    }

    #[tokio::test]
    async fn test_snapshot_replaces_stale_members() {
        let roster = VoiceRoster::new();
        let room = Uuid::new_v4();
        let sub = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        roster.apply_snapshot(sub, vec![state(alice, room, sub)]).await;
        // Authoritative refresh: alice is gone, bob is present.
        roster.apply_snapshot(sub, vec![state(bob, room, sub)]).await;

        assert!(roster.get(alice).await.is_none());
        assert!(roster.get(bob).await.is_some());
        assert_eq!(roster.member_count(sub).await, 1);
    }

    #[tokio::test]
    async fn test_remove_user_clears_indexes() {
        let roster = VoiceRoster::new();
        let room = Uuid::new_v4();
        let sub = Uuid::new_v4();
        let alice = Uuid::new_v4();

        roster.apply_snapshot(sub, vec![state(alice, room, sub)]).await;
        let removed = roster.remove_user(alice).await;
        assert!(removed.is_some());
        assert_eq!(roster.member_count(sub).await, 0);
        assert!(roster.get(alice).await.is_none());
    }

    #[tokio::test]
    async fn test_speaking_dispatch_updates_flag() {
        let roster = VoiceRoster::new();
        let room = Uuid::new_v4();
        let sub = Uuid::new_v4();
        let alice = Uuid::new_v4();

        roster.apply_snapshot(sub, vec![state(alice, room, sub)]).await;
        roster
            .handle_dispatch(&DispatchEvent::new(
                event::VOICE_SPEAKING,
                json!({"user_id": alice, "speaking": true}),
            ))
            .await;
        assert!(roster.get(alice).await.unwrap().speaking);
    }

    #[tokio::test]
    async fn test_user_left_dispatch() {
        let roster = VoiceRoster::new();
        let room = Uuid::new_v4();
        let sub = Uuid::new_v4();
        let alice = Uuid::new_v4();

        roster.apply_snapshot(sub, vec![state(alice, room, sub)]).await;
        roster
            .handle_dispatch(&DispatchEvent::new(event::USER_LEFT, json!({"user_id": alice})))
            .await;
        assert!(roster.get(alice).await.is_none());
    }
}
