//! Conversation aggregate: membership, group settings and per-participant overlay state.
//!
//! Every mutating operation checks all of its preconditions before touching the
//! aggregate, so a rejected call leaves the conversation exactly as it was.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, MessageId, UserId},
    error::MembershipError,
};

pub const DEFAULT_MAX_PARTICIPANTS: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPermission {
    AdminsOnly,
    AllMembers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    pub who_can_add_members: GroupPermission,
    pub who_can_edit_info: GroupPermission,
    pub admins_only_messages: bool,
    pub max_participants: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disappearing_messages_secs: Option<u64>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            who_can_add_members: GroupPermission::AdminsOnly,
            who_can_edit_info: GroupPermission::AdminsOnly,
            admins_only_messages: false,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            disappearing_messages_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub admins: BTreeSet<UserId>,
    #[serde(default)]
    pub settings: GroupSettings,
}

/// Per-participant view state. Kept after the participant leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<MessageId>,
}

impl ParticipantState {
    pub fn joined(at: DateTime<Utc>) -> Self {
        Self {
            joined_at: at,
            left_at: None,
            archived: false,
            muted: false,
            muted_until: None,
            pinned: false,
            nickname: None,
            last_read_message_id: None,
        }
    }

    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.muted && self.muted_until.map_or(true, |until| until > now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub participants: Vec<UserId>,
    pub created_by: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub participant_state: BTreeMap<UserId, ParticipantState>,
}

/// Overlay-based filter for [`list_for_user`]. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ConversationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

pub fn can_add_participants(
    kind: ConversationKind,
    settings: Option<&GroupSettings>,
    requester_is_admin: bool,
) -> bool {
    match (kind, settings) {
        (ConversationKind::Direct, _) => false,
        (ConversationKind::Group, Some(settings)) => {
            requester_is_admin || settings.who_can_add_members == GroupPermission::AllMembers
        }
        (ConversationKind::Group, None) => requester_is_admin,
    }
}

pub fn can_edit_metadata(
    kind: ConversationKind,
    settings: Option<&GroupSettings>,
    requester_is_admin: bool,
) -> bool {
    match (kind, settings) {
        (ConversationKind::Direct, _) => false,
        (ConversationKind::Group, Some(settings)) => {
            requester_is_admin || settings.who_can_edit_info == GroupPermission::AllMembers
        }
        (ConversationKind::Group, None) => requester_is_admin,
    }
}

pub fn can_post_messages(
    kind: ConversationKind,
    settings: Option<&GroupSettings>,
    requester_is_admin: bool,
) -> bool {
    match (kind, settings) {
        (ConversationKind::Direct, _) => true,
        (ConversationKind::Group, Some(settings)) => {
            requester_is_admin || !settings.admins_only_messages
        }
        (ConversationKind::Group, None) => true,
    }
}

/// Finds the direct conversation between exactly these two users, in either order.
pub fn find_direct<'a>(
    conversations: impl IntoIterator<Item = &'a Conversation>,
    a: &UserId,
    b: &UserId,
) -> Option<&'a Conversation> {
    conversations
        .into_iter()
        .find(|conversation| conversation.is_direct_between(a, b))
}

/// Canonical key for the unordered pair, used by stores to make direct
/// lookup-or-create atomic.
pub fn direct_pair_key(a: &UserId, b: &UserId) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

pub fn list_for_user<'a>(
    conversations: impl IntoIterator<Item = &'a Conversation>,
    user_id: &UserId,
    filter: &ListFilter,
    now: DateTime<Utc>,
) -> Vec<&'a Conversation> {
    let mut matching: Vec<&Conversation> = conversations
        .into_iter()
        .filter(|conversation| conversation.is_active && conversation.is_participant(user_id))
        .filter(|conversation| conversation.matches_filter(user_id, filter, now))
        .collect();
    matching.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.id.cmp(&b.id))
    });
    matching
}

impl Conversation {
    pub fn new_direct(
        id: ConversationId,
        a: UserId,
        b: UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, MembershipError> {
        if a == b {
            return Err(MembershipError::InvalidParticipants(
                "a direct conversation needs two distinct users".into(),
            ));
        }
        let participant_state = [&a, &b]
            .into_iter()
            .map(|user| (user.clone(), ParticipantState::joined(now)))
            .collect();
        Ok(Self {
            id,
            kind: ConversationKind::Direct,
            participants: vec![a.clone(), b],
            created_by: a,
            group: None,
            last_message_id: None,
            last_activity: now,
            is_active: true,
            participant_state,
        })
    }

    /// Creates a group; the creator is always a participant and the first admin.
    pub fn new_group(
        id: ConversationId,
        creator: UserId,
        members: impl IntoIterator<Item = UserId>,
        name: impl Into<String>,
        settings: GroupSettings,
        now: DateTime<Utc>,
    ) -> Result<Self, MembershipError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(MembershipError::InvalidParticipants(
                "group name must not be empty".into(),
            ));
        }

        let mut participants = vec![creator.clone()];
        for member in members {
            if !participants.contains(&member) {
                participants.push(member);
            }
        }
        if participants.len() < 2 {
            return Err(MembershipError::GroupTooSmall);
        }
        if participants.len() > settings.max_participants as usize {
            return Err(MembershipError::GroupFull {
                max: settings.max_participants,
            });
        }

        let participant_state = participants
            .iter()
            .map(|user| (user.clone(), ParticipantState::joined(now)))
            .collect();
        Ok(Self {
            id,
            kind: ConversationKind::Group,
            participants,
            created_by: creator.clone(),
            group: Some(GroupMetadata {
                name,
                description: None,
                admins: BTreeSet::from([creator]),
                settings,
            }),
            last_message_id: None,
            last_activity: now,
            is_active: true,
            participant_state,
        })
    }

    pub fn is_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    pub fn is_admin(&self, user_id: &UserId) -> bool {
        self.group
            .as_ref()
            .is_some_and(|group| group.admins.contains(user_id))
    }

    pub fn is_direct_between(&self, a: &UserId, b: &UserId) -> bool {
        self.kind == ConversationKind::Direct
            && self.participants.len() == 2
            && self.is_participant(a)
            && self.is_participant(b)
            && a != b
    }

    pub fn settings(&self) -> Option<&GroupSettings> {
        self.group.as_ref().map(|group| &group.settings)
    }

    pub fn overlay(&self, user_id: &UserId) -> Option<&ParticipantState> {
        self.participant_state.get(user_id)
    }

    /// The other side of a direct conversation.
    pub fn peer_of(&self, user_id: &UserId) -> Option<&UserId> {
        match self.kind {
            ConversationKind::Direct => self.participants.iter().find(|p| *p != user_id),
            ConversationKind::Group => None,
        }
    }

    pub fn can_add_participants(&self, requester: &UserId) -> bool {
        self.is_participant(requester)
            && can_add_participants(self.kind, self.settings(), self.is_admin(requester))
    }

    pub fn can_edit_metadata(&self, requester: &UserId) -> bool {
        self.is_participant(requester)
            && can_edit_metadata(self.kind, self.settings(), self.is_admin(requester))
    }

    pub fn can_post_messages(&self, requester: &UserId) -> bool {
        self.is_active
            && self.is_participant(requester)
            && can_post_messages(self.kind, self.settings(), self.is_admin(requester))
    }

    /// Checks every structural invariant. Stores call this before each write.
    pub fn validate(&self) -> Result<(), MembershipError> {
        let unique: BTreeSet<&UserId> = self.participants.iter().collect();
        if unique.len() != self.participants.len() {
            return Err(MembershipError::InvalidParticipants(
                "participants must be unique".into(),
            ));
        }
        match self.kind {
            ConversationKind::Direct => {
                if self.participants.len() != 2 {
                    return Err(MembershipError::InvalidParticipants(
                        "a direct conversation has exactly two participants".into(),
                    ));
                }
                if self.group.is_some() {
                    return Err(MembershipError::InvalidParticipants(
                        "a direct conversation carries no group metadata".into(),
                    ));
                }
            }
            ConversationKind::Group => {
                let Some(group) = &self.group else {
                    return Err(MembershipError::InvalidParticipants(
                        "a group conversation needs group metadata".into(),
                    ));
                };
                if self.participants.len() < 2 {
                    return Err(MembershipError::GroupTooSmall);
                }
                if self.participants.len() > group.settings.max_participants as usize {
                    return Err(MembershipError::GroupFull {
                        max: group.settings.max_participants,
                    });
                }
                if let Some(stray) = group.admins.iter().find(|a| !self.is_participant(a)) {
                    return Err(MembershipError::InvalidParticipants(format!(
                        "admin {stray} is not a participant"
                    )));
                }
            }
        }
        for participant in &self.participants {
            let joined = self
                .participant_state
                .get(participant)
                .is_some_and(|state| state.left_at.is_none());
            if !joined {
                return Err(MembershipError::InvalidParticipants(format!(
                    "participant {participant} has no active overlay state"
                )));
            }
        }
        Ok(())
    }

    fn require_group(&self) -> Result<&GroupMetadata, MembershipError> {
        if !self.is_active {
            return Err(MembershipError::Inactive);
        }
        match (&self.kind, &self.group) {
            (ConversationKind::Group, Some(group)) => Ok(group),
            _ => Err(MembershipError::NotGroupChat),
        }
    }

    fn require_member(&self, user_id: &UserId) -> Result<(), MembershipError> {
        if self.is_participant(user_id) {
            Ok(())
        } else {
            Err(MembershipError::NotMember(user_id.clone()))
        }
    }

    pub fn add_participant(
        &mut self,
        user_id: &UserId,
        actor_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(), MembershipError> {
        let group = self.require_group()?;
        if !self.can_add_participants(actor_id) {
            return Err(MembershipError::PermissionDenied(actor_id.clone()));
        }
        if self.is_participant(user_id) {
            return Err(MembershipError::AlreadyMember(user_id.clone()));
        }
        let max = group.settings.max_participants;
        if self.participants.len() >= max as usize {
            return Err(MembershipError::GroupFull { max });
        }

        self.participants.push(user_id.clone());
        self.participant_state
            .entry(user_id.clone())
            .and_modify(|state| {
                state.joined_at = now;
                state.left_at = None;
            })
            .or_insert_with(|| ParticipantState::joined(now));
        Ok(())
    }

    /// A participant may always remove themselves; removing someone else takes an admin.
    pub fn remove_participant(
        &mut self,
        user_id: &UserId,
        actor_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(), MembershipError> {
        let group = self.require_group()?;
        self.require_member(user_id)?;
        if user_id != actor_id && !group.admins.contains(actor_id) {
            return Err(MembershipError::PermissionDenied(actor_id.clone()));
        }
        if self.participants.len() <= 2 {
            return Err(MembershipError::GroupTooSmall);
        }

        self.participants.retain(|p| p != user_id);
        if let Some(state) = self.participant_state.get_mut(user_id) {
            state.left_at = Some(now);
        }
        let successor = self.longest_standing_participant();
        if let Some(group) = self.group.as_mut() {
            group.admins.remove(user_id);
            if group.admins.is_empty() {
                if let Some(successor) = successor {
                    group.admins.insert(successor);
                }
            }
        }
        Ok(())
    }

    fn longest_standing_participant(&self) -> Option<UserId> {
        self.participants
            .iter()
            .filter_map(|p| self.participant_state.get(p).map(|s| (s.joined_at, p)))
            .min()
            .map(|(_, p)| p.clone())
    }

    /// Returns `false` when the user already was an admin.
    pub fn set_admin(&mut self, user_id: &UserId, actor_id: &UserId) -> Result<bool, MembershipError> {
        let group = self.require_group()?;
        self.require_member(user_id)?;
        if group.admins.contains(user_id) {
            return Ok(false);
        }
        if !group.admins.contains(actor_id) {
            return Err(MembershipError::PermissionDenied(actor_id.clone()));
        }
        if let Some(group) = self.group.as_mut() {
            group.admins.insert(user_id.clone());
        }
        Ok(true)
    }

    /// Returns `false` when the user was not an admin.
    pub fn revoke_admin(
        &mut self,
        user_id: &UserId,
        actor_id: &UserId,
    ) -> Result<bool, MembershipError> {
        let group = self.require_group()?;
        self.require_member(user_id)?;
        if !group.admins.contains(user_id) {
            return Ok(false);
        }
        if !group.admins.contains(actor_id) {
            return Err(MembershipError::PermissionDenied(actor_id.clone()));
        }
        if group.admins.len() == 1 {
            return Err(MembershipError::LastAdmin);
        }
        if let Some(group) = self.group.as_mut() {
            group.admins.remove(user_id);
        }
        Ok(true)
    }

    pub fn update_metadata(
        &mut self,
        actor_id: &UserId,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<(), MembershipError> {
        self.require_group()?;
        if !self.can_edit_metadata(actor_id) {
            return Err(MembershipError::PermissionDenied(actor_id.clone()));
        }
        if name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(MembershipError::InvalidParticipants(
                "group name must not be empty".into(),
            ));
        }
        if let Some(group) = self.group.as_mut() {
            if let Some(name) = name {
                group.name = name;
            }
            if description.is_some() {
                group.description = description;
            }
        }
        Ok(())
    }

    pub fn update_settings(
        &mut self,
        actor_id: &UserId,
        settings: GroupSettings,
    ) -> Result<(), MembershipError> {
        let group = self.require_group()?;
        if !group.admins.contains(actor_id) {
            return Err(MembershipError::PermissionDenied(actor_id.clone()));
        }
        if (settings.max_participants as usize) < self.participants.len() {
            return Err(MembershipError::GroupFull {
                max: settings.max_participants,
            });
        }
        if let Some(group) = self.group.as_mut() {
            group.settings = settings;
        }
        Ok(())
    }

    fn overlay_mut(&mut self, user_id: &UserId) -> Result<&mut ParticipantState, MembershipError> {
        if !self.is_participant(user_id) {
            return Err(MembershipError::NotMember(user_id.clone()));
        }
        self.participant_state
            .get_mut(user_id)
            .ok_or_else(|| MembershipError::NotMember(user_id.clone()))
    }

    pub fn archive(&mut self, user_id: &UserId) -> Result<(), MembershipError> {
        self.overlay_mut(user_id)?.archived = true;
        Ok(())
    }

    pub fn unarchive(&mut self, user_id: &UserId) -> Result<(), MembershipError> {
        self.overlay_mut(user_id)?.archived = false;
        Ok(())
    }

    /// `until = None` mutes indefinitely.
    pub fn mute(
        &mut self,
        user_id: &UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), MembershipError> {
        let state = self.overlay_mut(user_id)?;
        state.muted = true;
        state.muted_until = until;
        Ok(())
    }

    pub fn unmute(&mut self, user_id: &UserId) -> Result<(), MembershipError> {
        let state = self.overlay_mut(user_id)?;
        state.muted = false;
        state.muted_until = None;
        Ok(())
    }

    pub fn pin(&mut self, user_id: &UserId) -> Result<(), MembershipError> {
        self.overlay_mut(user_id)?.pinned = true;
        Ok(())
    }

    pub fn unpin(&mut self, user_id: &UserId) -> Result<(), MembershipError> {
        self.overlay_mut(user_id)?.pinned = false;
        Ok(())
    }

    pub fn set_nickname(
        &mut self,
        user_id: &UserId,
        nickname: Option<String>,
    ) -> Result<(), MembershipError> {
        self.overlay_mut(user_id)?.nickname = nickname.filter(|n| !n.trim().is_empty());
        Ok(())
    }

    pub fn record_read(
        &mut self,
        user_id: &UserId,
        message_id: &MessageId,
    ) -> Result<(), MembershipError> {
        self.overlay_mut(user_id)?.last_read_message_id = Some(message_id.clone());
        Ok(())
    }

    /// Moves the last-message pointer forward; older messages never rewind it.
    pub fn record_message(&mut self, message_id: &MessageId, at: DateTime<Utc>) {
        if at >= self.last_activity || self.last_message_id.is_none() {
            self.last_message_id = Some(message_id.clone());
            self.last_activity = self.last_activity.max(at);
        }
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
    }

    fn matches_filter(&self, user_id: &UserId, filter: &ListFilter, now: DateTime<Utc>) -> bool {
        let Some(state) = self.overlay(user_id) else {
            return false;
        };
        filter.kind.map_or(true, |kind| kind == self.kind)
            && filter.archived.map_or(true, |v| v == state.archived)
            && filter.muted.map_or(true, |v| v == state.is_muted(now))
            && filter.pinned.map_or(true, |v| v == state.pinned)
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
