//! Control-plane message types
//!
//! JSON messages exchanged with the conferencing application's local
//! control API. Outbound messages are request-id correlated; inbound
//! messages are partial and merged field-wise into the held state —
//! absent fields never erase previously known values.

use serde::{Deserialize, Serialize};

/// Action requested from the conferencing application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MeetingAction {
    #[default]
    None,
    QueryMeetingState,
    Mute,
    Unmute,
    ToggleMute,
    HideVideo,
    ShowVideo,
    ToggleVideo,
    UnblurBackground,
    BlurBackground,
    ToggleBackgroundBlur,
    LowerHand,
    RaiseHand,
    ToggleHand,
    LeaveCall,
    SendReaction,
    ToggleUi,
    StopSharing,
}

/// Reaction kind carried by a `SendReaction` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReactionType {
    Applause,
    Laugh,
    Like,
    Love,
    Wow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessageParameter {
    #[serde(rename = "type")]
    pub reaction: ReactionType,
}

/// Outbound request. Request ids come from the client's own sequence
/// generator: monotonically increasing, never reused while it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub request_id: u64,
    pub action: MeetingAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ClientMessageParameter>,
}

impl ClientMessage {
    pub fn new(request_id: u64, action: MeetingAction) -> Self {
        Self { request_id, action, parameters: None }
    }

    pub fn with_reaction(request_id: u64, reaction: ReactionType) -> Self {
        Self {
            request_id,
            action: MeetingAction::SendReaction,
            parameters: Some(ClientMessageParameter { reaction }),
        }
    }
}

/// Partial meeting state. Every field optional: the server only sends what
/// changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MeetingState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_video_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_hand_raised: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_in_meeting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_recording_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_background_blurred: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_sharing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_unread_messages: Option<bool>,
}

/// Partial per-meeting permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MeetingPermissions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_toggle_mute: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_toggle_video: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_toggle_hand: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_toggle_blur: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_leave: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_react: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_toggle_share_tray: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_toggle_chat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_stop_sharing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_pair: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MeetingUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_state: Option<MeetingState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_permissions: Option<MeetingPermissions>,
}

/// Inbound message. All fields optional; see [`ServerMessage::merge_from`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_refresh: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_update: Option<MeetingUpdate>,
}

impl ServerMessage {
    /// Field-wise merge: present fields of `incoming` replace, absent
    /// fields leave the previous value untouched. `meetingUpdate` merges
    /// one level deeper — a present sub-object replaces that sub-object,
    /// an absent one keeps the previous.
    pub fn merge_from(&mut self, incoming: &ServerMessage) {
        if incoming.request_id.is_some() {
            self.request_id = incoming.request_id;
        }
        if incoming.response.is_some() {
            self.response = incoming.response.clone();
        }
        if incoming.error_msg.is_some() {
            self.error_msg = incoming.error_msg.clone();
        }
        if incoming.token_refresh.is_some() {
            self.token_refresh = incoming.token_refresh.clone();
        }
        if let Some(update) = &incoming.meeting_update {
            let merged = self.meeting_update.get_or_insert_with(MeetingUpdate::default);
            if update.meeting_state.is_some() {
                merged.meeting_state = update.meeting_state;
            }
            if update.meeting_permissions.is_some() {
                merged.meeting_permissions = update.meeting_permissions;
            }
        }
    }

    /// Whether the application currently reports an active meeting.
    pub fn is_in_meeting(&self) -> bool {
        self.meeting_update
            .as_ref()
            .and_then(|u| u.meeting_state.as_ref())
            .and_then(|s| s.is_in_meeting)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_serializes_camel_and_kebab() {
        let msg = ClientMessage::new(7, MeetingAction::ToggleMute);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""requestId":7"#));
        assert!(json.contains(r#""action":"toggle-mute""#));
        assert!(!json.contains("parameters"));
    }

    #[test]
    fn reaction_message_carries_typed_parameter() {
        let msg = ClientMessage::with_reaction(3, ReactionType::Applause);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""action":"send-reaction""#));
        assert!(json.contains(r#""type":"applause""#));
    }

    #[test]
    fn server_message_decodes_partial_update() {
        let json = r#"{"meetingUpdate":{"meetingState":{"isMuted":true,"isInMeeting":true}}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(msg.is_in_meeting());
        let state = msg.meeting_update.unwrap().meeting_state.unwrap();
        assert_eq!(state.is_muted, Some(true));
        assert_eq!(state.is_video_on, None);
    }

    #[test]
    fn merge_replaces_present_and_keeps_absent() {
        let mut held: ServerMessage = serde_json::from_str(
            r#"{"meetingUpdate":{"meetingState":{"isMuted":true,"isInMeeting":true},
                "meetingPermissions":{"canToggleMute":true}}}"#,
        )
        .unwrap();

        let incoming: ServerMessage =
            serde_json::from_str(r#"{"meetingUpdate":{"meetingState":{"isMuted":false}}}"#).unwrap();
        held.merge_from(&incoming);

        let update = held.meeting_update.as_ref().unwrap();
        // meetingState replaced wholesale by the present sub-object
        assert_eq!(update.meeting_state.unwrap().is_muted, Some(false));
        // absent permissions sub-object left untouched
        assert_eq!(update.meeting_permissions.unwrap().can_toggle_mute, Some(true));
    }

    #[test]
    fn token_only_message_leaves_meeting_state_untouched() {
        let mut held: ServerMessage = serde_json::from_str(
            r#"{"meetingUpdate":{"meetingState":{"isInMeeting":true},
                "meetingPermissions":{"canReact":true}}}"#,
        )
        .unwrap();
        let before = held.meeting_update;

        let incoming: ServerMessage =
            serde_json::from_str(r#"{"tokenRefresh":"new-token"}"#).unwrap();
        held.merge_from(&incoming);

        assert_eq!(held.token_refresh.as_deref(), Some("new-token"));
        assert_eq!(held.meeting_update, before);
        assert!(held.is_in_meeting());
    }
}
