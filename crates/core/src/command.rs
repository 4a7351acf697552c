//! The self-contained unit of work carried on the OUTBOUND queue.
//!
//! A command must hold everything the dispatcher needs to render and send:
//! credentials handle, recipient, and the kind-specific payload. The message
//! id doubles as the idempotency key for the upstream call.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::MessageKind;

/// One media attachment source: either an upstream media id or an
/// externally-signed URL. Exactly one must be present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
            MediaType::Sticker => "sticker",
        }
    }

    pub fn supports_caption(&self) -> bool {
        matches!(self, MediaType::Image | MediaType::Video | MediaType::Document)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

/// A parameter value inside a template component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateParameter {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateComponent {
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
}

/// Kind-specific payload of an outbound command. Serialized with an
/// adjacent `kind` tag so queue payloads stay self-describing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    Text {
        body: String,
        #[serde(default)]
        preview_url: bool,
    },
    Template {
        name: String,
        language_code: String,
        #[serde(default)]
        components: Vec<TemplateComponent>,
    },
    Media {
        media_type: MediaType,
        source: MediaSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    InteractiveButtons {
        body: String,
        buttons: Vec<ReplyButton>,
        #[serde(skip_serializing_if = "Option::is_none")]
        header: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        footer: Option<String>,
    },
    InteractiveList {
        body: String,
        button_text: String,
        sections: Vec<ListSection>,
        #[serde(skip_serializing_if = "Option::is_none")]
        header: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        footer: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    Reaction {
        target_message_id: String,
        emoji: String,
    },
    MarkAsRead {
        target_message_id: String,
    },
}

impl CommandKind {
    /// The message kind recorded on the row for this command.
    pub fn message_kind(&self) -> MessageKind {
        match self {
            CommandKind::Text { .. } => MessageKind::Text,
            CommandKind::Template { .. } => MessageKind::Template,
            CommandKind::Media { .. } => MessageKind::Media,
            CommandKind::InteractiveButtons { .. } | CommandKind::InteractiveList { .. } => {
                MessageKind::Interactive
            }
            CommandKind::Location { .. } => MessageKind::Location,
            CommandKind::Reaction { .. } | CommandKind::MarkAsRead { .. } => MessageKind::Reaction,
        }
    }
}

/// A validated, self-contained instruction to send one outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundCommand {
    /// Equal to the message row id; idempotency key for the upstream call.
    pub message_id: Uuid,
    pub workspace_id: Uuid,
    /// Upstream phone-number id to send from.
    pub phone_number_id: String,
    /// Handle to the sender number's access token.
    pub access_token: String,
    /// Recipient, E.164 with or without leading plus.
    pub to: String,
    /// Upstream message id to thread this send under, if replying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<Uuid>,
    #[serde(flatten)]
    pub payload: CommandKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip_keeps_kind_tag() {
        let cmd = OutboundCommand {
            message_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            phone_number_id: "104".into(),
            access_token: "tok".into(),
            to: "+15551234567".into(),
            reply_to: None,
            campaign_id: None,
            payload: CommandKind::Text {
                body: "Hi".into(),
                preview_url: false,
            },
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["kind"], "text");
        let back: OutboundCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_media_kind_mapping() {
        let payload = CommandKind::Media {
            media_type: MediaType::Document,
            source: MediaSource {
                media_id: Some("9981".into()),
                link: None,
            },
            caption: None,
            filename: Some("invoice.pdf".into()),
        };
        assert_eq!(payload.message_kind(), MessageKind::Media);
        assert!(MediaType::Document.supports_caption());
        assert!(!MediaType::Sticker.supports_caption());
    }
}
