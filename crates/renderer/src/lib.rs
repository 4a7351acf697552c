//! Renders validated outbound commands into the upstream wire format.
//!
//! This crate is the single place wire-format knowledge lives: the
//! dispatcher treats the output as opaque. Rendering is pure and total —
//! no I/O, and malformed commands are rejected up front with a classified
//! error rather than reaching the upstream API.

use serde_json::{json, Value};
use thiserror::Error;

use trunkline_core::command::{CommandKind, MediaType, OutboundCommand};

/// Upstream header/body length limits.
const MAX_TEXT_BODY: usize = 4096;
const MAX_BUTTONS: usize = 3;
const MAX_LIST_SECTIONS: usize = 10;
const MAX_BUTTON_TITLE: usize = 20;
const MAX_HEADER_FOOTER: usize = 60;
const MAX_TEMPLATE_PARAM: usize = 1024;

#[derive(Error, Debug, PartialEq)]
pub enum RenderError {
    #[error("invalid recipient number: {0}")]
    InvalidRecipient(String),

    #[error("text body empty or over {MAX_TEXT_BODY} chars")]
    TextBodyOutOfRange,

    #[error("template name must not be empty")]
    EmptyTemplateName,

    #[error("template parameter rejected: {0}")]
    BadTemplateParam(String),

    #[error("media command needs exactly one of media_id or link")]
    AmbiguousMediaSource,

    #[error("{field} not supported for media type {media_type}")]
    UnsupportedMediaField {
        field: &'static str,
        media_type: &'static str,
    },

    #[error("interactive message needs 1..={MAX_BUTTONS} buttons, got {0}")]
    ButtonCountOutOfRange(usize),

    #[error("interactive list needs 1..={MAX_LIST_SECTIONS} sections, got {0}")]
    SectionCountOutOfRange(usize),

    #[error("list section '{0}' has no rows")]
    EmptySection(String),

    #[error("coordinate out of range: lat {lat}, lon {lon}")]
    CoordinateOutOfRange { lat: f64, lon: f64 },

    #[error("reaction emoji must not be empty")]
    EmptyEmoji,

    #[error("target message id must not be empty")]
    EmptyTargetMessageId,
}

/// A rendered upstream request: resource path plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRequest {
    /// Resource path under the versioned API root, e.g. `/{phone}/messages`.
    pub path: String,
    pub body: Value,
}

/// Normalize a recipient to the digits-only form the upstream expects.
/// Accepts E.164 with separators; rejects anything outside 7..=15 digits.
pub fn normalize_recipient(raw: &str) -> Result<String, RenderError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 || digits.len() > 15 {
        return Err(RenderError::InvalidRecipient(raw.to_string()));
    }
    Ok(digits)
}

fn truncated(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn check_template_param(value: &str) -> Result<(), RenderError> {
    if value.len() > MAX_TEMPLATE_PARAM {
        return Err(RenderError::BadTemplateParam(format!(
            "parameter exceeds {MAX_TEMPLATE_PARAM} chars"
        )));
    }
    for ch in value.chars() {
        if ch.is_control() {
            return Err(RenderError::BadTemplateParam(format!(
                "parameter contains control character U+{:04X}",
                ch as u32
            )));
        }
    }
    Ok(())
}

/// Common envelope shared by every message kind except mark-as-read.
fn base_payload(cmd: &OutboundCommand) -> Result<Value, RenderError> {
    let to = normalize_recipient(&cmd.to)?;
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
    });
    if let Some(reply_to) = &cmd.reply_to {
        payload["context"] = json!({ "message_id": reply_to });
    }
    Ok(payload)
}

fn render_text(cmd: &OutboundCommand, body: &str, preview_url: bool) -> Result<Value, RenderError> {
    if body.is_empty() || body.chars().count() > MAX_TEXT_BODY {
        return Err(RenderError::TextBodyOutOfRange);
    }
    let mut payload = base_payload(cmd)?;
    payload["type"] = json!("text");
    payload["text"] = json!({
        "body": body,
        "preview_url": preview_url,
    });
    Ok(payload)
}

fn render_template(
    cmd: &OutboundCommand,
    name: &str,
    language_code: &str,
    components: &[trunkline_core::command::TemplateComponent],
) -> Result<Value, RenderError> {
    if name.is_empty() {
        return Err(RenderError::EmptyTemplateName);
    }
    for component in components {
        for param in &component.parameters {
            if let Some(text) = &param.text {
                check_template_param(text)?;
            }
        }
    }
    let mut payload = base_payload(cmd)?;
    payload["type"] = json!("template");
    let mut template = json!({
        "name": name,
        "language": { "code": language_code },
    });
    if !components.is_empty() {
        template["components"] = serde_json::to_value(components).unwrap_or(Value::Null);
    }
    payload["template"] = template;
    Ok(payload)
}

fn render_media(
    cmd: &OutboundCommand,
    media_type: MediaType,
    source: &trunkline_core::command::MediaSource,
    caption: &Option<String>,
    filename: &Option<String>,
) -> Result<Value, RenderError> {
    let mut media_obj = serde_json::Map::new();
    match (&source.media_id, &source.link) {
        (Some(id), None) => {
            media_obj.insert("id".into(), json!(id));
        }
        (None, Some(link)) => {
            media_obj.insert("link".into(), json!(link));
        }
        _ => return Err(RenderError::AmbiguousMediaSource),
    }

    if let Some(caption) = caption {
        if !media_type.supports_caption() {
            return Err(RenderError::UnsupportedMediaField {
                field: "caption",
                media_type: media_type.as_str(),
            });
        }
        media_obj.insert("caption".into(), json!(caption));
    }
    if let Some(filename) = filename {
        if media_type != MediaType::Document {
            return Err(RenderError::UnsupportedMediaField {
                field: "filename",
                media_type: media_type.as_str(),
            });
        }
        media_obj.insert("filename".into(), json!(filename));
    }

    let mut payload = base_payload(cmd)?;
    payload["type"] = json!(media_type.as_str());
    payload[media_type.as_str()] = Value::Object(media_obj);
    Ok(payload)
}

fn render_interactive_buttons(
    cmd: &OutboundCommand,
    body: &str,
    buttons: &[trunkline_core::command::ReplyButton],
    header: &Option<String>,
    footer: &Option<String>,
) -> Result<Value, RenderError> {
    if buttons.is_empty() || buttons.len() > MAX_BUTTONS {
        return Err(RenderError::ButtonCountOutOfRange(buttons.len()));
    }

    let rendered_buttons: Vec<Value> = buttons
        .iter()
        .map(|btn| {
            json!({
                "type": "reply",
                "reply": {
                    "id": btn.id,
                    "title": truncated(&btn.title, MAX_BUTTON_TITLE),
                },
            })
        })
        .collect();

    let mut interactive = json!({
        "type": "button",
        "body": { "text": body },
        "action": { "buttons": rendered_buttons },
    });
    if let Some(header) = header {
        interactive["header"] = json!({ "type": "text", "text": truncated(header, MAX_HEADER_FOOTER) });
    }
    if let Some(footer) = footer {
        interactive["footer"] = json!({ "text": truncated(footer, MAX_HEADER_FOOTER) });
    }

    let mut payload = base_payload(cmd)?;
    payload["type"] = json!("interactive");
    payload["interactive"] = interactive;
    Ok(payload)
}

fn render_interactive_list(
    cmd: &OutboundCommand,
    body: &str,
    button_text: &str,
    sections: &[trunkline_core::command::ListSection],
    header: &Option<String>,
    footer: &Option<String>,
) -> Result<Value, RenderError> {
    if sections.is_empty() || sections.len() > MAX_LIST_SECTIONS {
        return Err(RenderError::SectionCountOutOfRange(sections.len()));
    }

    let rendered_sections: Vec<Value> = sections
        .iter()
        .map(|section| {
            if section.rows.is_empty() {
                return Err(RenderError::EmptySection(section.title.clone()));
            }
            let rows: Vec<Value> = section
                .rows
                .iter()
                .map(|row| {
                    json!({
                        "id": row.id,
                        "title": row.title,
                        "description": row.description,
                    })
                })
                .collect();
            Ok(json!({ "title": section.title, "rows": rows }))
        })
        .collect::<Result<_, _>>()?;

    let mut interactive = json!({
        "type": "list",
        "body": { "text": body },
        "action": {
            "button": truncated(button_text, MAX_BUTTON_TITLE),
            "sections": rendered_sections,
        },
    });
    if let Some(header) = header {
        interactive["header"] = json!({ "type": "text", "text": truncated(header, MAX_HEADER_FOOTER) });
    }
    if let Some(footer) = footer {
        interactive["footer"] = json!({ "text": truncated(footer, MAX_HEADER_FOOTER) });
    }

    let mut payload = base_payload(cmd)?;
    payload["type"] = json!("interactive");
    payload["interactive"] = interactive;
    Ok(payload)
}

fn render_location(
    cmd: &OutboundCommand,
    lat: f64,
    lon: f64,
    name: &Option<String>,
    address: &Option<String>,
) -> Result<Value, RenderError> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(RenderError::CoordinateOutOfRange { lat, lon });
    }
    let mut location = json!({ "latitude": lat, "longitude": lon });
    if let Some(name) = name {
        location["name"] = json!(name);
    }
    if let Some(address) = address {
        location["address"] = json!(address);
    }
    let mut payload = base_payload(cmd)?;
    payload["type"] = json!("location");
    payload["location"] = location;
    Ok(payload)
}

fn render_reaction(
    cmd: &OutboundCommand,
    target_message_id: &str,
    emoji: &str,
) -> Result<Value, RenderError> {
    if target_message_id.is_empty() {
        return Err(RenderError::EmptyTargetMessageId);
    }
    if emoji.is_empty() {
        return Err(RenderError::EmptyEmoji);
    }
    let mut payload = base_payload(cmd)?;
    payload["type"] = json!("reaction");
    payload["reaction"] = json!({
        "message_id": target_message_id,
        "emoji": emoji,
    });
    Ok(payload)
}

/// Mark-as-read has its own body shape without the recipient envelope.
fn render_mark_as_read(target_message_id: &str) -> Result<Value, RenderError> {
    if target_message_id.is_empty() {
        return Err(RenderError::EmptyTargetMessageId);
    }
    Ok(json!({
        "messaging_product": "whatsapp",
        "status": "read",
        "message_id": target_message_id,
    }))
}

/// Render a validated command into the upstream request. Pure: never
/// touches the network or the clock.
pub fn render(cmd: &OutboundCommand) -> Result<RenderedRequest, RenderError> {
    let body = match &cmd.payload {
        CommandKind::Text { body, preview_url } => render_text(cmd, body, *preview_url)?,
        CommandKind::Template {
            name,
            language_code,
            components,
        } => render_template(cmd, name, language_code, components)?,
        CommandKind::Media {
            media_type,
            source,
            caption,
            filename,
        } => render_media(cmd, *media_type, source, caption, filename)?,
        CommandKind::InteractiveButtons {
            body,
            buttons,
            header,
            footer,
        } => render_interactive_buttons(cmd, body, buttons, header, footer)?,
        CommandKind::InteractiveList {
            body,
            button_text,
            sections,
            header,
            footer,
        } => render_interactive_list(cmd, body, button_text, sections, header, footer)?,
        CommandKind::Location {
            latitude,
            longitude,
            name,
            address,
        } => render_location(cmd, *latitude, *longitude, name, address)?,
        CommandKind::Reaction {
            target_message_id,
            emoji,
        } => render_reaction(cmd, target_message_id, emoji)?,
        CommandKind::MarkAsRead { target_message_id } => render_mark_as_read(target_message_id)?,
    };

    Ok(RenderedRequest {
        path: format!("/{}/messages", cmd.phone_number_id),
        body,
    })
}

/// Validate a command without producing the body. Used by the API layer to
/// reject bad requests before a message row is created.
pub fn validate(cmd: &OutboundCommand) -> Result<(), RenderError> {
    render(cmd).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunkline_core::command::{
        ListRow, ListSection, MediaSource, ReplyButton, TemplateComponent, TemplateParameter,
    };
    use uuid::Uuid;

    fn command(payload: CommandKind) -> OutboundCommand {
        OutboundCommand {
            message_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            phone_number_id: "104205552368".into(),
            access_token: "tok".into(),
            to: "+1 (555) 123-4567".into(),
            reply_to: None,
            campaign_id: None,
            payload,
        }
    }

    #[test]
    fn test_text_payload_shape() {
        let rendered = render(&command(CommandKind::Text {
            body: "Hi".into(),
            preview_url: false,
        }))
        .unwrap();

        assert_eq!(rendered.path, "/104205552368/messages");
        assert_eq!(rendered.body["messaging_product"], "whatsapp");
        assert_eq!(rendered.body["recipient_type"], "individual");
        assert_eq!(rendered.body["to"], "15551234567");
        assert_eq!(rendered.body["type"], "text");
        assert_eq!(rendered.body["text"]["body"], "Hi");
        assert_eq!(rendered.body["text"]["preview_url"], false);
    }

    #[test]
    fn test_reply_context_is_attached() {
        let mut cmd = command(CommandKind::Text {
            body: "Hi".into(),
            preview_url: true,
        });
        cmd.reply_to = Some("wamid.PARENT".into());
        let rendered = render(&cmd).unwrap();
        assert_eq!(rendered.body["context"]["message_id"], "wamid.PARENT");
    }

    #[test]
    fn test_recipient_normalization_rejects_garbage() {
        let mut cmd = command(CommandKind::Text {
            body: "Hi".into(),
            preview_url: false,
        });
        cmd.to = "not-a-number".into();
        assert!(matches!(
            render(&cmd),
            Err(RenderError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn test_template_payload_shape() {
        let rendered = render(&command(CommandKind::Template {
            name: "order_update".into(),
            language_code: "en_US".into(),
            components: vec![TemplateComponent {
                component_type: "body".into(),
                parameters: vec![TemplateParameter {
                    param_type: "text".into(),
                    text: Some("ORDER-42".into()),
                    image_url: None,
                }],
            }],
        }))
        .unwrap();

        assert_eq!(rendered.body["type"], "template");
        assert_eq!(rendered.body["template"]["name"], "order_update");
        assert_eq!(rendered.body["template"]["language"]["code"], "en_US");
        assert_eq!(
            rendered.body["template"]["components"][0]["parameters"][0]["text"],
            "ORDER-42"
        );
    }

    #[test]
    fn test_template_param_control_chars_rejected() {
        let result = render(&command(CommandKind::Template {
            name: "order_update".into(),
            language_code: "en".into(),
            components: vec![TemplateComponent {
                component_type: "body".into(),
                parameters: vec![TemplateParameter {
                    param_type: "text".into(),
                    text: Some("bad\u{0000}param".into()),
                    image_url: None,
                }],
            }],
        }));
        assert!(matches!(result, Err(RenderError::BadTemplateParam(_))));
    }

    #[test]
    fn test_media_requires_exactly_one_source() {
        let both = render(&command(CommandKind::Media {
            media_type: MediaType::Image,
            source: MediaSource {
                media_id: Some("123".into()),
                link: Some("https://cdn.example.com/a.jpg".into()),
            },
            caption: None,
            filename: None,
        }));
        assert_eq!(both, Err(RenderError::AmbiguousMediaSource));

        let neither = render(&command(CommandKind::Media {
            media_type: MediaType::Image,
            source: MediaSource {
                media_id: None,
                link: None,
            },
            caption: None,
            filename: None,
        }));
        assert_eq!(neither, Err(RenderError::AmbiguousMediaSource));
    }

    #[test]
    fn test_media_caption_rules() {
        let sticker = render(&command(CommandKind::Media {
            media_type: MediaType::Sticker,
            source: MediaSource {
                media_id: Some("123".into()),
                link: None,
            },
            caption: Some("nope".into()),
            filename: None,
        }));
        assert!(matches!(
            sticker,
            Err(RenderError::UnsupportedMediaField { field: "caption", .. })
        ));

        let doc = render(&command(CommandKind::Media {
            media_type: MediaType::Document,
            source: MediaSource {
                media_id: Some("123".into()),
                link: None,
            },
            caption: Some("Q3 report".into()),
            filename: Some("report.pdf".into()),
        }))
        .unwrap();
        assert_eq!(doc.body["type"], "document");
        assert_eq!(doc.body["document"]["id"], "123");
        assert_eq!(doc.body["document"]["caption"], "Q3 report");
        assert_eq!(doc.body["document"]["filename"], "report.pdf");
    }

    #[test]
    fn test_buttons_count_and_truncation() {
        let too_many: Vec<ReplyButton> = (0..4)
            .map(|i| ReplyButton {
                id: format!("b{i}"),
                title: "x".into(),
            })
            .collect();
        assert_eq!(
            render(&command(CommandKind::InteractiveButtons {
                body: "Pick one".into(),
                buttons: too_many,
                header: None,
                footer: None,
            })),
            Err(RenderError::ButtonCountOutOfRange(4))
        );

        let rendered = render(&command(CommandKind::InteractiveButtons {
            body: "Pick one".into(),
            buttons: vec![ReplyButton {
                id: "yes".into(),
                title: "An extremely long button title".into(),
            }],
            header: Some("H".into()),
            footer: None,
        }))
        .unwrap();
        let title = rendered.body["interactive"]["action"]["buttons"][0]["reply"]["title"]
            .as_str()
            .unwrap();
        assert_eq!(title.chars().count(), 20);
        assert_eq!(rendered.body["interactive"]["type"], "button");
    }

    #[test]
    fn test_list_sections_validated() {
        let rendered = render(&command(CommandKind::InteractiveList {
            body: "Menu".into(),
            button_text: "Open".into(),
            sections: vec![ListSection {
                title: "Mains".into(),
                rows: vec![ListRow {
                    id: "r1".into(),
                    title: "Pasta".into(),
                    description: Some("Fresh".into()),
                }],
            }],
            header: None,
            footer: Some("Thanks".into()),
        }))
        .unwrap();
        assert_eq!(rendered.body["interactive"]["type"], "list");
        assert_eq!(
            rendered.body["interactive"]["action"]["sections"][0]["rows"][0]["id"],
            "r1"
        );

        let empty = render(&command(CommandKind::InteractiveList {
            body: "Menu".into(),
            button_text: "Open".into(),
            sections: vec![ListSection {
                title: "Empty".into(),
                rows: vec![],
            }],
            header: None,
            footer: None,
        }));
        assert_eq!(empty, Err(RenderError::EmptySection("Empty".into())));
    }

    #[test]
    fn test_location_bounds() {
        assert!(matches!(
            render(&command(CommandKind::Location {
                latitude: 91.0,
                longitude: 0.0,
                name: None,
                address: None,
            })),
            Err(RenderError::CoordinateOutOfRange { .. })
        ));

        let ok = render(&command(CommandKind::Location {
            latitude: 52.52,
            longitude: 13.405,
            name: Some("Office".into()),
            address: None,
        }))
        .unwrap();
        assert_eq!(ok.body["location"]["name"], "Office");
    }

    #[test]
    fn test_mark_as_read_has_special_shape() {
        let rendered = render(&command(CommandKind::MarkAsRead {
            target_message_id: "wamid.IN".into(),
        }))
        .unwrap();
        assert_eq!(rendered.body["status"], "read");
        assert_eq!(rendered.body["message_id"], "wamid.IN");
        // No recipient envelope on mark-as-read.
        assert!(rendered.body.get("to").is_none());
    }
}
