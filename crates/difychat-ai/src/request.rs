use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DifyError, DifyErrorCode};
use crate::session::ConversationScope;
use crate::types::{Attachment, CallOptions, GenerationMode, Role, Turn, TurnContent, TurnPart};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Streaming,
    Blocking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            kind: "json_object".to_string(),
        }
    }
}

/// Body of `POST /chat-messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub inputs: Map<String, Value>,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conversation_id: Option<String>,
    pub response_mode: ResponseMode,
    pub files: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub auto_generate_name: Option<bool>,
}

/// Model-level values folded into every request.
#[derive(Debug, Clone, Copy)]
pub struct RequestDefaults<'a> {
    pub inputs: &'a Map<String, Value>,
    pub user: Option<&'a str>,
    pub auto_generate_name: Option<bool>,
}

pub fn build_request(
    turns: &[Turn],
    mode: &GenerationMode,
    scope: &ConversationScope,
    options: &CallOptions,
    defaults: RequestDefaults<'_>,
    response_mode: ResponseMode,
) -> Result<OutboundRequest, DifyError> {
    if *mode == GenerationMode::ToolCall {
        return Err(DifyError::new(
            DifyErrorCode::UnsupportedMode,
            "Unsupported functionality: tool-mode object generation",
        ));
    }

    let latest = turns
        .last()
        .ok_or_else(|| DifyError::protocol("The prompt must contain at least one message"))?;
    if latest.role != Role::User {
        return Err(
            DifyError::protocol("The last message must be a user message")
                .with_details(serde_json::json!({ "latestMessageRole": latest.role })),
        );
    }

    let conversation_id = resolve_conversation_id(
        turns,
        options.conversation_id.as_deref(),
        || scope.lookup(),
    );

    let user = options
        .user
        .as_deref()
        .or(defaults.user)
        .map(str::to_string);

    Ok(OutboundRequest {
        inputs: defaults.inputs.clone(),
        query: extract_query(&latest.content),
        user,
        conversation_id,
        response_mode,
        files: options.attachments.clone(),
        response_format: (*mode == GenerationMode::StructuredJson)
            .then(ResponseFormat::json_object),
        auto_generate_name: defaults.auto_generate_name,
    })
}

/// A lone user turn with no assistant reply is the only start-of-conversation
/// signal the turn list carries.
pub fn is_new_conversation(turns: &[Turn]) -> bool {
    let users = turns.iter().filter(|turn| turn.role == Role::User).count();
    let assistants = turns
        .iter()
        .filter(|turn| turn.role == Role::Assistant)
        .count();
    users == 1 && assistants == 0
}

pub fn resolve_conversation_id<F>(
    turns: &[Turn],
    explicit: Option<&str>,
    tracked: F,
) -> Option<String>
where
    F: FnOnce() -> Option<String>,
{
    if let Some(explicit) = explicit.filter(|value| !value.trim().is_empty()) {
        return Some(explicit.to_string());
    }
    if is_new_conversation(turns) {
        return None;
    }
    tracked()
}

/// Attachments travel in `files`; only text parts make it into the query.
pub fn extract_query(content: &TurnContent) -> String {
    match content {
        TurnContent::Text(text) => text.clone(),
        TurnContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                TurnPart::Text { text } if !text.is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::session::{InMemoryConversationStore, SessionManager};

    fn scope(handle: Option<&str>) -> ConversationScope {
        ConversationScope::new(
            Arc::new(InMemoryConversationStore::default()),
            Arc::new(SessionManager::new()),
            handle.map(str::to_string),
        )
    }

    fn defaults(inputs: &Map<String, Value>) -> RequestDefaults<'_> {
        RequestDefaults {
            inputs,
            user: Some("settings-user"),
            auto_generate_name: None,
        }
    }

    fn build(
        turns: &[Turn],
        mode: GenerationMode,
        scope: &ConversationScope,
        options: &CallOptions,
    ) -> Result<OutboundRequest, DifyError> {
        let inputs = Map::new();
        build_request(
            turns,
            &mode,
            scope,
            options,
            defaults(&inputs),
            ResponseMode::Streaming,
        )
    }

    #[test]
    fn trailing_assistant_turn_is_a_protocol_error() {
        let turns = vec![Turn::user("hi"), Turn::assistant("hello")];
        let error = build(
            &turns,
            GenerationMode::Plain,
            &scope(None),
            &CallOptions::default(),
        )
        .expect_err("must fail");
        assert_eq!(error.code, DifyErrorCode::Protocol);
    }

    #[test]
    fn empty_turn_list_is_a_protocol_error() {
        let error = build(
            &[],
            GenerationMode::Plain,
            &scope(None),
            &CallOptions::default(),
        )
        .expect_err("must fail");
        assert_eq!(error.code, DifyErrorCode::Protocol);
    }

    #[test]
    fn tool_call_mode_is_rejected_regardless_of_turns() {
        for turns in [vec![Turn::user("hi")], vec![Turn::assistant("hello")]] {
            let error = build(
                &turns,
                GenerationMode::ToolCall,
                &scope(None),
                &CallOptions::default(),
            )
            .expect_err("must fail");
            assert_eq!(error.code, DifyErrorCode::UnsupportedMode);
            assert!(error.message.contains("tool-mode object generation"));
        }
    }

    #[test]
    fn first_user_turn_starts_a_new_conversation() {
        let scope = scope(None);
        scope.observe("stale");
        let request = build(
            &[Turn::user("hello")],
            GenerationMode::Plain,
            &scope,
            &CallOptions::default(),
        )
        .expect("request");
        assert_eq!(request.conversation_id, None);
    }

    #[test]
    fn follow_up_turn_reuses_tracked_id_for_handle() {
        let scope = scope(Some("chat-1"));
        scope.observe("C1");
        let turns = vec![
            Turn::user("hello"),
            Turn::assistant("hi there"),
            Turn::user("what can you do?"),
        ];
        let request = build(
            &turns,
            GenerationMode::Plain,
            &scope,
            &CallOptions::default(),
        )
        .expect("request");
        assert_eq!(request.conversation_id.as_deref(), Some("C1"));
    }

    #[test]
    fn explicit_conversation_id_wins_even_for_first_turn() {
        let options = CallOptions {
            conversation_id: Some("explicit".to_string()),
            ..CallOptions::default()
        };
        let request = build(
            &[Turn::user("hello")],
            GenerationMode::Plain,
            &scope(None),
            &options,
        )
        .expect("request");
        assert_eq!(request.conversation_id.as_deref(), Some("explicit"));
    }

    #[test]
    fn two_user_turns_without_reply_still_count_as_continuation() {
        let turns = vec![Turn::user("one"), Turn::user("two")];
        assert!(!is_new_conversation(&turns));
        assert_eq!(
            resolve_conversation_id(&turns, None, || Some("C7".to_string())).as_deref(),
            Some("C7")
        );
    }

    #[test]
    fn query_flattens_text_parts_and_drops_attachments() {
        let content = TurnContent::Parts(vec![
            TurnPart::Text {
                text: "describe".to_string(),
            },
            TurnPart::Image {
                url: "https://files.example/cat.png".to_string(),
                mime_type: Some("image/png".to_string()),
            },
            TurnPart::Text {
                text: String::new(),
            },
            TurnPart::Text {
                text: "this image".to_string(),
            },
        ]);
        assert_eq!(extract_query(&content), "describe this image");
        assert_eq!(
            extract_query(&TurnContent::Text("  verbatim ".to_string())),
            "  verbatim "
        );
    }

    #[test]
    fn structured_json_adds_response_format() {
        let request = build(
            &[Turn::user("give me json")],
            GenerationMode::StructuredJson,
            &scope(None),
            &CallOptions::default(),
        )
        .expect("request");
        let body = serde_json::to_value(&request).expect("encode");
        assert_eq!(body["response_format"], json!({ "type": "json_object" }));
        assert_eq!(body["response_mode"], "streaming");
        assert!(body.get("conversation_id").is_none());
    }

    #[test]
    fn plain_mode_payload_has_no_response_format_and_resolves_user() {
        let options = CallOptions {
            user: Some("call-user".to_string()),
            ..CallOptions::default()
        };
        let request = build(
            &[Turn::user("hi")],
            GenerationMode::Plain,
            &scope(None),
            &options,
        )
        .expect("request");
        assert_eq!(request.response_format, None);
        assert_eq!(request.user.as_deref(), Some("call-user"));

        let request = build(
            &[Turn::user("hi")],
            GenerationMode::Plain,
            &scope(None),
            &CallOptions::default(),
        )
        .expect("request");
        assert_eq!(request.user.as_deref(), Some("settings-user"));
    }

    #[test]
    fn attachments_pass_through_to_files_unchanged() {
        let descriptor = json!({
            "url": "https://files.example/report.pdf",
            "name": "report.pdf",
            "contentType": "application/pdf",
            "type": "document",
            "transfer_method": "local_file",
            "upload_file_id": "file-123",
            "checksum": "sha256:abc"
        });
        let attachment: Attachment =
            serde_json::from_value(descriptor.clone()).expect("attachment");
        let options = CallOptions {
            attachments: vec![attachment],
            ..CallOptions::default()
        };
        let request = build(
            &[Turn::user("summarise the file")],
            GenerationMode::Plain,
            &scope(None),
            &options,
        )
        .expect("request");
        let body = serde_json::to_value(&request).expect("encode");
        assert_eq!(body["files"], json!([descriptor]));
    }
}
