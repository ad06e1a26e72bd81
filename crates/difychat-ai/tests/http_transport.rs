use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use difychat_ai::{
    Attachment, CallOptions, DifyChatSettings, DifyErrorCode, DifyProvider, DifyProviderSettings,
    GenerationMode, StreamPart, Turn,
};
use serde_json::{json, Value};

struct CapturedRequest {
    request_line: String,
    headers: Vec<(String, String)>,
    body: Value,
}

impl CapturedRequest {
    fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().copied()
    }
}

fn read_request(socket: &mut TcpStream) -> CapturedRequest {
    let mut raw = Vec::new();
    let mut buffer = [0_u8; 4096];
    let header_end = loop {
        let read = socket.read(&mut buffer).expect("read request");
        assert!(read > 0, "client closed before sending headers");
        raw.extend_from_slice(&buffer[..read]);
        if let Some(index) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
            break index + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    while raw.len() < header_end + content_length {
        let read = socket.read(&mut buffer).expect("read request body");
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&buffer[..read]);
    }

    let body = serde_json::from_slice(&raw[header_end..header_end + content_length])
        .expect("request body is json");
    CapturedRequest {
        request_line,
        headers,
        body,
    }
}

fn spawn_server(
    status_line: &'static str,
    content_type: &'static str,
    body: String,
) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind local test server");
    let address = listener.local_addr().expect("server local addr");
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        if let Ok((mut socket, _)) = listener.accept() {
            socket
                .set_read_timeout(Some(Duration::from_secs(2)))
                .expect("set read timeout");
            let captured = read_request(&mut socket);
            let _ = sender.send(captured);

            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket
                .write_all(response.as_bytes())
                .expect("write response");
            let _ = socket.flush();
        }
    });
    (format!("http://{address}/v1"), receiver)
}

fn provider_for(base_url: String) -> DifyProvider {
    let mut headers = HashMap::new();
    headers.insert("X-Workspace".to_string(), "team-a".to_string());
    DifyProvider::new(DifyProviderSettings {
        base_url: Some(base_url),
        headers,
    })
}

fn chat_settings() -> DifyChatSettings {
    let mut inputs = serde_json::Map::new();
    inputs.insert("topic".to_string(), json!("rust"));
    DifyChatSettings {
        inputs,
        user: Some("user-1".to_string()),
        auto_generate_name: Some(false),
        api_key: Some("app-secret".to_string()),
    }
}

#[tokio::test]
async fn blocking_call_posts_chat_messages_with_bearer_key() {
    let (base_url, requests) = spawn_server(
        "200 OK",
        "application/json",
        json!({
            "event": "message",
            "message_id": "M1",
            "conversation_id": "C1",
            "mode": "advanced-chat",
            "answer": "Hello from Dify",
            "metadata": { "usage": { "prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16 } },
            "created_at": 1_705_407_629
        })
        .to_string(),
    );
    let provider = provider_for(base_url);
    let model = provider.chat("dify-app", chat_settings()).expect("model");

    let attachment_json = json!({
        "url": "https://files.example.com/report.pdf",
        "name": "report.pdf",
        "contentType": "application/pdf",
        "type": "document",
        "transfer_method": "local_file",
        "upload_file_id": "file-123",
        "checksum": "sha256:abc"
    });
    let attachment: Attachment =
        serde_json::from_value(attachment_json.clone()).expect("attachment fixture");
    let mut options = CallOptions::default().with_handle("chat-1");
    options.attachments = vec![attachment];

    let result = model
        .generate(&[Turn::user("hello")], &GenerationMode::Plain, options)
        .await
        .expect("blocking call");
    assert_eq!(result.text, "Hello from Dify");
    assert_eq!(result.usage.prompt_tokens, 12.0);
    assert_eq!(result.metadata.message_id.as_deref(), Some("M1"));
    assert_eq!(
        provider.conversation_store().get("chat-1").as_deref(),
        Some("C1")
    );

    let captured = requests
        .recv_timeout(Duration::from_secs(2))
        .expect("captured request");
    assert_eq!(captured.request_line, "POST /v1/chat-messages HTTP/1.1");
    assert_eq!(captured.header("authorization"), Some("Bearer app-secret"));
    assert_eq!(captured.header("x-workspace"), Some("team-a"));
    assert_eq!(captured.body["query"], "hello");
    assert_eq!(captured.body["response_mode"], "blocking");
    assert_eq!(captured.body["inputs"], json!({ "topic": "rust" }));
    assert_eq!(captured.body["user"], "user-1");
    assert_eq!(captured.body["auto_generate_name"], false);
    assert_eq!(captured.body["files"], json!([attachment_json]));
    assert_eq!(captured.body, result.request_body);
}

#[tokio::test]
async fn streaming_call_reads_sse_body() {
    let body = [
        r#"{"event":"workflow_started","conversation_id":"C9","task_id":"T9","workflow_run_id":"R1","data":{"id":"R1","workflow_id":"W1","created_at":1}}"#,
        r#"{"event":"node_started","conversation_id":"C9","task_id":"T9","data":{"id":"N1","node_id":"start","node_type":"start","title":"Start","index":1}}"#,
        r#"{"event":"message","conversation_id":"C9","message_id":"M9","answer":"Hi "}"#,
        r#"{"event":"message","conversation_id":"C9","message_id":"M9","answer":"there"}"#,
        r#"{"event":"message_end","conversation_id":"C9","id":"M9","metadata":{"usage":{"prompt_tokens":2,"completion_tokens":3,"total_tokens":5}}}"#,
        r#"{"event":"workflow_finished","conversation_id":"C9","task_id":"T9","data":{"id":"R1","status":"succeeded","total_tokens":5}}"#,
    ]
    .iter()
    .map(|frame| format!("data: {frame}\n\n"))
    .chain(std::iter::once("event: ping\n\n".to_string()))
    .collect::<String>();
    let (base_url, requests) = spawn_server("200 OK", "text/event-stream", body);
    let provider = provider_for(base_url);
    let model = provider.chat("dify-app", chat_settings()).expect("model");

    let parts = model
        .stream(
            &[Turn::user("hi")],
            &GenerationMode::Plain,
            CallOptions::default().with_handle("chat-9"),
        )
        .await
        .expect("open stream")
        .collect_parts()
        .await;

    let text: String = parts
        .iter()
        .filter_map(StreamPart::as_text_delta)
        .collect();
    assert_eq!(text, "Hi there");
    let Some(StreamPart::Finish {
        usage, metadata, ..
    }) = parts.last()
    else {
        panic!("expected finish, got {parts:?}");
    };
    assert_eq!(usage.completion_tokens, 5.0);
    assert_eq!(metadata.task_id.as_deref(), Some("T9"));
    assert_eq!(
        provider.conversation_store().get("chat-9").as_deref(),
        Some("C9")
    );

    let captured = requests
        .recv_timeout(Duration::from_secs(2))
        .expect("captured request");
    assert_eq!(captured.body["response_mode"], "streaming");
    assert_eq!(captured.header("accept"), Some("text/event-stream"));
}

#[tokio::test]
async fn error_envelope_fails_stream_open() {
    let (base_url, _requests) = spawn_server(
        "404 Not Found",
        "application/json",
        json!({
            "code": "not_found",
            "message": "Conversation Not Exists.",
            "status": 404
        })
        .to_string(),
    );
    let provider = provider_for(base_url);
    let model = provider.chat("dify-app", chat_settings()).expect("model");

    let error = model
        .stream(&[Turn::user("hi")], &GenerationMode::Plain, CallOptions::default())
        .await
        .err()
        .expect("remote error");
    assert_eq!(error.code, DifyErrorCode::Remote);
    assert_eq!(error.http_status, Some(404));
    assert_eq!(error.message, "Dify API error: Conversation Not Exists.");
}

#[tokio::test]
async fn malformed_blocking_body_is_a_decode_error() {
    let (base_url, _requests) =
        spawn_server("200 OK", "application/json", "{\"answer\":".to_string());
    let provider = provider_for(base_url);
    let model = provider.chat("dify-app", chat_settings()).expect("model");

    let error = model
        .generate(&[Turn::user("hi")], &GenerationMode::Plain, CallOptions::default())
        .await
        .expect_err("decode error");
    assert_eq!(error.code, DifyErrorCode::Decode);
}

#[tokio::test]
async fn call_headers_override_provider_headers_once() {
    let (base_url, requests) = spawn_server(
        "200 OK",
        "application/json",
        json!({ "answer": "ok" }).to_string(),
    );
    let mut headers = HashMap::new();
    headers.insert("X-Tenant".to_string(), "provider".to_string());
    let provider = DifyProvider::new(DifyProviderSettings {
        base_url: Some(base_url),
        headers,
    });
    let mut settings = chat_settings();
    settings.api_key = Some("app-a".to_string());
    let model = provider.chat("dify-app", settings).expect("model");

    let mut options = CallOptions::default();
    options
        .headers
        .insert("Authorization".to_string(), "Bearer app-b".to_string());
    options.headers.insert("x-tenant".to_string(), "call".to_string());
    model
        .generate(&[Turn::user("hi")], &GenerationMode::Plain, options)
        .await
        .expect("blocking call");

    let captured = requests
        .recv_timeout(Duration::from_secs(2))
        .expect("captured request");
    assert_eq!(captured.header_values("authorization"), vec!["Bearer app-b"]);
    assert_eq!(captured.header_values("x-tenant"), vec!["call"]);
    assert_eq!(
        captured.header_values("content-type"),
        vec!["application/json"]
    );
}
