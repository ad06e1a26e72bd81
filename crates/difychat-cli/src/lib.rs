//! `difychat` command-line client: config loading, logging and the ask/chat runners.

use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use difychat_ai::{
    AbortController, CallOptions, DifyChatLanguageModel, DifyError, DifyProvider, GenerationMode,
    InMemoryConversationStore, StreamPart, Turn,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub mod config;
pub mod logging;

use config::CliConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputOptions {
    pub stream: bool,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskOptions {
    pub query: String,
    pub output: OutputOptions,
    pub handle: Option<String>,
    pub conversation_id: Option<String>,
}

pub fn build_model(config: &CliConfig) -> Result<DifyChatLanguageModel, String> {
    let store = Arc::new(InMemoryConversationStore::new(config.session));
    let provider =
        DifyProvider::new(config.provider_settings()).with_conversation_store(store);
    info!(base_url = provider.base_url(), "using Dify endpoint");
    provider
        .chat("difychat", config.chat_settings())
        .map_err(|error| error.to_string())
}

pub async fn run_ask(config: &CliConfig, options: AskOptions) -> Result<(), String> {
    let model = build_model(config)?;
    let mut call = CallOptions {
        handle: options.handle,
        conversation_id: options.conversation_id,
        ..CallOptions::default()
    };
    let controller = AbortController::new();
    call.signal = Some(controller.signal());

    let turns = [Turn::user(options.query)];
    let mut stdout = std::io::stdout();
    let turn = ask_once(&model, &turns, call, options.output, &mut stdout);
    tokio::pin!(turn);
    tokio::select! {
        result = &mut turn => result.map(|_| ()),
        _ = tokio::signal::ctrl_c() => {
            controller.abort();
            turn.await.map(|_| ())
        }
    }
}

pub async fn run_chat(config: &CliConfig, output: OutputOptions) -> Result<(), String> {
    let model = build_model(config)?;
    let input = BufReader::new(tokio::io::stdin());
    chat_loop(&model, output, input, std::io::stdout()).await
}

/// Interactive loop: every line is a user turn appended to one conversation.
/// `/reset` starts a new conversation, `/exit` quits.
pub async fn chat_loop<R, W>(
    model: &DifyChatLanguageModel,
    output_options: OutputOptions,
    input: R,
    mut output: W,
) -> Result<(), String>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    let mut turns: Vec<Turn> = Vec::new();
    let mut handle = new_chat_handle();
    info!(handle = %handle, "started chat session");

    loop {
        write!(output, "> ").map_err(write_error)?;
        output.flush().map_err(write_error)?;
        let line = tokio::select! {
            line = lines.next_line() => line.map_err(|error| format!("read stdin failed: {error}"))?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            writeln!(output).map_err(write_error)?;
            return Ok(());
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => return Ok(()),
            "/reset" => {
                turns.clear();
                model.conversation_store().remove(&handle);
                model.session().reset_conversation();
                handle = new_chat_handle();
                info!(handle = %handle, "reset chat session");
                writeln!(output, "(new conversation)").map_err(write_error)?;
                continue;
            }
            _ => {}
        }

        turns.push(Turn::user(line));
        let controller = AbortController::new();
        let call = CallOptions::default()
            .with_handle(handle.clone())
            .with_signal(controller.signal());
        let result = {
            let turn = ask_once(model, &turns, call, output_options, &mut output);
            tokio::pin!(turn);
            tokio::select! {
                result = &mut turn => result,
                _ = tokio::signal::ctrl_c() => {
                    controller.abort();
                    turn.await
                }
            }
        };
        match result {
            Ok(answer) => turns.push(Turn::assistant(answer)),
            Err(error) => {
                turns.pop();
                writeln!(output, "error: {error}").map_err(write_error)?;
            }
        }
    }
}

/// Runs one call and writes its answer. Returns the answer text.
async fn ask_once<W: Write>(
    model: &DifyChatLanguageModel,
    turns: &[Turn],
    call: CallOptions,
    output_options: OutputOptions,
    output: &mut W,
) -> Result<String, String> {
    let mode = GenerationMode::Plain;
    if !output_options.stream {
        let result = model
            .generate(turns, &mode, call)
            .await
            .map_err(|error| error.to_string())?;
        if output_options.json {
            let line = serde_json::to_string(&result)
                .map_err(|error| format!("encode result failed: {error}"))?;
            writeln!(output, "{line}").map_err(write_error)?;
        } else {
            writeln!(output, "{}", result.text).map_err(write_error)?;
        }
        return Ok(result.text);
    }

    let mut stream = model
        .stream(turns, &mode, call)
        .await
        .map_err(|error| error.to_string())?;
    let mut answer = String::new();
    while let Some(part) = stream.next().await {
        if output_options.json {
            let line = serde_json::to_string(&part)
                .map_err(|error| format!("encode stream part failed: {error}"))?;
            writeln!(output, "{line}").map_err(write_error)?;
        }
        match part {
            StreamPart::TextDelta { text_delta } => {
                if !output_options.json {
                    write!(output, "{text_delta}").map_err(write_error)?;
                    output.flush().map_err(write_error)?;
                }
                answer.push_str(&text_delta);
            }
            StreamPart::Finish { .. } => {
                if !output_options.json {
                    writeln!(output).map_err(write_error)?;
                }
                return Ok(answer);
            }
            StreamPart::Error { error } if error.is_recoverable() => {
                warn!(error = %error, "skipped malformed stream frame");
            }
            StreamPart::Error { error } => return Err(error.to_string()),
        }
    }
    Err(DifyError::aborted().to_string())
}

fn new_chat_handle() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    format!("cli-{}-{millis}", std::process::id())
}

fn write_error(error: std::io::Error) -> String {
    format!("write output failed: {error}")
}
