use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use difychat_cli::{config, logging, run_ask, run_chat, AskOptions, OutputOptions};

#[derive(Parser, Debug)]
#[command(name = "difychat", version, about = "Chat with a Dify app from the terminal")]
struct Cli {
    #[arg(long, global = true)]
    conf_dir: Option<PathBuf>,
    /// Config file; defaults to `<conf-dir>/difychat.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: DifychatSubcommand,
}

#[derive(Subcommand, Debug, Clone)]
enum DifychatSubcommand {
    /// Send one query and print the answer.
    Ask(AskArgs),
    /// Interactive session that keeps the conversation across lines.
    Chat(OutputArgs),
}

#[derive(Args, Debug, Clone)]
struct AskArgs {
    #[command(flatten)]
    output: OutputArgs,
    /// Chat handle the conversation id is tracked under.
    #[arg(long = "chat")]
    handle: Option<String>,
    /// Continue an existing Dify conversation.
    #[arg(long)]
    conversation: Option<String>,
    query: String,
}

#[derive(Args, Debug, Clone)]
struct OutputArgs {
    #[arg(long, default_value_t = false)]
    stream: bool,
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl From<OutputArgs> for OutputOptions {
    fn from(args: OutputArgs) -> Self {
        Self {
            stream: args.stream,
            json: args.json,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    config::init_conf_dir(cli.conf_dir.clone());
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error: {error}");
            std::process::exit(1);
        }
    };
    logging::init_tracing(&config.log);

    let result = match cli.command {
        DifychatSubcommand::Ask(ask) => {
            run_ask(
                &config,
                AskOptions {
                    query: ask.query,
                    output: ask.output.into(),
                    handle: ask.handle,
                    conversation_id: ask.conversation,
                },
            )
            .await
        }
        DifychatSubcommand::Chat(output) => run_chat(&config, output.into()).await,
    };
    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_ask_with_flags() {
        let parsed = Cli::try_parse_from([
            "difychat",
            "ask",
            "--stream",
            "--json",
            "--chat",
            "thread-1",
            "--conversation",
            "C1",
            "hello there",
        ])
        .expect("ask should parse");
        let DifychatSubcommand::Ask(ask) = parsed.command else {
            panic!("expected ask subcommand");
        };
        assert!(ask.output.stream);
        assert!(ask.output.json);
        assert_eq!(ask.handle.as_deref(), Some("thread-1"));
        assert_eq!(ask.conversation.as_deref(), Some("C1"));
        assert_eq!(ask.query, "hello there");
    }

    #[test]
    fn cli_requires_query_for_ask() {
        let parsed = Cli::try_parse_from(["difychat", "ask"]);
        assert!(parsed.is_err(), "ask without a query should be rejected");
    }

    #[test]
    fn cli_parses_chat_command() {
        let parsed = Cli::try_parse_from(["difychat", "chat", "--stream"]);
        assert!(parsed.is_ok(), "chat --stream should parse");
    }

    #[test]
    fn cli_parses_global_config_flags() {
        let parsed = Cli::try_parse_from([
            "difychat",
            "--conf-dir",
            "/tmp/difychat-conf",
            "--config",
            "/tmp/other.toml",
            "chat",
        ])
        .expect("global flags should parse");
        assert_eq!(parsed.conf_dir, Some(PathBuf::from("/tmp/difychat-conf")));
        assert_eq!(parsed.config, Some(PathBuf::from("/tmp/other.toml")));
    }
}
