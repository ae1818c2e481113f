use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use aide_config::{AppConfig, ChatConfig, Mode};
use aide_llm::{Action, Persona};
use aide_runtime::{AiRequest, AppContext, RequestDispatcher, Role};

const HELP: &str = "commands: /explain <code>, /translate <language> <code>, /optimize <code>\n          /fix <code> -- <error>, /persona <teacher|hacker|reviewer>, /mode <online|offline>\n          /status, /reconnect, /history [n], /help, /exit\nor type any message to chat";

#[derive(Debug, PartialEq, Eq)]
enum ReplCommand<'a> {
    Help,
    Exit,
    Status,
    Reconnect,
    History(usize),
    Persona(&'a str),
    Mode(&'a str),
    Explain(&'a str),
    Translate { language: &'a str, code: &'a str },
    Optimize(&'a str),
    Fix { code: &'a str, error: &'a str },
    Chat(&'a str),
    Invalid(String),
}

fn parse_command(line: &str) -> ReplCommand<'_> {
    let Some(rest) = line.strip_prefix('/') else {
        return ReplCommand::Chat(line);
    };
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    match name {
        "help" => ReplCommand::Help,
        "exit" | "quit" => ReplCommand::Exit,
        "status" => ReplCommand::Status,
        "reconnect" => ReplCommand::Reconnect,
        "history" if args.is_empty() => ReplCommand::History(10),
        "history" => match args.parse() {
            Ok(n) => ReplCommand::History(n),
            Err(_) => ReplCommand::Invalid(format!("not a number: {args}")),
        },
        "persona" | "mode" | "explain" | "optimize" | "translate" | "fix" if args.is_empty() => {
            ReplCommand::Invalid(format!("/{name} needs an argument"))
        }
        "persona" => ReplCommand::Persona(args),
        "mode" => ReplCommand::Mode(args),
        "explain" => ReplCommand::Explain(args),
        "optimize" => ReplCommand::Optimize(args),
        "translate" => match args.split_once(char::is_whitespace) {
            Some((language, code)) => ReplCommand::Translate {
                language,
                code: code.trim(),
            },
            None => ReplCommand::Invalid("usage: /translate <language> <code>".to_string()),
        },
        "fix" => match args.split_once(" -- ") {
            Some((code, error)) => ReplCommand::Fix {
                code: code.trim(),
                error: error.trim(),
            },
            None => ReplCommand::Invalid("usage: /fix <code> -- <error>".to_string()),
        },
        other => ReplCommand::Invalid(format!("unknown command /{other}; try /help")),
    }
}

pub(crate) async fn run_chat_session(config: AppConfig) -> Result<()> {
    let context = AppContext::new(config);
    spawn_status_printer(&context);

    println!("aide interactive mode");
    println!("{HELP}");
    if let Err(err) = context.start().await {
        println!("[backend] {err}");
    }

    if let Some(transcript) = &context.transcript {
        let recent = transcript.load_recent(6)?;
        if !recent.is_empty() {
            println!("── earlier today ──");
            for entry in recent {
                let who = match entry.role {
                    Role::User => "you",
                    Role::Assistant => "aide",
                    Role::Error => "error",
                };
                println!("{who}: {}", entry.content);
            }
        }
    }

    let mut dispatcher = context.dispatcher.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            println!("session closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request = match parse_command(line) {
            ReplCommand::Help => {
                println!("{HELP}");
                continue;
            }
            ReplCommand::Exit => break,
            ReplCommand::Status => {
                print_status(&context, &dispatcher);
                continue;
            }
            ReplCommand::Reconnect => {
                context.connection.connect();
                continue;
            }
            ReplCommand::History(limit) => {
                match &context.transcript {
                    Some(transcript) => {
                        for entry in transcript.load_recent(limit)? {
                            println!("[{}] {:?}: {}", entry.timestamp.format("%H:%M:%S"), entry.role, entry.content);
                        }
                    }
                    None => println!("transcript is disabled"),
                }
                continue;
            }
            ReplCommand::Persona(name) => {
                match Persona::from_name(name) {
                    Some(_) => {
                        let defaults = ChatConfig {
                            persona: name.to_lowercase(),
                            mode: dispatcher.defaults().mode,
                        };
                        dispatcher.set_defaults(defaults);
                        println!("persona set to {}", dispatcher.defaults().persona);
                    }
                    None => println!("unknown persona {name}; choose teacher, hacker or reviewer"),
                }
                continue;
            }
            ReplCommand::Mode(raw) => {
                match raw.parse::<Mode>() {
                    Ok(mode) => {
                        let defaults = ChatConfig {
                            persona: dispatcher.defaults().persona.clone(),
                            mode,
                        };
                        dispatcher.set_defaults(defaults);
                        println!("mode set to {mode}");
                    }
                    Err(err) => println!("{err}"),
                }
                continue;
            }
            ReplCommand::Invalid(message) => {
                println!("{message}");
                continue;
            }
            ReplCommand::Explain(code) => AiRequest::new(Action::Explain, code),
            ReplCommand::Optimize(code) => AiRequest::new(Action::Optimize, code),
            ReplCommand::Translate { language, code } => {
                AiRequest::new(Action::Translate, code).option("targetLanguage", language)
            }
            ReplCommand::Fix { code, error } => {
                AiRequest::new(Action::FixError, code).option("error", error)
            }
            ReplCommand::Chat(message) => AiRequest::new(Action::Chat, message),
        };

        match dispatcher.dispatch(request.target("repl")).await {
            Ok(text) => println!("{text}"),
            Err(err) => println!("[error] {err}"),
        }
    }

    context.shutdown().await;
    Ok(())
}

fn print_status(context: &AppContext, dispatcher: &RequestDispatcher) {
    let connection = context.connection.status();
    let backend = context.supervisor.snapshot();
    println!(
        "connection: {} (reconnect attempt {}, {} pending){}",
        connection.state.as_str(),
        connection.reconnect_attempt,
        connection.pending,
        if connection.unavailable { ", unavailable; use /reconnect" } else { "" }
    );
    println!("backend: {:?} {}", backend.state, backend.command);
    println!(
        "persona: {}, mode: {}",
        dispatcher.defaults().persona,
        dispatcher.defaults().mode
    );
}

/// Print connection and backend events as they happen.
fn spawn_status_printer(context: &AppContext) {
    let mut status = context.bus.status.subscribe();
    let mut backend = context.bus.backend.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = status.recv() => match event {
                    Ok(event) => println!("[connection] {}", event.message()),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                event = backend.recv() => match event {
                    Ok(event) => println!("[backend] {}", event.message),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_chat() {
        assert_eq!(parse_command("what is a closure?"), ReplCommand::Chat("what is a closure?"));
    }

    #[test]
    fn translate_splits_language_and_code() {
        assert_eq!(
            parse_command("/translate rust print(1)"),
            ReplCommand::Translate {
                language: "rust",
                code: "print(1)"
            }
        );
        assert!(matches!(parse_command("/translate rust"), ReplCommand::Invalid(_)));
    }

    #[test]
    fn fix_splits_code_and_error() {
        assert_eq!(
            parse_command("/fix x = y -- NameError: y"),
            ReplCommand::Fix {
                code: "x = y",
                error: "NameError: y"
            }
        );
    }

    #[test]
    fn commands_without_required_args_are_invalid() {
        assert!(matches!(parse_command("/explain"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_command("/persona"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_command("/bogus"), ReplCommand::Invalid(_)));
    }

    #[test]
    fn history_takes_optional_limit() {
        assert_eq!(parse_command("/history"), ReplCommand::History(10));
        assert_eq!(parse_command("/history 3"), ReplCommand::History(3));
        assert!(matches!(parse_command("/history lots"), ReplCommand::Invalid(_)));
    }

    #[test]
    fn simple_commands() {
        assert_eq!(parse_command("/help"), ReplCommand::Help);
        assert_eq!(parse_command("/quit"), ReplCommand::Exit);
        assert_eq!(parse_command("/mode offline"), ReplCommand::Mode("offline"));
        assert_eq!(parse_command("/explain x = 1"), ReplCommand::Explain("x = 1"));
    }
}
