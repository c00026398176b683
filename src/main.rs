//! kvchat - interactive chat over a local GGUF model
//!
//! Usage: `kvchat <model.gguf> [config.json]`. Type `/reset` to start over.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use tracing::{error, info};

use kvcache_client::types::{render_chatml, Message, Role};
use kvcache_client::{logging, MessageChunk, Session, SessionConfig};

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(model_path) = args.next() else {
        eprintln!("usage: kvchat <model.gguf> [config.json]");
        return ExitCode::from(2);
    };

    let config = match args.next() {
        Some(path) => SessionConfig::load(path),
        None => SessionConfig::load_or_default(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.verbose);
    info!("Starting kvchat v{}", env!("CARGO_PKG_VERSION"));

    let session = match Session::create(&model_path, config) {
        Ok(session) => session,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(&session) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(session: &Session) -> kvcache_client::Result<()> {
    let mut messages = vec![Message::new(Role::System, "You are a helpful assistant.")];
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/reset" {
            session.reset()?;
            messages.truncate(1);
            println!("(conversation cleared)");
            continue;
        }

        messages.push(Message::new(Role::User, line));
        let prompt = render_chatml(&messages);

        let mut reply = String::new();
        for piece in session.submit(vec![MessageChunk::Text(prompt)])? {
            let piece = piece?;
            print!("{piece}");
            let _ = stdout.flush();
            reply.push_str(&piece);
        }
        println!();
        messages.push(Message::new(Role::Assistant, reply));
    }
    Ok(())
}
