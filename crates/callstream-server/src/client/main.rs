//! # `callstream-client`
//!
//! Command-line client for a running `callstream-server`.
//!
//! ```bash
//! cargo run --bin callstream-client -- call "hello there"
//! ```

use callstream::{CallId, Event};
use callstream_server::{
    client::{CallClient, ClientError},
    server::service::handler::ExecuteRequest,
};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, json};
use std::io::Write;

#[derive(Parser, Debug)]
#[command(
    name = "callstream-client",
    version,
    about = "Starts, follows and cancels calls on a callstream server"
)]
struct Cli {
    /// Base URL of the server.
    ///
    /// Environment variable: `CALLSTREAM_URL`
    #[arg(long, env = "CALLSTREAM_URL", default_value_t = String::from("http://127.0.0.1:8080"))]
    server_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a call and print the submission.
    Execute {
        #[command(flatten)]
        call: CallArgs,

        /// Follow the call's events until it ends.
        #[arg(long)]
        follow: bool,
    },
    /// Follow a call's events, replaying what it already produced.
    Stream { call_id: CallId },
    /// Submit a call and print only its final text.
    Call(CallArgs),
    /// Cancel one call.
    Cancel { call_id: CallId },
    /// Cancel every call in flight.
    CancelAll,
    /// Show a call record.
    Get { call_id: CallId },
    /// Show a session's recent lifecycle entries.
    Session { session_id: String },
    Health,
    Ready,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Text passed to the tool as `input.text`.
    text: String,

    /// Tool to run. Defaults to the server's default tool.
    #[arg(long)]
    tool: Option<String>,

    #[arg(long)]
    session_id: Option<String>,

    /// Idempotency token. Repeating it returns the original call.
    #[arg(long)]
    request_id: Option<String>,
}

impl From<CallArgs> for ExecuteRequest {
    fn from(args: CallArgs) -> Self {
        let mut input = Map::new();
        input.insert("text".into(), json!(args.text));
        Self {
            tool: args.tool,
            input: Some(input),
            messages: None,
            session_id: args.session_id,
            request_id: args.request_id,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let client = CallClient::new(&cli.server_url)?;

    match cli.command {
        Command::Execute { call, follow } => {
            let submission = client.execute(&call.into()).await?;
            print_json(&submission)?;
            if follow {
                follow_call(&client, &submission.call_id).await?;
            }
        }
        Command::Stream { call_id } => follow_call(&client, &call_id).await?,
        Command::Call(call) => println!("{}", client.call_tool(&call.into()).await?),
        Command::Cancel { call_id } => print_json(&client.cancel(&call_id).await?)?,
        Command::CancelAll => print_json(&client.cancel_all().await?)?,
        Command::Get { call_id } => print_json(&client.get_call(&call_id).await?)?,
        Command::Session { session_id } => {
            print_json(&client.read_session(&session_id).await?)?;
        }
        Command::Health => print_json(&client.health().await?)?,
        Command::Ready => {
            let ready = client.ready().await?;
            println!("{}", if ready { "ready" } else { "not ready" });
            if !ready {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints partial text as it arrives, then the terminal event.
async fn follow_call(client: &CallClient, call_id: &CallId) -> anyhow::Result<()> {
    let mut events = client.stream_results(call_id).await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event? {
            Event::Partial { text } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            Event::Final { .. } => {
                writeln!(stdout)?;
                return Ok(());
            }
            Event::Error { message } => {
                writeln!(stdout)?;
                return Err(ClientError::CallFailed(message).into());
            }
            Event::Cancelled { message } => {
                writeln!(stdout)?;
                return Err(ClientError::CallCancelled(message).into());
            }
        }
    }
    Err(ClientError::Incomplete.into())
}
