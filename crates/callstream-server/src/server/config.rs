use anyhow::bail;
use callstream::{EchoGenerator, OrchestratorConfig};
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `callstream-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults suitable for a single node.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "callstream-server",
    version,
    about = "Streams tool calls to any number of observers over Server-Sent Events"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Number of lifecycle entries kept per session.
    ///
    /// Environment variable: `SESSION_CAPACITY`
    #[arg(long, env = "SESSION_CAPACITY", default_value_t = callstream::DEFAULT_SESSION_CAPACITY)]
    pub session_capacity: usize,

    /// Number of events buffered per call. Producers wait for the slowest
    /// attached subscriber once it is full. With nobody attached, the oldest
    /// partial events are dropped instead.
    ///
    /// Environment variable: `CHANNEL_CAPACITY`
    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = callstream::DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    /// Seconds an SSE stream may stay silent before it is closed with a
    /// `timeout` error event. The call itself keeps running.
    ///
    /// Environment variable: `STREAM_IDLE_TIMEOUT_SECS`
    #[arg(long, env = "STREAM_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub stream_idle_timeout_secs: u64,

    /// Maximum number of calls that may be in flight at once. Further
    /// submissions are rejected with 503.
    ///
    /// Environment variable: `MAX_INFLIGHT_CALLS`
    #[arg(long, env = "MAX_INFLIGHT_CALLS", default_value_t = callstream::DEFAULT_MAX_INFLIGHT_CALLS)]
    pub max_inflight_calls: usize,

    /// Seconds in-flight calls get to finish on shutdown before they are
    /// cancelled.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Tool used when a request does not name one.
    ///
    /// Environment variable: `DEFAULT_TOOL`
    #[arg(long, env = "DEFAULT_TOOL", default_value_t = String::from(EchoGenerator::TOOL))]
    pub default_tool: String,

    /// Milliseconds the echo tool sleeps before each chunk.
    ///
    /// Environment variable: `ECHO_DELAY_MS`
    #[arg(long, env = "ECHO_DELAY_MS", default_value_t = 0)]
    pub echo_delay_ms: u64,

    /// Emit logs as JSON lines instead of the pretty format.
    ///
    /// Environment variable: `LOG_JSON`
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub orchestrator: OrchestratorConfig,
    pub default_tool: String,
    pub echo_delay: Duration,
    pub log_json: bool,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.session_capacity == 0 {
            bail!("SESSION_CAPACITY must be greater than 0");
        }
        if args.channel_capacity == 0 {
            bail!("CHANNEL_CAPACITY must be greater than 0");
        }
        if args.stream_idle_timeout_secs == 0 {
            bail!("STREAM_IDLE_TIMEOUT_SECS must be greater than 0");
        }
        if args.max_inflight_calls == 0 {
            bail!("MAX_INFLIGHT_CALLS must be greater than 0");
        }
        if args.default_tool.trim().is_empty() {
            bail!("DEFAULT_TOOL must not be empty");
        }

        Ok(Self {
            server_addr: args.server_addr,
            orchestrator: OrchestratorConfig {
                session_capacity: args.session_capacity,
                channel_capacity: args.channel_capacity,
                stream_idle_timeout: Duration::from_secs(args.stream_idle_timeout_secs),
                max_inflight_calls: args.max_inflight_calls,
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            },
            default_tool: args.default_tool,
            echo_delay: Duration::from_millis(args.echo_delay_ms),
            log_json: args.log_json,
        })
    }
}
