use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use call_core::connection::mock::MockConnectionFactory;
use call_core::connection::webrtc::WebRtcConnectionFactory;
use call_core::media::mock::SyntheticMediaSource;
use call_core::session::{CallSession, CallStatus, SessionEvent};
use call_core::signaling::local::LocalSignaling;
use call_core::signaling::websocket::WebSocketSignaling;
use call_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use call_core::{CallConfig, CallError, SignalingError};
use clap::{Args, Parser, Subcommand};
use relay_bus::LocalRelay;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Demo(args) => run_demo(args).await,
        Command::Join(args) => run_join(args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "beach-call",
    about = "Two-party video calls over a pub/sub relay",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "BEACH_CALL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "BEACH_CALL_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig::new(self.level, self.file.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run two in-process participants against a local relay
    Demo(DemoArgs),
    /// Join a room on a WebSocket relay with synthetic media
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
struct DemoArgs {
    #[arg(long, default_value = "demo", help = "Room name (the observable prefix is added)")]
    room: String,

    #[arg(long, default_value_t = 10, help = "Seconds to wait for both sides to connect")]
    connect_timeout: u64,

    #[arg(long, default_value_t = 0, help = "Seconds to stay connected before hanging up")]
    hold: u64,

    #[arg(long, help = "Flip the second participant's camera once connected")]
    switch_camera: bool,
}

#[derive(Args, Debug, Clone)]
struct JoinArgs {
    #[arg(help = "Room name (the observable prefix is added)")]
    room: String,

    #[arg(
        long,
        env = "BEACH_CALL_RELAY_URL",
        default_value = "http://127.0.0.1:8080/ws",
        help = "Relay endpoint (http(s) or ws(s))"
    )]
    relay: String,

    #[arg(long, default_value = "beach-call", help = "Relay channel id")]
    channel: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Call(#[from] CallError),
    #[error("{0}")]
    Signaling(#[from] SignalingError),
    #[error("{who} did not connect within {secs}s (last status: {status})")]
    Timeout {
        who: String,
        secs: u64,
        status: &'static str,
    },
    #[error("session event stream closed")]
    EventsClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

fn demo_participant(signaling: &LocalSignaling, config: &CallConfig) -> CallSession {
    CallSession::new(
        config.clone(),
        Arc::new(signaling.clone()),
        Arc::new(SyntheticMediaSource::new()),
        Arc::new(MockConnectionFactory::new()),
    )
}

/// Prints events for `who` until its status reaches `Connected`.
async fn wait_connected(
    who: &str,
    session: &CallSession,
    events: &mut broadcast::Receiver<SessionEvent>,
    secs: u64,
) -> Result<(), CliError> {
    let waited = tokio::time::timeout(Duration::from_secs(secs), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    report(who, &event);
                    match event {
                        SessionEvent::Status(CallStatus::Connected) => return Ok(()),
                        SessionEvent::Notification(err) => return Err(CliError::Call(err)),
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(who, skipped, "session events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(CliError::EventsClosed),
            }
        }
    })
    .await;
    waited.unwrap_or_else(|_| {
        Err(CliError::Timeout {
            who: who.to_string(),
            secs,
            status: session.status().text(),
        })
    })
}

fn report(who: &str, event: &SessionEvent) {
    match event {
        SessionEvent::Status(status) => println!("[{who}] {}", status.text()),
        SessionEvent::Role(role) => println!("[{who}] role: {}", role.as_str()),
        SessionEvent::RemoteMedia(Some(track)) => {
            println!("[{who}] remote {} from {}", track.kind, track.stream_id)
        }
        SessionEvent::RemoteMedia(None) => println!("[{who}] remote media cleared"),
        SessionEvent::Notification(err) => println!("[{who}] ⚠️  {}", err.user_message()),
        SessionEvent::Error(err) => debug!(who, error = %err, "recoverable call error"),
    }
}

async fn run_demo(args: DemoArgs) -> Result<(), CliError> {
    let config = CallConfig::from_env();
    let signaling = LocalSignaling::new(Arc::new(LocalRelay::new()));
    let caller = demo_participant(&signaling, &config);
    let callee = demo_participant(&signaling, &config);
    let mut caller_events = caller.subscribe();
    let mut callee_events = callee.subscribe();

    info!(room = %config.room_key(&args.room), "starting demo call");
    callee.start("demo-callee", &args.room).await?;
    caller.start("demo-caller", &args.room).await?;
    wait_connected("caller", &caller, &mut caller_events, args.connect_timeout).await?;
    wait_connected("callee", &callee, &mut callee_events, args.connect_timeout).await?;

    if args.switch_camera {
        let facing = caller.switch_camera().await?;
        println!("[caller] camera switched to {facing:?}");
    }
    if args.hold > 0 {
        tokio::time::sleep(Duration::from_secs(args.hold)).await;
    }

    for (who, session) in [("caller", &caller), ("callee", &callee)] {
        let view = session.snapshot();
        println!(
            "[{who}] role={} connection={} remote_media={} mic={} camera={}",
            view.role.map(|role| role.as_str()).unwrap_or("-"),
            view.connection_state,
            view.remote_media,
            view.mic_enabled,
            view.camera_enabled,
        );
    }

    caller.end_and_release().await;
    callee.end_and_release().await;
    println!("demo call ended");
    Ok(())
}

async fn run_join(args: JoinArgs) -> Result<(), CliError> {
    let config = CallConfig::from_env();
    let signaling = WebSocketSignaling::new(&args.relay)?;
    info!(relay = %signaling.url(), room = %config.room_key(&args.room), "joining call");
    let session = CallSession::new(
        config,
        Arc::new(signaling),
        Arc::new(SyntheticMediaSource::new()),
        Arc::new(WebRtcConnectionFactory::new()),
    );
    let mut events = session.subscribe();
    session.start(&args.channel, &args.room).await?;
    println!("joined {}; press Ctrl-C to hang up", args.room);

    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                break signal.map_err(CliError::from);
            }
            event = events.recv() => match event {
                Ok(event) => {
                    report("local", &event);
                    if let SessionEvent::Notification(err) = event {
                        break Err(CliError::Call(err));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break Err(CliError::EventsClosed),
            },
        }
    };

    session.end_and_release().await;
    println!("call ended");
    outcome
}
