#![forbid(unsafe_code)]

use samcom_station::config::{load_config, Cli, Commands, StationConfig};
use samcom_station::local_api::{self, LocalApi};
use samcom_station::UserStation;

use clap::Parser;
use std::io::IsTerminal;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

// ── Shared helpers ──────────────────────────────────────────────────

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

/// Loads the config file and applies command-line overrides.
fn resolve_config(cli: &Cli) -> anyhow::Result<StationConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref relay) = cli.relay {
        config.relay.clone_from(relay);
    }
    if let Some(ref listen) = cli.listen {
        config.listen.clone_from(listen);
    }
    if let Some(ref user) = cli.user {
        config.user_id.clone_from(user);
    }
    Ok(config)
}

// ── Daemon ──────────────────────────────────────────────────────────

async fn run_daemon(cli: &Cli) -> anyhow::Result<()> {
    let config = resolve_config(cli)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ samcom station{RESET} {DIM}v{v}{RESET}");
        eprintln!("  {DIM}User{RESET}       {CYAN}{}{RESET}", config.user_id);
        eprintln!("  {DIM}Relay{RESET}      {}", config.relay);
        eprintln!("  {DIM}Listen{RESET}     {}", config.listen);
        eprintln!();
    }

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(user_id = %config.user_id, relay = %config.relay, "starting station daemon");

    let user_id = config.user_id.clone();
    let relay = config.relay.clone();
    let (client, events) = UserStation::spawn(config).into_parts();
    let events = local_api::fan_out_events(events);
    let api = LocalApi::new(client, events, user_id, relay);

    tokio::select! {
        result = local_api::run_local_api(listener, api) => {
            if let Err(e) = result {
                error!("local API error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

// ── Daemon IPC ──────────────────────────────────────────────────────

fn daemon_addr(cli: &Cli) -> String {
    cli.listen.clone().map_or_else(
        || {
            load_config(cli.config.as_deref())
                .map(|c| c.listen_addr().to_string())
                .unwrap_or_else(|_| StationConfig::default().listen_addr().to_string())
        },
        |listen| listen.strip_prefix("tcp://").unwrap_or(&listen).to_string(),
    )
}

async fn open_daemon(addr: &str) -> TcpStream {
    match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            if tty() {
                eprintln!();
                eprintln!("  {RED}✗{RESET} Could not connect to daemon");
                eprintln!("    {DIM}{e}{RESET}");
                eprintln!();
                eprintln!("    Is the station running? Try: {BOLD}samcom-station start{RESET}");
                eprintln!();
            } else {
                eprintln!("Failed to connect to daemon: {e}");
            }
            std::process::exit(1);
        }
    }
}

async fn daemon_cmd(addr: &str, cmd: &serde_json::Value) -> anyhow::Result<String> {
    let stream = open_daemon(addr).await;
    let (reader, mut writer) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(reader);

    writer.write_all(serde_json::to_string(cmd)?.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line)
}

async fn watch_events(addr: &str) -> anyhow::Result<()> {
    let stream = open_daemon(addr).await;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(b"{\"cmd\":\"subscribe\"}\n").await?;

    let mut lines = tokio::io::BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if tty() {
            let json: serde_json::Value = serde_json::from_str(&line)?;
            fmt_event(&json);
        } else {
            println!("{line}");
        }
    }
    Ok(())
}

// ── Pretty formatters ───────────────────────────────────────────────

fn fmt_status(json: &serde_json::Value) {
    let state = json["state"].as_str().unwrap_or("unknown");
    let dot = match state {
        "authenticated" => format!("{GREEN}●{RESET}"),
        "authenticating" => format!("{YELLOW}●{RESET}"),
        _ => format!("{RED}●{RESET}"),
    };
    let v = env!("CARGO_PKG_VERSION");

    println!();
    println!("  {BOLD}◈ samcom station{RESET} {DIM}v{v}{RESET}");
    println!();
    println!("  {DIM}State{RESET}      {dot} {state}");
    if let Some(user) = json["user_id"].as_str() {
        println!("  {DIM}User{RESET}       {CYAN}{user}{RESET}");
    }
    if let Some(relay) = json["relay"].as_str() {
        println!("  {DIM}Relay{RESET}      {relay}");
    }
    println!();
}

fn fmt_action(json: &serde_json::Value, done: &str) {
    let status = json["status"].as_str().unwrap_or("error");
    match (status, json["error"].as_str()) {
        ("error", Some(msg)) => println!("  {RED}✗{RESET} {msg}"),
        ("error", None) => println!("  {RED}✗{RESET} Failed"),
        _ => println!("  {GREEN}✓{RESET} {done}"),
    }
}

fn fmt_event(json: &serde_json::Value) {
    let event = json["event"].as_str().unwrap_or("unknown");
    let field = |name: &str| json[name].as_str().unwrap_or("").to_string();
    match event {
        "message_received" => println!(
            "  {CYAN}{}{RESET} {DIM}{}{RESET}  {}",
            field("source_user"),
            field("received_at"),
            field("message")
        ),
        "authenticated" => println!("  {GREEN}●{RESET} authenticated"),
        "text_forwarded" => println!("  {GREEN}✓{RESET} forwarded to {}", field("target_user")),
        "logged_out" => println!("  {DIM}●{RESET} logged out"),
        _ => println!("  {RED}✗{RESET} {event}: {}", field("reason")),
    }
}

async fn run_action(addr: &str, cmd: &serde_json::Value, done: &str) -> anyhow::Result<()> {
    let resp = daemon_cmd(addr, cmd).await?;
    if tty() {
        let json: serde_json::Value = serde_json::from_str(resp.trim())?;
        fmt_action(&json, done);
    } else {
        print!("{resp}");
    }
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli)?;

    let addr = daemon_addr(&cli);
    match &cli.command {
        Commands::Start => run_daemon(&cli).await?,
        Commands::Status => {
            let resp = daemon_cmd(&addr, &serde_json::json!({"cmd": "status"})).await?;
            if tty() {
                let json: serde_json::Value = serde_json::from_str(resp.trim())?;
                fmt_status(&json);
            } else {
                print!("{resp}");
            }
        }
        Commands::Connect => {
            run_action(&addr, &serde_json::json!({"cmd": "connect"}), "Authenticated").await?;
        }
        Commands::Send { to, message } => {
            let cmd = serde_json::json!({"cmd": "send", "to": to, "message": message});
            run_action(&addr, &cmd, "Forwarded").await?;
        }
        Commands::Logout => {
            run_action(&addr, &serde_json::json!({"cmd": "logout"}), "Logged out").await?;
        }
        Commands::Watch => watch_events(&addr).await?,
    }

    Ok(())
}
