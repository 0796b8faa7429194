use crate::error::StationError;
use crate::station::{StationClient, StationEvent, StationState};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Maximum command line length (64 KiB).
const MAX_CMD_LEN: usize = 65_536;

/// How long a command waits for the station to answer.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the event fan-out; slower subscribers skip events.
const EVENT_FANOUT_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum ApiCommand {
    Connect,
    Send { to: String, message: String },
    Logout,
    Status,
    Subscribe,
}

#[derive(Debug, Clone, Serialize)]
struct ActionResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ActionResponse {
    fn from_result(done: &str, result: Result<(), StationError>) -> Self {
        match result {
            Ok(()) => Self {
                status: done.to_string(),
                error: None,
            },
            Err(e) => Self {
                status: "error".to_string(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse<'a> {
    state: StationState,
    user_id: &'a str,
    relay: &'a str,
}

/// What a local API connection needs: the station and its event stream.
#[derive(Debug, Clone)]
pub struct LocalApi {
    client: StationClient,
    events: broadcast::Sender<StationEvent>,
    user_id: String,
    relay: String,
}

impl LocalApi {
    /// Builds the API over a station client and an event fan-out from
    /// [`fan_out_events`].
    #[must_use]
    pub const fn new(
        client: StationClient,
        events: broadcast::Sender<StationEvent>,
        user_id: String,
        relay: String,
    ) -> Self {
        Self {
            client,
            events,
            user_id,
            relay,
        }
    }
}

/// Forwards the station's events to a broadcast channel so any number of
/// `subscribe` connections can follow them.
#[must_use]
pub fn fan_out_events(
    mut events: mpsc::UnboundedReceiver<StationEvent>,
) -> broadcast::Sender<StationEvent> {
    let (tx, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);
    let fan_out = tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if fan_out.send(event).is_err() {
                debug!("station event dropped: no subscribers");
            }
        }
    });
    tx
}

/// Serves line-delimited JSON commands on `listener` until accepting fails.
///
/// # Errors
///
/// Returns an error if accepting a connection fails.
pub async fn run_local_api(listener: TcpListener, api: LocalApi) -> anyhow::Result<()> {
    info!("local API listening on TCP: {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let api = api.clone();
        let (reader, writer) = stream.into_split();

        tokio::spawn(async move {
            if let Err(e) = handle_local_client(reader, writer, &api).await {
                debug!("local client {} error: {}", addr, e);
            }
        });
    }
}

fn json_line(value: &impl Serialize) -> Result<String, StationError> {
    Ok(serde_json::to_string(value)? + "\n")
}

async fn with_timeout(
    request: impl std::future::Future<Output = Result<(), StationError>>,
) -> Result<(), StationError> {
    tokio::time::timeout(COMMAND_TIMEOUT, request)
        .await
        .unwrap_or_else(|_| Err(StationError::Rejected("timed out".to_string())))
}

async fn handle_local_client<R, W>(
    reader: R,
    mut writer: W,
    api: &LocalApi,
) -> Result<(), StationError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_CMD_LEN as u64 + 1);
        if tokio::io::AsyncBufReadExt::read_line(&mut limited, &mut line).await? == 0 {
            break;
        }
        if line.len() > MAX_CMD_LEN {
            let error = json_line(&serde_json::json!({
                "error": format!("command exceeds maximum length ({MAX_CMD_LEN} bytes)")
            }))?;
            writer.write_all(error.as_bytes()).await?;
            continue;
        }

        let cmd: ApiCommand = match serde_json::from_str(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                let error = json_line(&serde_json::json!({"error": e.to_string()}))?;
                writer.write_all(error.as_bytes()).await?;
                continue;
            }
        };
        debug!(?cmd, "local API command");

        let response = match cmd {
            ApiCommand::Connect => {
                let result = with_timeout(api.client.connect()).await;
                json_line(&ActionResponse::from_result("authenticated", result))?
            }
            ApiCommand::Send { to, message } => {
                let result = with_timeout(api.client.send_text(&to, &message)).await;
                json_line(&ActionResponse::from_result("forwarded", result))?
            }
            ApiCommand::Logout => {
                let result = with_timeout(api.client.logout()).await;
                json_line(&ActionResponse::from_result("logged_out", result))?
            }
            ApiCommand::Status => json_line(&StatusResponse {
                state: api.client.state(),
                user_id: &api.user_id,
                relay: &api.relay,
            })?,
            ApiCommand::Subscribe => {
                handle_subscribe(api.events.subscribe(), &mut writer).await?;
                return Ok(());
            }
        };

        writer.write_all(response.as_bytes()).await?;
    }

    Ok(())
}

async fn handle_subscribe<W>(
    mut events: broadcast::Receiver<StationEvent>,
    writer: &mut W,
) -> Result<(), StationError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                let line = json_line(&event)?;
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "subscribe stream lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}
