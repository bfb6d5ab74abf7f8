use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::api::ApiClient;
use crate::constants::{snapshot_key, REDIS_TIMEOUT};
use crate::error::{E2eError, Result};
use crate::types::{value_as_i64, Coin, GridSize, LobbyStatus, PlayerView, Position};

const DEFAULT_REDIS_PORT: u16 = 6379;
const MAX_BULK_LEN: i64 = 64 * 1024 * 1024;

/// One published lobby state, as written by the game server's tick loop.
#[derive(Clone, Debug, PartialEq)]
pub struct LobbySnapshot {
    pub status: Option<LobbyStatus>,
    pub tick: u64,
    pub grid: GridSize,
    pub players: Vec<PlayerView>,
    pub coins: Vec<Coin>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl LobbySnapshot {
    /// Parses a state blob, skipping player and coin records with missing or
    /// non-numeric coordinates.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|error| E2eError::InvalidSnapshot(error.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| E2eError::InvalidSnapshot("state is not an object".to_string()))?;
        Ok(Self::from_object(object))
    }

    fn from_object(object: &Map<String, Value>) -> Self {
        let status = object
            .get("status")
            .and_then(Value::as_str)
            .and_then(LobbyStatus::parse);
        let tick = object
            .get("tick")
            .and_then(value_as_i64)
            .unwrap_or(0)
            .max(0) as u64;
        let grid = GridSize {
            width: read_dimension(object.get("width")),
            height: read_dimension(object.get("height")),
        };

        let mut players = Vec::new();
        if let Some(entries) = object.get("players").and_then(Value::as_object) {
            for (agent_id, player) in entries {
                if let Some(view) = parse_player(agent_id, player) {
                    players.push(view);
                }
            }
        }

        let coins = object
            .get("coins")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(parse_coin).collect())
            .unwrap_or_default();

        let ends_at = object
            .get("ends_at")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc));

        Self {
            status,
            tick,
            grid,
            players,
            coins,
            ends_at,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == Some(LobbyStatus::Finished)
    }

    pub fn player(&self, agent_id: &str) -> Option<&PlayerView> {
        self.players.iter().find(|player| player.agent_id == agent_id)
    }

    pub fn occupied(&self) -> HashSet<Position> {
        self.players.iter().map(|player| player.position).collect()
    }
}

fn read_dimension(value: Option<&Value>) -> i32 {
    value
        .and_then(value_as_i64)
        .filter(|dim| *dim > 0)
        .map(|dim| dim.min(i32::MAX as i64) as i32)
        .unwrap_or(1)
}

fn read_coord(object: &Map<String, Value>, key: &str) -> Option<i32> {
    value_as_i64(object.get(key)?).and_then(|v| i32::try_from(v).ok())
}

fn parse_player(agent_id: &str, value: &Value) -> Option<PlayerView> {
    let object = value.as_object()?;
    Some(PlayerView {
        agent_id: agent_id.to_string(),
        position: Position::new(read_coord(object, "x")?, read_coord(object, "y")?),
        score: object.get("score").and_then(value_as_i64).unwrap_or(0),
    })
}

fn parse_coin(value: &Value) -> Option<Coin> {
    let object = value.as_object()?;
    Some(Coin {
        id: value_as_i64(object.get("id")?)?,
        position: Position::new(read_coord(object, "x")?, read_coord(object, "y")?),
    })
}

/// Point lookup of the latest published lobby state.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` while the lobby has no state published yet.
    async fn fetch(&self, lobby_id: &str) -> Result<Option<LobbySnapshot>>;
}

/// Reads `lobby:<id>:state` straight from Redis over a single RESP connection.
pub struct RedisSnapshotStore {
    addr: String,
    password: Option<String>,
    database: u32,
    timeout: Duration,
    connection: Mutex<Option<BufReader<TcpStream>>>,
}

impl RedisSnapshotStore {
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|error| E2eError::Config(format!("invalid redis url {url}: {error}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| E2eError::Config(format!("redis url {url} has no host")))?;
        let port = parsed.port().unwrap_or(DEFAULT_REDIS_PORT);
        let database = match parsed.path().trim_matches('/') {
            "" => 0,
            db => db
                .parse()
                .map_err(|_| E2eError::Config(format!("invalid redis database in {url}")))?,
        };
        Ok(Self {
            addr: format!("{host}:{port}"),
            password: parsed.password().map(str::to_string),
            database,
            timeout: REDIS_TIMEOUT,
            connection: Mutex::new(None),
        })
    }

    /// Bounds connect, handshake and each round trip together.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.connection.lock().await;
        let reply = match timeout(self.timeout, self.round_trip(&mut guard, key)).await {
            Ok(reply) => reply,
            Err(_) => Err(E2eError::deadline(
                format!("redis GET {key} on {}", self.addr),
                self.timeout,
            )),
        };
        if reply.is_err() {
            // Drop the connection so the next call reconnects.
            *guard = None;
        }
        reply
    }

    async fn round_trip(
        &self,
        connection: &mut Option<BufReader<TcpStream>>,
        key: &str,
    ) -> Result<Option<String>> {
        if connection.is_none() {
            *connection = Some(self.connect().await?);
        }
        let Some(stream) = connection.as_mut() else {
            return Err(E2eError::SnapshotStore("redis connection unavailable".to_string()));
        };
        write_command(stream, &["GET", key]).await?;
        read_reply(stream).await
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>> {
        let mut stream = BufReader::new(TcpStream::connect(&self.addr).await?);
        if let Some(password) = &self.password {
            write_command(&mut stream, &["AUTH", password]).await?;
            read_reply(&mut stream).await?;
        }
        if self.database != 0 {
            write_command(&mut stream, &["SELECT", &self.database.to_string()]).await?;
            read_reply(&mut stream).await?;
        }
        Ok(stream)
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn fetch(&self, lobby_id: &str) -> Result<Option<LobbySnapshot>> {
        match self.get(&snapshot_key(lobby_id)).await? {
            Some(raw) if !raw.is_empty() => LobbySnapshot::parse(&raw).map(Some),
            _ => Ok(None),
        }
    }
}

async fn write_command<W>(writer: &mut W, args: &[&str]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut command = format!("*{}\r\n", args.len());
    for arg in args {
        command.push_str(&format!("${}\r\n{arg}\r\n", arg.len()));
    }
    writer.write_all(command.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one RESP reply. Bulk strings map to `Some`, nil to `None`, simple
/// strings and integers to their text.
async fn read_reply<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(E2eError::SnapshotStore("connection closed".to_string()));
    }
    let line = line.trim_end_matches(['\r', '\n']);
    let mut chars = line.chars();
    let kind = chars.next();
    let rest = chars.as_str();
    match kind {
        Some('$') => {
            let len: i64 = rest
                .parse()
                .map_err(|_| E2eError::SnapshotStore(format!("bad bulk length: {rest}")))?;
            if len < 0 {
                return Ok(None);
            }
            if len > MAX_BULK_LEN {
                return Err(E2eError::SnapshotStore(format!(
                    "bulk reply of {len} bytes exceeds {MAX_BULK_LEN}"
                )));
            }
            let mut payload = vec![0u8; len as usize + 2];
            reader.read_exact(&mut payload).await?;
            payload.truncate(len as usize);
            String::from_utf8(payload)
                .map(Some)
                .map_err(|error| E2eError::SnapshotStore(error.to_string()))
        }
        Some('+' | ':') => Ok(Some(rest.to_string())),
        Some('-') => Err(E2eError::SnapshotStore(format!("redis error: {rest}"))),
        _ => Err(E2eError::SnapshotStore(format!("unexpected reply: {line}"))),
    }
}

/// Reads lobby state through the API's `GET /lobbies/:id/state` helper.
pub struct HttpSnapshotStore {
    api: ApiClient,
}

impl HttpSnapshotStore {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl SnapshotStore for HttpSnapshotStore {
    async fn fetch(&self, lobby_id: &str) -> Result<Option<LobbySnapshot>> {
        match self.api.lobby_state(lobby_id).await? {
            Some(raw) => LobbySnapshot::parse(&raw).map(Some),
            None => Ok(None),
        }
    }
}

pub enum AnySnapshotStore {
    Redis(RedisSnapshotStore),
    Http(HttpSnapshotStore),
}

#[async_trait]
impl SnapshotStore for AnySnapshotStore {
    async fn fetch(&self, lobby_id: &str) -> Result<Option<LobbySnapshot>> {
        match self {
            Self::Redis(store) => store.fetch(lobby_id).await,
            Self::Http(store) => store.fetch(lobby_id).await,
        }
    }
}
