use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub type AgentId = String;
pub type CoinId = i64;
pub type Slot = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Fixed fallback order used after the axis-preferred directions.
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GridSize {
    pub width: i32,
    pub height: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LobbyStatus {
    Waiting,
    Active,
    Finished,
}

impl LobbyStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "WAITING" => Some(Self::Waiting),
            "ACTIVE" => Some(Self::Active),
            "FINISHED" => Some(Self::Finished),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Coin {
    pub id: CoinId,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerView {
    pub agent_id: AgentId,
    pub position: Position,
    pub score: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChallengeResponse {
    pub challenge_id: String,
    pub nonce: String,
    #[serde(deserialize_with = "de_u32")]
    pub difficulty: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct VerifyRequest {
    pub challenge_id: String,
    pub solution: String,
    pub payout_address: String,
    pub runtime_identity: String,
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VerifyResponse {
    #[serde(default)]
    pub agent_id: String,
    #[serde(alias = "token")]
    pub api_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct JoinResponse {
    pub lobby_id: String,
    #[serde(default)]
    pub watch_code: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_u32")]
    pub slot: Slot,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LobbyPlayerRow {
    pub agent_id: String,
    #[serde(deserialize_with = "de_u32")]
    pub slot: Slot,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LobbyResultRow {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default, deserialize_with = "de_i64")]
    pub final_coins: i64,
    #[serde(default, alias = "final_reward_quai", deserialize_with = "de_amount")]
    pub final_reward: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LobbyResult {
    #[serde(default)]
    pub lobby_id: Option<String>,
    #[serde(default)]
    pub results: Vec<LobbyResultRow>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct ExecutePayoutResponse {
    #[serde(default, deserialize_with = "de_u32")]
    pub sent: u32,
    #[serde(default, deserialize_with = "de_u32")]
    pub failed: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PayoutItemCounts {
    pub sent: u32,
    pub failed: u32,
    pub pending: u32,
    pub hashed: u32,
}

impl PayoutItemCounts {
    /// Every item has been attempted and at least one attempt is recorded.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && (self.hashed > 0 || self.sent + self.failed > 0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentPayoutItem {
    pub payout_address: String,
    pub amount_quai: String,
    pub tx_hash: Option<String>,
}

#[derive(Clone, Debug)]
pub struct GameModeSpec {
    pub max_players: u32,
    pub duration_sec: u32,
    pub coins_per_match: u32,
    pub reward_pool_quai: String,
}

/// Reads integers that may arrive as JSON numbers or numeric strings.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn de_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(0);
    }
    value_as_i64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {value}")))
}

fn de_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = de_i64(deserializer)?;
    u32::try_from(value).map_err(|_| serde::de::Error::custom(format!("out of range: {value}")))
}

fn de_amount<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok("0".to_string()),
        Value::String(text) => Ok(text.trim().to_string()),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected amount, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direction_serializes_as_its_wire_name() {
        for dir in Direction::ALL {
            assert_eq!(
                serde_json::to_value(dir).expect("direction serializes"),
                json!(dir.as_str())
            );
        }
        assert_eq!(
            serde_json::to_value(Direction::Left).expect("direction serializes"),
            json!("left")
        );
    }

    #[test]
    fn lobby_status_parse_is_case_insensitive() {
        assert_eq!(LobbyStatus::parse("ACTIVE"), Some(LobbyStatus::Active));
        assert_eq!(LobbyStatus::parse(" finished "), Some(LobbyStatus::Finished));
        assert_eq!(LobbyStatus::parse("LEFT"), None);
    }

    #[test]
    fn join_response_accepts_string_slot_and_missing_fields() {
        let joined: JoinResponse =
            serde_json::from_value(json!({ "lobby_id": "l1", "slot": "3" })).expect("parses");
        assert_eq!(joined.slot, 3);
        assert!(joined.watch_code.is_none());
    }

    #[test]
    fn result_row_accepts_reward_as_string_or_number() {
        let rows: Vec<LobbyResultRow> = serde_json::from_value(json!([
            { "final_coins": 2, "final_reward_quai": "2.000000000000000000" },
            { "final_coins": "1", "final_reward": 1 },
            { "final_coins": null, "final_reward_quai": null }
        ]))
        .expect("parses");
        assert_eq!(rows[0].final_reward, "2.000000000000000000");
        assert_eq!(rows[1].final_coins, 1);
        assert_eq!(rows[1].final_reward, "1");
        assert_eq!(rows[2].final_coins, 0);
        assert_eq!(rows[2].final_reward, "0");
    }

    #[test]
    fn payout_counts_settle_only_without_pending_items() {
        let pending = PayoutItemCounts {
            sent: 1,
            failed: 0,
            pending: 1,
            hashed: 1,
        };
        assert!(!pending.is_settled());
        let settled = PayoutItemCounts {
            sent: 1,
            failed: 1,
            pending: 0,
            hashed: 1,
        };
        assert!(settled.is_settled());
        assert!(!PayoutItemCounts::default().is_settled());
    }
}
