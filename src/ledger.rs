use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::constants::GAME_MODE_TITLE;
use crate::error::Result;
use crate::types::{GameModeSpec, PayoutItemCounts, SentPayoutItem, Slot};

const MAX_CONNECTIONS: u32 = 4;

/// Read side of the payout bookkeeping.
#[async_trait]
pub trait PayoutLedger: Send + Sync {
    async fn payout_id(&self, lobby_id: &str) -> Result<Option<String>>;
    async fn payout_item_counts(&self, payout_id: &str) -> Result<PayoutItemCounts>;
    async fn sent_payout_items(&self, payout_id: &str) -> Result<Vec<SentPayoutItem>>;
    /// Error text of the first failed line item, if any.
    async fn first_failure(&self, payout_id: &str) -> Result<Option<String>>;
}

/// Game-mode provisioning and lobby membership.
#[async_trait]
pub trait LobbyLedger: Send + Sync {
    /// Inserts an ACTIVE game mode and returns its id.
    async fn create_game_mode(&self, spec: &GameModeSpec) -> Result<String>;
    /// Joined members ordered by slot.
    async fn lobby_agents_by_slot(&self, lobby_id: &str) -> Result<Vec<(Slot, String)>>;
}

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl PayoutLedger for PgLedger {
    async fn payout_id(&self, lobby_id: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar(
            r#"
            SELECT id::text FROM payouts WHERE lobby_id::text = $1 LIMIT 1
            "#,
        )
        .bind(lobby_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn payout_item_counts(&self, payout_id: &str) -> Result<PayoutItemCounts> {
        let (sent, failed, pending, hashed): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'SENT'),
                COUNT(*) FILTER (WHERE status = 'FAILED'),
                COUNT(*) FILTER (WHERE status = 'PENDING'),
                COUNT(*) FILTER (WHERE tx_hash IS NOT NULL AND tx_hash <> '')
            FROM payout_items
            WHERE payout_id::text = $1
            "#,
        )
        .bind(payout_id)
        .fetch_one(&self.pool)
        .await?;
        let count = |value: i64| u32::try_from(value).unwrap_or(u32::MAX);
        Ok(PayoutItemCounts {
            sent: count(sent),
            failed: count(failed),
            pending: count(pending),
            hashed: count(hashed),
        })
    }

    async fn sent_payout_items(&self, payout_id: &str) -> Result<Vec<SentPayoutItem>> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT payout_address, amount_quai::text, tx_hash
            FROM payout_items
            WHERE payout_id::text = $1 AND status = 'SENT'
            ORDER BY attempted_at ASC
            "#,
        )
        .bind(payout_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(payout_address, amount_quai, tx_hash)| SentPayoutItem {
                payout_address,
                amount_quai,
                tx_hash: tx_hash.filter(|hash| !hash.trim().is_empty()),
            })
            .collect())
    }

    async fn first_failure(&self, payout_id: &str) -> Result<Option<String>> {
        let error: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT error FROM payout_items
            WHERE payout_id::text = $1 AND status = 'FAILED'
            LIMIT 1
            "#,
        )
        .bind(payout_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(error.flatten())
    }
}

#[async_trait]
impl LobbyLedger for PgLedger {
    async fn create_game_mode(&self, spec: &GameModeSpec) -> Result<String> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO game_modes (title, max_players, duration_sec, coins_per_match, reward_pool_quai, status)
            VALUES ($1, $2, $3, $4, $5::numeric, 'ACTIVE')
            RETURNING id::text
            "#,
        )
        .bind(GAME_MODE_TITLE)
        .bind(spec.max_players as i32)
        .bind(spec.duration_sec as i32)
        .bind(spec.coins_per_match as i32)
        .bind(&spec.reward_pool_quai)
        .fetch_one(&self.pool)
        .await?;
        info!(
            game_mode_id = %id,
            max_players = spec.max_players,
            duration_sec = spec.duration_sec,
            coins_per_match = spec.coins_per_match,
            reward_pool_quai = %spec.reward_pool_quai,
            "game_mode_created"
        );
        Ok(id)
    }

    async fn lobby_agents_by_slot(&self, lobby_id: &str) -> Result<Vec<(Slot, String)>> {
        let rows: Vec<(i32, String)> = sqlx::query_as(
            r#"
            SELECT slot, agent_id::text
            FROM lobby_players
            WHERE lobby_id::text = $1 AND status = 'JOINED'
            ORDER BY slot ASC
            "#,
        )
        .bind(lobby_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(slot, agent_id)| Slot::try_from(slot).ok().map(|slot| (slot, agent_id)))
            .collect())
    }
}
