//! Escrow Status Normalization
//!
//! The contract reports status either as a bare string or as a
//! single-key tagged object (`{"active": {}}`). Both collapse into
//! [`EscrowStatus`] here and nowhere else.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::game::ResultType;

/// Escrow lifecycle as seen by a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// No escrow (unwagered, or creation failed).
    #[default]
    None,
    /// Waiting for one or both deposits.
    PendingDeposits,
    /// Both deposits held.
    Active,
    /// Paid out to the winner.
    Settled,
    /// Refunded.
    Cancelled,
}

impl EscrowStatus {
    /// Normalize a contract status value. Unknown shapes map to `None`.
    pub fn from_contract(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::from_name(s),
            Value::Object(map) => map
                .keys()
                .next()
                .map(|k| Self::from_name(k))
                .unwrap_or(EscrowStatus::None),
            _ => EscrowStatus::None,
        }
    }

    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "awaiting_deposits" | "pending_deposits" | "pending" => EscrowStatus::PendingDeposits,
            "active" | "funded" => EscrowStatus::Active,
            "settled" | "completed" => EscrowStatus::Settled,
            "cancelled" | "canceled" | "timed_out" => EscrowStatus::Cancelled,
            _ => EscrowStatus::None,
        }
    }

    /// No further transitions possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, EscrowStatus::Settled | EscrowStatus::Cancelled)
    }
}

/// On-chain escrow state mirrored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscrowInfo {
    /// Escrow key (game or match id).
    pub game_id: String,
    /// First depositor (white).
    pub player_a: String,
    /// Second depositor (black).
    pub player_b: String,
    /// Deposit required from each player.
    pub wager_amount: String,
    /// Normalized status.
    pub status: EscrowStatus,
    /// Player A has deposited.
    pub player_a_deposited: bool,
    /// Player B has deposited.
    pub player_b_deposited: bool,
}

impl EscrowInfo {
    /// Parse the contract's `escrow` query response.
    pub fn from_contract(value: &Value) -> Option<Self> {
        let text = |key: &str| -> Option<String> {
            match value.get(key)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };
        let flag = |key: &str| value.get(key).and_then(Value::as_bool).unwrap_or(false);

        Some(Self {
            game_id: text("game_id")?,
            player_a: text("player_a").unwrap_or_default(),
            player_b: text("player_b").unwrap_or_default(),
            wager_amount: text("wager_amount").unwrap_or_else(|| "0".into()),
            status: value
                .get("status")
                .map(EscrowStatus::from_contract)
                .unwrap_or_default(),
            player_a_deposited: flag("player_a_deposited"),
            player_b_deposited: flag("player_b_deposited"),
        })
    }

    /// Both players have funded the escrow.
    pub fn fully_funded(&self) -> bool {
        self.status == EscrowStatus::Active || (self.player_a_deposited && self.player_b_deposited)
    }
}

/// Stake multiplier for a settled game: result multiplier times cube.
pub fn settlement_multiplier(result_type: ResultType, cube_value: u32) -> u32 {
    result_type.multiplier() * cube_value
}
