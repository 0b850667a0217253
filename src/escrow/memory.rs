//! In-process escrow ledger.
//!
//! Mirrors the contract's message surface so the server can run wagered
//! games without a chain. With `auto_fund` set, both deposits land as
//! soon as the escrow is created.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{EscrowBackend, EscrowError, EscrowStatus};

#[derive(Debug, Clone)]
struct LedgerEntry {
    player_a: String,
    player_b: String,
    wager_amount: u64,
    status: EscrowStatus,
    player_a_deposited: bool,
    player_b_deposited: bool,
    multiplier: u32,
    winner: Option<String>,
}

#[derive(Debug, Default)]
struct Ledger {
    escrows: HashMap<String, LedgerEntry>,
    balances: HashMap<String, u64>,
}

/// Escrow backend holding everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryEscrowBackend {
    ledger: Mutex<Ledger>,
    auto_fund: bool,
}

impl InMemoryEscrowBackend {
    /// New empty ledger.
    pub fn new(auto_fund: bool) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            auto_fund,
        }
    }

    /// Record a deposit by `address`. Activates the escrow once both are in.
    pub async fn deposit(&self, game_id: &str, address: &str) -> Result<EscrowStatus, EscrowError> {
        let mut ledger = self.ledger.lock().await;
        let entry = ledger
            .escrows
            .get_mut(game_id)
            .ok_or_else(|| EscrowError::Contract(format!("escrow {} not found", game_id)))?;
        if entry.status != EscrowStatus::PendingDeposits {
            return Err(EscrowError::Contract("escrow not accepting deposits".into()));
        }
        if address == entry.player_a {
            entry.player_a_deposited = true;
        } else if address == entry.player_b {
            entry.player_b_deposited = true;
        } else {
            return Err(EscrowError::Contract(format!("{} is not a party", address)));
        }
        if entry.player_a_deposited && entry.player_b_deposited {
            entry.status = EscrowStatus::Active;
        }
        Ok(entry.status)
    }

    /// Multiplier and winner recorded at settlement.
    pub async fn settlement(&self, game_id: &str) -> Option<(String, u32)> {
        let ledger = self.ledger.lock().await;
        let entry = ledger.escrows.get(game_id)?;
        entry.winner.clone().map(|w| (w, entry.multiplier))
    }

    /// Current status, `None` for unknown escrows.
    pub async fn status(&self, game_id: &str) -> EscrowStatus {
        let ledger = self.ledger.lock().await;
        ledger
            .escrows
            .get(game_id)
            .map_or(EscrowStatus::None, |e| e.status)
    }
}

fn field<'a>(body: &'a Value, key: &str) -> Result<&'a str, EscrowError> {
    body.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EscrowError::Decode(format!("missing {}", key)))
}

fn status_name(status: EscrowStatus) -> &'static str {
    match status {
        EscrowStatus::None => "none",
        EscrowStatus::PendingDeposits => "awaiting_deposits",
        EscrowStatus::Active => "active",
        EscrowStatus::Settled => "settled",
        EscrowStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl EscrowBackend for InMemoryEscrowBackend {
    async fn execute(&self, msg: Value) -> Result<Value, EscrowError> {
        let (action, body) = msg
            .as_object()
            .and_then(|m| m.iter().next())
            .ok_or_else(|| EscrowError::Decode("empty execute message".into()))?;
        let game_id = field(body, "game_id")?.to_string();
        let mut ledger = self.ledger.lock().await;

        match action.as_str() {
            "create_escrow" => {
                if ledger.escrows.contains_key(&game_id) {
                    return Err(EscrowError::Contract(format!("escrow {} exists", game_id)));
                }
                let wager_amount = field(body, "wager_amount")?
                    .parse()
                    .map_err(|_| EscrowError::Decode("bad wager_amount".into()))?;
                let funded = self.auto_fund;
                ledger.escrows.insert(
                    game_id,
                    LedgerEntry {
                        player_a: field(body, "player_a")?.to_string(),
                        player_b: field(body, "player_b")?.to_string(),
                        wager_amount,
                        status: if funded {
                            EscrowStatus::Active
                        } else {
                            EscrowStatus::PendingDeposits
                        },
                        player_a_deposited: funded,
                        player_b_deposited: funded,
                        multiplier: 1,
                        winner: None,
                    },
                );
            }
            "settle" | "settle_with_multiplier" => {
                let winner = field(body, "winner")?.to_string();
                let multiplier = match body.get("multiplier").and_then(Value::as_str) {
                    Some(m) => m
                        .parse()
                        .map_err(|_| EscrowError::Decode("bad multiplier".into()))?,
                    None => 1,
                };
                let Ledger { escrows, balances } = &mut *ledger;
                let entry = escrows
                    .get_mut(&game_id)
                    .ok_or_else(|| EscrowError::Contract(format!("escrow {} not found", game_id)))?;
                if entry.status != EscrowStatus::Active {
                    return Err(EscrowError::Contract("escrow not active".into()));
                }
                if winner != entry.player_a && winner != entry.player_b {
                    return Err(EscrowError::Contract("winner is not a party".into()));
                }
                entry.status = EscrowStatus::Settled;
                entry.multiplier = multiplier;
                // Own stake back plus the wager times the result multiplier.
                let payout = entry
                    .wager_amount
                    .saturating_mul(u64::from(multiplier).saturating_add(1));
                *balances.entry(winner.clone()).or_default() += payout;
                entry.winner = Some(winner);
            }
            "cancel" => {
                let Ledger { escrows, balances } = &mut *ledger;
                let entry = escrows
                    .get_mut(&game_id)
                    .ok_or_else(|| EscrowError::Contract(format!("escrow {} not found", game_id)))?;
                if entry.status.is_terminal() {
                    return Err(EscrowError::Contract("escrow already closed".into()));
                }
                if entry.player_a_deposited {
                    *balances.entry(entry.player_a.clone()).or_default() += entry.wager_amount;
                }
                if entry.player_b_deposited {
                    *balances.entry(entry.player_b.clone()).or_default() += entry.wager_amount;
                }
                entry.status = EscrowStatus::Cancelled;
            }
            other => {
                return Err(EscrowError::Contract(format!("unknown message {}", other)));
            }
        }
        Ok(json!({}))
    }

    async fn query(&self, msg: Value) -> Result<Value, EscrowError> {
        let game_id = msg
            .get("escrow")
            .map(|b| field(b, "game_id"))
            .ok_or_else(|| EscrowError::Decode("unsupported query".into()))??;
        let ledger = self.ledger.lock().await;
        let entry = ledger
            .escrows
            .get(game_id)
            .ok_or_else(|| EscrowError::Contract(format!("escrow {} not found", game_id)))?;
        Ok(json!({
            "game_id": game_id,
            "player_a": entry.player_a,
            "player_b": entry.player_b,
            "wager_amount": entry.wager_amount.to_string(),
            "status": status_name(entry.status),
            "player_a_deposited": entry.player_a_deposited,
            "player_b_deposited": entry.player_b_deposited,
        }))
    }

    async fn balance(&self, address: &str, _denom: &str) -> Result<u64, EscrowError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.balances.get(address).copied().unwrap_or(0))
    }
}
