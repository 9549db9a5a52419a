//! Account ledger and escrow: holds, settlement with platform fee, refunds.
//!
//! All amounts are integer cents. No floating point ever touches the ledger.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const PLATFORM_ACCOUNT_ID: &str = "platform";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("hold not found: {0}")]
    HoldNotFound(String),
    #[error("hold already settled or refunded: {0}")]
    AlreadyFinalized(String),
    #[error("deposit not found: {0}")]
    DepositNotFound(String),
    #[error("deposit already confirmed: {0}")]
    DepositAlreadyConfirmed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub wallet_address: String,
    pub currency: String,
    pub balance_cents: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Held,
    Settled,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub hold_id: String,
    pub source_account: String,
    pub destination_account: Option<String>,
    pub amount_cents: u64,
    pub currency: String,
    pub job_id: String,
    pub status: HoldStatus,
}

/// Result of a successful settlement, for callers that need the breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub paid_to_node_cents: u64,
    pub fee_cents: u64,
    pub refunded_cents: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Confirmed,
}

/// An externally-triggered credit flow. The engine never increases a balance
/// on `request_deposit` alone — only `confirm_deposit` (driven by the wallet
/// rail's out-of-band confirmation) or the admin test-credit operation moves
/// cents onto the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub account_id: String,
    pub amount_cents: u64,
    pub currency: String,
    pub status: DepositStatus,
}

struct Inner {
    accounts: HashMap<String, Account>,
    records: HashMap<String, PaymentRecord>,
    deposits: HashMap<String, Deposit>,
    fee_bps: u32,
}

/// In-memory payment/escrow engine. Single coarse lock, matching the
/// orchestrator's per-subsystem serialization model.
#[derive(Clone)]
pub struct PaymentEngine {
    inner: Arc<RwLock<Inner>>,
}

impl PaymentEngine {
    pub fn new(fee_bps: u32) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(
            PLATFORM_ACCOUNT_ID.to_string(),
            Account {
                id: PLATFORM_ACCOUNT_ID.to_string(),
                wallet_address: PLATFORM_ACCOUNT_ID.to_string(),
                currency: "usd".to_string(),
                balance_cents: 0,
            },
        );
        Self {
            inner: Arc::new(RwLock::new(Inner {
                accounts,
                records: HashMap::new(),
                deposits: HashMap::new(),
                fee_bps,
            })),
        }
    }

    pub async fn get_or_create_account(&self, wallet_address: &str, currency: &str) -> Account {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.accounts.get(wallet_address) {
            return existing.clone();
        }
        let account = Account {
            id: wallet_address.to_string(),
            wallet_address: wallet_address.to_string(),
            currency: currency.to_string(),
            balance_cents: 0,
        };
        inner
            .accounts
            .insert(wallet_address.to_string(), account.clone());
        account
    }

    pub async fn get_account(&self, account_id: &str) -> Option<Account> {
        self.inner.read().await.accounts.get(account_id).cloned()
    }

    /// Increases a balance directly. Models an externally-confirmed deposit
    /// or the admin test-credit operation; never called from ledger-internal
    /// code.
    pub async fn credit(&self, account_id: &str, cents: u64) -> Result<Account, PaymentError> {
        let mut inner = self.inner.write().await;
        let account = inner
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| Account {
                id: account_id.to_string(),
                wallet_address: account_id.to_string(),
                currency: "usd".to_string(),
                balance_cents: 0,
            });
        account.balance_cents += cents;
        Ok(account.clone())
    }

    /// Atomically checks balance and creates a `held` payment record.
    pub async fn hold(
        &self,
        account_id: &str,
        cents: u64,
        job_id: &str,
    ) -> Result<String, PaymentError> {
        let mut inner = self.inner.write().await;
        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or(PaymentError::InsufficientFunds)?;
        if account.balance_cents < cents {
            return Err(PaymentError::InsufficientFunds);
        }
        account.balance_cents -= cents;
        let currency = account.currency.clone();

        let hold_id = Uuid::new_v4().to_string();
        inner.records.insert(
            hold_id.clone(),
            PaymentRecord {
                hold_id: hold_id.clone(),
                source_account: account_id.to_string(),
                destination_account: None,
                amount_cents: cents,
                currency,
                job_id: job_id.to_string(),
                status: HoldStatus::Held,
            },
        );
        Ok(hold_id)
    }

    /// Settles a hold: caps `actual_cents` at the held amount, takes the
    /// platform fee (round-half-to-even) out of the actual cost, credits the
    /// node account with the remainder, and refunds any unused hold amount
    /// to the source.
    pub async fn settle(
        &self,
        hold_id: &str,
        node_account_id: &str,
        actual_cents: u64,
    ) -> Result<Settlement, PaymentError> {
        let mut inner = self.inner.write().await;
        let fee_bps = inner.fee_bps;
        let record = inner
            .records
            .get_mut(hold_id)
            .ok_or_else(|| PaymentError::HoldNotFound(hold_id.to_string()))?;
        if record.status != HoldStatus::Held {
            return Err(PaymentError::AlreadyFinalized(hold_id.to_string()));
        }

        let actual = actual_cents.min(record.amount_cents);
        let fee = round_half_to_even_bps(actual, fee_bps);
        let paid_to_node = actual - fee;
        let refund = record.amount_cents - actual;

        record.status = HoldStatus::Settled;
        record.destination_account = Some(node_account_id.to_string());
        let source_account = record.source_account.clone();
        let currency = record.currency.clone();

        let node_account = inner
            .accounts
            .entry(node_account_id.to_string())
            .or_insert_with(|| Account {
                id: node_account_id.to_string(),
                wallet_address: node_account_id.to_string(),
                currency: currency.clone(),
                balance_cents: 0,
            });
        node_account.balance_cents += paid_to_node;

        if let Some(platform) = inner.accounts.get_mut(PLATFORM_ACCOUNT_ID) {
            platform.balance_cents += fee;
        }

        if refund > 0 {
            if let Some(source) = inner.accounts.get_mut(&source_account) {
                source.balance_cents += refund;
            }
        }

        Ok(Settlement {
            paid_to_node_cents: paid_to_node,
            fee_cents: fee,
            refunded_cents: refund,
        })
    }

    /// Returns the full held amount to the source account.
    pub async fn refund(&self, hold_id: &str) -> Result<(), PaymentError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(hold_id)
            .ok_or_else(|| PaymentError::HoldNotFound(hold_id.to_string()))?;
        if record.status != HoldStatus::Held {
            return Err(PaymentError::AlreadyFinalized(hold_id.to_string()));
        }
        record.status = HoldStatus::Refunded;
        let amount = record.amount_cents;
        let source_account = record.source_account.clone();

        if let Some(source) = inner.accounts.get_mut(&source_account) {
            source.balance_cents += amount;
        }
        Ok(())
    }

    pub async fn get_record(&self, hold_id: &str) -> Option<PaymentRecord> {
        self.inner.read().await.records.get(hold_id).cloned()
    }

    /// Records an intent to credit `account_id` via an external wallet rail.
    /// Balance is untouched until `confirm_deposit` is called.
    pub async fn request_deposit(&self, account_id: &str, cents: u64, currency: &str) -> Deposit {
        let mut inner = self.inner.write().await;
        inner
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| Account {
                id: account_id.to_string(),
                wallet_address: account_id.to_string(),
                currency: currency.to_string(),
                balance_cents: 0,
            });
        let deposit = Deposit {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            amount_cents: cents,
            currency: currency.to_string(),
            status: DepositStatus::Pending,
        };
        inner.deposits.insert(deposit.id.clone(), deposit.clone());
        deposit
    }

    /// Models the wallet rail's out-of-band confirmation: the only path
    /// (besides the admin test-credit operation) by which a balance may
    /// increase.
    pub async fn confirm_deposit(&self, deposit_id: &str) -> Result<Account, PaymentError> {
        let mut inner = self.inner.write().await;
        let deposit = inner
            .deposits
            .get_mut(deposit_id)
            .ok_or_else(|| PaymentError::DepositNotFound(deposit_id.to_string()))?;
        if deposit.status == DepositStatus::Confirmed {
            return Err(PaymentError::DepositAlreadyConfirmed(deposit_id.to_string()));
        }
        deposit.status = DepositStatus::Confirmed;
        let account_id = deposit.account_id.clone();
        let cents = deposit.amount_cents;

        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| PaymentError::DepositNotFound(deposit_id.to_string()))?;
        account.balance_cents += cents;
        Ok(account.clone())
    }

    pub async fn get_deposit(&self, deposit_id: &str) -> Option<Deposit> {
        self.inner.read().await.deposits.get(deposit_id).cloned()
    }

    /// Atomically checks and subtracts `cents`, modeling a withdrawal
    /// instruction handed off to the (opaque, externally-triggered) wallet
    /// rail. The engine never re-credits this amount itself; a failed
    /// external payout is outside this ledger's authority per the spec's
    /// scope.
    pub async fn request_withdraw(&self, account_id: &str, cents: u64) -> Result<(), PaymentError> {
        let mut inner = self.inner.write().await;
        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or(PaymentError::InsufficientFunds)?;
        if account.balance_cents < cents {
            return Err(PaymentError::InsufficientFunds);
        }
        account.balance_cents -= cents;
        Ok(())
    }
}

/// Round-half-to-even (banker's rounding) fee computation in basis points,
/// entirely in integer arithmetic: `round(amount * bps / 10000)`.
fn round_half_to_even_bps(amount_cents: u64, fee_bps: u32) -> u64 {
    let numerator = amount_cents as u128 * fee_bps as u128;
    let denominator = 10_000u128;
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    let twice_remainder = remainder * 2;

    match twice_remainder.cmp(&denominator) {
        std::cmp::Ordering::Less => quotient as u64,
        std::cmp::Ordering::Greater => (quotient + 1) as u64,
        std::cmp::Ordering::Equal => {
            if quotient.is_multiple_of(2) {
                quotient as u64
            } else {
                (quotient + 1) as u64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hold_then_settle_splits_fee_to_platform() {
        let engine = PaymentEngine::new(500); // 5%
        engine.credit("client", 10_000).await.unwrap();
        let hold_id = engine.hold("client", 10_000, "job-1").await.unwrap();

        let settlement = engine.settle(&hold_id, "node-1", 10_000).await.unwrap();
        assert_eq!(settlement.fee_cents, 500);
        assert_eq!(settlement.paid_to_node_cents, 9_500);
        assert_eq!(settlement.refunded_cents, 0);

        let node = engine.get_account("node-1").await.unwrap();
        assert_eq!(node.balance_cents, 9_500);
        let platform = engine.get_account(PLATFORM_ACCOUNT_ID).await.unwrap();
        assert_eq!(platform.balance_cents, 500);
    }

    #[tokio::test]
    async fn settle_refunds_unused_hold_amount() {
        let engine = PaymentEngine::new(500);
        engine.credit("client", 10_000).await.unwrap();
        let hold_id = engine.hold("client", 10_000, "job-1").await.unwrap();

        let settlement = engine.settle(&hold_id, "node-1", 6_000).await.unwrap();
        assert_eq!(settlement.refunded_cents, 4_000);

        let client = engine.get_account("client").await.unwrap();
        assert_eq!(client.balance_cents, 4_000);
    }

    #[tokio::test]
    async fn settle_caps_actual_cost_at_hold_amount() {
        let engine = PaymentEngine::new(500);
        engine.credit("client", 10_000).await.unwrap();
        let hold_id = engine.hold("client", 10_000, "job-1").await.unwrap();

        // Node reports more than was held; it must never be paid more than
        // the held amount allows.
        let settlement = engine.settle(&hold_id, "node-1", 50_000).await.unwrap();
        assert_eq!(settlement.refunded_cents, 0);
        assert_eq!(settlement.paid_to_node_cents + settlement.fee_cents, 10_000);
    }

    #[tokio::test]
    async fn hold_fails_on_insufficient_balance() {
        let engine = PaymentEngine::new(500);
        engine.credit("client", 100).await.unwrap();
        let result = engine.hold("client", 500, "job-1").await;
        assert_eq!(result.unwrap_err(), PaymentError::InsufficientFunds);
    }

    #[tokio::test]
    async fn refund_returns_full_held_amount() {
        let engine = PaymentEngine::new(500);
        engine.credit("client", 1_000).await.unwrap();
        let hold_id = engine.hold("client", 1_000, "job-1").await.unwrap();
        engine.refund(&hold_id).await.unwrap();

        let client = engine.get_account("client").await.unwrap();
        assert_eq!(client.balance_cents, 1_000);
    }

    #[tokio::test]
    async fn double_settlement_is_rejected() {
        let engine = PaymentEngine::new(500);
        engine.credit("client", 1_000).await.unwrap();
        let hold_id = engine.hold("client", 1_000, "job-1").await.unwrap();
        engine.settle(&hold_id, "node-1", 1_000).await.unwrap();

        let second = engine.settle(&hold_id, "node-1", 1_000).await;
        assert!(matches!(second, Err(PaymentError::AlreadyFinalized(_))));
    }

    #[tokio::test]
    async fn deposit_requires_confirmation_before_crediting() {
        let engine = PaymentEngine::new(500);
        let deposit = engine.request_deposit("client", 2_000, "usd").await;
        assert_eq!(engine.get_account("client").await.unwrap().balance_cents, 0);

        engine.confirm_deposit(&deposit.id).await.unwrap();
        assert_eq!(engine.get_account("client").await.unwrap().balance_cents, 2_000);
    }

    #[tokio::test]
    async fn double_confirmation_is_rejected() {
        let engine = PaymentEngine::new(500);
        let deposit = engine.request_deposit("client", 500, "usd").await;
        engine.confirm_deposit(&deposit.id).await.unwrap();
        let second = engine.confirm_deposit(&deposit.id).await;
        assert!(matches!(second, Err(PaymentError::DepositAlreadyConfirmed(_))));
    }

    #[tokio::test]
    async fn withdraw_requires_sufficient_balance() {
        let engine = PaymentEngine::new(500);
        engine.credit("client", 100).await.unwrap();
        let result = engine.request_withdraw("client", 500).await;
        assert!(matches!(result, Err(PaymentError::InsufficientFunds)));
        assert_eq!(engine.get_account("client").await.unwrap().balance_cents, 100);
    }

    #[test]
    fn round_half_to_even_matches_banker_rounding() {
        // 500 cents at 50bps = 2.5 -> rounds to 2 (nearest even).
        assert_eq!(round_half_to_even_bps(500, 50), 2);
        // 700 cents at 50bps = 3.5 -> rounds to 4 (nearest even).
        assert_eq!(round_half_to_even_bps(700, 50), 4);
    }
}
