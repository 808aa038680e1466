/// Coin ledger: per-account balances, allowance, pricing and payouts
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Standard order price for non-VIP requesters
pub const STANDARD_PRICE: i64 = 100;
/// Standard order price while VIP is active
pub const VIP_PRICE: i64 = 50;
/// Priority-tier order price
pub const SUPER_PRICE: i64 = 150;
/// Daily allowance for non-VIP accounts
pub const ALLOWANCE_STANDARD: i64 = 1000;
/// Daily allowance while VIP is active
pub const ALLOWANCE_VIP: i64 = 2000;
/// Flat fee credited to the cook when an order becomes ready
pub const COOK_FEE: i64 = 20;
/// Flat fee credited to the courier on delivery
pub const COURIER_FEE: i64 = 30;
/// Price of the 30-day stat-boost perk
pub const STAT_BOOST_PRICE: i64 = 15_000;

const ALLOWANCE_COOLDOWN_HOURS: i64 = 24;
const STAT_BOOST_DAYS: i64 = 30;
const VIP_MEMBERSHIP_DAYS: i64 = 30;

/// Requested order kind, before pricing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Standard,
    Super,
}

/// Account record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub balance: i64,
    pub last_allowance_at: DateTime<Utc>,
    pub strike_count: i64,
    pub suspended_until: Option<DateTime<Utc>>,
    pub perm_banned: bool,
    pub vip_until: DateTime<Utc>,
    pub stat_boost_until: DateTime<Utc>,
    pub weekly_cook_count: i64,
    pub weekly_courier_count: i64,
    pub lifetime_cook_count: i64,
    pub lifetime_courier_count: i64,
    pub cook_quota_strikes: i64,
    pub courier_quota_strikes: i64,
}

impl Account {
    pub fn is_vip(&self, now: DateTime<Utc>) -> bool {
        now < self.vip_until
    }

    pub fn boost_active(&self, now: DateTime<Utc>) -> bool {
        now < self.stat_boost_until
    }

    /// Permanent ban supersedes temporary suspension
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.perm_banned || self.suspended_until.map_or(false, |until| now < until)
    }
}

pub(crate) fn parse_timestamp(s: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Internal(format!("Invalid timestamp {:?}: {}", s, e)))
}

pub(crate) fn account_from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Account> {
    let suspended_until = row
        .try_get::<Option<String>, _>("suspended_until")?
        .map(|s| parse_timestamp(&s))
        .transpose()?;

    Ok(Account {
        id: row.try_get("id")?,
        balance: row.try_get("balance")?,
        last_allowance_at: parse_timestamp(&row.try_get::<String, _>("last_allowance_at")?)?,
        strike_count: row.try_get("strike_count")?,
        suspended_until,
        perm_banned: row.try_get("perm_banned")?,
        vip_until: parse_timestamp(&row.try_get::<String, _>("vip_until")?)?,
        stat_boost_until: parse_timestamp(&row.try_get::<String, _>("stat_boost_until")?)?,
        weekly_cook_count: row.try_get("weekly_cook_count")?,
        weekly_courier_count: row.try_get("weekly_courier_count")?,
        lifetime_cook_count: row.try_get("lifetime_cook_count")?,
        lifetime_courier_count: row.try_get("lifetime_courier_count")?,
        cook_quota_strikes: row.try_get("cook_quota_strikes")?,
        courier_quota_strikes: row.try_get("courier_quota_strikes")?,
    })
}

/// Ledger manager
#[derive(Clone)]
pub struct Ledger {
    db: SqlitePool,
}

impl Ledger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Fetch an account, creating it lazily on first interaction
    pub async fn get_or_create(&self, account_id: &str) -> CoreResult<Account> {
        sqlx::query("INSERT OR IGNORE INTO account (id, created_at) VALUES (?, ?)")
            .bind(account_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.db)
            .await?;

        self.get(account_id).await
    }

    /// Fetch an existing account
    pub async fn get(&self, account_id: &str) -> CoreResult<Account> {
        let row = sqlx::query("SELECT * FROM account WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Account {}", account_id)))?;

        account_from_row(&row)
    }

    /// Debit an account. The balance check and the debit are a single
    /// conditional update, so concurrent charges against one account
    /// cannot drive the balance negative.
    pub async fn charge(&self, account_id: &str, amount: i64) -> CoreResult<()> {
        let result = sqlx::query("UPDATE account SET balance = balance - ? WHERE id = ? AND balance >= ?")
            .bind(amount)
            .bind(account_id)
            .bind(amount)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InsufficientFunds { required: amount });
        }

        Ok(())
    }

    /// Credit an account, creating it if needed. Always succeeds.
    pub async fn credit(&self, account_id: &str, amount: i64) -> CoreResult<()> {
        self.get_or_create(account_id).await?;

        sqlx::query("UPDATE account SET balance = balance + ? WHERE id = ?")
            .bind(amount)
            .bind(account_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Claim the daily allowance. The cooldown stamp is part of the update
    /// condition, so two concurrent claims resolve to one winner.
    pub async fn claim_allowance(&self, account_id: &str, now: DateTime<Utc>) -> CoreResult<i64> {
        let account = self.get_or_create(account_id).await?;

        let next_claim_at = account.last_allowance_at + Duration::hours(ALLOWANCE_COOLDOWN_HOURS);
        if now < next_claim_at {
            return Err(CoreError::CooldownActive { next_claim_at });
        }

        let amount = if account.is_vip(now) {
            ALLOWANCE_VIP
        } else {
            ALLOWANCE_STANDARD
        };

        let result = sqlx::query(
            "UPDATE account SET balance = balance + ?, last_allowance_at = ? \
             WHERE id = ? AND last_allowance_at = ?",
        )
        .bind(amount)
        .bind(now.to_rfc3339())
        .bind(account_id)
        .bind(account.last_allowance_at.to_rfc3339())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::CooldownActive {
                next_claim_at: now + Duration::hours(ALLOWANCE_COOLDOWN_HOURS),
            });
        }

        Ok(amount)
    }

    /// Price an order for a requester. VIPs already hold the discount, so
    /// the priority tier is rejected for them as redundant.
    pub fn price_for(&self, kind: OrderKind, is_vip: bool) -> CoreResult<i64> {
        match kind {
            OrderKind::Super => {
                if is_vip {
                    Err(CoreError::RedundantTier(
                        "VIP members already receive priority handling".to_string(),
                    ))
                } else {
                    Ok(SUPER_PRICE)
                }
            }
            OrderKind::Standard => Ok(if is_vip { VIP_PRICE } else { STANDARD_PRICE }),
        }
    }

    /// Split a tip between the cook and courier of a delivered order.
    /// The courier gets the floor half, the cook the remainder; an
    /// auto-delivered order has no human courier and the cook takes all.
    /// Returns (cook_share, courier_share).
    pub async fn split_tip(
        &self,
        tipper_id: &str,
        cook_id: &str,
        courier_id: Option<&str>,
        amount: i64,
    ) -> CoreResult<(i64, i64)> {
        if amount <= 0 {
            return Err(CoreError::Validation("Tip amount must be positive".to_string()));
        }

        self.charge(tipper_id, amount).await?;

        let (cook_share, courier_share) = match courier_id {
            Some(_) => {
                let courier_share = amount / 2;
                (amount - courier_share, courier_share)
            }
            None => (amount, 0),
        };

        if let Err(e) = self.credit(cook_id, cook_share).await {
            // Compensate the debit rather than leave a half-applied split
            self.credit(tipper_id, amount).await?;
            return Err(e);
        }
        if let Some(courier) = courier_id {
            if courier_share > 0 {
                if let Err(e) = self.credit(courier, courier_share).await {
                    self.credit(tipper_id, amount - cook_share).await?;
                    return Err(e);
                }
            }
        }

        Ok((cook_share, courier_share))
    }

    /// Pay the cook fee and bump weekly/lifetime cook counters. Weekly
    /// increments double while the stat boost is active.
    pub async fn settle_cook_completion(&self, cook_id: &str, now: DateTime<Utc>) -> CoreResult<()> {
        let account = self.get_or_create(cook_id).await?;
        let weekly_inc: i64 = if account.boost_active(now) { 2 } else { 1 };

        sqlx::query(
            "UPDATE account SET balance = balance + ?, \
             weekly_cook_count = weekly_cook_count + ?, \
             lifetime_cook_count = lifetime_cook_count + 1 \
             WHERE id = ?",
        )
        .bind(COOK_FEE)
        .bind(weekly_inc)
        .bind(cook_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Pay the courier fee and bump weekly/lifetime courier counters
    pub async fn settle_courier_delivery(
        &self,
        courier_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let account = self.get_or_create(courier_id).await?;
        let weekly_inc: i64 = if account.boost_active(now) { 2 } else { 1 };

        sqlx::query(
            "UPDATE account SET balance = balance + ?, \
             weekly_courier_count = weekly_courier_count + ?, \
             lifetime_courier_count = lifetime_courier_count + 1 \
             WHERE id = ?",
        )
        .bind(COURIER_FEE)
        .bind(weekly_inc)
        .bind(courier_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Buy the 30-day double-stats perk
    pub async fn purchase_stat_boost(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<DateTime<Utc>> {
        self.get_or_create(account_id).await?;
        self.charge(account_id, STAT_BOOST_PRICE).await?;

        let until = now + Duration::days(STAT_BOOST_DAYS);
        sqlx::query("UPDATE account SET stat_boost_until = ? WHERE id = ?")
            .bind(until.to_rfc3339())
            .bind(account_id)
            .execute(&self.db)
            .await?;

        Ok(until)
    }

    /// Extend VIP membership by 30 days from now or from the current
    /// expiry, whichever is later
    pub async fn extend_vip(&self, account_id: &str, now: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
        let account = self.get_or_create(account_id).await?;

        let base = if account.vip_until > now {
            account.vip_until
        } else {
            now
        };
        let until = base + Duration::days(VIP_MEMBERSHIP_DAYS);

        sqlx::query("UPDATE account SET vip_until = ? WHERE id = ?")
            .bind(until.to_rfc3339())
            .bind(account_id)
            .execute(&self.db)
            .await?;

        Ok(until)
    }
}
