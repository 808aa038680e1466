/// Order records and lifecycle states
use crate::error::{CoreError, CoreResult};
use crate::ledger::parse_timestamp;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::Row;

pub mod machine;

pub use machine::OrderMachine;

/// Courier sentinel written by the failsafe sweep
pub const SYSTEM_FAILSAFE: &str = "SYSTEM_FAILSAFE";

/// Order lifecycle states. Forward-only except for the manager-side
/// cancellation and refund branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Claimed,
    Preparing,
    Ready,
    Delivered,
    CancelledUnprepped,
    CancelledPredelivery,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Claimed => "claimed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Delivered => "delivered",
            OrderStatus::CancelledUnprepped => "cancelled_unprepped",
            OrderStatus::CancelledPredelivery => "cancelled_predelivery",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "claimed" => Ok(OrderStatus::Claimed),
            "preparing" => Ok(OrderStatus::Preparing),
            "ready" => Ok(OrderStatus::Ready),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled_unprepped" => Ok(OrderStatus::CancelledUnprepped),
            "cancelled_predelivery" => Ok(OrderStatus::CancelledPredelivery),
            "refunded" => Ok(OrderStatus::Refunded),
            _ => Err(CoreError::Internal(format!("Invalid order status: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered
                | OrderStatus::CancelledUnprepped
                | OrderStatus::CancelledPredelivery
                | OrderStatus::Refunded
        )
    }
}

/// Price tier, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceTier {
    Standard,
    Discount,
    Priority,
}

impl PriceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceTier::Standard => "standard",
            PriceTier::Discount => "discount",
            PriceTier::Priority => "priority",
        }
    }

    pub fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "standard" => Ok(PriceTier::Standard),
            "discount" => Ok(PriceTier::Discount),
            "priority" => Ok(PriceTier::Priority),
            _ => Err(CoreError::Internal(format!("Invalid price tier: {}", s))),
        }
    }
}

/// Opaque routing tuple: where the fulfilled order should be announced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginContext {
    pub context: String,
    pub channel: String,
}

/// Order record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub requester_id: String,
    pub origin: OriginContext,
    pub status: OrderStatus,
    pub item: String,
    pub price_tier: PriceTier,
    pub price_paid: i64,
    pub created_at: DateTime<Utc>,
    pub cook_id: Option<String>,
    pub cook_label: Option<String>,
    pub courier_id: Option<String>,
    pub ready_at: Option<DateTime<Utc>>,
    pub evidence: Vec<String>,
    pub archive_ref: Option<String>,
}

impl Order {
    /// Whether the order was delivered by the failsafe rather than a human
    pub fn auto_delivered(&self) -> bool {
        self.courier_id.as_deref() == Some(SYSTEM_FAILSAFE)
    }
}

/// Generate a short opaque order code
pub fn generate_order_id() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

pub(crate) fn order_from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Order> {
    let status = OrderStatus::from_str(&row.try_get::<String, _>("status")?)?;
    let price_tier = PriceTier::from_str(&row.try_get::<String, _>("price_tier")?)?;

    let ready_at = row
        .try_get::<Option<String>, _>("ready_at")?
        .map(|s| parse_timestamp(&s))
        .transpose()?;

    let evidence: Vec<String> = serde_json::from_str(&row.try_get::<String, _>("evidence")?)
        .map_err(|e| CoreError::Internal(format!("Invalid evidence list: {}", e)))?;

    Ok(Order {
        order_id: row.try_get("order_id")?,
        requester_id: row.try_get("requester_id")?,
        origin: OriginContext {
            context: row.try_get("origin_context")?,
            channel: row.try_get("origin_channel")?,
        },
        status,
        item: row.try_get("item")?,
        price_tier,
        price_paid: row.try_get("price_paid")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        cook_id: row.try_get("cook_id")?,
        cook_label: row.try_get("cook_label")?,
        courier_id: row.try_get("courier_id")?,
        ready_at,
        evidence,
        archive_ref: row.try_get("archive_ref")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Claimed,
            OrderStatus::Preparing,
            OrderStatus::Ready,
            OrderStatus::Delivered,
            OrderStatus::CancelledUnprepped,
            OrderStatus::CancelledPredelivery,
            OrderStatus::Refunded,
        ] {
            assert_eq!(OrderStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(OrderStatus::from_str("frobnicated").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Claimed.is_terminal());
        assert!(!OrderStatus::Preparing.is_terminal());
        assert!(!OrderStatus::Ready.is_terminal());
        assert!(OrderStatus::Delivered.is_terminal());
        assert!(OrderStatus::CancelledUnprepped.is_terminal());
        assert!(OrderStatus::CancelledPredelivery.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
    }

    #[test]
    fn test_order_id_shape() {
        let id = generate_order_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }
}
