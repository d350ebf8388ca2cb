use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment methods a checkout can settle with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "UPI")]
    Upi,
    #[sea_orm(string_value = "CARD")]
    Card,
    #[sea_orm(string_value = "COD")]
    Cod,
}

impl PaymentMethod {
    /// Methods that collect money before fulfillment through the payment gateway.
    pub fn is_pay_now(self) -> bool {
        matches!(self, PaymentMethod::Upi | PaymentMethod::Card)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Upi => "UPI",
            PaymentMethod::Card => "CARD",
            PaymentMethod::Cod => "COD",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UPI" => Ok(PaymentMethod::Upi),
            "CARD" => Ok(PaymentMethod::Card),
            "COD" => Ok(PaymentMethod::Cod),
            other => Err(format!("unsupported payment method: {other}")),
        }
    }
}

/// A single line captured from the cart when the payment method is chosen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub product_id: i64,
    pub quantity: i32,
    /// Unit price in minor units at snapshot time.
    pub unit_price: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub items: Vec<SnapshotItem>,
}

impl CartSnapshot {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkout_sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub public_id: Uuid,
    pub user_id: i64,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub cart_snapshot: Option<Json>,
    pub selected_payment_method: Option<PaymentMethod>,
    pub is_active: bool,
    pub order_id: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Decodes the stored snapshot; a session without one has an empty cart.
    pub fn snapshot(&self) -> Result<CartSnapshot, serde_json::Error> {
        match &self.cart_snapshot {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(CartSnapshot::default()),
        }
    }

    /// True once `now + buffer` has reached the expiry deadline.
    pub fn is_expiring(&self, now: DateTime<Utc>, buffer: chrono::Duration) -> bool {
        now + buffer >= self.expires_at
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::inventory_reservation::Entity")]
    InventoryReservations,
}

impl Related<super::inventory_reservation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InventoryReservations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
