//! Order totals computed purely from a stored cart snapshot.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::PricingConfig;
use crate::entities::checkout_session::{CartSnapshot, PaymentMethod};
use crate::errors::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTotals {
    pub product_id: i64,
    pub quantity: i32,
    pub unit_price: i64,
    pub line_total: i64,
    pub tax: i64,
}

/// All amounts in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub currency: String,
    pub subtotal: i64,
    pub tax: i64,
    pub shipping: i64,
    pub cod_fee: i64,
    pub discount: i64,
    pub total: i64,
    pub lines: Vec<LineTotals>,
}

fn floor_tax(amount: i64, rate: Decimal) -> Result<i64, ServiceError> {
    (Decimal::from(amount) * rate)
        .floor()
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError("tax amount out of range".to_string()))
}

/// Tax is floored on the subtotal; per-line tax is informational and floored per line.
pub fn compute_totals(
    snapshot: &CartSnapshot,
    method: PaymentMethod,
    pricing: &PricingConfig,
) -> Result<OrderTotals, ServiceError> {
    if snapshot.is_empty() {
        return Err(ServiceError::BadRequest("cart snapshot has no items".to_string()));
    }

    let mut lines = Vec::with_capacity(snapshot.items.len());
    let mut subtotal: i64 = 0;
    for item in &snapshot.items {
        if item.quantity <= 0 || item.unit_price < 0 {
            return Err(ServiceError::ValidationError(format!(
                "invalid snapshot line for product {}",
                item.product_id
            )));
        }
        let line_total = item
            .unit_price
            .checked_mul(i64::from(item.quantity))
            .ok_or_else(|| ServiceError::ValidationError("line total overflow".to_string()))?;
        subtotal = subtotal
            .checked_add(line_total)
            .ok_or_else(|| ServiceError::ValidationError("subtotal overflow".to_string()))?;
        lines.push(LineTotals {
            product_id: item.product_id,
            quantity: item.quantity,
            unit_price: item.unit_price,
            line_total,
            tax: floor_tax(line_total, pricing.tax_rate)?,
        });
    }

    let tax = floor_tax(subtotal, pricing.tax_rate)?;
    let shipping = pricing.shipping_fee;
    let cod_fee = if method == PaymentMethod::Cod {
        pricing.cod_fee
    } else {
        0
    };
    let discount = 0;
    let total = subtotal
        .checked_add(tax)
        .and_then(|t| t.checked_add(shipping))
        .and_then(|t| t.checked_add(cod_fee))
        .and_then(|t| t.checked_sub(discount))
        .ok_or_else(|| ServiceError::ValidationError("order total overflow".to_string()))?;

    Ok(OrderTotals {
        currency: pricing.currency.clone(),
        subtotal,
        tax,
        shipping,
        cod_fee,
        discount,
        total,
        lines,
    })
}
