use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::quote::QuoteItem;
use crate::errors::DomainError;

/// Minor unit of the quoting currency (cents).
pub const CURRENCY_SCALE: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub tax_total: Decimal,
    pub total: Decimal,
}

/// Round half to even at the currency scale, padded to exactly two places.
pub fn round_amount(amount: Decimal) -> Decimal {
    let mut rounded =
        amount.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(CURRENCY_SCALE);
    rounded
}

/// Exact line amount `quantity * unit_price * (1 - discount) * (1 + tax)`, unrounded.
pub fn compute_item_total(item: &QuoteItem) -> Result<Decimal, DomainError> {
    item.validate()?;
    let parts = line_parts(item)?;
    Ok(parts.net + parts.tax)
}

pub fn compute_quote_total(items: &[QuoteItem]) -> Result<Decimal, DomainError> {
    let mut sum = Decimal::ZERO;
    for item in items {
        sum = sum.checked_add(compute_item_total(item)?).ok_or_else(overflow)?;
    }
    Ok(round_amount(sum))
}

pub fn price_breakdown(items: &[QuoteItem]) -> Result<PriceBreakdown, DomainError> {
    let mut subtotal = Decimal::ZERO;
    let mut discount_total = Decimal::ZERO;
    let mut tax_total = Decimal::ZERO;
    let mut total = Decimal::ZERO;

    for item in items {
        item.validate()?;
        let parts = line_parts(item)?;
        subtotal = subtotal.checked_add(parts.gross).ok_or_else(overflow)?;
        discount_total = discount_total.checked_add(parts.discount).ok_or_else(overflow)?;
        tax_total = tax_total.checked_add(parts.tax).ok_or_else(overflow)?;
        total = total.checked_add(parts.net + parts.tax).ok_or_else(overflow)?;
    }

    Ok(PriceBreakdown {
        subtotal: round_amount(subtotal),
        discount_total: round_amount(discount_total),
        tax_total: round_amount(tax_total),
        total: round_amount(total),
    })
}

struct LineParts {
    gross: Decimal,
    discount: Decimal,
    net: Decimal,
    tax: Decimal,
}

fn line_parts(item: &QuoteItem) -> Result<LineParts, DomainError> {
    let gross = item.quantity.checked_mul(item.unit_price).ok_or_else(overflow)?;
    let discount = gross.checked_mul(item.discount).ok_or_else(overflow)?;
    let net = gross - discount;
    let tax = net.checked_mul(item.tax).ok_or_else(overflow)?;
    net.checked_add(tax).ok_or_else(overflow)?;
    Ok(LineParts { gross, discount, net, tax })
}

fn overflow() -> DomainError {
    DomainError::validation("amount", "exceeds the supported decimal range")
}
