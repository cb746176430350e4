//! Data models for the bonus allocation service.
//!
//! The `models` module defines the serialisable structs exchanged with the
//! allocation engine: product lines coming in from the CRM, allocated lines
//! going back out, and the policy knobs controlling how pre-existing
//! discounts are treated.  All currency amounts are `rust_decimal::Decimal`
//! in major currency units so that sums reconcile exactly.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One product line of a deal, as presented to the allocation engine.
///
/// A deal may carry several lines referencing the same catalog product;
/// `product_id` is only required to identify a line for the duration of a
/// single allocation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductLine {
    /// Identifier of the product on this line.
    pub product_id: String,
    /// Catalog product name, carried through into the allocation note.
    pub name: String,
    /// Price per unit before any discount.  Non-negative.
    pub unit_price: Decimal,
    /// Quantity purchased.  May be fractional; lines with zero or negative
    /// quantity cannot participate in the allocation.
    pub quantity: Decimal,
    /// Per-unit discount already present on the row before this call.
    pub existing_discount_per_unit: Decimal,
    /// Whether this line may receive bonus-derived discount at all.
    pub eligible: bool,
    /// Maximum discount as a fraction of the line total, in (0, 1].
    pub cap_percent: Decimal,
}

impl ProductLine {
    /// Full value of the line: `unit_price × quantity`.
    pub fn total_price(&self) -> Decimal {
        self.unit_price * self.quantity
    }
}

/// Controls the treatment of discounts that were on the rows before the
/// allocation ran.
///
/// The two observed behaviours of the upstream system differ in whether
/// pre-existing discounts survive a bonus run; rather than guessing, both
/// are available behind this flag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AllocationPolicy {
    /// When `true` (the default), each line's running discount starts from
    /// its pre-existing total discount, ineligible lines keep their
    /// pre-existing per-unit discount, and the reconciliation target is the
    /// requested bonus plus the sum of pre-existing discounts.  When
    /// `false`, every row is reset to zero discount first and the target is
    /// the raw bonus amount.
    pub carry_forward_existing_discount: bool,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            carry_forward_existing_discount: true,
        }
    }
}

/// The outcome of the allocation for a single input line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatedLine {
    /// Identifier of the product on this line.
    pub product_id: String,
    /// Catalog product name.
    pub name: String,
    /// Final price per unit after the discount was subtracted.
    pub unit_price: Decimal,
    /// Quantity, unchanged from the input.
    pub quantity: Decimal,
    /// Discount per unit in whole currency units.
    pub discount_per_unit: Decimal,
    /// Whether this line took part in the distribution.  Ineligible and
    /// zero-quantity lines pass through with `false`.
    pub participated: bool,
}

/// The full result of one allocation call: the lines in input order plus
/// the reconciliation diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReport {
    /// Allocated lines, one per input line, in input order.
    pub lines: Vec<AllocatedLine>,
    /// The bonus amount that was requested.
    pub requested: Decimal,
    /// `Σ discount_per_unit × quantity` over all emitted lines.
    pub applied_total: Decimal,
    /// Budget that no line could absorb because every cap was reached.
    /// Zero whenever the lines had enough capacity.
    pub shortfall: Decimal,
    /// Difference between the reconciliation target and `applied_total`
    /// that could not be corrected without breaching the price floor or the
    /// per-unit granularity of the designated line.  Zero in the normal
    /// case.
    pub residual: Decimal,
}

impl AllocationReport {
    /// Human-readable allocation note, one line per product:
    /// `"<id> <name> - <discount_per_unit>"`.
    pub fn note_lines(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|line| {
                format!(
                    "{} {} - {}",
                    line.product_id, line.name, line.discount_per_unit
                )
            })
            .collect()
    }

    /// Warnings a caller should surface when the allocation could not hit
    /// the target exactly.  Empty in the normal case.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.shortfall.is_zero() {
            warnings.push(format!(
                "bonus of {} exceeded the remaining discount capacity by {}",
                self.requested, self.shortfall
            ));
        }
        if !self.residual.is_zero() {
            warnings.push(format!(
                "applied discounts miss the target by {} after rounding",
                self.residual
            ));
        }
        warnings
    }
}
