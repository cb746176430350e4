//! Bonus allocation engine.
//!
//! The `engine` module turns a deal's total bonus amount into per-line
//! discounts.  Distribution is an iterative proportional fill: each round
//! splits the remaining budget across the lines in proportion to the
//! discount capacity they have left, until the budget is spent or no line
//! can absorb more.  A final reconciliation pass forces the sum of the
//! quantized per-unit discounts to match the requested amount exactly,
//! within the bounds of the price floor.
//!
//! The engine is a pure computation over its inputs.  Fetching deal data
//! and writing results back belong to the CRM client in [`crate::crm`].

use crate::models::{AllocatedLine, AllocationPolicy, AllocationReport, ProductLine};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Errors the allocation can fail with before any distribution happens.
///
/// Rounding problems are never an error.  When the reconciliation cannot
/// hit the target exactly the call still succeeds and the miss is reported
/// in [`AllocationReport::residual`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// The bonus amount was zero or negative.
    #[error("bonus amount must be positive, got {0}")]
    InvalidBonusAmount(Decimal),
    /// Every line was ineligible, empty, or already at its cap.
    #[error("no product line can absorb bonus discount")]
    NoEligibleItems,
}

/// Smallest amount the fill loop will move in one step.  Deltas below this
/// are skipped, and a round that moves less than this in total ends the
/// loop.
fn min_increment() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

/// Per-line working state of one allocation call.
struct WorkingLine {
    /// Index of the line in the caller's slice.
    idx: usize,
    /// Running total discount assigned to the line.
    applied: Decimal,
    /// Absolute ceiling for `applied`: the percent cap, bounded by the
    /// line's own value.
    cap_abs: Decimal,
}

impl WorkingLine {
    fn remaining_capacity(&self) -> Decimal {
        (self.cap_abs - self.applied).max(Decimal::ZERO)
    }
}

/// Distributes `total_bonus` across `lines` and returns the allocated lines
/// in input order together with reconciliation diagnostics.
///
/// Lines that are ineligible or have no positive quantity pass through
/// untouched (per [`AllocationPolicy`]); they never receive new discount.
/// The call fails when the bonus is not positive or when no line can take
/// any discount at all.
pub fn allocate(
    total_bonus: Decimal,
    lines: &[ProductLine],
    policy: AllocationPolicy,
) -> Result<AllocationReport, AllocationError> {
    if total_bonus <= Decimal::ZERO {
        return Err(AllocationError::InvalidBonusAmount(total_bonus));
    }
    let carry = policy.carry_forward_existing_discount;

    let mut working: Vec<WorkingLine> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.eligible && line.quantity > Decimal::ZERO)
        .map(|(idx, line)| {
            let total = line.total_price();
            let applied = if carry {
                line.existing_discount_per_unit * line.quantity
            } else {
                Decimal::ZERO
            };
            WorkingLine {
                idx,
                applied,
                cap_abs: (total * line.cap_percent).min(total),
            }
        })
        .collect();

    let initial_capacity: Decimal = working.iter().map(WorkingLine::remaining_capacity).sum();
    if working.is_empty() || initial_capacity <= Decimal::ZERO {
        return Err(AllocationError::NoEligibleItems);
    }

    let remaining = fill_rounds(total_bonus, &mut working);

    // Budget the lines could never have absorbed is reported back instead
    // of being forced onto some line in reconciliation.
    let final_capacity: Decimal = working.iter().map(WorkingLine::remaining_capacity).sum();
    let shortfall = (remaining - final_capacity).max(Decimal::ZERO);

    let carried: Decimal = if carry {
        lines
            .iter()
            .map(|line| line.existing_discount_per_unit * line.quantity)
            .sum()
    } else {
        Decimal::ZERO
    };

    let mut out = quantize(lines, &working, carry);
    let target = carried + total_bonus - shortfall;
    let residual = reconcile(&mut out, lines, target);

    let applied_total = discount_sum(&out);
    Ok(AllocationReport {
        lines: out,
        requested: total_bonus,
        applied_total,
        shortfall,
        residual,
    })
}

/// The proportional fill loop.  Returns the budget left over when no line
/// could absorb more, or when a whole round moved less than the minimum
/// increment.
fn fill_rounds(total_bonus: Decimal, working: &mut [WorkingLine]) -> Decimal {
    let mut remaining = total_bonus;
    while remaining > Decimal::ZERO {
        // Capacities are frozen at the start of the round; every delta in
        // this round is computed against this snapshot.
        let caps: Vec<Decimal> = working.iter().map(WorkingLine::remaining_capacity).collect();
        let total_capacity: Decimal = caps.iter().copied().sum();
        if total_capacity <= Decimal::ZERO {
            break;
        }

        let round_amount = remaining.min(total_capacity);
        let mut distributed = Decimal::ZERO;
        for (line, cap) in working.iter_mut().zip(&caps) {
            if *cap <= Decimal::ZERO {
                continue;
            }
            let delta = round_amount * (*cap / total_capacity);
            if delta < min_increment() {
                continue;
            }
            line.applied += delta;
            remaining -= delta;
            distributed += delta;
        }

        // Deadlock guard: capacity may be left only in slivers too small
        // to move.
        if distributed < min_increment() {
            break;
        }
    }
    remaining
}

/// Rounds each participating line's running discount to a whole-unit
/// per-unit discount and emits the result rows in input order.
fn quantize(lines: &[ProductLine], working: &[WorkingLine], carry: bool) -> Vec<AllocatedLine> {
    let mut applied_by_idx: Vec<Option<Decimal>> = vec![None; lines.len()];
    for w in working {
        applied_by_idx[w.idx] = Some(w.applied);
    }

    lines
        .iter()
        .enumerate()
        .map(|(idx, line)| match applied_by_idx[idx] {
            Some(applied) => {
                let mut per_unit = (applied / line.quantity)
                    .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
                // Rounding half away from zero can step past a fractional
                // unit price; the price floor wins.
                if per_unit > line.unit_price {
                    per_unit = line.unit_price.floor();
                }
                if per_unit < Decimal::ZERO {
                    per_unit = Decimal::ZERO;
                }
                AllocatedLine {
                    product_id: line.product_id.clone(),
                    name: line.name.clone(),
                    unit_price: line.unit_price - per_unit,
                    quantity: line.quantity,
                    discount_per_unit: per_unit,
                    participated: true,
                }
            }
            None => {
                let per_unit = if carry {
                    line.existing_discount_per_unit
                } else {
                    Decimal::ZERO
                };
                AllocatedLine {
                    product_id: line.product_id.clone(),
                    name: line.name.clone(),
                    unit_price: line.unit_price - per_unit,
                    quantity: line.quantity,
                    discount_per_unit: per_unit,
                    participated: false,
                }
            }
        })
        .collect()
}

fn discount_sum(lines: &[AllocatedLine]) -> Decimal {
    lines
        .iter()
        .map(|line| line.discount_per_unit * line.quantity)
        .sum()
}

/// Forces the quantized discount sum onto the target by correcting the last
/// participating line: first the full difference as a rounded per-unit
/// delta, then a one-unit nudge if the division did not land exactly.
/// Corrections never push a discount below zero or above the line's
/// original unit price; whatever cannot be corrected is returned.
fn reconcile(out: &mut [AllocatedLine], lines: &[ProductLine], target: Decimal) -> Decimal {
    let mut diff = target - discount_sum(out);
    if diff.is_zero() {
        return Decimal::ZERO;
    }
    let Some(pos) = out.iter().rposition(|line| line.participated) else {
        return diff;
    };
    let original_unit_price = lines[pos].unit_price;

    let per_unit = (diff / out[pos].quantity)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    apply_correction(&mut out[pos], original_unit_price, per_unit);

    diff = target - discount_sum(out);
    if !diff.is_zero() {
        let nudge = if diff.is_sign_positive() {
            Decimal::ONE
        } else {
            -Decimal::ONE
        };
        apply_correction(&mut out[pos], original_unit_price, nudge);
        diff = target - discount_sum(out);
    }
    diff
}

fn apply_correction(line: &mut AllocatedLine, original_unit_price: Decimal, delta: Decimal) {
    let ceiling = original_unit_price.floor();
    let mut per_unit = line.discount_per_unit + delta;
    if per_unit < Decimal::ZERO {
        per_unit = Decimal::ZERO;
    }
    if per_unit > ceiling {
        per_unit = ceiling;
    }
    line.discount_per_unit = per_unit;
    line.unit_price = original_unit_price - per_unit;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(id: &str, unit_price: i64, quantity: i64, cap_percent: &str) -> ProductLine {
        ProductLine {
            product_id: id.into(),
            name: format!("Product {id}"),
            unit_price: Decimal::from(unit_price),
            quantity: Decimal::from(quantity),
            existing_discount_per_unit: Decimal::ZERO,
            eligible: true,
            cap_percent: cap_percent.parse().unwrap(),
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn single_line_takes_the_whole_bonus() {
        let lines = vec![line("1", 1000, 1, "0.15")];
        let report =
            allocate(dec("100"), &lines, AllocationPolicy::default()).unwrap();

        assert_eq!(report.lines[0].discount_per_unit, dec("100"));
        assert_eq!(report.lines[0].unit_price, dec("900"));
        assert!(report.lines[0].participated);
        assert_eq!(report.applied_total, dec("100"));
        assert!(report.shortfall.is_zero());
        assert!(report.residual.is_zero());
    }

    #[test]
    fn two_lines_saturate_exactly_at_their_caps() {
        let lines = vec![line("1", 1000, 1, "0.15"), line("2", 2000, 1, "0.15")];
        let report =
            allocate(dec("450"), &lines, AllocationPolicy::default()).unwrap();

        assert_eq!(report.lines[0].discount_per_unit, dec("150"));
        assert_eq!(report.lines[1].discount_per_unit, dec("300"));
        assert_eq!(report.applied_total, dec("450"));
        assert!(report.shortfall.is_zero());
        assert!(report.residual.is_zero());
    }

    #[test]
    fn distribution_is_proportional_to_remaining_capacity() {
        let lines = vec![line("1", 1000, 1, "0.1"), line("2", 3000, 1, "0.1")];
        let report =
            allocate(dec("100"), &lines, AllocationPolicy::default()).unwrap();

        assert_eq!(report.lines[0].discount_per_unit, dec("25"));
        assert_eq!(report.lines[1].discount_per_unit, dec("75"));
        assert_eq!(report.applied_total, dec("100"));
    }

    #[test]
    fn bonus_beyond_total_capacity_is_reported_as_shortfall() {
        let lines = vec![line("1", 1000, 1, "0.15"), line("2", 2000, 1, "0.15")];
        let report =
            allocate(dec("600"), &lines, AllocationPolicy::default()).unwrap();

        // Caps absorb 450; the rest must not be forced onto any line.
        assert_eq!(report.lines[0].discount_per_unit, dec("150"));
        assert_eq!(report.lines[1].discount_per_unit, dec("300"));
        assert_eq!(report.applied_total, dec("450"));
        assert_eq!(report.shortfall, dec("150"));
        assert!(report.residual.is_zero());
        assert!(!report.warnings().is_empty());
    }

    #[test]
    fn zero_or_negative_bonus_is_rejected() {
        let lines = vec![line("1", 1000, 1, "0.15")];
        assert_eq!(
            allocate(Decimal::ZERO, &lines, AllocationPolicy::default()).unwrap_err(),
            AllocationError::InvalidBonusAmount(Decimal::ZERO)
        );
        assert!(matches!(
            allocate(dec("-5"), &lines, AllocationPolicy::default()),
            Err(AllocationError::InvalidBonusAmount(_))
        ));
    }

    #[test]
    fn all_ineligible_lines_are_rejected() {
        let mut a = line("1", 1000, 1, "0.15");
        let mut b = line("2", 2000, 1, "0.15");
        a.eligible = false;
        b.eligible = false;
        assert_eq!(
            allocate(dec("100"), &[a, b], AllocationPolicy::default()).unwrap_err(),
            AllocationError::NoEligibleItems
        );
    }

    #[test]
    fn capacity_exhausted_from_the_start_is_rejected() {
        // The pre-existing discount already sits above the cap.
        let mut a = line("1", 1000, 1, "0.15");
        a.existing_discount_per_unit = dec("200");
        assert_eq!(
            allocate(dec("100"), &[a], AllocationPolicy::default()).unwrap_err(),
            AllocationError::NoEligibleItems
        );
    }

    #[test]
    fn ineligible_line_passes_through_unmodified() {
        let mut blocked = line("2", 500, 2, "0.15");
        blocked.eligible = false;
        blocked.existing_discount_per_unit = dec("7");
        let lines = vec![line("1", 1000, 1, "0.15"), blocked];
        let report =
            allocate(dec("100"), &lines, AllocationPolicy::default()).unwrap();

        let kept = &report.lines[1];
        assert!(!kept.participated);
        assert_eq!(kept.discount_per_unit, dec("7"));
        assert_eq!(kept.unit_price, dec("493"));
        // Target includes the carried discount of the untouched line.
        assert_eq!(report.applied_total, dec("100") + dec("7") * dec("2"));
    }

    #[test]
    fn zero_quantity_line_cannot_participate() {
        let mut empty = line("2", 500, 1, "0.15");
        empty.quantity = Decimal::ZERO;
        let lines = vec![line("1", 1000, 1, "0.15"), empty];
        let report =
            allocate(dec("100"), &lines, AllocationPolicy::default()).unwrap();

        assert!(!report.lines[1].participated);
        assert!(report.lines[1].discount_per_unit.is_zero());
        assert_eq!(report.lines[0].discount_per_unit, dec("100"));
    }

    #[test]
    fn rounding_drift_is_reconciled_on_the_last_line() {
        // 99 split across two equal capacities rounds both halves up;
        // the second line gives one unit back.
        let lines = vec![line("1", 100, 1, "0.5"), line("2", 100, 1, "0.5")];
        let report =
            allocate(dec("99"), &lines, AllocationPolicy::default()).unwrap();

        assert_eq!(report.lines[0].discount_per_unit, dec("50"));
        assert_eq!(report.lines[1].discount_per_unit, dec("49"));
        assert_eq!(report.applied_total, dec("99"));
        assert!(report.residual.is_zero());
    }

    #[test]
    fn coarse_quantity_leaves_a_bounded_residual() {
        // One line of three units cannot represent 100 exactly; the miss
        // stays within one unit step of the line.
        let lines = vec![line("1", 500, 3, "0.15")];
        let report =
            allocate(dec("100"), &lines, AllocationPolicy::default()).unwrap();

        assert!(report.residual.abs() <= report.lines[0].quantity);
        assert_eq!(
            report.applied_total,
            report.requested - report.shortfall - report.residual
        );
    }

    #[test]
    fn price_floor_survives_quantization_and_nudges() {
        // The whole line value fits in the cap but rounds above the
        // fractional unit price.
        let mut a = line("1", 10, 1, "1.0");
        a.unit_price = dec("10.5");
        let report =
            allocate(dec("100"), &[a], AllocationPolicy::default()).unwrap();

        let result = &report.lines[0];
        assert!(result.discount_per_unit <= dec("10.5"));
        assert!(result.unit_price >= Decimal::ZERO);
        assert_eq!(report.shortfall, dec("89.5"));
        assert_eq!(report.residual, dec("0.5"));
    }

    #[test]
    fn carried_discount_consumes_capacity_and_joins_the_target() {
        let mut a = line("1", 1000, 1, "0.15");
        a.existing_discount_per_unit = dec("50");
        let report =
            allocate(dec("100"), &[a], AllocationPolicy::default()).unwrap();

        // 150 cap minus 50 already applied leaves room for the full bonus.
        assert_eq!(report.lines[0].discount_per_unit, dec("150"));
        assert_eq!(report.applied_total, dec("150"));
        assert!(report.shortfall.is_zero());
        assert!(report.residual.is_zero());
    }

    #[test]
    fn reset_policy_clears_existing_discounts() {
        let policy = AllocationPolicy {
            carry_forward_existing_discount: false,
        };
        let mut a = line("1", 1000, 1, "0.15");
        a.existing_discount_per_unit = dec("50");
        let mut blocked = line("2", 500, 1, "0.15");
        blocked.eligible = false;
        blocked.existing_discount_per_unit = dec("7");

        let report = allocate(dec("100"), &[a, blocked], policy).unwrap();

        assert_eq!(report.lines[0].discount_per_unit, dec("100"));
        assert!(report.lines[1].discount_per_unit.is_zero());
        assert_eq!(report.lines[1].unit_price, dec("500"));
        assert_eq!(report.applied_total, dec("100"));
    }

    #[test]
    fn fractional_quantities_allocate_against_line_totals() {
        // 2.5 units at 100 gives a 250 line total and a 37.50 cap.
        let mut a = line("1", 100, 1, "0.15");
        a.quantity = dec("2.5");
        let report =
            allocate(dec("30"), &[a], AllocationPolicy::default()).unwrap();

        // 30 / 2.5 = 12 per unit, exactly representable.
        assert_eq!(report.lines[0].discount_per_unit, dec("12"));
        assert_eq!(report.applied_total, dec("30"));
        assert!(report.residual.is_zero());
    }
}
