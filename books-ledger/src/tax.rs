use serde::Deserialize;
use serde::Serialize;

use crate::LedgerError;
use crate::LedgerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxTreatment {
    None,
    Included,
    OnTop,
}

/// A gross/net/tax split. `net_minor + tax_minor == gross_minor` always
/// holds after rounding; `split_amount` adjusts the net by the cent delta
/// when the rounded parts disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub net_minor: i64,
    pub tax_minor: i64,
    pub gross_minor: i64,
}

fn div_half_up(numerator: i128, denominator: i128) -> i64 {
    ((numerator + denominator / 2) / denominator) as i64
}

/// Split `base_minor` into (net, tax, gross) for the given treatment and
/// rate in basis points, rounding half-up to whole minor units.
pub fn split_amount(
    base_minor: i64,
    treatment: TaxTreatment,
    rate_bps: i64,
) -> LedgerResult<TaxBreakdown> {
    if base_minor < 0 {
        return Err(LedgerError::Validation(
            "Tax can only be computed on a positive amount.".into(),
        ));
    }
    if rate_bps < 0 {
        return Err(LedgerError::Validation("Tax rate cannot be negative.".into()));
    }

    let breakdown = match treatment {
        TaxTreatment::None => TaxBreakdown {
            net_minor: base_minor,
            tax_minor: 0,
            gross_minor: base_minor,
        },
        TaxTreatment::OnTop => {
            let tax = div_half_up(i128::from(base_minor) * i128::from(rate_bps), 10_000);
            TaxBreakdown {
                net_minor: base_minor,
                tax_minor: tax,
                gross_minor: base_minor + tax,
            }
        }
        TaxTreatment::Included => {
            let net = div_half_up(
                i128::from(base_minor) * 10_000,
                10_000 + i128::from(rate_bps),
            );
            TaxBreakdown {
                net_minor: net,
                tax_minor: base_minor - net,
                gross_minor: base_minor,
            }
        }
    };

    debug_assert_eq!(
        breakdown.net_minor + breakdown.tax_minor,
        breakdown.gross_minor
    );
    Ok(breakdown)
}
