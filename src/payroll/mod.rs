use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::AppResult;
use crate::jobs::{Job, JobKind, JobRepository};

/// Statutory deductions for one pay period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub paye: Decimal,
    pub uif: Decimal,
    pub sdl: Decimal,
    pub net: Decimal,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CalculationOptions {
    /// Employee age; drives the secondary/tertiary rebates
    pub age: Option<u32>,
    /// Employer below the SDL registration threshold
    pub sdl_exempt: bool,
    /// Not a UIF contributor (e.g. learnership)
    pub uif_exempt: bool,
}

/// Collaborator seam: produces the amounts that become payroll job inputs.
/// Pure with respect to storage; implementations must be deterministic.
#[async_trait]
pub trait SalaryCalculator: Send + Sync {
    async fn calculate(
        &self,
        gross_monthly: Decimal,
        options: &CalculationOptions,
    ) -> AppResult<TaxBreakdown>;
}

/// SARS 2024/25 individual tax table, annual amounts in ZAR.
/// (lower bound, base tax, marginal rate on the excess)
const PAYE_BRACKETS: [(i64, i64, &str); 7] = [
    (0, 0, "0.18"),
    (237_100, 42_678, "0.26"),
    (370_500, 77_362, "0.31"),
    (512_800, 121_475, "0.36"),
    (673_000, 179_147, "0.39"),
    (857_900, 251_258, "0.41"),
    (1_817_000, 644_489, "0.45"),
];

const PRIMARY_REBATE: Decimal = dec!(17235);
const SECONDARY_REBATE: Decimal = dec!(9444);
const TERTIARY_REBATE: Decimal = dec!(3145);

/// UIF is 1% of remuneration capped at this monthly amount
const UIF_CEILING_MONTHLY: Decimal = dec!(17712);
const UIF_RATE: Decimal = dec!(0.01);
const SDL_RATE: Decimal = dec!(0.01);

const MONTHS: Decimal = dec!(12);

/// Bracket-table calculator over the statutory SARS tables.
#[derive(Debug, Default, Clone)]
pub struct SarsTableCalculator;

#[async_trait]
impl SalaryCalculator for SarsTableCalculator {
    async fn calculate(
        &self,
        gross_monthly: Decimal,
        options: &CalculationOptions,
    ) -> AppResult<TaxBreakdown> {
        let paye = monthly_paye(gross_monthly, options.age);
        let uif = if options.uif_exempt {
            Decimal::ZERO
        } else {
            round_cents(gross_monthly.min(UIF_CEILING_MONTHLY) * UIF_RATE)
        };
        let sdl = if options.sdl_exempt {
            Decimal::ZERO
        } else {
            round_cents(gross_monthly * SDL_RATE)
        };
        // SDL is an employer levy; only PAYE and UIF come off the payslip
        let net = gross_monthly - paye - uif;

        Ok(TaxBreakdown { paye, uif, sdl, net })
    }
}

fn monthly_paye(gross_monthly: Decimal, age: Option<u32>) -> Decimal {
    let annual = gross_monthly * MONTHS;

    let (lower, base, rate) = PAYE_BRACKETS
        .iter()
        .rev()
        .find(|(lower, _, _)| annual > Decimal::from(*lower))
        .copied()
        .unwrap_or(PAYE_BRACKETS[0]);
    // Rates in the table are string literals so the array stays const
    let rate: Decimal = rate.parse().unwrap_or(Decimal::ZERO);
    let annual_tax =
        Decimal::from(base) + (annual - Decimal::from(lower)) * rate;

    let mut rebate = PRIMARY_REBATE;
    if let Some(age) = age {
        if age >= 65 {
            rebate += SECONDARY_REBATE;
        }
        if age >= 75 {
            rebate += TERTIARY_REBATE;
        }
    }

    let after_rebate = (annual_tax - rebate).max(Decimal::ZERO);
    round_cents(after_rebate / MONTHS)
}

fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Front door for payroll: runs a gross salary through the calculator and
/// queues the net amount as a pending payroll job for the next settlement
/// window.
pub struct PayrollIntake {
    jobs: Arc<JobRepository>,
    calculator: Arc<dyn SalaryCalculator>,
}

impl PayrollIntake {
    pub fn new(jobs: Arc<JobRepository>, calculator: Arc<dyn SalaryCalculator>) -> Self {
        Self { jobs, calculator }
    }

    pub async fn create_payroll_job(
        &self,
        business_id: Uuid,
        gross_monthly: Decimal,
        currency: &str,
        options: &CalculationOptions,
    ) -> AppResult<(Job, TaxBreakdown)> {
        let breakdown = self.calculator.calculate(gross_monthly, options).await?;
        let job = self
            .jobs
            .create_job(JobKind::Payroll, business_id, breakdown.net, currency, None)
            .await?;

        info!(
            job_id = %job.id,
            %business_id,
            gross = %gross_monthly,
            net = %breakdown.net,
            "Payroll job queued"
        );
        Ok((job, breakdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_below_threshold_pays_no_paye() {
        let breakdown = SarsTableCalculator
            .calculate(dec!(6000), &CalculationOptions::default())
            .await
            .unwrap();

        assert_eq!(breakdown.paye, Decimal::ZERO);
        assert_eq!(breakdown.uif, dec!(60.00));
        assert_eq!(breakdown.sdl, dec!(60.00));
        assert_eq!(breakdown.net, dec!(5940.00));
    }

    #[tokio::test]
    async fn test_second_bracket_with_uif_cap() {
        // 20,000/month = 240,000/year: 42,678 + 26% of 2,900, less the
        // primary rebate, over 12 months
        let breakdown = SarsTableCalculator
            .calculate(dec!(20000), &CalculationOptions::default())
            .await
            .unwrap();

        assert_eq!(breakdown.paye, dec!(2183.08));
        assert_eq!(breakdown.uif, dec!(177.12));
        assert_eq!(breakdown.net, dec!(20000) - dec!(2183.08) - dec!(177.12));
    }

    #[tokio::test]
    async fn test_age_rebates_reduce_paye() {
        let options_young = CalculationOptions {
            age: Some(40),
            ..Default::default()
        };
        let options_senior = CalculationOptions {
            age: Some(66),
            ..Default::default()
        };

        let young = SarsTableCalculator
            .calculate(dec!(30000), &options_young)
            .await
            .unwrap();
        let senior = SarsTableCalculator
            .calculate(dec!(30000), &options_senior)
            .await
            .unwrap();

        assert!(senior.paye < young.paye);
        assert_eq!(young.paye - senior.paye, round_cents(SECONDARY_REBATE / MONTHS));
    }

    #[tokio::test]
    async fn test_exemption_flags() {
        let options = CalculationOptions {
            sdl_exempt: true,
            uif_exempt: true,
            ..Default::default()
        };
        let breakdown = SarsTableCalculator
            .calculate(dec!(10000), &options)
            .await
            .unwrap();

        assert_eq!(breakdown.uif, Decimal::ZERO);
        assert_eq!(breakdown.sdl, Decimal::ZERO);
        assert_eq!(breakdown.net, dec!(10000) - breakdown.paye);
    }

    #[tokio::test]
    async fn test_intake_dispatches_through_calculator_seam() {
        // PayrollIntake holds a trait object; any deterministic
        // implementation slots in
        struct FlatRateCalculator;

        #[async_trait]
        impl SalaryCalculator for FlatRateCalculator {
            async fn calculate(
                &self,
                gross_monthly: Decimal,
                _options: &CalculationOptions,
            ) -> AppResult<TaxBreakdown> {
                let paye = round_cents(gross_monthly * dec!(0.20));
                Ok(TaxBreakdown {
                    paye,
                    uif: Decimal::ZERO,
                    sdl: Decimal::ZERO,
                    net: gross_monthly - paye,
                })
            }
        }

        let calculator: Arc<dyn SalaryCalculator> = Arc::new(FlatRateCalculator);
        let breakdown = calculator
            .calculate(dec!(10000), &CalculationOptions::default())
            .await
            .unwrap();
        assert_eq!(breakdown.net, dec!(8000.00));
    }

    #[test]
    fn test_brackets_are_monotonic() {
        for pair in PAYE_BRACKETS.windows(2) {
            assert!(pair[0].0 < pair[1].0);
            assert!(pair[0].1 < pair[1].1);
        }
    }
}
