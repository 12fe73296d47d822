//! Loan and net-worth math behind the budgeting dashboards.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::Payload;

/// 50 лет помесячно; длиннее график растёт по мере заполнения
const MAX_PREALLOCATED_ROWS: u32 = 600;

fn monthly_rate(annual_rate_percent: f64) -> f64 {
    annual_rate_percent / 12.0 / 100.0
}

/// Ежемесячный аннуитетный платёж (EMI).
/// `P·r·(1+r)^n / ((1+r)^n − 1)`; при нулевой ставке `P / n`.
pub fn emi(principal: f64, annual_rate_percent: f64, tenure_months: u32) -> f64 {
    if tenure_months == 0 || principal <= 0.0 {
        return 0.0;
    }
    let n = tenure_months as f64;
    let r = monthly_rate(annual_rate_percent);
    if r <= 0.0 {
        return principal / n;
    }
    let growth = (1.0 + r).powf(n);
    if growth.is_infinite() {
        // при очень длинном сроке платёж стремится к одним процентам
        return principal * r;
    }
    principal * r * growth / (growth - 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmortizationRow {
    pub month: u32,
    pub emi: f64,
    pub interest: f64,
    pub principal: f64,
    pub balance: f64,
}

/// График погашения по месяцам. Последняя строка закрывает остаток целиком.
pub fn amortization_schedule(
    principal: f64,
    annual_rate_percent: f64,
    tenure_months: u32,
) -> Vec<AmortizationRow> {
    let payment = emi(principal, annual_rate_percent, tenure_months);
    if payment == 0.0 {
        return Vec::new();
    }
    let r = monthly_rate(annual_rate_percent).max(0.0);

    let mut balance = principal;
    let mut rows = Vec::with_capacity(tenure_months.min(MAX_PREALLOCATED_ROWS) as usize);
    for month in 1..=tenure_months {
        let interest = balance * r;
        let mut principal_part = payment - interest;
        let mut this_emi = payment;
        if month == tenure_months {
            principal_part = balance;
            this_emi = balance + interest;
        }
        balance = (balance - principal_part).max(0.0);
        rows.push(AmortizationRow {
            month,
            emi: this_emi,
            interest,
            principal: principal_part,
            balance,
        });
    }
    rows
}

fn total_interest(principal: f64, annual_rate_percent: f64, tenure_months: u32) -> f64 {
    amortization_schedule(principal, annual_rate_percent, tenure_months)
        .iter()
        .map(|row| row.interest)
        .sum()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefinanceComparison {
    pub current_emi: f64,
    pub new_emi: f64,
    pub monthly_savings: f64,
    pub current_total_interest: f64,
    pub new_total_interest: f64,
    /// Interest saved minus refinancing fees
    pub net_savings: f64,
    /// First month whose cumulative EMI saving covers the fees
    pub break_even_month: Option<u32>,
}

/// Сравнить текущий кредит с рефинансированием остатка по новой ставке
pub fn compare_refinance(
    outstanding: f64,
    current_rate_percent: f64,
    new_rate_percent: f64,
    remaining_months: u32,
    fees: f64,
) -> RefinanceComparison {
    let current_emi = emi(outstanding, current_rate_percent, remaining_months);
    let new_emi = emi(outstanding, new_rate_percent, remaining_months);
    let monthly_savings = current_emi - new_emi;
    let current_total_interest = total_interest(outstanding, current_rate_percent, remaining_months);
    let new_total_interest = total_interest(outstanding, new_rate_percent, remaining_months);

    let break_even_month = if monthly_savings > 0.0 {
        let months = (fees.max(0.0) / monthly_savings).ceil() as u32;
        let months = months.max(1);
        (months <= remaining_months).then_some(months)
    } else {
        None
    };

    RefinanceComparison {
        current_emi,
        new_emi,
        monthly_savings,
        current_total_interest,
        new_total_interest,
        net_savings: current_total_interest - new_total_interest - fees,
        break_even_month,
    }
}

/// Сумма числового поля по строкам, полученным из удалённой таблицы.
/// Числовые колонки приходят как числа или как строки; прочее игнорируется.
pub fn sum_field(rows: &[Payload], field: &str) -> f64 {
    rows.iter()
        .filter_map(|row| match row.get(field)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|v| v.is_finite())
        .sum()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetWorthSummary {
    pub total_assets: f64,
    pub total_liabilities: f64,
    pub net_worth: f64,
    pub assets_by_source: BTreeMap<String, f64>,
    pub liabilities_by_source: BTreeMap<String, f64>,
}

/// Агрегатор чистой стоимости по нескольким таблицам (накопления, счета, кредиты...)
#[derive(Debug, Default)]
pub struct NetWorthAggregator {
    assets: BTreeMap<String, f64>,
    liabilities: BTreeMap<String, f64>,
}

impl NetWorthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_asset(&mut self, source: &str, amount: f64) -> &mut Self {
        *self.assets.entry(source.to_string()).or_insert(0.0) += amount;
        self
    }

    pub fn add_liability(&mut self, source: &str, amount: f64) -> &mut Self {
        *self.liabilities.entry(source.to_string()).or_insert(0.0) += amount;
        self
    }

    pub fn add_asset_rows(&mut self, source: &str, rows: &[Payload], field: &str) -> &mut Self {
        self.add_asset(source, sum_field(rows, field))
    }

    pub fn add_liability_rows(
        &mut self,
        source: &str,
        rows: &[Payload],
        field: &str,
    ) -> &mut Self {
        self.add_liability(source, sum_field(rows, field))
    }

    pub fn summary(&self) -> NetWorthSummary {
        let total_assets: f64 = self.assets.values().sum();
        let total_liabilities: f64 = self.liabilities.values().sum();
        NetWorthSummary {
            total_assets,
            total_liabilities,
            net_worth: total_assets - total_liabilities,
            assets_by_source: self.assets.clone(),
            liabilities_by_source: self.liabilities.clone(),
        }
    }
}
