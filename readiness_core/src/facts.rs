//! Canonical fact model.
//!
//! Every connector normalizes its source records into these value types. One
//! row is one aggregation bucket: a `(date, channel)` for sales, an
//! `(as_of_date, bucket)` for aging snapshots.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Channel stored when a sales row carries none.
pub const DEFAULT_CHANNEL: &str = "default";

/// Daily sales totals for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesDaily {
    pub date: NaiveDate,
    #[serde(default)]
    pub channel: Option<String>,
    pub net_amount: Decimal,
    pub gross_amount: Decimal,
    pub orders: u64,
}

impl SalesDaily {
    /// Channel used as part of the persistence key.
    pub fn channel_key(&self) -> &str {
        match self.channel.as_deref() {
            Some(c) if !c.trim().is_empty() => c,
            _ => DEFAULT_CHANNEL,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.net_amount.is_sign_negative() || self.gross_amount.is_sign_negative() {
            return Err(Error::InvalidInput(format!(
                "sales amounts for {} must be non-negative",
                self.date
            )));
        }
        Ok(())
    }
}

/// Fixed age ranges for outstanding receivables/payables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgingBucket {
    #[serde(rename = "0-30")]
    Current,
    #[serde(rename = "31-60")]
    Days31To60,
    #[serde(rename = "61-90")]
    Days61To90,
    #[serde(rename = "90+")]
    Over90,
}

impl AgingBucket {
    pub const ALL: [AgingBucket; 4] = [
        AgingBucket::Current,
        AgingBucket::Days31To60,
        AgingBucket::Days61To90,
        AgingBucket::Over90,
    ];

    /// Bucket for an age in whole days. Documents dated after the snapshot
    /// (negative age) count as current.
    pub fn from_age_days(days: i64) -> Self {
        match days {
            i64::MIN..=30 => AgingBucket::Current,
            31..=60 => AgingBucket::Days31To60,
            61..=90 => AgingBucket::Days61To90,
            _ => AgingBucket::Over90,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgingBucket::Current => "0-30",
            AgingBucket::Days31To60 => "31-60",
            AgingBucket::Days61To90 => "61-90",
            AgingBucket::Over90 => "90+",
        }
    }
}

impl fmt::Display for AgingBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgingBucket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AgingBucket::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown aging bucket '{s}'")))
    }
}

/// Outstanding amount in one age bucket as of a snapshot date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingRow {
    pub as_of_date: NaiveDate,
    pub bucket: AgingBucket,
    pub amount: Decimal,
}

/// One survey response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpsRow {
    pub date: NaiveDate,
    #[serde(default)]
    pub respondent_id: Option<String>,
    pub score: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

impl NpsRow {
    pub fn new(
        date: NaiveDate,
        respondent_id: Option<String>,
        score: u8,
        comment: Option<String>,
    ) -> Result<Self> {
        let row = Self {
            date,
            respondent_id,
            score,
            comment,
        };
        row.validate()?;
        Ok(row)
    }

    pub fn validate(&self) -> Result<()> {
        if self.score > 10 {
            return Err(Error::InvalidInput(format!(
                "nps score {} is outside 0..=10",
                self.score
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HrAction {
    Hire,
    Exit,
}

impl HrAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HrAction::Hire => "hire",
            HrAction::Exit => "exit",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "hire" => Some(HrAction::Hire),
            "exit" => Some(HrAction::Exit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HrEvent {
    pub date: NaiveDate,
    pub employee_id: String,
    pub action: HrAction,
    #[serde(default)]
    pub department: Option<String>,
}

impl HrEvent {
    pub fn validate(&self) -> Result<()> {
        if self.employee_id.trim().is_empty() {
            return Err(Error::InvalidInput("hr event employee_id is empty".to_string()));
        }
        Ok(())
    }
}

/// Groups source documents into one `SalesDaily` row per date.
#[derive(Debug, Clone)]
pub struct SalesRollup {
    channel: Option<String>,
    by_date: BTreeMap<NaiveDate, (Decimal, Decimal, u64)>,
}

impl SalesRollup {
    pub fn new(channel: Option<&str>) -> Self {
        Self {
            channel: channel.map(str::to_string),
            by_date: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, date: NaiveDate, net: Decimal, gross: Decimal) {
        let entry = self
            .by_date
            .entry(date)
            .or_insert((Decimal::ZERO, Decimal::ZERO, 0));
        entry.0 += net;
        entry.1 += gross;
        entry.2 += 1;
    }

    /// Rows ordered by date.
    pub fn finish(self) -> Vec<SalesDaily> {
        let channel = self.channel;
        self.by_date
            .into_iter()
            .map(|(date, (net, gross, orders))| SalesDaily {
                date,
                channel: channel.clone(),
                net_amount: net,
                gross_amount: gross,
                orders,
            })
            .collect()
    }
}

/// Accumulates outstanding amounts into the four aging buckets.
#[derive(Debug, Clone)]
pub struct AgingRollup {
    as_of: NaiveDate,
    totals: BTreeMap<AgingBucket, Decimal>,
}

impl AgingRollup {
    pub fn new(as_of: NaiveDate) -> Self {
        let totals = AgingBucket::ALL
            .into_iter()
            .map(|b| (b, Decimal::ZERO))
            .collect();
        Self { as_of, totals }
    }

    pub fn add(&mut self, document_date: NaiveDate, amount: Decimal) {
        let age = (self.as_of - document_date).num_days();
        let bucket = AgingBucket::from_age_days(age);
        if let Some(total) = self.totals.get_mut(&bucket) {
            *total += amount;
        }
    }

    /// Always four rows, zero-amount buckets included.
    pub fn finish(self) -> Vec<AgingRow> {
        let as_of = self.as_of;
        self.totals
            .into_iter()
            .map(|(bucket, amount)| AgingRow {
                as_of_date: as_of,
                bucket,
                amount,
            })
            .collect()
    }
}

/// Parses an upstream amount given either as a JSON number or a numeric string.
///
/// Empty strings, `null` and `false` (Odoo's "no value") read as zero.
pub fn parse_amount(value: &serde_json::Value) -> Result<Decimal> {
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(false) => Ok(Decimal::ZERO),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| Error::InvalidInput(format!("invalid amount {n}: {e}"))),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(Decimal::ZERO),
        serde_json::Value::String(s) => Decimal::from_str(s.trim())
            .map_err(|e| Error::InvalidInput(format!("invalid amount '{s}': {e}"))),
        other => Err(Error::InvalidInput(format!("invalid amount {other}"))),
    }
}
