//! Turns a pricing document into the hourly price table.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

use crate::PricingResult;

const RULE_WIDTH: usize = 52;
const TIME_WIDTH: usize = 25;
const PRICE_WIDTH: usize = 20;
const PRICE_DECIMALS: u32 = 6;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Offset timestamps that RFC 3339 rejects because seconds are missing.
const OFFSET_MINUTES_FORMAT: &str = "%Y-%m-%dT%H:%M%:z";
const NAIVE_ISO_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

pub const PARSE_FAILURE_MESSAGE: &str =
    "Could not parse pricing data. The structure may have changed.";

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("field `{0}` is missing or not a string")]
    MissingField(&'static str),
    #[error("invalid timestamp {value:?}: {source}")]
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("invalid price {0}")]
    InvalidPrice(String),
}

/// An ISO-8601 timestamp as sent by the API, kept in its own wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalTimestamp {
    local: NaiveDateTime,
    offset: Option<FixedOffset>,
}

impl IntervalTimestamp {
    /// Calendar date in the timestamp's own offset.
    pub fn date(&self) -> NaiveDate {
        self.local.date()
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        self.offset
    }
}

impl FromStr for IntervalTimestamp {
    type Err = chrono::ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_iso(raw.trim());
        let with_offset = DateTime::parse_from_rfc3339(&normalized).or_else(|err| {
            DateTime::parse_from_str(&normalized, OFFSET_MINUTES_FORMAT).map_err(|_| err)
        });
        match with_offset {
            Ok(timestamp) => Ok(Self {
                local: timestamp.naive_local(),
                offset: Some(*timestamp.offset()),
            }),
            Err(err) => NAIVE_ISO_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(&normalized, format).ok())
                .map(|local| Self { local, offset: None })
                .ok_or(err),
        }
    }
}

impl fmt::Display for IntervalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self.offset {
            Some(offset) => format!(
                "{} {}",
                self.local.format(TIMESTAMP_FORMAT),
                utc_designator(offset)
            ),
            None => self.local.format(TIMESTAMP_FORMAT).to_string(),
        };
        f.pad(&text)
    }
}

/// Brings ISO-8601 variants into the RFC 3339 shape: `T` between date and
/// time, `Z` spelled `+00:00`, and a trailing `+hhmm` offset as `+hh:mm`.
fn normalize_iso(raw: &str) -> String {
    let mut text = match (raw.get(..10), raw.get(10..)) {
        (Some(date), Some(rest)) if rest.starts_with(' ') => format!("{date}T{}", &rest[1..]),
        _ => raw.to_owned(),
    };
    if !text.contains('T') {
        return text;
    }
    if text.ends_with(['Z', 'z']) {
        text.pop();
        text.push_str("+00:00");
        return text;
    }
    if let Some(split) = text.len().checked_sub(5) {
        let compact_offset = text.get(split..).is_some_and(|tail| {
            tail.starts_with(['+', '-']) && tail[1..].bytes().all(|b| b.is_ascii_digit())
        });
        if compact_offset {
            text.insert(split + 3, ':');
        }
    }
    text
}

/// `UTC` for a zero offset, otherwise `UTC±hh:mm`.
fn utc_designator(offset: FixedOffset) -> String {
    let seconds = offset.local_minus_utc();
    if seconds == 0 {
        return "UTC".to_owned();
    }
    let sign = if seconds < 0 { '-' } else { '+' };
    let seconds = seconds.unsigned_abs();
    let (hours, minutes, rest) = (seconds / 3600, seconds % 3600 / 60, seconds % 60);
    if rest == 0 {
        format!("UTC{sign}{hours:02}:{minutes:02}")
    } else {
        format!("UTC{sign}{hours:02}:{minutes:02}:{rest:02}")
    }
}

/// One hourly row of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalRecord {
    pub timestamp: IntervalTimestamp,
    pub price_cents_per_kwh: Decimal,
}

impl TryFrom<&Value> for IntervalRecord {
    type Error = RecordError;

    fn try_from(detail: &Value) -> Result<Self, Self::Error> {
        let raw_time = detail
            .get("startIntervalTimeStamp")
            .and_then(Value::as_str)
            .ok_or(RecordError::MissingField("startIntervalTimeStamp"))?;
        let timestamp = raw_time
            .parse()
            .map_err(|source| RecordError::InvalidTimestamp {
                value: raw_time.to_owned(),
                source,
            })?;

        let raw_price = detail
            .get("intervalPrice")
            .ok_or(RecordError::MissingField("intervalPrice"))?;
        let price_cents_per_kwh = parse_price(raw_price)
            .and_then(|price| price.checked_mul(Decimal::ONE_HUNDRED))
            .ok_or_else(|| RecordError::InvalidPrice(raw_price.to_string()))?;

        Ok(Self {
            timestamp,
            price_cents_per_kwh,
        })
    }
}

/// Prices arrive in $/kWh, either as a JSON string or a JSON number.
fn parse_price(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::String(text) => Cow::Borrowed(text.trim()),
        Value::Number(number) => Cow::Owned(number.to_string()),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// The first day of a pricing document: its caption date and raw interval entries.
#[derive(Debug, Clone, Copy)]
pub struct PricingDay<'a> {
    pub date: NaiveDate,
    pub details: &'a [Value],
}

impl<'a> PricingDay<'a> {
    /// Interval records in the order the API sent them.
    pub fn records(&self) -> impl Iterator<Item = Result<IntervalRecord, RecordError>> + 'a {
        let details = self.details;
        details.iter().map(IntervalRecord::try_from)
    }
}

/// Looks up `data[0].priceDetails` and `data[0].priceHeader.startTime`.
///
/// Returns `None` as soon as any step is missing or has the wrong type.
pub fn locate_pricing_day(document: &Value) -> Option<PricingDay<'_>> {
    let day = document.get("data")?.as_array()?.first()?;
    let details = day.get("priceDetails")?.as_array()?;
    let start_time: IntervalTimestamp = day
        .get("priceHeader")?
        .get("startTime")?
        .as_str()?
        .parse()
        .ok()?;

    Some(PricingDay {
        date: start_time.date(),
        details,
    })
}

pub fn format_price_cell(price_cents_per_kwh: Decimal) -> String {
    let price = price_cents_per_kwh.round_dp(PRICE_DECIMALS);
    format!(
        "{:>width$}",
        format!("{price:.prec$}", prec = PRICE_DECIMALS as usize),
        width = PRICE_WIDTH
    )
}

pub fn format_row(record: &IntervalRecord) -> String {
    format!(
        "| {:<width$} | {} |",
        record.timestamp,
        format_price_cell(record.price_cents_per_kwh),
        width = TIME_WIDTH
    )
}

fn write_rule<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "{:-<width$}", "", width = RULE_WIDTH)
}

fn write_header<W: Write>(out: &mut W, date: NaiveDate) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "--- Hourly Electricity Pricing for {} ---", date.format("%Y-%m-%d"))?;
    write_rule(out)?;
    writeln!(
        out,
        "| {:<time$} | {:>price$} |",
        "Start Time",
        "Price ($c/kWh)",
        time = TIME_WIDTH,
        price = PRICE_WIDTH
    )?;
    write_rule(out)
}

/// Write the pricing table for `result` to `out`.
///
/// A failed fetch becomes one `An error occurred: ..` line. A document without
/// the expected shape is reported with a dump of what was received. An
/// interval record that cannot be read stops the table at that row.
pub fn render<W: Write>(out: &mut W, result: &PricingResult) -> io::Result<()> {
    let document = match result {
        Ok(document) => document,
        Err(err) => return writeln!(out, "An error occurred: {err}"),
    };

    let Some(day) = locate_pricing_day(document) else {
        tracing::debug!("pricing document does not have the expected shape");
        writeln!(out, "{PARSE_FAILURE_MESSAGE}")?;
        return writeln!(out, "Received data: {document}");
    };

    write_header(out, day.date)?;
    for (index, record) in day.records().enumerate() {
        match record {
            Ok(record) => writeln!(out, "{}", format_row(&record))?,
            Err(err) => {
                tracing::debug!(row = index + 1, error = %err, "unreadable interval record");
                return writeln!(out, "Could not parse interval record {}: {err}", index + 1);
            }
        }
    }
    write_rule(out)
}

/// [`render`] into stdout.
pub fn print_pricing(result: &PricingResult) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    render(&mut out, result)
}
