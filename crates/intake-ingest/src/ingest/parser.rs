//! Row validation
//!
//! [`parse_record`] is a pure function over a borrowed row and the shared
//! column mapping, so any number of workers may call it concurrently.

use csv_async::StringRecord;
use sqlx::types::BigDecimal;
use std::str::FromStr;

use super::columns::ColumnMapping;
use super::models::SubjectRecord;
use crate::error::DiscardReason;

/// Digits allowed before the decimal point of `monthly_income`
pub const MAX_INTEGER_DIGITS: u64 = 65_536;

/// Digits allowed after the decimal point of `monthly_income` (NUMERIC's limit)
pub const MAX_SCALE: i64 = 16_383;

/// Convert one row into a [`SubjectRecord`], or say why it was discarded
///
/// String fields are trimmed. Numeric fields are trimmed and then parsed
/// strictly: `monthly_income` as a plain decimal, `credit_score` and `age`
/// as 32-bit integers. An empty key is rejected because it cannot identify a
/// row in the store.
pub fn parse_record(
    fields: &StringRecord,
    mapping: &ColumnMapping,
) -> Result<SubjectRecord, DiscardReason> {
    let subject_id = field(fields, mapping.subject_id, "subject_id")?;
    if subject_id.is_empty() {
        return Err(DiscardReason::InvalidField("subject_id"));
    }

    Ok(SubjectRecord {
        subject_id: subject_id.to_string(),
        email: field(fields, mapping.email, "email")?.to_string(),
        monthly_income: decimal(fields, mapping.monthly_income, "monthly_income")?,
        credit_score: number(fields, mapping.credit_score, "credit_score")?,
        employment_status: field(fields, mapping.employment_status, "employment_status")?
            .to_string(),
        age: number(fields, mapping.age, "age")?,
    })
}

fn field<'r>(
    fields: &'r StringRecord,
    index: usize,
    name: &'static str,
) -> Result<&'r str, DiscardReason> {
    fields
        .get(index)
        .map(str::trim)
        .ok_or(DiscardReason::MissingField(name))
}

fn number<T: FromStr>(
    fields: &StringRecord,
    index: usize,
    name: &'static str,
) -> Result<T, DiscardReason> {
    field(fields, index, name)?
        .parse()
        .map_err(|_| DiscardReason::InvalidField(name))
}

/// Plain decimal notation only, bounded to what a NUMERIC bind can encode
///
/// Exponent forms such as `1e200000` parse as `BigDecimal` but cannot be
/// bound, which would fail the whole batch they land in.
fn decimal(
    fields: &StringRecord,
    index: usize,
    name: &'static str,
) -> Result<BigDecimal, DiscardReason> {
    let raw = field(fields, index, name)?;
    if raw.contains(['e', 'E']) {
        return Err(DiscardReason::InvalidField(name));
    }

    let value: BigDecimal = raw.parse().map_err(|_| DiscardReason::InvalidField(name))?;
    let (_, scale) = value.as_bigint_and_exponent();
    let integer_digits = value.digits() as i64 - scale;

    if !(0..=MAX_SCALE).contains(&scale) || integer_digits > MAX_INTEGER_DIGITS as i64 {
        return Err(DiscardReason::InvalidField(name));
    }
    Ok(value)
}
