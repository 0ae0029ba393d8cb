//! Header resolution
//!
//! Maps normalized header names to column positions and rejects a header that
//! lacks any required field, before a single data row is read.

use std::collections::HashMap;

use crate::error::{IngestError, IngestResult};

/// Required fields other than the key, in the order they are reported
pub const REQUIRED_FIELDS: [&str; 5] = [
    "email",
    "monthly_income",
    "credit_score",
    "employment_status",
    "age",
];

/// Accepted header names for the key column, in order of preference
pub const KEY_COLUMNS: [&str; 2] = ["user_id", "subject_id"];

/// Resolved positions of the six required fields
///
/// Built once per file and shared read-only by every parser worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    positions: HashMap<String, usize>,
    pub subject_id: usize,
    pub email: usize,
    pub monthly_income: usize,
    pub credit_score: usize,
    pub employment_status: usize,
    pub age: usize,
}

impl ColumnMapping {
    /// Build the mapping from the header row
    ///
    /// Names are trimmed and lower-cased. Extra columns are kept in the
    /// mapping but otherwise ignored. When a name repeats, the last
    /// occurrence wins.
    pub fn resolve<'a, I>(header: I) -> IngestResult<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let positions: HashMap<String, usize> = header
            .into_iter()
            .enumerate()
            .map(|(index, name)| (normalize(name), index))
            .collect();

        let key = KEY_COLUMNS.iter().find_map(|name| positions.get(*name).copied());

        let mut missing = Vec::new();
        if key.is_none() {
            missing.push(KEY_COLUMNS[0].to_string());
        }
        missing.extend(
            REQUIRED_FIELDS
                .iter()
                .filter(|name| !positions.contains_key(**name))
                .map(|name| name.to_string()),
        );

        let position = |name: &str| positions.get(name).copied();
        match (
            key,
            position("email"),
            position("monthly_income"),
            position("credit_score"),
            position("employment_status"),
            position("age"),
        ) {
            (
                Some(subject_id),
                Some(email),
                Some(monthly_income),
                Some(credit_score),
                Some(employment_status),
                Some(age),
            ) => Ok(Self {
                positions,
                subject_id,
                email,
                monthly_income,
                credit_score,
                employment_status,
                age,
            }),
            _ => Err(IngestError::Schema { missing }),
        }
    }

    /// Position of any header column, by case-insensitive name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(&normalize(name)).copied()
    }

    pub fn column_count(&self) -> usize {
        self.positions.len()
    }
}

fn normalize(name: &str) -> String {
    // Spreadsheet exports often prefix the first header with a byte order mark
    name.trim_start_matches('\u{feff}').trim().to_lowercase()
}
