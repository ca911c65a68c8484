use crate::config::ColumnMap;
use csv_async::StringRecord;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// One input row, addressed by header name.
///
/// The header record is shared by every row of a stream.
#[derive(Debug, Clone)]
pub struct RawRecord {
    headers: Arc<StringRecord>,
    values: StringRecord,
}

impl RawRecord {
    pub fn new(headers: Arc<StringRecord>, values: StringRecord) -> Self {
        Self { headers, values }
    }

    /// Build a record from `(column, value)` pairs. Mostly useful in tests.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = StringRecord::new();
        let mut values = StringRecord::new();
        for (k, v) in pairs {
            headers.push_field(k.as_ref());
            values.push_field(v.as_ref());
        }
        Self::new(Arc::new(headers), values)
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|h| h == column)
            .and_then(|idx| self.values.get(idx))
    }

    /// Field bytes held by this row (delimiters and quotes excluded).
    pub fn byte_len(&self) -> usize {
        self.values.as_slice().len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().zip(self.values.iter())
    }
}

/// A row that passed every validation rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub key: String,
    pub label: String,
    pub amount: f64,
}

/// Why a row was rejected. Serialized as its reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rejection {
    #[serde(rename = "Missing or Invalid SKU")]
    MissingKey,
    #[serde(rename = "Empty SKU")]
    EmptyKey,
    #[serde(rename = "Missing Name")]
    MissingLabel,
    /// Non-numeric, non-finite, zero and negative amounts alike.
    #[serde(rename = "Invalid Price")]
    InvalidAmount,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::MissingKey => "Missing or Invalid SKU",
            Rejection::EmptyKey => "Empty SKU",
            Rejection::MissingLabel => "Missing Name",
            Rejection::InvalidAmount => "Invalid Price",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// A row that failed validation; reported, never retried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
    /// The raw key as it appeared in the input, if any.
    pub key: Option<String>,
    pub reason: Rejection,
}

/// Maps a [`RawRecord`] to a [`NormalizedRecord`]. Rules apply in order, first
/// failure wins.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    columns: ColumnMap,
}

impl Validator {
    pub fn new(columns: ColumnMap) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &ColumnMap {
        &self.columns
    }

    /// The amount must parse as a whole `f64`: a numeric prefix such as `10abc`
    /// is rejected rather than read as 10.
    pub fn validate(&self, raw: &RawRecord) -> Result<NormalizedRecord, Rejection> {
        // an absent or empty key is missing; only whitespace counts as empty
        let key = raw
            .get(&self.columns.key)
            .filter(|k| !k.is_empty())
            .ok_or(Rejection::MissingKey)?
            .trim();
        if key.is_empty() {
            return Err(Rejection::EmptyKey);
        }

        let label = raw
            .get(&self.columns.label)
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(Rejection::MissingLabel)?;

        let amount = raw
            .get(&self.columns.amount)
            .and_then(|a| a.trim().parse::<f64>().ok())
            .filter(|a| a.is_finite() && *a > 0.0)
            .ok_or(Rejection::InvalidAmount)?;

        Ok(NormalizedRecord {
            key: key.to_string(),
            label: label.to_string(),
            amount,
        })
    }

    /// Validate and, on failure, keep the raw key for the operator report.
    pub fn check(&self, raw: &RawRecord) -> Result<NormalizedRecord, RejectedRecord> {
        self.validate(raw).map_err(|reason| RejectedRecord {
            key: raw.get(&self.columns.key).map(str::to_string),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sku: &str, name: &str, price: &str) -> RawRecord {
        RawRecord::from_pairs([("sku", sku), ("name", name), ("price", price)])
    }

    #[test]
    fn accepts_and_trims_valid_row() {
        let v = Validator::default();
        let rec = v.validate(&row("  SKU1 ", "Product 1", "10.50")).unwrap();
        assert_eq!(
            rec,
            NormalizedRecord {
                key: "SKU1".into(),
                label: "Product 1".into(),
                amount: 10.5,
            }
        );
    }

    #[test]
    fn key_rules_come_first() {
        let v = Validator::default();
        let missing = RawRecord::from_pairs([("name", "x"), ("price", "abc")]);
        assert_eq!(v.validate(&missing), Err(Rejection::MissingKey));
        assert_eq!(v.validate(&row("", "x", "1")), Err(Rejection::MissingKey));
        assert_eq!(v.validate(&row("   ", "", "-1")), Err(Rejection::EmptyKey));
        assert_eq!(v.validate(&row("SKU4", "", "10")), Err(Rejection::MissingLabel));
    }

    #[test]
    fn every_bad_amount_shares_one_reason() {
        let v = Validator::default();
        for price in ["-5", "0", "0.0", "abc", "", "NaN", "inf", "-inf"] {
            assert_eq!(
                v.validate(&row("SKU", "Name", price)),
                Err(Rejection::InvalidAmount),
                "price {price:?}"
            );
        }
        assert_eq!(Rejection::InvalidAmount.to_string(), "Invalid Price");
    }

    #[test]
    fn numeric_prefix_is_not_an_amount() {
        let v = Validator::default();
        assert_eq!(
            v.validate(&row("SKU", "Name", "10abc")),
            Err(Rejection::InvalidAmount)
        );
        assert_eq!(v.validate(&row("SKU", "Name", " 10 ")).unwrap().amount, 10.0);
    }

    #[test]
    fn check_keeps_raw_key() {
        let v = Validator::default();
        let rejected = v.check(&row("SKU2", "Negative", "-5")).unwrap_err();
        assert_eq!(rejected.key.as_deref(), Some("SKU2"));
        assert_eq!(rejected.reason, Rejection::InvalidAmount);
        assert_eq!(
            serde_json::to_string(&rejected).unwrap(),
            r#"{"key":"SKU2","reason":"Invalid Price"}"#
        );
    }

    #[test]
    fn custom_columns() {
        let v = Validator::new(ColumnMap {
            key: "id".into(),
            label: "title".into(),
            amount: "cost".into(),
        });
        let raw = RawRecord::from_pairs([("cost", "3"), ("title", "t"), ("id", "A")]);
        assert_eq!(v.validate(&raw).unwrap().key, "A");
        assert_eq!(
            raw.iter().collect::<Vec<_>>(),
            vec![("cost", "3"), ("title", "t"), ("id", "A")]
        );
    }
}
