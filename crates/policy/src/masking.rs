//! Column masking rules.
//!
//! Every rule is total over every column type and keeps nulls null, so a
//! masked column has the same Arrow type as the raw one.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use riq_common::{Result, RiqError};
use serde::{Deserialize, Serialize};

const REDACTED: &str = "***";
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaskingRuleId {
    /// `"John Smith"` -> `"J***"`.
    FirstCharacter,
    /// `"john@example.com"` -> `"j***@example.com"`.
    Email,
    /// Constant placeholder: `"***"`, zero or `false`.
    Redact,
    /// Deterministic FNV-1a 64 digest; equal inputs stay joinable.
    Hash,
    NullOut,
}

impl MaskingRuleId {
    /// Masks one string value; `None` means null.
    pub fn mask_str(self, value: &str) -> Option<String> {
        match self {
            MaskingRuleId::FirstCharacter => Some(match value.chars().next() {
                Some(c) => format!("{c}{REDACTED}"),
                None => REDACTED.to_string(),
            }),
            MaskingRuleId::Email => Some(match value.split_once('@') {
                Some((local, domain)) => {
                    let first = local.chars().next().map(String::from).unwrap_or_default();
                    format!("{first}{REDACTED}@{domain}")
                }
                None => "***@***.com".to_string(),
            }),
            MaskingRuleId::Redact => Some(REDACTED.to_string()),
            MaskingRuleId::Hash => Some(format!("{:016x}", fnv1a(value.as_bytes()))),
            MaskingRuleId::NullOut => None,
        }
    }

    fn mask_i64(self, value: i64) -> Option<i64> {
        match self {
            MaskingRuleId::Hash => Some(fnv1a(&value.to_le_bytes()) as i64),
            MaskingRuleId::NullOut => None,
            _ => Some(0),
        }
    }

    fn mask_f64(self, value: f64) -> Option<f64> {
        match self {
            // 53 bits keep the digest exact and finite
            MaskingRuleId::Hash => Some((fnv1a(&value.to_bits().to_le_bytes()) >> 11) as f64),
            MaskingRuleId::NullOut => None,
            _ => Some(0.0),
        }
    }

    fn mask_bool(self, value: bool) -> Option<bool> {
        match self {
            MaskingRuleId::Hash => Some(fnv1a(&[u8::from(value)]) & 1 == 1),
            MaskingRuleId::NullOut => None,
            _ => Some(false),
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Applies `rule` to every non-null value of `column`.
///
/// Returns the masked column and how many values were masked.
pub fn apply_mask(rule: MaskingRuleId, column: &ArrayRef) -> Result<(ArrayRef, u64)> {
    let masked = (column.len() - column.null_count()) as u64;
    let out: ArrayRef = match column.data_type() {
        DataType::Utf8 => {
            let values = column.as_string::<i32>();
            Arc::new(
                values
                    .iter()
                    .map(|v| v.and_then(|s| rule.mask_str(s)))
                    .collect::<StringArray>(),
            )
        }
        DataType::Int64 => {
            let values = column.as_primitive::<Int64Type>();
            Arc::new(
                values
                    .iter()
                    .map(|v| v.and_then(|x| rule.mask_i64(x)))
                    .collect::<Int64Array>(),
            )
        }
        DataType::Float64 => {
            let values = column.as_primitive::<Float64Type>();
            Arc::new(
                values
                    .iter()
                    .map(|v| v.and_then(|x| rule.mask_f64(x)))
                    .collect::<Float64Array>(),
            )
        }
        DataType::Boolean => {
            let values = column.as_boolean();
            Arc::new(
                values
                    .iter()
                    .map(|v| v.and_then(|x| rule.mask_bool(x)))
                    .collect::<BooleanArray>(),
            )
        }
        DataType::Null => return Ok((Arc::clone(column), 0)),
        other => {
            return Err(RiqError::Unsupported(format!(
                "masking columns of type {other}"
            )))
        }
    };
    Ok((out, masked))
}
