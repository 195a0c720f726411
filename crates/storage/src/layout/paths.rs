use std::collections::BTreeMap;

use riq_common::{Result, RiqError};
use riq_planner::LiteralValue;

use crate::catalog::TableDescriptor;

pub const DATA_FILE_NAME: &str = "data.parquet";
pub const MANIFEST_FILE_NAME: &str = "_METADATA.json";
/// Directory value for a null partition key.
pub const NULL_PARTITION_VALUE: &str = "__HIVE_DEFAULT_PARTITION__";

pub fn table_prefix(table: &str) -> String {
    format!("{table}/")
}

pub fn manifest_path(table: &str) -> String {
    format!("{table}/{MANIFEST_FILE_NAME}")
}

pub fn data_file_path(location: &str) -> String {
    if location.ends_with('/') {
        format!("{location}{DATA_FILE_NAME}")
    } else {
        format!("{location}/{DATA_FILE_NAME}")
    }
}

fn needs_escape(c: char) -> bool {
    c.is_control() || matches!(c, '/' | '=' | '%' | '#' | '\\')
}

/// Percent-encodes characters that cannot appear in a `key=value` segment.
pub fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if needs_escape(c) {
            let mut buf = [0_u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{b:02X}"));
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Decodes `%XX` sequences; malformed sequences are kept verbatim.
pub fn unescape_segment(escaped: &str) -> String {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(b) = hex {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Checks that `key_values` names exactly the table's partition keys with
/// values of the declared types.
pub fn validate_key_values(
    descriptor: &TableDescriptor,
    key_values: &BTreeMap<String, LiteralValue>,
) -> Result<()> {
    let invalid = |reason: String| RiqError::InvalidPartition {
        table: descriptor.name.clone(),
        reason,
    };
    if descriptor.partition_keys.is_empty() && key_values.is_empty() {
        return Ok(());
    }
    for key in &descriptor.partition_keys {
        let Some(value) = key_values.get(key) else {
            return Err(invalid(format!("missing value for partition key '{key}'")));
        };
        let def = descriptor.require_column(key)?;
        if !def.column_type.accepts(value) {
            return Err(invalid(format!(
                "value {value} for partition key '{key}' is not {:?}",
                def.column_type
            )));
        }
    }
    if let Some(extra) = key_values
        .keys()
        .find(|k| !descriptor.is_partition_key(k))
    {
        return Err(invalid(format!("'{extra}' is not a partition key")));
    }
    Ok(())
}

fn render_value(descriptor: &TableDescriptor, key: &str, value: &LiteralValue) -> String {
    match value {
        LiteralValue::Null => NULL_PARTITION_VALUE.to_string(),
        LiteralValue::Int64(v) => match descriptor.pad_width(key) {
            Some(width) if *v >= 0 => format!("{v:0width$}"),
            _ => v.to_string(),
        },
        other => escape_segment(&other.to_key_string()),
    }
}

/// `<table>/<k1>=<v1>/.../`, keys in declaration order.
pub fn partition_location(
    descriptor: &TableDescriptor,
    key_values: &BTreeMap<String, LiteralValue>,
) -> Result<String> {
    validate_key_values(descriptor, key_values)?;
    let mut out = table_prefix(&descriptor.name);
    for key in &descriptor.partition_keys {
        if let Some(value) = key_values.get(key) {
            out.push_str(&escape_segment(key));
            out.push('=');
            out.push_str(&render_value(descriptor, key, value));
            out.push('/');
        }
    }
    Ok(out)
}

/// Inverse of [`partition_location`]; accepts a location or a file path below it.
pub fn parse_partition_path(
    descriptor: &TableDescriptor,
    path: &str,
) -> Result<BTreeMap<String, LiteralValue>> {
    let invalid = |reason: String| RiqError::InvalidPartition {
        table: descriptor.name.clone(),
        reason,
    };
    let rest = path
        .strip_prefix(&table_prefix(&descriptor.name))
        .ok_or_else(|| invalid(format!("'{path}' is outside the table directory")))?;

    let mut out = BTreeMap::new();
    let mut segments = rest.split('/');
    for expected in &descriptor.partition_keys {
        let segment = segments.next().unwrap_or_default();
        let Some((raw_key, raw_value)) = segment.split_once('=') else {
            return Err(invalid(format!(
                "'{path}' has no segment for partition key '{expected}'"
            )));
        };
        let key = unescape_segment(raw_key);
        if key != *expected {
            return Err(invalid(format!(
                "unexpected partition segment '{segment}' in '{path}'"
            )));
        }
        let column_type = descriptor.require_column(&key)?.column_type;
        let value = if raw_value == NULL_PARTITION_VALUE {
            LiteralValue::Null
        } else {
            let text = unescape_segment(raw_value);
            column_type.parse_literal(&text).ok_or_else(|| {
                invalid(format!(
                    "value '{text}' of '{key}' is not {column_type:?}"
                ))
            })?
        };
        out.insert(key, value);
    }
    // at most a file name below the partition directory
    let tail = segments.collect::<Vec<_>>();
    if tail.len() > 1 || tail.first().is_some_and(|s| s.contains('=')) {
        return Err(invalid(format!(
            "'{path}' nests below its partition directory"
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnType, Sensitivity};
    use crate::test_util::fact_sales;

    fn keys(year: i64, month: i64) -> BTreeMap<String, LiteralValue> {
        BTreeMap::from([
            ("order_year".to_string(), LiteralValue::Int64(year)),
            ("order_month".to_string(), LiteralValue::Int64(month)),
        ])
    }

    #[test]
    fn location_follows_key_declaration_order_with_padding() {
        let d = fact_sales();
        let loc = partition_location(&d, &keys(2017, 1)).expect("location");
        assert_eq!(loc, "fact_sales/order_year=2017/order_month=01/");
        assert_eq!(
            data_file_path(&loc),
            "fact_sales/order_year=2017/order_month=01/data.parquet"
        );
        assert_eq!(parse_partition_path(&d, &loc).expect("parse"), keys(2017, 1));
        assert_eq!(
            parse_partition_path(&d, &data_file_path(&loc)).expect("parse file"),
            keys(2017, 1)
        );
    }

    #[test]
    fn string_values_are_escaped_and_round_trip() {
        let d = TableDescriptor::new(
            "dim_store",
            vec![
                ColumnDef::new("region", ColumnType::Utf8, Sensitivity::Low),
                ColumnDef::new("store_name", ColumnType::Utf8, Sensitivity::Low),
            ],
            &["region"],
        );
        for raw in ["North/East", "a=b", "50%", "#1", "plain"] {
            let kv = BTreeMap::from([("region".to_string(), LiteralValue::Utf8(raw.to_string()))]);
            let loc = partition_location(&d, &kv).expect("location");
            assert_eq!(loc.matches('/').count(), 2, "{loc}");
            assert_eq!(parse_partition_path(&d, &loc).expect("parse"), kv);
        }
        let null = BTreeMap::from([("region".to_string(), LiteralValue::Null)]);
        let loc = partition_location(&d, &null).expect("location");
        assert_eq!(loc, "dim_store/region=__HIVE_DEFAULT_PARTITION__/");
        assert_eq!(parse_partition_path(&d, &loc).expect("parse"), null);
    }

    #[test]
    fn rejects_incomplete_or_mistyped_keys() {
        let d = fact_sales();
        let mut partial = keys(2017, 1);
        partial.remove("order_month");
        assert!(matches!(
            partition_location(&d, &partial),
            Err(RiqError::InvalidPartition { .. })
        ));
        let mut mistyped = keys(2017, 1);
        mistyped.insert("order_month".to_string(), LiteralValue::Utf8("jan".to_string()));
        assert!(partition_location(&d, &mistyped).is_err());
        let mut extra = keys(2017, 1);
        extra.insert("location_key".to_string(), LiteralValue::Int64(3));
        assert!(partition_location(&d, &extra).is_err());
        assert!(parse_partition_path(&d, "fact_sales/order_month=01/order_year=2017/").is_err());
        assert!(parse_partition_path(&d, "fact_sales/order_year=2017/").is_err());
        assert!(
            parse_partition_path(&d, "fact_sales/order_year=2017/copy/order_month=01/").is_err()
        );
        assert!(
            parse_partition_path(&d, "fact_sales/order_year=2017/order_month=01/old/data.parquet")
                .is_err()
        );
    }

    #[test]
    fn malformed_escapes_are_kept() {
        assert_eq!(unescape_segment("100%"), "100%");
        assert_eq!(unescape_segment("%zz%41"), "%zzA");
        assert_eq!(escape_segment("a/b"), "a%2Fb");
    }
}
