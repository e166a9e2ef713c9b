//! Conversion of MySQL rows into JSON rows.
//!
//! Statements run over the text protocol, so most values arrive as bytes. The
//! column type decides how they are interpreted: integers and floating point
//! columns become JSON numbers, `JSON` columns are parsed, binary columns are
//! base64 encoded and everything else (including `DECIMAL`, which would lose
//! precision as a float) stays a string.

use mysql_async::consts::ColumnType;
use mysql_async::{Column, Row as MysqlRow, Value};
use prax_batch::Row;
use serde_json::Value as JsonValue;

/// Character set number MySQL reports for binary columns.
const BINARY_CHARSET: u16 = 63;

/// Convert a MySQL row into a JSON row, keeping column order.
pub fn row_to_json(row: MysqlRow) -> Row {
    let columns = row.columns();
    let values = row.unwrap();

    columns
        .iter()
        .zip(values)
        .map(|(column, value)| (column.name_str().into_owned(), from_mysql_value(value, column)))
        .collect()
}

/// Convert a single MySQL value to JSON according to its column.
pub fn from_mysql_value(value: Value, column: &Column) -> JsonValue {
    match value {
        Value::NULL => JsonValue::Null,
        Value::Bytes(bytes) => from_text(bytes, column.column_type(), column.character_set()),
        Value::Int(i) => JsonValue::Number(i.into()),
        Value::UInt(u) => JsonValue::Number(u.into()),
        Value::Float(f) => float(f64::from(f)),
        Value::Double(d) => float(d),
        Value::Date(year, month, day, hour, minute, second, micro) => {
            let mut text = format!("{:04}-{:02}-{:02}", year, month, day);
            if column.column_type() != ColumnType::MYSQL_TYPE_DATE {
                text.push_str(&format!(" {:02}:{:02}:{:02}", hour, minute, second));
                if micro > 0 {
                    text.push_str(&format!(".{:06}", micro));
                }
            }
            JsonValue::String(text)
        }
        Value::Time(is_neg, days, hours, minutes, seconds, micro) => {
            let sign = if is_neg { "-" } else { "" };
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                days * 24 + u32::from(hours),
                minutes,
                seconds
            );
            if micro > 0 {
                text.push_str(&format!(".{:06}", micro));
            }
            JsonValue::String(text)
        }
    }
}

fn from_text(bytes: Vec<u8>, column_type: ColumnType, charset: u16) -> JsonValue {
    use ColumnType::*;

    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => return JsonValue::String(base64_encode(err.as_bytes())),
    };

    match column_type {
        MYSQL_TYPE_TINY | MYSQL_TYPE_SHORT | MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG
        | MYSQL_TYPE_LONGLONG | MYSQL_TYPE_YEAR => integer(text),
        MYSQL_TYPE_FLOAT | MYSQL_TYPE_DOUBLE => match text.parse::<f64>() {
            Ok(value) => float(value),
            Err(_) => JsonValue::String(text),
        },
        MYSQL_TYPE_JSON => serde_json::from_str(&text).unwrap_or(JsonValue::String(text)),
        MYSQL_TYPE_BIT => JsonValue::String(base64_encode(text.as_bytes())),
        MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB | MYSQL_TYPE_BLOB
        | MYSQL_TYPE_VAR_STRING | MYSQL_TYPE_STRING | MYSQL_TYPE_VARCHAR
            if charset == BINARY_CHARSET =>
        {
            JsonValue::String(base64_encode(text.as_bytes()))
        }
        _ => JsonValue::String(text),
    }
}

fn integer(text: String) -> JsonValue {
    if let Ok(i) = text.parse::<i64>() {
        JsonValue::Number(i.into())
    } else if let Ok(u) = text.parse::<u64>() {
        JsonValue::Number(u.into())
    } else {
        JsonValue::String(text)
    }
}

fn float(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Standard base64 with padding.
fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);

        for (i, shift) in [18u32, 12, 6, 0].into_iter().enumerate() {
            if i <= chunk.len() {
                out.push(ALPHABET[((n >> shift) & 0x3f) as usize] as char);
            } else {
                out.push('=');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base64() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg==");
        assert_eq!(base64_encode(b"fo"), "Zm8=");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        assert_eq!(base64_encode(&[0xff, 0x00, 0x10, 0x80]), "/wAQgA==");
    }

    #[test]
    fn test_text_integers() {
        assert_eq!(
            from_text(b"42".to_vec(), ColumnType::MYSQL_TYPE_LONG, 33),
            json!(42)
        );
        assert_eq!(
            from_text(b"-7".to_vec(), ColumnType::MYSQL_TYPE_TINY, 33),
            json!(-7)
        );
        assert_eq!(
            from_text(b"18446744073709551615".to_vec(), ColumnType::MYSQL_TYPE_LONGLONG, 33),
            json!(18446744073709551615u64)
        );
    }

    #[test]
    fn test_text_decimal_stays_string() {
        assert_eq!(
            from_text(b"10.50".to_vec(), ColumnType::MYSQL_TYPE_NEWDECIMAL, 33),
            json!("10.50")
        );
    }

    #[test]
    fn test_text_double_and_json() {
        assert_eq!(
            from_text(b"1.5".to_vec(), ColumnType::MYSQL_TYPE_DOUBLE, 33),
            json!(1.5)
        );
        assert_eq!(
            from_text(br#"{"a":[1,2]}"#.to_vec(), ColumnType::MYSQL_TYPE_JSON, 33),
            json!({"a": [1, 2]})
        );
    }

    #[test]
    fn test_text_strings_and_binary() {
        assert_eq!(
            from_text(b"123".to_vec(), ColumnType::MYSQL_TYPE_VAR_STRING, 255),
            json!("123")
        );
        assert_eq!(
            from_text(b"foo".to_vec(), ColumnType::MYSQL_TYPE_BLOB, BINARY_CHARSET),
            json!("Zm9v")
        );
        assert_eq!(
            from_text(vec![0xff, 0xfe], ColumnType::MYSQL_TYPE_BLOB, 33),
            json!("//4=")
        );
    }
}
