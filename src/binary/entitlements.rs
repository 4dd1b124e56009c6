//! Plist to JSON conversion
//!
//! Entitlements come out of `codesign` and Spotlight metadata out of `mdls`
//! as plist documents; consumers get both as JSON-compatible values.

use std::collections::HashMap;
use std::io::Cursor;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Parse a plist document whose root is a dictionary into a key/value map.
/// Empty input gives an empty map.
pub fn parse_plist_dict(bytes: &[u8]) -> Result<HashMap<String, Value>, plist::Error> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }

    let value = plist::Value::from_reader(Cursor::new(bytes))?;
    Ok(plist_to_json_map(value))
}

/// Convert a plist dictionary to a JSON-compatible map. Non-dictionary
/// roots give an empty map.
pub fn plist_to_json_map(plist_value: plist::Value) -> HashMap<String, Value> {
    match plist_value {
        plist::Value::Dictionary(dict) => dict
            .into_iter()
            .map(|(key, value)| (key, plist_value_to_json_value(value)))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Convert plist::Value to serde_json::Value
pub fn plist_value_to_json_value(plist_value: plist::Value) -> Value {
    match plist_value {
        plist::Value::String(s) => Value::String(s),
        plist::Value::Boolean(b) => Value::Bool(b),
        plist::Value::Integer(i) => {
            if let Some(signed) = i.as_signed() {
                Value::Number(signed.into())
            } else if let Some(unsigned) = i.as_unsigned() {
                Value::Number(unsigned.into())
            } else {
                Value::String(i.to_string())
            }
        }
        plist::Value::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        plist::Value::Array(arr) => {
            Value::Array(arr.into_iter().map(plist_value_to_json_value).collect())
        }
        plist::Value::Dictionary(dict) => Value::Object(
            dict.into_iter()
                .map(|(key, value)| (key, plist_value_to_json_value(value)))
                .collect(),
        ),
        plist::Value::Data(data) => Value::String(format!("0x{}", hex::encode(data))),
        plist::Value::Date(date) => {
            let date: DateTime<Utc> = SystemTime::from(date).into();
            Value::String(date.to_rfc3339())
        }
        // UIDs only appear in keyed archives
        plist::Value::Uid(_) => Value::Null,
        other => Value::String(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SANDBOX_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>com.apple.security.app-sandbox</key>
    <true/>
    <key>com.apple.application-identifier</key>
    <string>ABCDE12345.com.example.app</string>
    <key>com.apple.developer.team-identifier</key>
    <string>ABCDE12345</string>
    <key>com.apple.security.temporary-exception.mach-lookup.global-name</key>
    <array>
        <string>com.apple.one</string>
        <string>com.apple.two</string>
    </array>
    <key>com.example.limit</key>
    <integer>42</integer>
    <key>com.example.nested</key>
    <dict>
        <key>enabled</key>
        <false/>
    </dict>
</dict>
</plist>"#;

    #[test]
    fn test_parse_entitlement_plist_types() {
        let entitlements = parse_plist_dict(SANDBOX_PLIST.as_bytes()).unwrap();

        assert_eq!(entitlements.len(), 6);
        assert_eq!(entitlements["com.apple.security.app-sandbox"], Value::Bool(true));
        assert_eq!(
            entitlements["com.apple.developer.team-identifier"],
            Value::String("ABCDE12345".to_string())
        );
        assert_eq!(entitlements["com.example.limit"], serde_json::json!(42));
        assert_eq!(
            entitlements["com.apple.security.temporary-exception.mach-lookup.global-name"],
            serde_json::json!(["com.apple.one", "com.apple.two"])
        );
        assert_eq!(entitlements["com.example.nested"], serde_json::json!({"enabled": false}));
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_plist_dict(b"").unwrap().is_empty());
        assert!(parse_plist_dict(b"  \n").unwrap().is_empty());
    }

    #[test]
    fn test_non_dictionary_root_is_empty() {
        let array_plist = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><array><string>x</string></array></plist>"#;
        assert!(parse_plist_dict(array_plist.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_parse_spotlight_metadata_plist() {
        let mdls_plist = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>kMDItemDisplayName</key>
    <string>Sample.app</string>
    <key>kMDItemContentCreationDate</key>
    <date>2024-03-01T12:00:00Z</date>
    <key>kMDItemWhereFroms</key>
    <array>
        <string>https://example.com/Sample.dmg</string>
    </array>
</dict>
</plist>"#;
        let metadata = parse_plist_dict(mdls_plist.as_bytes()).unwrap();

        assert_eq!(metadata["kMDItemDisplayName"], serde_json::json!("Sample.app"));
        assert_eq!(
            metadata["kMDItemContentCreationDate"],
            serde_json::json!("2024-03-01T12:00:00+00:00")
        );
        assert_eq!(
            metadata["kMDItemWhereFroms"],
            serde_json::json!(["https://example.com/Sample.dmg"])
        );
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_plist_dict(b"not a plist at all").is_err());
    }

    #[test]
    fn test_data_values_hex_encoded() {
        let value = plist_value_to_json_value(plist::Value::Data(vec![0xde, 0xad]));
        assert_eq!(value, Value::String("0xdead".to_string()));
    }
}
