// Deserializers for numbers that arrive either as JSON numbers or as strings.
// OKX encodes every numeric field as a string, and older state files stored
// sizes as formatted strings.

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrString {
    Num(f64),
    Str(String),
}

/// Parse a number or numeric string; empty strings become 0.0
pub fn f64_lenient<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) if s.trim().is_empty() => Ok(0.0),
        NumOrString::Str(s) => s.trim().parse::<f64>().map_err(de::Error::custom),
    }
}

/// Parse an optional number or numeric string; empty strings and null become None
pub fn opt_f64_lenient<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(NumOrString::Str(s)) => s.trim().parse::<f64>().map(Some).map_err(de::Error::custom),
    }
}

/// Parse a JSON bool or the strings "true"/"false"
pub fn bool_lenient<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Str(String),
    }
    Ok(match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => b,
        BoolOrString::Str(s) => s.trim() == "true",
    })
}

/// Parse an optional string where "" means absent
pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Row {
        #[serde(default, deserialize_with = "f64_lenient")]
        px: f64,
        #[serde(default, deserialize_with = "opt_f64_lenient")]
        sl: Option<f64>,
        #[serde(default, deserialize_with = "opt_string")]
        id: Option<String>,
    }

    #[test]
    fn test_accepts_strings_and_numbers() {
        let row: Row = serde_json::from_str(r#"{"px":"1944.52","sl":1980.0,"id":"abc"}"#).unwrap();
        assert_eq!(row.px, 1944.52);
        assert_eq!(row.sl, Some(1980.0));
        assert_eq!(row.id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_empty_strings_are_absent() {
        let row: Row = serde_json::from_str(r#"{"px":"","sl":"","id":""}"#).unwrap();
        assert_eq!(row.px, 0.0);
        assert_eq!(row.sl, None);
        assert_eq!(row.id, None);
    }

    #[test]
    fn test_missing_fields_default() {
        let row: Row = serde_json::from_str("{}").unwrap();
        assert_eq!(row.px, 0.0);
        assert!(row.sl.is_none());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(serde_json::from_str::<Row>(r#"{"px":"abc"}"#).is_err());
    }
}
