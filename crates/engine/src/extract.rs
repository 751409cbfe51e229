//! Path extraction into a fetched payload.
//!
//! Path syntax: dot-separated keys, each optionally followed by one or more
//! `[index]` groups, e.g. `data.rates[0].value`, `[0].price`, `m[1][2]`.
//! An empty path selects the whole payload.

use serde_json::Value;
use thiserror::Error;

/// Errors from path parsing and lookup. Lookup errors carry the path prefix
/// up to and including the first failing segment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("key not found at '{at}'")]
    MissingKey { at: String },

    #[error("index {index} out of range at '{at}' (length {len})")]
    IndexOutOfRange { at: String, index: usize, len: usize },

    #[error("cannot index non-array at '{at}'")]
    NotAnArray { at: String },

    #[error("cannot look up key on non-object at '{at}'")]
    NotAnObject { at: String },
}

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Parse a path into segments. Blank input parses to an empty path.
pub fn parse_path(path: &str) -> Result<Vec<Segment>, ExtractionError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let invalid = |reason: &str| ExtractionError::InvalidPath {
        path: trimmed.to_string(),
        reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    for (i, part) in trimmed.split('.').enumerate() {
        if part.is_empty() {
            return Err(invalid("empty segment"));
        }
        let (key, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if key.contains(']') || key.chars().any(char::is_whitespace) {
            return Err(invalid("unexpected character in key"));
        }
        if !key.is_empty() {
            segments.push(Segment::Key(key.to_string()));
        } else if rest.is_empty() {
            return Err(invalid("empty segment"));
        } else if i > 0 {
            // Only a leading segment may start with an index.
            return Err(invalid("expected key after '.'"));
        }
        while !rest.is_empty() {
            let inner = rest
                .strip_prefix('[')
                .ok_or_else(|| invalid("expected '[' after index"))?;
            let close = inner.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            let digits = &inner[..close];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("index must be a non-negative integer"));
            }
            let index = digits
                .parse::<usize>()
                .map_err(|_| invalid("index too large"))?;
            segments.push(Segment::Index(index));
            rest = &inner[close + 1..];
        }
    }
    Ok(segments)
}

/// Select the value at `path` inside `payload`. Pure.
pub fn extract(payload: &Value, path: Option<&str>) -> Result<Value, ExtractionError> {
    let segments = match path {
        Some(p) => parse_path(p)?,
        None => Vec::new(),
    };

    let mut current = payload;
    let mut at = String::new();
    for segment in &segments {
        match segment {
            Segment::Key(key) => {
                if !at.is_empty() {
                    at.push('.');
                }
                at.push_str(key);
                let obj = current
                    .as_object()
                    .ok_or_else(|| ExtractionError::NotAnObject { at: at.clone() })?;
                current = obj
                    .get(key)
                    .ok_or_else(|| ExtractionError::MissingKey { at: at.clone() })?;
            }
            Segment::Index(index) => {
                at.push_str(&format!("[{index}]"));
                let arr = current
                    .as_array()
                    .ok_or_else(|| ExtractionError::NotAnArray { at: at.clone() })?;
                current = arr.get(*index).ok_or_else(|| ExtractionError::IndexOutOfRange {
                    at: at.clone(),
                    index: *index,
                    len: arr.len(),
                })?;
            }
        }
    }
    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "data": {
                "rates": [
                    {"code": "EUR", "value": 1.08},
                    {"code": "GBP", "value": 1.27}
                ],
                "matrix": [[1, 2, 3], [4, 5, 6]]
            },
            "meta": "ok"
        })
    }

    #[test]
    fn test_parse_path_forms() {
        assert_eq!(
            parse_path("data.rates[0].value").unwrap(),
            vec![
                Segment::Key("data".into()),
                Segment::Key("rates".into()),
                Segment::Index(0),
                Segment::Key("value".into()),
            ]
        );
        assert_eq!(
            parse_path("[1].price").unwrap(),
            vec![Segment::Index(1), Segment::Key("price".into())]
        );
        assert_eq!(
            parse_path("m[1][2]").unwrap(),
            vec![Segment::Key("m".into()), Segment::Index(1), Segment::Index(2)]
        );
        assert!(parse_path("   ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_path_rejects_malformed() {
        for bad in [
            "a..b", "a.", ".a", "a[", "a[x]", "a[-1]", "a[]", "a[0]b", "a b", "a]", "a.[0]",
            "[0].[1]",
        ] {
            assert!(
                matches!(parse_path(bad), Err(ExtractionError::InvalidPath { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_empty_path_returns_payload() {
        let p = payload();
        assert_eq!(extract(&p, None).unwrap(), p);
        assert_eq!(extract(&p, Some("")).unwrap(), p);
    }

    #[test]
    fn test_nested_lookup() {
        let p = payload();
        assert_eq!(extract(&p, Some("data.rates[1].value")).unwrap(), json!(1.27));
        assert_eq!(extract(&p, Some("data.matrix[1][2]")).unwrap(), json!(6));
        assert_eq!(extract(&json!([{"price": 3}]), Some("[0].price")).unwrap(), json!(3));
    }

    #[test]
    fn test_missing_index_names_prefix() {
        let err = extract(&payload(), Some("data.rates[2].value")).unwrap_err();
        assert_eq!(
            err,
            ExtractionError::IndexOutOfRange {
                at: "data.rates[2]".into(),
                index: 2,
                len: 2
            }
        );
    }

    #[test]
    fn test_missing_key_names_prefix() {
        let err = extract(&payload(), Some("data.prices.value")).unwrap_err();
        assert_eq!(err, ExtractionError::MissingKey { at: "data.prices".into() });
        assert!(err.to_string().contains("data.prices"));
    }

    #[test]
    fn test_type_mismatches() {
        let err = extract(&payload(), Some("meta[0]")).unwrap_err();
        assert_eq!(err, ExtractionError::NotAnArray { at: "meta[0]".into() });

        let err = extract(&payload(), Some("meta.inner")).unwrap_err();
        assert_eq!(err, ExtractionError::NotAnObject { at: "meta.inner".into() });
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let p = payload();
        for path in ["data.rates[0]", "data.matrix", "meta", "data.rates[5]"] {
            assert_eq!(extract(&p, Some(path)), extract(&p, Some(path)));
        }
        // The payload itself is untouched.
        assert_eq!(p, payload());
    }
}
