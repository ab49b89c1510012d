//! Schema check for untrusted preview payloads.
//!
//! Accepts `{ "code": { "html"?, "css"?, "js"? } }` and nothing else. The
//! output is a normalized [`PreviewRequest`]; no other component ever sees
//! the raw JSON.

use serde_json::{Map, Value};

use crate::error::{ValidationError, ValidationErrorKind};
use crate::request::PreviewRequest;

/// Default per-field limit (64 KiB).
pub const DEFAULT_MAX_FIELD_BYTES: usize = 64 * 1024;

/// Keys allowed at the top level of the body
const TOP_LEVEL_KEYS: &[&str] = &["code"];

/// Keys allowed inside `code`
const CODE_KEYS: &[&str] = &["html", "css", "js"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_field_bytes: usize,
    /// Treat a missing `html` as `MissingField` instead of a default.
    pub require_html: bool,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_field_bytes: DEFAULT_MAX_FIELD_BYTES,
            require_html: false,
        }
    }
}

/// Validate and normalize a raw payload.
///
/// # Errors
/// - `WrongType` if the body, `code`, or a field has the wrong JSON type
/// - `UnknownField` for any key outside the schema
/// - `TooLarge` if a normalized field exceeds `max_field_bytes`
/// - `MalformedEncoding` for control characters other than tab/newline
/// - `MissingField` for an absent `html` when `require_html` is set
pub fn validate(raw: &Value, limits: &ValidationLimits) -> Result<PreviewRequest, ValidationError> {
    let body = raw
        .as_object()
        .ok_or_else(|| ValidationError::wrong_type("body", "an object"))?;
    reject_unknown_keys(body, TOP_LEVEL_KEYS, "")?;

    let empty = Map::new();
    let code = match body.get("code") {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(code)) => code,
        Some(_) => return Err(ValidationError::wrong_type("code", "an object")),
    };
    reject_unknown_keys(code, CODE_KEYS, "code.")?;

    let html = text_field(code, "html", limits)?;
    if html.is_none() && limits.require_html {
        return Err(ValidationError::missing_field("code.html"));
    }

    Ok(PreviewRequest {
        html,
        css: text_field(code, "css", limits)?,
        js: text_field(code, "js", limits)?,
    })
}

fn reject_unknown_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    prefix: &str,
) -> Result<(), ValidationError> {
    match map.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(ValidationError::unknown_field(&format!("{prefix}{key}"))),
        None => Ok(()),
    }
}

fn text_field(
    code: &Map<String, Value>,
    name: &str,
    limits: &ValidationLimits,
) -> Result<Option<String>, ValidationError> {
    let path = format!("code.{name}");
    let raw = match code.get(name) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s,
        Some(_) => return Err(ValidationError::wrong_type(&path, "a string")),
    };

    let text = normalize(raw);
    if text.is_empty() {
        return Ok(None);
    }
    if text.len() > limits.max_field_bytes {
        return Err(ValidationError::too_large(&path, text.len(), limits.max_field_bytes));
    }
    if let Some((offset, c)) = text
        .char_indices()
        .find(|(_, c)| c.is_control() && *c != '\n' && *c != '\t')
    {
        return Err(ValidationError::new(
            ValidationErrorKind::MalformedEncoding,
            format!("`{path}` contains control character U+{:04X} at byte {offset}", c as u32),
        ));
    }
    Ok(Some(text))
}

/// Strip a leading BOM, unify line endings to `\n`, trim the ends.
pub fn normalize(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    text.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits() -> ValidationLimits {
        ValidationLimits::default()
    }

    fn kind_of(raw: Value, limits: &ValidationLimits) -> ValidationErrorKind {
        validate(&raw, limits).unwrap_err().kind
    }

    #[test]
    fn test_accepts_full_payload() {
        let req = validate(
            &json!({"code": {"html": "<b>hi</b>", "css": "b { color: red }", "js": "1"}}),
            &limits(),
        )
        .unwrap();
        assert_eq!(req.html(), Some("<b>hi</b>"));
        assert_eq!(req.css(), Some("b { color: red }"));
        assert_eq!(req.js(), Some("1"));
    }

    #[test]
    fn test_missing_code_is_empty_request() {
        let req = validate(&json!({}), &limits()).unwrap();
        assert_eq!(req.html(), None);

        let req = validate(&json!({"code": null}), &limits()).unwrap();
        assert_eq!(req.html(), None);
    }

    #[test]
    fn test_missing_html_when_required() {
        let strict = ValidationLimits {
            require_html: true,
            ..limits()
        };
        assert_eq!(kind_of(json!({"code": {}}), &strict), ValidationErrorKind::MissingField);
        assert_eq!(
            kind_of(json!({"code": {"html": "   "}}), &strict),
            ValidationErrorKind::MissingField
        );
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = validate(&json!({"code": {}, "extra": 1}), &limits()).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::UnknownField);
        assert!(err.detail.contains("extra"));

        let err = validate(&json!({"code": {"python": "print()"}}), &limits()).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::UnknownField);
        assert!(err.detail.contains("code.python"));
    }

    #[test]
    fn test_rejects_wrong_types() {
        assert_eq!(kind_of(json!([1, 2]), &limits()), ValidationErrorKind::WrongType);
        assert_eq!(kind_of(json!({"code": "html"}), &limits()), ValidationErrorKind::WrongType);
        assert_eq!(
            kind_of(json!({"code": {"html": 42}}), &limits()),
            ValidationErrorKind::WrongType
        );
        assert_eq!(
            kind_of(json!({"code": {"css": ["a"]}}), &limits()),
            ValidationErrorKind::WrongType
        );
    }

    #[test]
    fn test_rejects_oversized_field() {
        let small = ValidationLimits {
            max_field_bytes: 8,
            ..limits()
        };
        let err = validate(&json!({"code": {"js": "x".repeat(9)}}), &small).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::TooLarge);

        // Limit applies after normalization
        assert!(validate(&json!({"code": {"js": format!("  {}  ", "x".repeat(8))}}), &small).is_ok());
    }

    #[test]
    fn test_rejects_control_characters() {
        assert_eq!(
            kind_of(json!({"code": {"html": "a\u{0000}b"}}), &limits()),
            ValidationErrorKind::MalformedEncoding
        );
        assert_eq!(
            kind_of(json!({"code": {"css": "a\u{001b}[0m"}}), &limits()),
            ValidationErrorKind::MalformedEncoding
        );
        assert!(validate(&json!({"code": {"html": "a\tb\nc"}}), &limits()).is_ok());
    }

    #[test]
    fn test_normalization_makes_equivalent_inputs_equal() {
        let a = validate(&json!({"code": {"html": "\u{feff}<p>\r\nx</p>\r\n"}}), &limits()).unwrap();
        let b = validate(&json!({"code": {"html": "<p>\nx</p>"}}), &limits()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_revalidation_is_deterministic() {
        let raw = json!({"code": {"html": " <i>x</i>\r", "js": null}});
        let first = validate(&raw, &limits()).unwrap();
        let second = validate(&raw, &limits()).unwrap();
        assert_eq!(first, second);
    }
}
