//! Utility functions for the AI-CORE Webhook Delivery Service

use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use serde_json::Value;
use url::Url;

/// Maximum number of characters of an endpoint response kept on a delivery record
pub const MAX_RESPONSE_BODY_CHARS: usize = 1024;

/// String utility functions
pub struct StringUtils;

impl StringUtils {
    /// Truncate to at most `max_chars` characters without splitting a code point
    pub fn truncate_chars(s: &str, max_chars: usize) -> String {
        match s.char_indices().nth(max_chars) {
            Some((idx, _)) => s[..idx].to_string(),
            None => s.to_string(),
        }
    }
}

/// JSON utility functions
pub struct JsonUtils;

impl JsonUtils {
    /// Resolve a dot-separated path (`customer.address.city`, `items.0.sku`) in `value`
    pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
        if path.is_empty() {
            return Some(value);
        }
        path.split('.').try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

/// URL validation helpers
pub struct UrlUtils;

impl UrlUtils {
    /// Validate a webhook target URL; only http/https, and https alone when `require_https`
    pub fn validate_endpoint_url(raw: &str, require_https: bool) -> WebhookDeliveryResult<Url> {
        let url = Url::parse(raw).map_err(|e| {
            WebhookDeliveryError::configuration(format!("invalid url '{}': {}", raw, e))
        })?;

        match url.scheme() {
            "https" => {}
            "http" if !require_https => {}
            "http" => {
                return Err(WebhookDeliveryError::configuration(
                    "url must use https in this environment",
                ))
            }
            other => {
                return Err(WebhookDeliveryError::configuration(format!(
                    "url scheme '{}' is not allowed; use http or https",
                    other
                )))
            }
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(WebhookDeliveryError::configuration("url must have a host"));
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(StringUtils::truncate_chars("hello", 10), "hello");
        assert_eq!(StringUtils::truncate_chars("hello", 3), "hel");
        assert_eq!(StringUtils::truncate_chars("héllo", 2), "hé");
    }

    #[test]
    fn test_get_path() {
        let value = json!({"customer": {"tier": "gold"}, "items": [{"sku": "A1"}]});

        assert_eq!(
            JsonUtils::get_path(&value, "customer.tier"),
            Some(&json!("gold"))
        );
        assert_eq!(JsonUtils::get_path(&value, "items.0.sku"), Some(&json!("A1")));
        assert_eq!(JsonUtils::get_path(&value, "customer.missing"), None);
        assert_eq!(JsonUtils::get_path(&value, "customer.tier.deeper"), None);
    }

    #[test]
    fn test_validate_endpoint_url() {
        assert!(UrlUtils::validate_endpoint_url("https://hooks.example.com/in", true).is_ok());
        assert!(UrlUtils::validate_endpoint_url("http://localhost:8080/in", false).is_ok());
        assert!(UrlUtils::validate_endpoint_url("http://hooks.example.com", true).is_err());
        assert!(UrlUtils::validate_endpoint_url("ftp://hooks.example.com", false).is_err());
        assert!(UrlUtils::validate_endpoint_url("not a url", false).is_err());
    }
}
