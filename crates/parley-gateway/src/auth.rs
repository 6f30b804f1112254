use parley_core::config::GatewayConfig;

/// Check a bearer token against the configured API token. With no token
/// configured every request is accepted.
pub fn validate_bearer(config: &GatewayConfig, bearer: Option<&str>) -> bool {
    match config.api_token.as_deref() {
        None => true,
        Some(expected) => bearer.is_some_and(|given| constant_time_eq(given, expected)),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Pull the token out of an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    header.and_then(|h| h.strip_prefix("Bearer ")).map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            api_token: token.map(str::to_string),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_open_when_no_token() {
        assert!(validate_bearer(&config(None), None));
        assert!(validate_bearer(&config(None), Some("anything")));
    }

    #[test]
    fn test_token_must_match() {
        let config = config(Some("s3cret"));
        assert!(validate_bearer(&config, Some("s3cret")));
        assert!(!validate_bearer(&config, Some("s3cre")));
        assert!(!validate_bearer(&config, Some("s3cres")));
        assert!(!validate_bearer(&config, None));
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(None), None);
    }
}
