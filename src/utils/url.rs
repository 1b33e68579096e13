//! URL utilities for consistent endpoint construction
//!
//! The backend base URL comes from configuration and may or may not carry a
//! trailing slash; these helpers keep the joined endpoint URLs free of
//! doubled slashes.

/// Normalize a base URL by removing trailing slashes.
///
/// # Examples
///
/// ```
/// use charla::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://bot.example.com/api"), "https://bot.example.com/api");
/// assert_eq!(normalize_base_url("https://bot.example.com/api/"), "https://bot.example.com/api");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete endpoint URL from a base URL and an endpoint path.
///
/// # Examples
///
/// ```
/// use charla::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://bot.example.com/api/", "botAsk"),
///     "https://bot.example.com/api/botAsk"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://bot.example.com/api"),
            "https://bot.example.com/api"
        );
        assert_eq!(
            normalize_base_url("https://bot.example.com/api///"),
            "https://bot.example.com/api"
        );
        assert_eq!(normalize_base_url(""), "");
    }

    #[test]
    fn test_construct_api_url() {
        assert_eq!(
            construct_api_url("https://bot.example.com/api", "botAsk"),
            "https://bot.example.com/api/botAsk"
        );
        assert_eq!(
            construct_api_url("https://bot.example.com/api/", "/check-auth"),
            "https://bot.example.com/api/check-auth"
        );
    }
}
