//! URL utilities for consistent endpoint handling
//!
//! Local inference servers are configured by hand, so base URLs arrive with
//! missing schemes, stray trailing slashes, and with or without a `/v1`
//! suffix. Everything that talks to a backend goes through this module so
//! the rest of the crate can assume a canonical form.

/// Normalize a base URL: guarantee a scheme and strip trailing slashes.
///
/// Idempotent under repeated application.
///
/// # Examples
///
/// ```
/// use parlance::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("localhost:11434"), "http://localhost:11434");
/// assert_eq!(normalize_base_url("http://localhost:11434/"), "http://localhost:11434");
/// assert_eq!(normalize_base_url("https://api.example.com/v1///"), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Construct a complete API endpoint URL from a base URL and endpoint path,
/// avoiding doubled slashes.
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}

/// Chat-completions URL for an OpenAI-compatible server.
///
/// Bases configured with a `/v1` suffix get `chat/completions` appended
/// directly; bare bases get the full `v1/chat/completions` path.
pub fn chat_completions_url(base_url: &str) -> String {
    versioned_url(base_url, "chat/completions")
}

/// Model-listing URL, with the same `/v1` awareness as
/// [`chat_completions_url`].
pub fn models_url(base_url: &str) -> String {
    versioned_url(base_url, "models")
}

fn versioned_url(base_url: &str, endpoint: &str) -> String {
    let normalized = normalize_base_url(base_url);
    if normalized.ends_with("/v1") {
        construct_api_url(&normalized, endpoint)
    } else {
        construct_api_url(&normalized, &format!("v1/{endpoint}"))
    }
}

/// Candidate URLs to attempt, in order.
///
/// Browsers and some local servers resolve `localhost` inconsistently
/// (IPv6 vs IPv4 binds), so a URL whose host is `localhost` gets a
/// `127.0.0.1` fallback candidate. Other URLs yield a single candidate,
/// even when `localhost` appears later in the path or query.
pub fn candidate_urls(url: &str) -> Vec<String> {
    let mut candidates = vec![url.to_string()];
    let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    if authority == "localhost" || authority.starts_with("localhost:") {
        candidates.push(url.replacen("localhost", "127.0.0.1", 1));
    }
    candidates
}
