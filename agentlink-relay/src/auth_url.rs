//! Login URL side channel.
//!
//! When the agent answers a `chatgpt` login start, the response carries an
//! `authUrl`. The relay opens it on the host so the user can finish the
//! login flow next to the agent, then tells the client what happened.

use serde_json::Value;

/// Extracts a login URL from one agent stdout line, if present.
///
/// Matches responses whose `result.type` is `"chatgpt"` and whose
/// `result.authUrl` is an `http` or `https` URL. Lines that are not JSON
/// yield `None`.
#[must_use]
pub fn extract_login_url(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    let result = value.get("result")?;
    if result.get("type").and_then(Value::as_str) != Some("chatgpt") {
        return None;
    }
    let raw = result.get("authUrl").and_then(Value::as_str)?;
    let parsed = url::Url::parse(raw).ok()?;
    matches!(parsed.scheme(), "http" | "https").then(|| raw.to_string())
}

/// Opens URLs in the host's browser.
pub trait BrowserLauncher: Send + Sync {
    /// Opens `url`, returning a description of the failure if it could not.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message when the browser could not be
    /// launched.
    fn open(&self, url: &str) -> Result<(), String>;
}

/// Launches the platform default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> Result<(), String> {
        open::that_detached(url).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_chatgpt_login_url() {
        let line = r#"{"id":4,"result":{"type":"chatgpt","loginId":"l1","authUrl":"https://auth.example.com/x"}}"#;
        assert_eq!(
            extract_login_url(line).as_deref(),
            Some("https://auth.example.com/x")
        );
    }

    #[test]
    fn ignores_other_results() {
        assert!(extract_login_url(r#"{"id":4,"result":{"type":"apiKey"}}"#).is_none());
        assert!(
            extract_login_url(r#"{"id":4,"result":{"type":"chatgpt","authUrl":"file:///etc/passwd"}}"#)
                .is_none()
        );
        assert!(extract_login_url("not json").is_none());
        assert!(extract_login_url(r#"{"method":"turn/started"}"#).is_none());
    }
}
