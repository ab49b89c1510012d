//! Resource URL policy for rendered markup.
//!
//! Security model:
//! - Absolute network URLs are only kept when their origin is allowlisted
//! - `javascript:` and non-network schemes (`file:`, `ftp:`, ...) are blocked
//! - Relative URLs, fragments, `data:` and `mailto:` never leave the preview

use url::Url;

/// Base that relative references are resolved against. Anything still on
/// this origin afterwards never left the preview document.
const PREVIEW_BASE: &str = "https://preview.invalid/";
const PREVIEW_ORIGIN: &str = "https://preview.invalid";

/// What to do with a URL found in a resource-loading attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlVerdict {
    Keep,
    Block(String),
}

/// Allowlist of origins the preview may reach.
#[derive(Debug, Clone, Default)]
pub struct ResourcePolicy {
    /// Allowed origins (e.g., "https://cdn.example.com")
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
}

impl ResourcePolicy {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }

    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.allowed_origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }

    /// Judge a single attribute value.
    pub fn check(&self, value: &str) -> UrlVerdict {
        let value = value.trim();
        // Browsers ignore embedded whitespace/control chars when sniffing the scheme
        let squashed: String = value
            .chars()
            .filter(|c| !c.is_whitespace() && !c.is_control())
            .collect::<String>()
            .to_ascii_lowercase();

        if squashed.starts_with("javascript:") || squashed.starts_with("vbscript:") {
            return UrlVerdict::Block("script URL".to_string());
        }

        // Resolve the way a browser would; `url` drops tabs/newlines and
        // reads `\` as `/`, so `/\evil.com` lands on another host
        let resolved = match Url::parse(PREVIEW_BASE).and_then(|base| base.join(value)) {
            Ok(url) => url,
            Err(e) => return UrlVerdict::Block(format!("unparseable URL ({e})")),
        };

        match resolved.scheme() {
            "data" | "mailto" | "about" => UrlVerdict::Keep,
            "http" | "https" | "ws" | "wss" => {
                let origin = resolved.origin().ascii_serialization();
                if origin == PREVIEW_ORIGIN || self.is_origin_allowed(&resolved) {
                    UrlVerdict::Keep
                } else {
                    UrlVerdict::Block(format!("origin '{origin}' is not in the allowlist"))
                }
            }
            other => UrlVerdict::Block(format!("scheme '{other}' is not allowed")),
        }
    }

    /// Judge a `srcset` value; blocked if any candidate is blocked.
    pub fn check_srcset(&self, value: &str) -> UrlVerdict {
        for candidate in value.split(',') {
            let url = candidate.split_whitespace().next().unwrap_or("");
            if url.is_empty() {
                continue;
            }
            if let UrlVerdict::Block(reason) = self.check(url) {
                return UrlVerdict::Block(reason);
            }
        }
        UrlVerdict::Keep
    }

    /// Content-Security-Policy for a preview document.
    ///
    /// Inline style and script run; everything else is limited to `data:`
    /// and the allowlisted origins.
    pub fn content_security_policy(&self) -> String {
        let origins = self.allowed_origins.join(" ");
        let with_origins = |base: &str| {
            if origins.is_empty() {
                base.to_string()
            } else {
                format!("{base} {origins}")
            }
        };
        let connect = if origins.is_empty() {
            "'none'".to_string()
        } else {
            origins.clone()
        };

        format!(
            "default-src 'none'; style-src {}; script-src {}; img-src {}; font-src {}; \
             media-src {}; connect-src {}; form-action 'none'; base-uri 'none'",
            with_origins("'unsafe-inline'"),
            with_origins("'unsafe-inline'"),
            with_origins("data:"),
            with_origins("data:"),
            with_origins("data:"),
            connect,
        )
    }
}
