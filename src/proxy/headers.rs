use http::HeaderMap;
use std::collections::HashSet;

pub const REDACTED: &str = "[REDACTED]";

/// Headers whose values never reach the audit log or the container.
pub const DEFAULT_SENSITIVE_HEADERS: &[&str] = &[
	"authorization",
	"cookie",
	"set-cookie",
	"x-api-key",
	"x-auth-token",
	"x-csrf-token",
	"x-xsrf-token",
	"proxy-authorization",
	"www-authenticate",
	"x-amz-security-token",
	"x-goog-iam-authorization-token",
	"x-goog-authenticated-user-email",
];

/// Case-insensitive sensitive-header set. Audit snapshots replace the whole
/// value with `[REDACTED]` (length is not revealed); responses relayed to the
/// container have matching headers removed outright.
#[derive(Debug, Clone)]
pub struct HeaderFilter {
	enabled: bool,
	names: HashSet<String>,
}

impl HeaderFilter {
	pub fn new(enabled: bool, names: &[String]) -> Self {
		HeaderFilter {
			enabled,
			names: names.iter().map(|n| n.to_ascii_lowercase()).collect(),
		}
	}

	pub fn is_sensitive(&self, name: &str) -> bool {
		self.enabled && self.names.contains(&name.to_ascii_lowercase())
	}

	/// Snapshot a header map for the audit log, redacting sensitive values.
	pub fn audit_view(&self, headers: &HeaderMap) -> Vec<(String, String)> {
		headers
			.iter()
			.map(|(name, value)| {
				let value = if self.is_sensitive(name.as_str()) {
					REDACTED.to_string()
				} else {
					value.to_str().unwrap_or("[binary]").to_string()
				};
				(name.as_str().to_string(), value)
			})
			.collect()
	}

	/// Remove sensitive headers from a response before it is relayed to the
	/// container.
	pub fn strip(&self, headers: &mut HeaderMap) {
		if !self.enabled {
			return;
		}
		let sensitive: Vec<http::HeaderName> = headers
			.keys()
			.filter(|name| self.is_sensitive(name.as_str()))
			.cloned()
			.collect();
		for name in sensitive {
			headers.remove(&name);
		}
	}
}

impl Default for HeaderFilter {
	fn default() -> Self {
		let names: Vec<String> = DEFAULT_SENSITIVE_HEADERS
			.iter()
			.map(|s| s.to_string())
			.collect();
		HeaderFilter::new(true, &names)
	}
}
