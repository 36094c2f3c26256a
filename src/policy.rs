use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire shape of a per-principal security policy, as returned by the policy
/// service. Rule order inside each list is significant and preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicySpec {
	pub allowed_domains: Vec<String>,
	pub api_path_rules: HashMap<String, Vec<PathRule>>,
	pub allowed_packages: Vec<String>,
	pub allowed_binaries: Vec<String>,
	// Reserved; the policy service does not populate this yet.
	pub blocked_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
	pub method: RuleMethod,
	pub path: String,
	pub allow: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuleMethod {
	#[serde(rename = "GET")]
	Get,
	#[serde(rename = "POST")]
	Post,
	#[serde(rename = "PUT")]
	Put,
	#[serde(rename = "PATCH")]
	Patch,
	#[serde(rename = "DELETE")]
	Delete,
	#[serde(rename = "*")]
	Any,
}

impl RuleMethod {
	fn matches(&self, method: &str) -> bool {
		match self {
			RuleMethod::Any => true,
			RuleMethod::Get => method.eq_ignore_ascii_case("GET"),
			RuleMethod::Post => method.eq_ignore_ascii_case("POST"),
			RuleMethod::Put => method.eq_ignore_ascii_case("PUT"),
			RuleMethod::Patch => method.eq_ignore_ascii_case("PATCH"),
			RuleMethod::Delete => method.eq_ignore_ascii_case("DELETE"),
		}
	}
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
	pub allow: bool,
	pub reason: Option<String>,
}

impl Decision {
	pub fn allow() -> Self {
		Decision {
			allow: true,
			reason: None,
		}
	}

	pub fn deny(reason: String) -> Self {
		Decision {
			allow: false,
			reason: Some(reason),
		}
	}
}

// A host pattern: exact hostname, or a wildcard like `*.okta.com` compiled
// to an anchored regex. A pattern that fails to compile never matches.
#[derive(Debug, Clone)]
enum HostMatcher {
	Exact(String),
	Wildcard(Regex),
	Invalid,
}

impl HostMatcher {
	fn new(pattern: &str) -> Self {
		let pattern = pattern.trim().to_ascii_lowercase();
		if pattern.contains('*') {
			match compile_wildcard(&pattern) {
				Some(re) => HostMatcher::Wildcard(re),
				None => HostMatcher::Invalid,
			}
		} else {
			HostMatcher::Exact(pattern)
		}
	}

	fn matches(&self, host: &str) -> bool {
		match self {
			HostMatcher::Exact(p) => p == host,
			HostMatcher::Wildcard(re) => re.is_match(host),
			HostMatcher::Invalid => false,
		}
	}
}

#[derive(Debug, Clone)]
enum PathMatcher {
	// The special rule path `/*` matches every path, including `/`.
	Any,
	Exact(String),
	Wildcard(Regex),
	Invalid,
}

impl PathMatcher {
	fn new(pattern: &str) -> Self {
		if pattern == "/*" {
			PathMatcher::Any
		} else if pattern.contains('*') {
			match compile_wildcard(pattern) {
				Some(re) => PathMatcher::Wildcard(re),
				None => PathMatcher::Invalid,
			}
		} else {
			PathMatcher::Exact(pattern.to_string())
		}
	}

	fn matches(&self, path: &str) -> bool {
		match self {
			PathMatcher::Any => true,
			PathMatcher::Exact(p) => p == path,
			PathMatcher::Wildcard(re) => re.is_match(path),
			PathMatcher::Invalid => false,
		}
	}
}

// `*` becomes `.*`; everything else (dots, slashes) is escaped literally.
// Anchored at both ends.
fn compile_wildcard(pattern: &str) -> Option<Regex> {
	let expr = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
	Regex::new(&expr).ok()
}

#[derive(Debug, Clone)]
struct CompiledRule {
	method: RuleMethod,
	path: PathMatcher,
	allow: bool,
}

#[derive(Debug, Clone)]
struct DomainRules {
	// Lowercased key as it appeared on the wire, for the exact lookup.
	key: String,
	matcher: HostMatcher,
	rules: Vec<CompiledRule>,
}

/// A compiled, immutable policy. All wildcard patterns are compiled once at
/// construction so every request pays only a match, never a compile.
#[derive(Debug, Clone)]
pub struct Policy {
	spec: PolicySpec,
	domains: Vec<HostMatcher>,
	path_rules: Vec<DomainRules>,
}

impl Policy {
	pub fn new(spec: PolicySpec) -> Self {
		let domains = spec.allowed_domains.iter().map(|d| HostMatcher::new(d)).collect();
		let path_rules = spec
			.api_path_rules
			.iter()
			.map(|(domain, rules)| DomainRules {
				key: domain.trim().to_ascii_lowercase(),
				matcher: HostMatcher::new(domain),
				rules: rules
					.iter()
					.map(|r| CompiledRule {
						method: r.method,
						path: PathMatcher::new(&r.path),
						allow: r.allow,
					})
					.collect(),
			})
			.collect();
		Policy {
			spec,
			domains,
			path_rules,
		}
	}

	/// A policy that allows the given domains and nothing else, with no path
	/// rules. Used for the baked-in fallback when no per-principal policy is
	/// available.
	pub fn allow_domains(domains: &[String]) -> Self {
		Policy::new(PolicySpec {
			allowed_domains: domains.to_vec(),
			..Default::default()
		})
	}

	/// A policy that allows every domain. Used when the proxy runs in
	/// audit-only mode.
	pub fn allow_all() -> Self {
		Policy::allow_domains(&["*".to_string()])
	}

	pub fn spec(&self) -> &PolicySpec {
		&self.spec
	}

	/// Decide whether `method` on `hostname``path` may proceed.
	///
	/// Domain gate first: if no allowed-domain pattern matches, deny. Then the
	/// effective rule list for the host (exact key, else first matching
	/// pattern key) is scanned in order and the first matching rule wins. A
	/// host with no rules, an empty rule list, or no matching rule is allowed:
	/// an explicitly allowed domain fails open at the path level.
	pub fn is_allowed(&self, hostname: &str, method: &str, path: &str) -> Decision {
		let host = hostname.to_ascii_lowercase();
		if !self.domains.iter().any(|d| d.matches(&host)) {
			return Decision::deny(format!("Domain {hostname} is not in allowed list"));
		}

		let Some(rules) = self.rules_for(&host) else {
			return Decision::allow();
		};
		for rule in rules {
			if rule.method.matches(method) && rule.path.matches(path) {
				return if rule.allow {
					Decision::allow()
				} else {
					Decision::deny(format!("Method {method} not allowed for {hostname}{path}"))
				};
			}
		}
		Decision::allow()
	}

	fn rules_for(&self, host: &str) -> Option<&[CompiledRule]> {
		if let Some(exact) = self.path_rules.iter().find(|d| d.key == host) {
			return Some(&exact.rules);
		}
		self
			.path_rules
			.iter()
			.find(|d| d.matcher.matches(host))
			.map(|d| d.rules.as_slice())
	}
}

impl Serialize for Policy {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		self.spec.serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for Policy {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		Ok(Policy::new(PolicySpec::deserialize(deserializer)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(method: RuleMethod, path: &str, allow: bool) -> PathRule {
		PathRule {
			method,
			path: path.to_string(),
			allow,
		}
	}

	fn policy(domains: &[&str], rules: &[(&str, Vec<PathRule>)]) -> Policy {
		Policy::new(PolicySpec {
			allowed_domains: domains.iter().map(|d| d.to_string()).collect(),
			api_path_rules: rules
				.iter()
				.map(|(d, r)| (d.to_string(), r.clone()))
				.collect(),
			..Default::default()
		})
	}

	#[test]
	fn empty_domain_list_denies_everything() {
		let p = policy(&[], &[]);
		let d = p.is_allowed("api.stripe.com", "GET", "/v1/products");
		assert!(!d.allow);
		assert_eq!(
			d.reason.as_deref(),
			Some("Domain api.stripe.com is not in allowed list")
		);
	}

	#[test]
	fn exact_domain_match_is_case_insensitive() {
		let p = policy(&["API.Stripe.com"], &[]);
		assert!(p.is_allowed("api.stripe.com", "GET", "/").allow);
		assert!(p.is_allowed("Api.Stripe.Com", "GET", "/").allow);
		assert!(!p.is_allowed("api.github.com", "GET", "/").allow);
	}

	#[test]
	fn wildcard_domain_match_is_case_insensitive() {
		let p = policy(&["*.okta.com"], &[]);
		assert!(p.is_allowed("dev-1.okta.com", "GET", "/").allow);
		assert!(p.is_allowed("DEV-1.Okta.com", "GET", "/").allow);
		assert!(!p.is_allowed("okta.com.evil.io", "GET", "/").allow);
		// The dot is literal; `*` does not bleed across it.
		assert!(!p.is_allowed("oktaxcom", "GET", "/").allow);
	}

	#[test]
	fn allowed_domain_without_rules_fails_open() {
		let p = policy(&["api.stripe.com"], &[("api.stripe.com", vec![])]);
		assert!(p.is_allowed("api.stripe.com", "DELETE", "/anything").allow);
	}

	#[test]
	fn first_matching_rule_wins() {
		let p = policy(
			&["api.stripe.com"],
			&[(
				"api.stripe.com",
				vec![
					rule(RuleMethod::Get, "/v1/products", true),
					rule(RuleMethod::Any, "/v1/products", false),
				],
			)],
		);
		assert!(p.is_allowed("api.stripe.com", "GET", "/v1/products").allow);
		assert!(!p.is_allowed("api.stripe.com", "POST", "/v1/products").allow);
	}

	#[test]
	fn wildcard_any_method_deny_first_blocks_all_methods() {
		let p = policy(
			&["api.stripe.com"],
			&[(
				"api.stripe.com",
				vec![
					rule(RuleMethod::Any, "/*", false),
					rule(RuleMethod::Get, "/v1/products", true),
				],
			)],
		);
		let d = p.is_allowed("api.stripe.com", "GET", "/v1/products");
		assert!(!d.allow);
		assert_eq!(
			d.reason.as_deref(),
			Some("Method GET not allowed for api.stripe.com/v1/products")
		);
	}

	#[test]
	fn path_suffix_wildcard_does_not_match_collection_url() {
		// `/v1/products/*` matches item URLs but not the bare collection, so
		// a deny on the wildcard leaves the exact path reachable.
		let p = policy(
			&["api.stripe.com"],
			&[(
				"api.stripe.com",
				vec![
					rule(RuleMethod::Any, "/v1/products/*", false),
					rule(RuleMethod::Get, "/v1/products", true),
				],
			)],
		);
		assert!(p.is_allowed("api.stripe.com", "GET", "/v1/products").allow);
		assert!(!p.is_allowed("api.stripe.com", "GET", "/v1/products/p_123").allow);
	}

	#[test]
	fn slash_star_matches_every_path() {
		let p = policy(
			&["dev-1.okta.com"],
			&[("dev-1.okta.com", vec![rule(RuleMethod::Delete, "/*", false)])],
		);
		assert!(!p.is_allowed("dev-1.okta.com", "DELETE", "/").allow);
		assert!(!p.is_allowed("dev-1.okta.com", "DELETE", "/api/v1/users/123").allow);
		assert!(p.is_allowed("dev-1.okta.com", "GET", "/api/v1/users/123").allow);
	}

	#[test]
	fn method_specific_denial_reason() {
		let p = policy(
			&["*.okta.com"],
			&[(
				"*.okta.com",
				vec![
					rule(RuleMethod::Get, "/*", true),
					rule(RuleMethod::Delete, "/*", false),
				],
			)],
		);
		let d = p.is_allowed("dev-1.okta.com", "DELETE", "/api/v1/users/123");
		assert!(!d.allow);
		assert_eq!(
			d.reason.as_deref(),
			Some("Method DELETE not allowed for dev-1.okta.com/api/v1/users/123")
		);
	}

	#[test]
	fn pattern_key_lookup_applies_wildcard_rules() {
		let p = policy(
			&["*.okta.com"],
			&[("*.okta.com", vec![rule(RuleMethod::Post, "/*", false)])],
		);
		assert!(!p.is_allowed("dev-1.okta.com", "POST", "/users").allow);
		assert!(p.is_allowed("dev-1.okta.com", "GET", "/users").allow);
	}

	#[test]
	fn exact_rule_key_takes_precedence_over_pattern_key() {
		let p = policy(
			&["*.okta.com"],
			&[
				("dev-1.okta.com", vec![rule(RuleMethod::Get, "/*", true)]),
				("*.okta.com", vec![rule(RuleMethod::Any, "/*", false)]),
			],
		);
		assert!(p.is_allowed("dev-1.okta.com", "GET", "/users").allow);
		assert!(!p.is_allowed("dev-2.okta.com", "GET", "/users").allow);
	}

	#[test]
	fn no_matching_rule_fails_open() {
		let p = policy(
			&["api.stripe.com"],
			&[(
				"api.stripe.com",
				vec![rule(RuleMethod::Delete, "/v1/products", false)],
			)],
		);
		assert!(p.is_allowed("api.stripe.com", "GET", "/v1/charges").allow);
	}

	#[test]
	fn malformed_pattern_never_matches() {
		// regex::escape neutralizes metacharacters, so `(` in a pattern is
		// literal rather than malformed; the host simply never matches it.
		let p = policy(&["*(.com"], &[]);
		assert!(!p.is_allowed("x.com", "GET", "/").allow);
	}

	#[test]
	fn allow_all_policy_permits_any_host() {
		let p = Policy::allow_all();
		assert!(p.is_allowed("anything.example", "DELETE", "/x").allow);
	}

	#[test]
	fn spec_round_trip_preserves_decisions() {
		let p = policy(
			&["api.stripe.com", "*.okta.com"],
			&[(
				"api.stripe.com",
				vec![rule(RuleMethod::Get, "/v1/products", true), rule(RuleMethod::Any, "/*", false)],
			)],
		);
		let json = serde_json::to_string(&p).unwrap();
		let back: Policy = serde_json::from_str(&json).unwrap();
		for (host, method, path) in [
			("api.stripe.com", "GET", "/v1/products"),
			("api.stripe.com", "POST", "/v1/products"),
			("dev-1.okta.com", "GET", "/"),
			("api.github.com", "GET", "/"),
		] {
			assert_eq!(
				p.is_allowed(host, method, path).allow,
				back.is_allowed(host, method, path).allow,
				"{method} {host}{path}"
			);
		}
	}
}
