use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// One observed egress attempt, allowed or blocked. Header snapshots are
/// already filtered by the proxy before they reach the sink.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
	pub timestamp: DateTime<Utc>,
	pub method: String,
	pub url: String,
	pub hostname: String,
	pub path: String,
	pub status_code: u16,
	pub blocked: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	pub request_headers: Vec<(String, String)>,
	pub response_headers: Vec<(String, String)>,
}

impl AuditEntry {
	pub fn new(method: &str, url: String, hostname: String, path: String) -> Self {
		AuditEntry {
			timestamp: Utc::now(),
			method: method.to_string(),
			url,
			hostname,
			path,
			status_code: 0,
			blocked: false,
			reason: None,
			request_headers: Vec::new(),
			response_headers: Vec::new(),
		}
	}

	pub fn blocked(mut self, status_code: u16, reason: String) -> Self {
		self.status_code = status_code;
		self.blocked = true;
		self.reason = Some(reason);
		self
	}

	pub fn completed(mut self, status_code: u16) -> Self {
		self.status_code = status_code;
		self.blocked = false;
		self
	}

	pub fn failed(mut self, status_code: u16, reason: String) -> Self {
		self.status_code = status_code;
		self.blocked = false;
		self.reason = Some(reason);
		self
	}
}

struct SinkState {
	// (arrival sequence, entry); kept ordered by sequence. Entries complete
	// out of order, so inserts go through a binary search.
	entries: Vec<(u64, AuditEntry)>,
	dropped: u64,
}

/// Append-only audit log shared between the proxy's request handlers (many
/// writers) and the coordinator (one reader, after stop). Entries are ordered
/// by request arrival, not completion. Bounded: when full, the oldest entry
/// is dropped and accounted for.
#[derive(Clone)]
pub struct AuditSink {
	state: Arc<Mutex<SinkState>>,
	capacity: usize,
}

impl AuditSink {
	pub fn new(capacity: usize) -> Self {
		AuditSink {
			state: Arc::new(Mutex::new(SinkState {
				entries: Vec::new(),
				dropped: 0,
			})),
			capacity,
		}
	}

	pub fn record(&self, seq: u64, entry: AuditEntry) {
		let mut state = self.state.lock().expect("audit sink poisoned");
		let at = state
			.entries
			.partition_point(|(existing, _)| *existing <= seq);
		state.entries.insert(at, (seq, entry));
		if state.entries.len() > self.capacity {
			state.entries.remove(0);
			state.dropped += 1;
		}
	}

	pub fn len(&self) -> usize {
		self.state.lock().expect("audit sink poisoned").entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Ordered snapshot plus the number of entries dropped to the cap.
	pub fn snapshot(&self) -> (Vec<AuditEntry>, u64) {
		let state = self.state.lock().expect("audit sink poisoned");
		(
			state.entries.iter().map(|(_, e)| e.clone()).collect(),
			state.dropped,
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(url: &str) -> AuditEntry {
		AuditEntry::new("GET", url.to_string(), "example.com".to_string(), "/".to_string())
			.completed(200)
	}

	#[test]
	fn snapshot_is_ordered_by_arrival_sequence() {
		let sink = AuditSink::new(100);
		sink.record(2, entry("http://example.com/c"));
		sink.record(0, entry("http://example.com/a"));
		sink.record(1, entry("http://example.com/b"));
		let (entries, dropped) = sink.snapshot();
		assert_eq!(dropped, 0);
		let urls: Vec<&str> = entries.iter().map(|e| e.url.as_str()).collect();
		assert_eq!(
			urls,
			vec![
				"http://example.com/a",
				"http://example.com/b",
				"http://example.com/c"
			]
		);
	}

	#[test]
	fn cap_drops_oldest_and_counts() {
		let sink = AuditSink::new(2);
		sink.record(0, entry("http://example.com/a"));
		sink.record(1, entry("http://example.com/b"));
		sink.record(2, entry("http://example.com/c"));
		let (entries, dropped) = sink.snapshot();
		assert_eq!(dropped, 1);
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].url, "http://example.com/b");
		assert_eq!(entries[1].url, "http://example.com/c");
	}

	#[test]
	fn blocked_entry_has_reason_and_status() {
		let e = AuditEntry::new(
			"DELETE",
			"http://dev-1.okta.com/api/v1/users/123".to_string(),
			"dev-1.okta.com".to_string(),
			"/api/v1/users/123".to_string(),
		)
		.blocked(403, "Method DELETE not allowed for dev-1.okta.com/api/v1/users/123".to_string());
		assert!(e.blocked);
		assert_eq!(e.status_code, 403);
		assert!(e.reason.as_deref().is_some_and(|r| !r.is_empty()));
	}
}
