//! Wire types shared by the agent (node side) and the controller.
//!
//! Keeping these in one crate means the JSON shapes on both ends of the
//! ingest protocol (agent -> controller, §6.1) and the control protocol
//! (controller -> agent, §6.2) can never drift independently.

use serde::{Deserialize, Serialize};

/// A single parsed connection observation, as carried in a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchEntry {
    pub subscriber: String,
    pub ip: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// `POST /log` — a single-event report, fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequest {
    pub subscriber: String,
    pub ip: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub node: String,
    pub secret: String,
}

/// `POST /log_batch` — either pre-parsed entries, or raw log lines the
/// controller parses itself with the same grammar the agent's tailer uses.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogBatchRequest {
    pub node: String,
    pub secret: String,
    #[serde(default)]
    pub entries: Vec<BatchEntry>,
    #[serde(default)]
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkReply {
    pub ok: bool,
}

impl OkReply {
    pub const TRUE: OkReply = OkReply { ok: true };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatchReply {
    pub ok: bool,
    pub processed: usize,
}

/// `GET /health` on the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerHealth {
    pub status: String,
    pub connections: usize,
    pub users: usize,
}

/// `POST /block` (a.k.a. `/block_ip`) on the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub ip: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub duration: u64,
    pub secret: String,
}

/// `POST /unblock` (a.k.a. `/unblock_ip`) on the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnblockRequest {
    pub ip: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub secret: String,
}

/// `POST /clear` (a.k.a. `/clear_iptables`) on the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretOnlyRequest {
    pub secret: String,
}

/// `GET /health` on the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub installed_rules_count: usize,
    /// Log lines that matched no known pattern (§7: "not an error", counted).
    pub parse_misses: u64,
    /// Upload-pipeline events dropped under back-pressure (§4.2).
    pub upload_drops: u64,
}

/// `GET /blocked` on the agent — diagnostic listing of currently-blocked keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedListReply {
    pub keys: Vec<String>,
}

/// The key identifying a single firewall rule: a bare address, or an
/// address+source-port pair (port present selects TCP-only).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub ip: String,
    pub port: Option<u16>,
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(p) => write!(f, "{}:{}", self.ip, p),
            None => write!(f, "{}", self.ip),
        }
    }
}

/// Parse a raw access-log line into `(subscriber_id, ip, port)`.
///
/// Matches the primary grammar named in spec §4.1: `from [tcp:]<IPv4>:<port>
/// ... email: <token>`. Lines that don't match either fragment are not an
/// error, just a non-match — callers should count and drop them silently.
/// The subscriber token's `user_` display prefix, if present, is stripped.
pub fn parse_log_line(line: &str) -> Option<BatchEntry> {
    let from_idx = line.find("from ")?;
    let after_from = &line[from_idx + "from ".len()..];
    let after_from = after_from.strip_prefix("tcp:").unwrap_or(after_from);

    let colon_idx = after_from.find(':')?;
    let ip_str = &after_from[..colon_idx];
    let rest = &after_from[colon_idx + 1..];

    let port_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if port_end == 0 {
        return None;
    }
    let port_str = &rest[..port_end];

    let ip: std::net::Ipv4Addr = ip_str.parse().ok()?;
    let port: u16 = port_str.parse().ok()?;

    let email_idx = line.find("email:")?;
    let after_email = line[email_idx + "email:".len()..].trim_start();
    let token_end = after_email
        .find(|c: char| c.is_whitespace())
        .unwrap_or(after_email.len());
    let token = &after_email[..token_end];
    if token.is_empty() {
        return None;
    }

    Some(BatchEntry {
        subscriber: strip_display_prefix(token),
        ip: ip.to_string(),
        port: Some(port),
    })
}

/// Strip a `user_<digits-or-anything>` display prefix from a subscriber
/// token, per the invariant in spec §3: `subscriber_id` carries no display
/// prefix.
pub fn strip_display_prefix(token: &str) -> String {
    token
        .strip_prefix("user_")
        .unwrap_or(token)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_from() {
        let line = "2024/01/01 12:00:00 from 10.0.0.5:51234 accepted tcp:example.com:443 email: user_42";
        let entry = parse_log_line(line).unwrap();
        assert_eq!(entry.ip, "10.0.0.5");
        assert_eq!(entry.port, Some(51234));
        assert_eq!(entry.subscriber, "42");
    }

    #[test]
    fn parses_tcp_prefixed_from() {
        let line = "from tcp:203.0.113.9:443 ... email: alice";
        let entry = parse_log_line(line).unwrap();
        assert_eq!(entry.ip, "203.0.113.9");
        assert_eq!(entry.subscriber, "alice");
    }

    #[test]
    fn rejects_malformed_ip() {
        let line = "from 999.999.999.999:80 email: bob";
        assert!(parse_log_line(line).is_none());
    }

    #[test]
    fn rejects_missing_email() {
        let line = "from 10.0.0.1:80 accepted, no subscriber here";
        assert!(parse_log_line(line).is_none());
    }

    #[test]
    fn rejects_non_matching_line() {
        let line = "this line has nothing interesting in it";
        assert!(parse_log_line(line).is_none());
    }

    #[test]
    fn strip_prefix_only_strips_known_prefix() {
        assert_eq!(strip_display_prefix("user_123"), "123");
        assert_eq!(strip_display_prefix("plainname"), "plainname");
    }
}
