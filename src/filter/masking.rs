//! Column masking for text-protocol result sets

use std::sync::Arc;

use bytes::Bytes;
use regex::Regex;
use tracing::warn;

use crate::classifier::QueryClassification;
use crate::config::{MaskingRuleConfig, RewriteConfig};
use crate::protocol::resultset::{encode_text_row, parse_text_row, ColumnDefinition};
use crate::protocol::response::{is_eof_packet, is_err_packet, is_ok_packet, more_results_exist};
use crate::protocol::wire::read_lenenc_int;
use crate::protocol::{Command, Packet};

use super::{Filter, FilterVerdict};

#[derive(Debug, thiserror::Error)]
pub enum MaskingError {
    #[error("invalid account '{0}', expected 'user'@'host'")]
    InvalidAccount(String),
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A `'user'@'host'` entry. The user always compares verbatim; a host with
/// `%` or `_` wildcards is matched as a pattern. Empty parts match anything.
#[derive(Debug, Clone)]
pub enum Account {
    Verbatim { user: String, host: String },
    Pattern { user: String, host: Arc<Regex> },
}

fn unquote(part: &str) -> Option<&str> {
    let part = part.trim();
    for quote in ['\'', '"', '`'] {
        if let Some(inner) = part.strip_prefix(quote) {
            return inner.strip_suffix(quote);
        }
    }
    (!part.contains(['\'', '"', '`'])).then_some(part)
}

/// SQL wildcard host to an anchored regex
fn host_pattern(host: &str) -> String {
    let mut pattern = String::from("^");
    for c in host.chars() {
        match c {
            '%' => pattern.push_str(".*"),
            '_' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    pattern
}

impl Account {
    pub fn parse(account: &str) -> Result<Self, MaskingError> {
        let invalid = || MaskingError::InvalidAccount(account.to_string());
        let (user, host) = match account.split_once('@') {
            Some((user, host)) => (user, host),
            None => (account, ""),
        };
        let user = unquote(user).ok_or_else(invalid)?.to_string();
        let host = unquote(host).ok_or_else(invalid)?;

        if host.contains(['%', '_']) {
            let pattern = host_pattern(host);
            let regex = Regex::new(&pattern).map_err(|source| MaskingError::InvalidPattern { pattern, source })?;
            Ok(Account::Pattern {
                user,
                host: Arc::new(regex),
            })
        } else {
            Ok(Account::Verbatim {
                user,
                host: host.to_string(),
            })
        }
    }

    pub fn matches(&self, user: &str, host: &str) -> bool {
        match self {
            Account::Verbatim { user: u, host: h } => {
                (u.is_empty() || u == user) && (h.is_empty() || h == host)
            }
            Account::Pattern { user: u, host: h } => (u.is_empty() || u == user) && h.is_match(host),
        }
    }
}

/// How a masked value is rewritten; the length of the value never changes
#[derive(Debug, Clone)]
pub enum Rewrite {
    /// `value` when it has the same length, otherwise `fill` repeated
    Replace { value: Option<Bytes>, fill: Bytes },
    /// Letters rotated by 13, other bytes shifted up
    Obfuscate,
    /// Every match of the pattern overwritten with `fill`
    Capture { pattern: Arc<regex::bytes::Regex>, fill: Bytes },
}

fn fill_with(out: &mut [u8], fill: &[u8]) {
    if fill.is_empty() {
        return;
    }
    for (byte, f) in out.iter_mut().zip(fill.iter().cycle()) {
        *byte = *f;
    }
}

fn obfuscate_byte(c: u8) -> u8 {
    match c {
        b'a'..=b'z' => (c - b'a' + 13) % 26 + b'a',
        b'A'..=b'Z' => (c - b'A' + 13) % 26 + b'A',
        _ => c.saturating_add(32).min(127),
    }
}

impl Rewrite {
    fn from_config(config: &RewriteConfig) -> Result<Self, MaskingError> {
        Ok(match config {
            RewriteConfig::Replace { value, fill } => Rewrite::Replace {
                value: value.as_ref().map(|v| Bytes::copy_from_slice(v.as_bytes())),
                fill: Bytes::copy_from_slice(fill.as_bytes()),
            },
            RewriteConfig::Obfuscate => Rewrite::Obfuscate,
            RewriteConfig::Capture { pattern, fill } => {
                let regex = regex::bytes::Regex::new(pattern).map_err(|source| MaskingError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
                Rewrite::Capture {
                    pattern: Arc::new(regex),
                    fill: Bytes::copy_from_slice(fill.as_bytes()),
                }
            }
        })
    }

    pub fn apply(&self, value: &[u8]) -> Bytes {
        let mut out = value.to_vec();
        match self {
            Rewrite::Replace { value: Some(v), .. } if v.len() == out.len() => {
                out.copy_from_slice(v);
            }
            Rewrite::Replace { fill, .. } => {
                if fill.is_empty() {
                    warn!(len = out.len(), "Replacement length differs and no fill is set, value left as is");
                }
                fill_with(&mut out, fill);
            }
            Rewrite::Obfuscate => out.iter_mut().for_each(|c| *c = obfuscate_byte(*c)),
            Rewrite::Capture { pattern, fill } => {
                let ranges: Vec<_> = pattern
                    .find_iter(value)
                    .filter(|m| !m.is_empty())
                    .map(|m| m.range())
                    .collect();
                for range in ranges {
                    fill_with(&mut out[range], fill);
                }
            }
        }
        Bytes::from(out)
    }
}

#[derive(Debug, Clone)]
pub struct MaskingRule {
    column: String,
    table: Option<String>,
    database: Option<String>,
    applies_to: Vec<Account>,
    exempted: Vec<Account>,
    rewrite: Rewrite,
}

impl MaskingRule {
    pub fn from_config(config: &MaskingRuleConfig) -> Result<Self, MaskingError> {
        let accounts = |list: &[String]| list.iter().map(|a| Account::parse(a)).collect::<Result<Vec<_>, _>>();
        Ok(Self {
            column: config.column.clone(),
            table: config.table.clone(),
            database: config.database.clone(),
            applies_to: accounts(&config.applies_to)?,
            exempted: accounts(&config.exempted)?,
            rewrite: Rewrite::from_config(&config.rewrite)?,
        })
    }

    pub fn applies_to(&self, user: &str, host: &str) -> bool {
        let included = self.applies_to.is_empty() || self.applies_to.iter().any(|a| a.matches(user, host));
        included && !self.exempted.iter().any(|a| a.matches(user, host))
    }

    pub fn matches_column(&self, column: &ColumnDefinition) -> bool {
        self.column == column.org_name
            && self.table.as_ref().map_or(true, |t| *t == column.org_table)
            && self.database.as_ref().map_or(true, |d| *d == column.schema)
    }

    pub fn rewrite(&self) -> &Rewrite {
        &self.rewrite
    }
}

/// Masking for one session: only the rules that apply to its account
#[derive(Debug)]
pub struct MaskingFilter {
    rules: Vec<Arc<MaskingRule>>,
    /// The statement in flight returns text-protocol rows
    text_rows: bool,
}

impl MaskingFilter {
    /// `None` when no rule applies to the account
    pub fn for_account(rules: &[Arc<MaskingRule>], user: &str, host: &str) -> Option<Self> {
        let rules: Vec<_> = rules.iter().filter(|r| r.applies_to(user, host)).cloned().collect();
        (!rules.is_empty()).then_some(Self {
            rules,
            text_rows: false,
        })
    }

    fn rule_for(&self, column: &[u8]) -> Option<Arc<MaskingRule>> {
        let definition = ColumnDefinition::parse(column)?;
        self.rules.iter().find(|r| r.matches_column(&definition)).cloned()
    }

    fn mask_row(packet: &mut Packet, masks: &[Option<Arc<MaskingRule>>]) {
        let Some(mut values) = parse_text_row(&packet.payload, masks.len()) else {
            return;
        };
        for (value, mask) in values.iter_mut().zip(masks) {
            if let (Some(v), Some(rule)) = (value.as_mut(), mask) {
                *v = rule.rewrite().apply(v);
            }
        }
        packet.payload = encode_text_row(&values);
    }
}

impl Filter for MaskingFilter {
    fn route_query(&mut self, _packet: &Packet, classification: &QueryClassification) -> FilterVerdict {
        self.text_rows = classification.command == Command::Query;
        FilterVerdict::Continue
    }

    fn client_reply(&mut self, reply: &mut [Packet]) {
        if !self.text_rows {
            return;
        }
        let mut at = 0;
        while at < reply.len() {
            let header = &reply[at].payload;
            if is_err_packet(header) {
                return;
            }
            if is_ok_packet(header) {
                if !more_results_exist(header) {
                    return;
                }
                at += 1;
                continue;
            }
            let Some((columns, _)) = read_lenenc_int(header) else {
                return;
            };
            at += 1;

            let mut masks = Vec::new();
            for _ in 0..columns {
                let Some(column) = reply.get(at) else { return };
                masks.push(self.rule_for(&column.payload));
                at += 1;
            }
            // EOF after the definitions
            at += 1;

            let masked = masks.iter().any(Option::is_some);
            let mut continued = false;
            while let Some(row) = reply.get_mut(at) {
                let split = std::mem::replace(&mut continued, row.is_continued());
                if !split && !continued && (is_eof_packet(&row.payload) || is_err_packet(&row.payload)) {
                    break;
                }
                if masked && !split && !continued {
                    Self::mask_row(row, &masks);
                }
                at += 1;
            }

            let more = reply.get(at).map_or(false, |end| more_results_exist(&end.payload));
            at += 1;
            if !more {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    use crate::classifier::{SqlClassifier, StatementClassifier};
    use crate::protocol::wire::put_lenenc_bytes;

    fn rule(toml_rule: &str) -> Arc<MaskingRule> {
        let config: MaskingRuleConfig = toml::from_str(toml_rule).unwrap();
        Arc::new(MaskingRule::from_config(&config).unwrap())
    }

    fn column(schema: &str, table: &str, name: &str) -> Packet {
        let mut buf = BytesMut::new();
        for part in ["def", schema, table, table, name, name] {
            put_lenenc_bytes(&mut buf, Some(part.as_bytes()));
        }
        buf.extend_from_slice(&[0x0c, 0x21, 0x00, 0xff, 0x00, 0x00, 0x00, 0xfd, 0x00, 0x00, 0x00, 0x00, 0x00]);
        Packet::new(2, buf.freeze())
    }

    fn row(values: &[&str]) -> Packet {
        let values: Vec<Option<Bytes>> = values.iter().map(|v| Some(Bytes::copy_from_slice(v.as_bytes()))).collect();
        Packet::new(4, encode_text_row(&values))
    }

    fn eof() -> Packet {
        Packet::new(3, vec![0xFE, 0, 0, 2, 0])
    }

    fn query(filter: &mut MaskingFilter, sql: &str) {
        let mut payload = vec![Command::Query as u8];
        payload.extend_from_slice(sql.as_bytes());
        let packet = Packet::new(0, payload);
        let classification = SqlClassifier::new().classify(&packet).unwrap();
        assert_eq!(filter.route_query(&packet, &classification), FilterVerdict::Continue);
    }

    #[test]
    fn test_account_forms() {
        let exact = Account::parse("'bob'@'10.0.0.1'").unwrap();
        assert!(matches!(exact, Account::Verbatim { .. }));
        assert!(exact.matches("bob", "10.0.0.1"));
        assert!(!exact.matches("bob", "10.0.0.2"));

        let pattern = Account::parse("'bob'@'10.0.%'").unwrap();
        assert!(matches!(pattern, Account::Pattern { .. }));
        assert!(pattern.matches("bob", "10.0.7.1"));
        assert!(!pattern.matches("alice", "10.0.7.1"));
        assert!(!pattern.matches("bob", "10.1.0.1"));

        let anyone = Account::parse("''@'%'").unwrap();
        assert!(anyone.matches("alice", "localhost"));

        assert!(Account::parse("'bob@'host'").is_err());
    }

    #[test]
    fn test_rewrites() {
        let replace = Rewrite::Replace {
            value: Some(Bytes::from_static(b"***")),
            fill: Bytes::from_static(b"X"),
        };
        assert_eq!(&replace.apply(b"abc")[..], b"***");
        assert_eq!(&replace.apply(b"abcde")[..], b"XXXXX");

        assert_eq!(&Rewrite::Obfuscate.apply(b"Hello")[..], b"Uryyb");

        let capture = Rewrite::Capture {
            pattern: Arc::new(regex::bytes::Regex::new("[0-9]+").unwrap()),
            fill: Bytes::from_static(b"#"),
        };
        assert_eq!(&capture.apply(b"tel 555-1234")[..], b"tel ###-####");
    }

    #[test]
    fn test_exempted_account_is_not_masked() {
        let rules = vec![rule(
            r#"
column = "ssn"
applies_to = ["''@'%'"]
exempted = ["'admin'@'localhost'"]
rewrite = { kind = "obfuscate" }
"#,
        )];
        assert!(MaskingFilter::for_account(&rules, "admin", "localhost").is_none());
        assert!(MaskingFilter::for_account(&rules, "app", "10.0.0.5").is_some());
    }

    #[test]
    fn test_account_user_is_matched_verbatim() {
        let any_user = Account::parse("''@'%'").unwrap();
        assert!(any_user.matches("app", "10.0.0.5"));

        let percent = Account::parse("'%'@'%'").unwrap();
        assert!(!percent.matches("app", "10.0.0.5"));
        assert!(percent.matches("%", "10.0.0.5"));

        let subnet = Account::parse("'app'@'10.0.%'").unwrap();
        assert!(subnet.matches("app", "10.0.0.5"));
        assert!(!subnet.matches("app", "192.168.0.5"));
        assert!(!subnet.matches("report", "10.0.0.5"));
    }

    #[test]
    fn test_masks_matching_column_only() {
        let rules = vec![rule(
            r#"
column = "ssn"
table = "customers"
rewrite = { kind = "replace", value = "XXX-XX-XXXX" }
"#,
        )];
        let mut filter = MaskingFilter::for_account(&rules, "app", "127.0.0.1").unwrap();
        query(&mut filter, "SELECT name, ssn FROM customers");

        let mut reply = vec![
            Packet::new(1, vec![2]),
            column("shop", "customers", "name"),
            column("shop", "customers", "ssn"),
            eof(),
            row(&["alice", "123-45-6789"]),
            row(&["bob", "987-65-4321"]),
            eof(),
        ];
        filter.client_reply(&mut reply);

        let values = parse_text_row(&reply[4].payload, 2).unwrap();
        assert_eq!(values[0].as_deref(), Some(&b"alice"[..]));
        assert_eq!(values[1].as_deref(), Some(&b"XXX-XX-XXXX"[..]));
        assert_eq!(reply[4].sequence_id, 4);
        let values = parse_text_row(&reply[5].payload, 2).unwrap();
        assert_eq!(values[1].as_deref(), Some(&b"XXX-XX-XXXX"[..]));
    }

    #[test]
    fn test_binary_protocol_untouched() {
        let rules = vec![rule("column = \"ssn\"\nrewrite = { kind = \"obfuscate\" }")];
        let mut filter = MaskingFilter::for_account(&rules, "app", "h").unwrap();
        filter.route_query(&Packet::new(0, vec![Command::StmtExecute as u8]), &QueryClassification::raw());

        let original = vec![Packet::new(1, vec![1]), column("d", "t", "ssn"), eof(), row(&["abc"]), eof()];
        let mut reply = original.clone();
        filter.client_reply(&mut reply);
        assert_eq!(reply, original);
    }
}
