use std::path::Path;

use regex::Regex;
use serde::Deserialize;

/// The SQL firewall consulted per query frame (§4.3). Stateless with respect to the
/// connection: the same `Censor` instance serves every query on every connection.
pub struct Censor {
    deny_patterns: Vec<Regex>,
    allow_patterns: Vec<Regex>,
}

#[derive(Debug)]
pub enum Verdict {
    Allow,
    Deny(String),
}

#[derive(Debug, Deserialize, Default)]
struct CensorPolicyFile {
    #[serde(default)]
    deny: Vec<String>,
    #[serde(default)]
    allow: Vec<String>,
}

impl Censor {
    /// A missing policy file is equivalent to allow-all (§4.3).
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let policy = match path {
            None => CensorPolicyFile::default(),
            Some(p) if !p.exists() => CensorPolicyFile::default(),
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| format!("reading censor policy {p:?}: {e}"))?;
                serde_yaml::from_str(&raw)
                    .map_err(|e| format!("parsing censor policy {p:?}: {e}"))?
            }
        };
        Self::from_policy(policy)
    }

    fn from_policy(policy: CensorPolicyFile) -> Result<Self, String> {
        let compile = |patterns: Vec<String>| -> Result<Vec<Regex>, String> {
            patterns
                .into_iter()
                .map(|p| Regex::new(&format!("(?i){p}")).map_err(|e| format!("bad pattern {p:?}: {e}")))
                .collect()
        };
        Ok(Censor {
            deny_patterns: compile(policy.deny)?,
            allow_patterns: compile(policy.allow)?,
        })
    }

    pub fn allow_all() -> Self {
        Censor {
            deny_patterns: Vec::new(),
            allow_patterns: Vec::new(),
        }
    }

    /// `inspect(query, clientID) -> Allow | Deny(reason)`. An explicit allow-list, if
    /// non-empty, makes the policy a whitelist (anything not matched is denied);
    /// otherwise a deny-list is checked and everything else is allowed.
    pub fn inspect(&self, query: &str, _client_id: &str) -> Verdict {
        for pattern in &self.deny_patterns {
            if pattern.is_match(query) {
                return Verdict::Deny(format!("query matches forbidden pattern {}", pattern));
            }
        }
        if !self.allow_patterns.is_empty() {
            let matched = self.allow_patterns.iter().any(|p| p.is_match(query));
            if !matched {
                return Verdict::Deny("query does not match any allow-listed pattern".to_string());
            }
        }
        Verdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_policy_file_allows_everything() {
        let censor = Censor::load(None).unwrap();
        assert!(matches!(
            censor.inspect("DROP TABLE users", "client-1"),
            Verdict::Allow
        ));
    }

    #[test]
    fn deny_pattern_rejects_matching_query() {
        let policy = CensorPolicyFile {
            deny: vec!["DROP TABLE .*".to_string()],
            allow: vec![],
        };
        let censor = Censor::from_policy(policy).unwrap();
        assert!(matches!(
            censor.inspect("DROP TABLE users", "client-1"),
            Verdict::Deny(_)
        ));
        assert!(matches!(
            censor.inspect("SELECT 1", "client-1"),
            Verdict::Allow
        ));
    }

    #[test]
    fn non_empty_allow_list_rejects_everything_else() {
        let policy = CensorPolicyFile {
            deny: vec![],
            allow: vec!["^SELECT .*".to_string()],
        };
        let censor = Censor::from_policy(policy).unwrap();
        assert!(matches!(
            censor.inspect("SELECT * FROM t", "client-1"),
            Verdict::Allow
        ));
        assert!(matches!(
            censor.inspect("DELETE FROM t", "client-1"),
            Verdict::Deny(_)
        ));
    }
}
