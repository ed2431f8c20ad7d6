//! Scope checks for protected resources

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// How a multi-scope requirement combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    /// Every required scope must be present.
    #[default]
    All,
    /// At least one required scope must be present.
    Any,
}

/// Scopes a resource requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopePolicy {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub mode: ScopeMode,
}

impl ScopePolicy {
    pub fn all<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            mode: ScopeMode::All,
        }
    }

    pub fn any<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            mode: ScopeMode::Any,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeDecision {
    Granted { matched: BTreeSet<String> },
    InsufficientScope { missing: Vec<String> },
}

impl ScopeDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, ScopeDecision::Granted { .. })
    }
}

/// Split a space-delimited `scope` value (RFC 6749 §3.3).
pub fn parse_scopes(scope: &str) -> BTreeSet<String> {
    scope.split_ascii_whitespace().map(str::to_string).collect()
}

pub fn check(validated: &BTreeSet<String>, required: &str) -> bool {
    validated.contains(required)
}

pub fn check_policy(validated: &BTreeSet<String>, policy: &ScopePolicy) -> ScopeDecision {
    let (matched, missing): (Vec<&String>, Vec<&String>) =
        policy.required.iter().partition(|s| validated.contains(*s));

    let granted = match policy.mode {
        ScopeMode::All => missing.is_empty(),
        ScopeMode::Any => policy.required.is_empty() || !matched.is_empty(),
    };

    if granted {
        ScopeDecision::Granted {
            matched: matched.into_iter().cloned().collect(),
        }
    } else {
        ScopeDecision::InsufficientScope {
            missing: missing.into_iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_dedups() {
        let scopes = parse_scopes("  read:data write:data\tread:data ");
        assert_eq!(scopes.len(), 2);
        assert!(check(&scopes, "read:data"));
        assert!(!check(&scopes, "admin"));
        assert!(parse_scopes("").is_empty());
    }

    #[test]
    fn all_mode_reports_every_missing_scope() {
        let scopes = parse_scopes("read:data");
        let decision = check_policy(&scopes, &ScopePolicy::all(["read:data", "write:data", "admin"]));
        assert_eq!(
            decision,
            ScopeDecision::InsufficientScope {
                missing: vec!["write:data".into(), "admin".into()]
            }
        );
    }

    #[test]
    fn any_mode_grants_on_first_overlap() {
        let scopes = parse_scopes("write:data");
        match check_policy(&scopes, &ScopePolicy::any(["read:data", "write:data"])) {
            ScopeDecision::Granted { matched } => {
                assert_eq!(matched, BTreeSet::from(["write:data".to_string()]));
            }
            other => panic!("expected grant, got {other:?}"),
        }
        assert!(!check_policy(&parse_scopes("profile"), &ScopePolicy::any(["admin"])).is_granted());
    }

    #[test]
    fn repeated_checks_give_the_same_answer() {
        let scopes = parse_scopes("read:data profile");
        let policies = [
            ScopePolicy::all(["read:data", "admin"]),
            ScopePolicy::any(["admin", "profile"]),
            ScopePolicy::default(),
        ];
        for policy in &policies {
            let first = check_policy(&scopes, policy);
            assert_eq!(check_policy(&scopes, policy), first);
            assert_eq!(check_policy(&scopes, policy), first);
        }
        for required in ["read:data", "admin"] {
            assert_eq!(check(&scopes, required), check(&scopes, required));
        }
        assert_eq!(scopes, parse_scopes("read:data profile"));
    }

    #[test]
    fn empty_requirement_is_granted() {
        let none = BTreeSet::new();
        assert!(check_policy(&none, &ScopePolicy::default()).is_granted());
        assert!(check_policy(&none, &ScopePolicy::any(Vec::<String>::new())).is_granted());
    }

    #[test]
    fn policy_deserializes_with_default_mode() {
        let policy: ScopePolicy = serde_json::from_str(r#"{"required":["read:data"]}"#).unwrap();
        assert_eq!(policy.mode, ScopeMode::All);
        let policy: ScopePolicy =
            serde_json::from_str(r#"{"required":["a","b"],"mode":"any"}"#).unwrap();
        assert_eq!(policy.mode, ScopeMode::Any);
    }
}
