// SPDX-License-Identifier: AGPL-3.0-or-later

//! The policy engine (C7): layered allow/deny rule lists evaluated per
//! send/receive/own decision.
//!
//! Four rule lists are kept — default, mandatory, per-user, per-group — and
//! evaluated in that order with an implicit deny as the starting verdict.
//! Within a list the last matching rule wins; later lists override earlier
//! ones, except that `mandatory` cannot be overridden by per-user/per-group
//! rules (it is folded in again after them).

use std::collections::HashMap;

/// What a rule governs. `User`/`Group` rules are bus-global and may only
/// live in the default or mandatory list (enforced by the config parser).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Send { name: Option<String>, destination: Option<String> },
    Receive { name: Option<String>, sender: Option<String> },
    Own { name: Option<String> },
    User { uid: u32 },
    Group { gid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    pub allow: bool,
}

impl Rule {
    pub fn send(allow: bool, name: Option<String>, destination: Option<String>) -> Self {
        Self { kind: RuleKind::Send { name, destination }, allow }
    }

    pub fn receive(allow: bool, name: Option<String>, sender: Option<String>) -> Self {
        Self { kind: RuleKind::Receive { name, sender }, allow }
    }

    pub fn own(allow: bool, name: Option<String>) -> Self {
        Self { kind: RuleKind::Own { name }, allow }
    }

    pub fn user(allow: bool, uid: u32) -> Self {
        Self { kind: RuleKind::User { uid }, allow }
    }

    pub fn group(allow: bool, gid: u32) -> Self {
        Self { kind: RuleKind::Group { gid }, allow }
    }

    /// A constraint value of `None` means "match any", per spec wildcards.
    fn matches_send(&self, msg_name: Option<&str>, destination: Option<&str>) -> bool {
        match &self.kind {
            RuleKind::Send { name, destination: dst } => {
                matches_opt(name.as_deref(), msg_name) && matches_opt(dst.as_deref(), destination)
            },
            _ => false,
        }
    }

    fn matches_receive(&self, msg_name: Option<&str>, sender: Option<&str>) -> bool {
        match &self.kind {
            RuleKind::Receive { name, sender: src } => {
                matches_opt(name.as_deref(), msg_name) && matches_opt(src.as_deref(), sender)
            },
            _ => false,
        }
    }

    fn matches_own(&self, name: &str) -> bool {
        match &self.kind {
            RuleKind::Own { name: n } => matches_opt(n.as_deref(), Some(name)),
            _ => false,
        }
    }
}

fn matches_opt(constraint: Option<&str>, value: Option<&str>) -> bool {
    match constraint {
        None => true,
        Some(c) => value == Some(c),
    }
}

/// The connection identity a policy decision is made against.
#[derive(Debug, Clone)]
pub struct Principal {
    pub uid: u32,
    /// Primary gid plus every supplementary group, so the per-group policy
    /// pass below considers every `<policy group="...">` list the
    /// connecting peer actually belongs to, not just its primary group.
    pub groups: Vec<u32>,
}

/// The four layered rule lists that make up a bus policy.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub default: Vec<Rule>,
    pub mandatory: Vec<Rule>,
    pub per_user: HashMap<u32, Vec<Rule>>,
    pub per_group: HashMap<u32, Vec<Rule>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Deny,
    Allow,
}

impl From<bool> for Verdict {
    fn from(allow: bool) -> Self {
        if allow { Verdict::Allow } else { Verdict::Deny }
    }
}

impl Policy {
    pub fn can_send(
        &self,
        principal: &Principal,
        msg_name: Option<&str>,
        destination: Option<&str>,
    ) -> bool {
        self.evaluate(principal, |r| r.matches_send(msg_name, destination))
    }

    pub fn can_receive(
        &self,
        principal: &Principal,
        msg_name: Option<&str>,
        sender: Option<&str>,
    ) -> bool {
        self.evaluate(principal, |r| r.matches_receive(msg_name, sender))
    }

    pub fn can_own(&self, principal: &Principal, name: &str) -> bool {
        self.evaluate(principal, |r| r.matches_own(name))
    }

    /// Runs the layered evaluation order: default, then
    /// mandatory, then every group list the principal belongs to (primary
    /// and supplementary groups alike), then the per-user list, with
    /// `mandatory` re-applied last so it cannot be overridden by the
    /// per-group/per-user layers.
    fn evaluate(&self, principal: &Principal, matches: impl Fn(&Rule) -> bool) -> bool {
        let mut verdict = Verdict::Deny;

        apply_list(&self.default, &matches, &mut verdict);
        apply_list(&self.mandatory, &matches, &mut verdict);
        for gid in &principal.groups {
            if let Some(rules) = self.per_group.get(gid) {
                apply_list(rules, &matches, &mut verdict);
            }
        }
        if let Some(rules) = self.per_user.get(&principal.uid) {
            apply_list(rules, &matches, &mut verdict);
        }
        apply_list(&self.mandatory, &matches, &mut verdict);

        verdict == Verdict::Allow
    }

    pub fn merge(&mut self, other: Policy) {
        self.default.extend(other.default);
        self.mandatory.extend(other.mandatory);
        for (uid, rules) in other.per_user {
            self.per_user.entry(uid).or_default().extend(rules);
        }
        for (gid, rules) in other.per_group {
            self.per_group.entry(gid).or_default().extend(rules);
        }
    }
}

fn apply_list(rules: &[Rule], matches: impl Fn(&Rule) -> bool, verdict: &mut Verdict) {
    for rule in rules {
        if matches(rule) {
            *verdict = rule.allow.into();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(uid: u32, gid: u32) -> Principal {
        Principal { uid, groups: vec![gid] }
    }

    #[test]
    fn implicit_deny_with_no_rules() {
        let policy = Policy::default();
        assert!(!policy.can_send(&principal(1, 1), Some("foo.Bar"), None));
    }

    #[test]
    fn default_allow_then_deny_overridden_by_last_match() {
        let mut policy = Policy::default();
        policy.default.push(Rule::send(true, None, None));
        policy.default.push(Rule::send(false, Some("foo.Bar".into()), None));
        assert!(policy.can_send(&principal(1, 1), Some("foo.Quux"), None));
        assert!(!policy.can_send(&principal(1, 1), Some("foo.Bar"), None));
    }

    #[test]
    fn scenario_4_policy_deny_no_override() {
        let mut policy = Policy::default();
        policy.default.push(Rule::send(false, Some("foo.Bar".into()), None));
        assert!(!policy.can_send(&principal(1, 1), Some("foo.Bar"), None));
    }

    #[test]
    fn mandatory_cannot_be_overridden_by_per_user() {
        let mut policy = Policy::default();
        policy.mandatory.push(Rule::send(false, Some("foo.Bar".into()), None));
        policy.per_user.insert(1, vec![Rule::send(true, Some("foo.Bar".into()), None)]);
        assert!(!policy.can_send(&principal(1, 1), Some("foo.Bar"), None));
    }

    #[test]
    fn per_user_overrides_default_and_group() {
        let mut policy = Policy::default();
        policy.default.push(Rule::send(false, None, None));
        policy.per_group.insert(5, vec![Rule::send(false, None, None)]);
        policy.per_user.insert(1, vec![Rule::send(true, Some("foo.Bar".into()), None)]);
        assert!(policy.can_send(&principal(1, 5), Some("foo.Bar"), None));
        assert!(!policy.can_send(&principal(1, 5), Some("foo.Other"), None));
    }

    #[test]
    fn a_rule_on_any_supplementary_group_applies_not_just_the_primary_one() {
        let mut policy = Policy::default();
        policy.per_group.insert(200, vec![Rule::send(true, Some("foo.Bar".into()), None)]);
        let p = Principal { uid: 1, groups: vec![100, 200, 300] };
        assert!(policy.can_send(&p, Some("foo.Bar"), None));
    }

    #[test]
    fn policy_determinism_is_a_pure_function() {
        let mut policy = Policy::default();
        policy.default.push(Rule::own(true, Some("org.example".into())));
        let a = policy.can_own(&principal(1, 1), "org.example");
        let b = policy.can_own(&principal(1, 1), "org.example");
        assert_eq!(a, b);
    }
}
