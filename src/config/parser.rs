// SPDX-License-Identifier: AGPL-3.0-or-later

//! The bus config XML parser (C8): an element-stack push-down automaton
//! consuming tokens from [`crate::config::xml`] and producing a
//! [`BusConfig`].
//!
//! Grounded in `examples/original_source/bus/config-parser.c`: the element
//! stack, the `ElementData` scratch variant carried alongside it, the
//! `<policy>` attribute-combination checks, the `<allow>`/`<deny>`
//! attribute-pairing checks, and the unknown-user/unknown-group handling
//! all mirror `append_rule_from_element` and its surrounding code there.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    config::xml::{self, Token},
    policy::{Policy, Rule},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0}")]
    Xml(#[from] xml::XmlError),
    #[error("element <{element}> not allowed inside <{parent}>")]
    ElementNotAllowed { element: String, parent: String },
    #[error("unclosed element <{0}> at end of document")]
    UnclosedElement(String),
    #[error("unexpected closing tag </{found}>, expected </{expected}>")]
    MismatchedClose { found: String, expected: String },
    #[error("element <{0}> requires text content")]
    MissingTextContent(String),
    #[error("element <{0}> must be empty")]
    UnexpectedTextContent(String),
    #[error("{0}")]
    InvalidAttributes(String),
    #[error("at least one <listen> element is required")]
    NoListenAddress,
    #[error("circular <include> of {0}")]
    CircularInclude(String),
    #[error("failed to read {path}: {source}")]
    Io { path: String, source: String },
}

/// Daemon-global configuration assembled from the bus XML tree.
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    pub bus_type: Option<String>,
    pub listen: Vec<String>,
    pub auth_mechanisms: Vec<String>,
    pub service_dirs: Vec<String>,
    pub user: Option<String>,
    pub fork: bool,
    pub pidfile: Option<String>,
    pub policy: Policy,
}

impl BusConfig {
    /// Merges `other` (an included file's result) into `self`: scalars
    /// overwrite, lists concatenate in order, policy rules concatenate,
    /// `fork` OR-s.
    fn merge(&mut self, other: BusConfig) {
        if other.bus_type.is_some() {
            self.bus_type = other.bus_type;
        }
        if other.user.is_some() {
            self.user = other.user;
        }
        if other.pidfile.is_some() {
            self.pidfile = other.pidfile;
        }
        self.listen.extend(other.listen);
        self.auth_mechanisms.extend(other.auth_mechanisms);
        self.service_dirs.extend(other.service_dirs);
        self.fork = self.fork || other.fork;
        self.policy.merge(other.policy);
    }
}

/// Maps configured user/group names to numeric ids. The real lookup
/// facility is a platform credential database, kept out of scope here;
/// this trait is the seam a host environment plugs a real lookup into.
/// [`NumericOnlyLookup`] is the default and only resolves
/// names that are already numeric, which is enough to exercise the
/// parser's own logic without depending on any host-specific database.
pub trait CredentialLookup {
    fn uid_for_user(&self, name: &str) -> Option<u32>;
    fn gid_for_group(&self, name: &str) -> Option<u32>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NumericOnlyLookup;

impl CredentialLookup for NumericOnlyLookup {
    fn uid_for_user(&self, name: &str) -> Option<u32> {
        name.parse().ok()
    }

    fn gid_for_group(&self, name: &str) -> Option<u32> {
        name.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementType {
    BusConfig,
    Type,
    User,
    Fork,
    Pidfile,
    Listen,
    Auth,
    ServiceDir,
    IncludeDir,
    Include,
    Policy,
    Allow,
    Deny,
}

impl ElementType {
    fn name(self) -> &'static str {
        match self {
            ElementType::BusConfig => "busconfig",
            ElementType::Type => "type",
            ElementType::User => "user",
            ElementType::Fork => "fork",
            ElementType::Pidfile => "pidfile",
            ElementType::Listen => "listen",
            ElementType::Auth => "auth",
            ElementType::ServiceDir => "servicedir",
            ElementType::IncludeDir => "includedir",
            ElementType::Include => "include",
            ElementType::Policy => "policy",
            ElementType::Allow => "allow",
            ElementType::Deny => "deny",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "busconfig" => ElementType::BusConfig,
            "type" => ElementType::Type,
            "user" => ElementType::User,
            "fork" => ElementType::Fork,
            "pidfile" => ElementType::Pidfile,
            "listen" => ElementType::Listen,
            "auth" => ElementType::Auth,
            "servicedir" => ElementType::ServiceDir,
            "includedir" => ElementType::IncludeDir,
            "include" => ElementType::Include,
            "policy" => ElementType::Policy,
            "allow" => ElementType::Allow,
            "deny" => ElementType::Deny,
            _ => return None,
        })
    }

    /// Whether this element is allowed to carry text content.
    fn takes_text(self) -> bool {
        matches!(
            self,
            ElementType::Type
                | ElementType::User
                | ElementType::Pidfile
                | ElementType::Listen
                | ElementType::Auth
                | ElementType::ServiceDir
                | ElementType::IncludeDir
                | ElementType::Include
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PolicyKind {
    Default,
    Mandatory,
    User(u32),
    Group(u32),
    /// Unknown user/group named in the `<policy>` attribute: the block is
    /// parsed but every rule inside it is dropped on the floor.
    Ignored,
}

/// Scratch data carried alongside an element on the stack.
enum ElementData {
    None,
    Include { ignore_missing: bool },
    Policy(PolicyKind),
}

struct StackEntry {
    element: ElementType,
    data: ElementData,
    text: String,
}

/// One document-parsing pass. A fresh `Parser` is created for every
/// `<include>`d file; the `seen_paths` set is threaded down through
/// includes to detect cycles.
struct Parser<'a> {
    stack: Vec<StackEntry>,
    config: BusConfig,
    basedir: PathBuf,
    seen_paths: &'a mut HashSet<PathBuf>,
    lookup: &'a dyn CredentialLookup,
    saw_busconfig_root: bool,
}

/// Parses `path` (and any files it `<include>`s or `<includedir>`s) into a
/// merged [`BusConfig`], using [`NumericOnlyLookup`] for user/group name
/// resolution.
pub fn parse_file(path: &Path) -> Result<BusConfig, ConfigError> {
    parse_file_with_lookup(path, &NumericOnlyLookup)
}

/// As [`parse_file`], with a caller-supplied [`CredentialLookup`].
pub fn parse_file_with_lookup(
    path: &Path,
    lookup: &dyn CredentialLookup,
) -> Result<BusConfig, ConfigError> {
    let mut seen = HashSet::new();
    parse_file_inner(path, &mut seen, lookup, true)
}

fn parse_file_inner(
    path: &Path,
    seen_paths: &mut HashSet<PathBuf>,
    lookup: &dyn CredentialLookup,
    require_listen: bool,
) -> Result<BusConfig, ConfigError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen_paths.insert(canonical.clone()) {
        return Err(ConfigError::CircularInclude(path.display().to_string()));
    }

    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io { path: path.display().to_string(), source: e.to_string() })?;
    let basedir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

    let tokens = xml::tokenize(&text)?;
    let mut parser = Parser {
        stack: Vec::new(),
        config: BusConfig::default(),
        basedir,
        seen_paths,
        lookup,
        saw_busconfig_root: false,
    };

    for token in tokens {
        parser.handle_token(token)?;
    }

    if let Some(top) = parser.stack.last() {
        return Err(ConfigError::UnclosedElement(top.element.name().to_owned()));
    }
    if require_listen && parser.config.listen.is_empty() {
        return Err(ConfigError::NoListenAddress);
    }

    seen_paths.remove(&canonical);
    Ok(parser.config)
}

impl<'a> Parser<'a> {
    fn handle_token(&mut self, token: Token) -> Result<(), ConfigError> {
        match token {
            Token::StartTag { name, attrs } => self.start_element(&name, &attrs),
            Token::EndTag { name } => self.end_element(&name),
            Token::Text(text) => {
                if let Some(top) = self.stack.last_mut() {
                    top.text.push_str(&text);
                }
                Ok(())
            },
        }
    }

    fn parent(&self) -> Option<ElementType> {
        self.stack.last().map(|e| e.element)
    }

    fn start_element(
        &mut self,
        name: &str,
        attrs: &[(String, String)],
    ) -> Result<(), ConfigError> {
        let kind = ElementType::from_name(name).ok_or_else(|| ConfigError::ElementNotAllowed {
            element: name.to_owned(),
            parent: self.parent().map(ElementType::name).unwrap_or("<document>").to_owned(),
        })?;

        let parent = self.parent();
        let parent_ok = match (parent, kind) {
            (None, ElementType::BusConfig) => true,
            (Some(ElementType::BusConfig), ElementType::Policy) => true,
            (Some(ElementType::Policy), ElementType::Allow | ElementType::Deny) => true,
            (Some(ElementType::BusConfig), _)
                if !matches!(kind, ElementType::BusConfig | ElementType::Allow | ElementType::Deny) =>
            {
                true
            },
            _ => false,
        };
        if !parent_ok {
            return Err(ConfigError::ElementNotAllowed {
                element: name.to_owned(),
                parent: parent.map(ElementType::name).unwrap_or("<document>").to_owned(),
            });
        }
        if kind == ElementType::BusConfig {
            self.saw_busconfig_root = true;
        }

        let data = match kind {
            ElementType::Include => {
                let ignore_missing = match attr(attrs, "ignore_missing") {
                    Some("yes") => true,
                    Some("no") | None => false,
                    Some(other) => {
                        return Err(ConfigError::InvalidAttributes(format!(
                            "ignore_missing attribute must have value \"yes\" or \"no\", not \"{other}\""
                        )));
                    },
                };
                ElementData::Include { ignore_missing }
            },
            ElementType::Policy => ElementData::Policy(self.policy_kind_from_attrs(attrs)?),
            ElementType::Allow | ElementType::Deny => {
                self.append_rule_from_element(kind, attrs)?;
                ElementData::None
            },
            _ => ElementData::None,
        };

        self.stack.push(StackEntry { element: kind, data, text: String::new() });
        Ok(())
    }

    fn policy_kind_from_attrs(&self, attrs: &[(String, String)]) -> Result<PolicyKind, ConfigError> {
        let context = attr(attrs, "context");
        let user = attr(attrs, "user");
        let group = attr(attrs, "group");

        let present = [context.is_some(), user.is_some(), group.is_some()];
        if present.iter().filter(|p| **p).count() != 1 {
            return Err(ConfigError::InvalidAttributes(
                "<policy> element must have exactly one of (context|user|group) attributes".into(),
            ));
        }

        if let Some(context) = context {
            return match context {
                "default" => Ok(PolicyKind::Default),
                "mandatory" => Ok(PolicyKind::Mandatory),
                other => Err(ConfigError::InvalidAttributes(format!(
                    "context attribute on <policy> must have the value \"default\" or \"mandatory\", not \"{other}\""
                ))),
            };
        }
        if let Some(user) = user {
            return Ok(match self.lookup.uid_for_user(user) {
                Some(uid) => PolicyKind::User(uid),
                None => PolicyKind::Ignored,
            });
        }
        let group = group.expect("exactly one of context/user/group present");
        Ok(match self.lookup.gid_for_group(group) {
            Some(gid) => PolicyKind::Group(gid),
            None => PolicyKind::Ignored,
        })
    }

    fn append_rule_from_element(
        &mut self,
        kind: ElementType,
        attrs: &[(String, String)],
    ) -> Result<(), ConfigError> {
        let element_name = kind.name();
        let send = attr(attrs, "send");
        let receive = attr(attrs, "receive");
        let own = attr(attrs, "own");
        let send_to = attr(attrs, "send_to");
        let receive_from = attr(attrs, "receive_from");
        let user = attr(attrs, "user");
        let group = attr(attrs, "group");

        if [send, receive, own, send_to, receive_from, user, group].iter().all(|a| a.is_none()) {
            return Err(ConfigError::InvalidAttributes(format!(
                "element <{element_name}> must have one or more attributes"
            )));
        }

        let invalid_combo = (send.is_some() && (own.is_some() || receive.is_some() || receive_from.is_some() || user.is_some() || group.is_some()))
            || (receive.is_some() && (own.is_some() || send_to.is_some() || user.is_some() || group.is_some()))
            || (own.is_some() && (send_to.is_some() || receive_from.is_some() || user.is_some() || group.is_some()))
            || (send_to.is_some() && (receive_from.is_some() || user.is_some() || group.is_some()))
            || (receive_from.is_some() && (user.is_some() || group.is_some()))
            || (user.is_some() && group.is_some());
        if invalid_combo {
            return Err(ConfigError::InvalidAttributes(format!(
                "invalid combination of attributes on element <{element_name}>, only send/send_to or receive/receive_from may be paired"
            )));
        }

        let allow = kind == ElementType::Allow;
        let rule = if send.is_some() || send_to.is_some() {
            Some(Rule::send(allow, unwild(send), unwild(send_to)))
        } else if receive.is_some() || receive_from.is_some() {
            Some(Rule::receive(allow, unwild(receive), unwild(receive_from)))
        } else if let Some(own) = own {
            Some(Rule::own(allow, unwild(Some(own))))
        } else if let Some(user) = user {
            if is_wildcard(user) {
                // `user="*"` is accepted and stored as a match-any uid-0
                // rule, since `RuleKind::User` has no "any" representation
                // of its own (see DESIGN.md).
                Some(Rule::user(allow, 0))
            } else {
                match self.lookup.uid_for_user(user) {
                    Some(uid) => Some(Rule::user(allow, uid)),
                    None => {
                        tracing::warn!("unknown username \"{user}\" on element <{element_name}>");
                        None
                    },
                }
            }
        } else if let Some(group) = group {
            if is_wildcard(group) {
                Some(Rule::group(allow, 0))
            } else {
                match self.lookup.gid_for_group(group) {
                    Some(gid) => Some(Rule::group(allow, gid)),
                    None => {
                        tracing::warn!("unknown group \"{group}\" on element <{element_name}>");
                        None
                    },
                }
            }
        } else {
            None
        };

        let Some(rule) = rule else {
            return Ok(());
        };

        let policy_entry = self
            .stack
            .last()
            .expect("allow/deny is only pushed inside a validated <policy> parent");
        let ElementData::Policy(policy_kind) = policy_entry.data else {
            unreachable!("allow/deny's parent is always a <policy> element");
        };

        let is_per_client = matches!(rule.kind, crate::policy::RuleKind::Send { .. } | crate::policy::RuleKind::Receive { .. } | crate::policy::RuleKind::Own { .. });

        match policy_kind {
            PolicyKind::Ignored => {},
            PolicyKind::Default => self.config.policy.default.push(rule),
            PolicyKind::Mandatory => self.config.policy.mandatory.push(rule),
            PolicyKind::User(uid) => {
                if !is_per_client {
                    return Err(ConfigError::InvalidAttributes(format!(
                        "<{element_name}> rule cannot be per-user because it has bus-global semantics"
                    )));
                }
                self.config.policy.per_user.entry(uid).or_default().push(rule);
            },
            PolicyKind::Group(gid) => {
                if !is_per_client {
                    return Err(ConfigError::InvalidAttributes(format!(
                        "<{element_name}> rule cannot be per-group because it has bus-global semantics"
                    )));
                }
                self.config.policy.per_group.entry(gid).or_default().push(rule);
            },
        }
        Ok(())
    }

    fn end_element(&mut self, name: &str) -> Result<(), ConfigError> {
        let kind = ElementType::from_name(name).ok_or_else(|| ConfigError::ElementNotAllowed {
            element: name.to_owned(),
            parent: self.parent().map(ElementType::name).unwrap_or("<document>").to_owned(),
        })?;

        let top = self.stack.pop().ok_or_else(|| ConfigError::MismatchedClose {
            found: name.to_owned(),
            expected: "<nothing open>".to_owned(),
        })?;
        if top.element != kind {
            return Err(ConfigError::MismatchedClose {
                found: name.to_owned(),
                expected: top.element.name().to_owned(),
            });
        }

        let text = top.text.trim().to_owned();
        if kind.takes_text() && text.is_empty() && !matches!(kind, ElementType::Include) {
            return Err(ConfigError::MissingTextContent(kind.name().to_owned()));
        }
        if !kind.takes_text() && !text.is_empty() {
            return Err(ConfigError::UnexpectedTextContent(kind.name().to_owned()));
        }

        match kind {
            ElementType::Type => self.config.bus_type = Some(text),
            ElementType::User => self.config.user = Some(text),
            ElementType::Fork => self.config.fork = true,
            ElementType::Pidfile => self.config.pidfile = Some(text),
            ElementType::Listen => self.config.listen.push(text),
            ElementType::Auth => self.config.auth_mechanisms.push(text),
            ElementType::ServiceDir => self.config.service_dirs.push(self.resolve_path(&text)),
            ElementType::IncludeDir => self.include_dir(&text)?,
            ElementType::Include => {
                let ElementData::Include { ignore_missing } = top.data else {
                    unreachable!("Include element always carries Include scratch data");
                };
                self.include_file(&text, ignore_missing)?;
            },
            ElementType::BusConfig | ElementType::Policy | ElementType::Allow | ElementType::Deny => {},
        }
        Ok(())
    }

    fn resolve_path(&self, raw: &str) -> String {
        let path = Path::new(raw);
        if path.is_absolute() {
            raw.to_owned()
        } else {
            self.basedir.join(path).to_string_lossy().into_owned()
        }
    }

    fn include_file(&mut self, raw_path: &str, ignore_missing: bool) -> Result<(), ConfigError> {
        let resolved = self.resolve_path(raw_path);
        let path = PathBuf::from(&resolved);
        if !path.exists() {
            if ignore_missing {
                return Ok(());
            }
            return Err(ConfigError::Io {
                path: resolved,
                source: "file not found".to_owned(),
            });
        }
        let included = parse_file_inner(&path, self.seen_paths, self.lookup, false)?;
        self.config.merge(included);
        Ok(())
    }

    fn include_dir(&mut self, raw_path: &str) -> Result<(), ConfigError> {
        let resolved = self.resolve_path(raw_path);
        let dir = PathBuf::from(&resolved);
        let Ok(read_dir) = std::fs::read_dir(&dir) else {
            return Ok(());
        };
        let mut entries: Vec<PathBuf> = read_dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("conf"))
            .collect();
        entries.sort();
        for entry in entries {
            let included = parse_file_inner(&entry, self.seen_paths, self.lookup, false)?;
            self.config.merge(included);
        }
        Ok(())
    }
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn is_wildcard(s: &str) -> bool {
    s == "*"
}

fn unwild(s: Option<&str>) -> Option<String> {
    s.filter(|v| !is_wildcard(v)).map(str::to_owned)
}
