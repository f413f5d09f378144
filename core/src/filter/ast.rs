//! Filter-rule record and its building blocks.
//!
//! A rule pairs a set of predicates (source user, user description, source
//! IP, target site, target port) with an action mask, a log mask, and the
//! set of destination channels the target predicate applies to. Rules are
//! produced by the rule parser and folded into the compiled lookup tree; the
//! `Display` form re-parses to an identical rule.

use std::fmt;
use std::str::FromStr;

use bitmask_enum::bitmask;

use crate::filter::FilterError;

/// The five filter actions, as a mask: equal-precedence rules that land on
/// the same leaf of the compiled tree merge their action masks.
#[bitmask]
#[bitmask_config(vec_debug)]
pub enum Action {
    /// Terminate TLS and divert the connection to the inspector.
    Divert,
    /// Terminate TLS but stream directly, without the inspector.
    Split,
    /// Relay untouched, no TLS interception.
    Pass,
    /// Close the connection.
    Block,
    /// No action of its own; contributes log settings when selected.
    Match,
}

impl FromStr for Action {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Divert" => Ok(Action::Divert),
            "Split" => Ok(Action::Split),
            "Pass" => Ok(Action::Pass),
            "Block" => Ok(Action::Block),
            "Match" => Ok(Action::Match),
            _ => Err(FilterError::InvalidAction(s.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (Action::Divert, "Divert"),
            (Action::Split, "Split"),
            (Action::Pass, "Pass"),
            (Action::Block, "Block"),
            (Action::Match, "Match"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// The six log channels a rule can toggle.
#[bitmask]
#[bitmask_config(vec_debug)]
pub enum LogAction {
    Connect,
    Master,
    Cert,
    Content,
    Pcap,
    Mirror,
}

pub(crate) const LOG_CHANNELS: [(LogAction, &str); 6] = [
    (LogAction::Connect, "connect"),
    (LogAction::Master, "master"),
    (LogAction::Cert, "cert"),
    (LogAction::Content, "content"),
    (LogAction::Pcap, "pcap"),
    (LogAction::Mirror, "mirror"),
];

impl FromStr for LogAction {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LOG_CHANNELS
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(bit, _)| *bit)
            .ok_or_else(|| FilterError::InvalidLogChannel(s.to_string()))
    }
}

/// A log specification: channels switched on, and channels explicitly
/// negated (`!channel`). A negated bit clears its positive twin whenever the
/// two meet, and negation is sticky across equal-precedence merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSpec {
    pub set: LogAction,
    pub clear: LogAction,
}

impl Default for LogSpec {
    fn default() -> Self {
        LogSpec {
            set: LogAction::none(),
            clear: LogAction::none(),
        }
    }
}

impl LogSpec {
    pub fn is_empty(&self) -> bool {
        self.set.is_none() && self.clear.is_none()
    }

    /// Adds one `log` clause token: a channel name, `!`-negated channel
    /// name, or `*` for all channels.
    pub fn add_token(&mut self, token: &str) -> Result<(), FilterError> {
        if token == "*" {
            self.set = LogAction::all();
        } else if let Some(name) = token.strip_prefix('!') {
            self.clear |= LogAction::from_str(name)?;
        } else {
            self.set |= LogAction::from_str(token)?;
        }
        self.set &= self.clear.not();
        Ok(())
    }

    /// OR-merges another spec, then re-applies negations.
    pub fn merge(&mut self, other: &LogSpec) {
        self.set |= other.set;
        self.clear |= other.clear;
        self.set &= self.clear.not();
    }

    /// Channels effectively enabled after negation.
    pub fn enabled(&self) -> LogAction {
        self.set
    }
}

impl fmt::Display for LogSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in LOG_CHANNELS {
            let tok = if self.clear.contains(bit) {
                Some(format!("!{}", name))
            } else if self.set.contains(bit) {
                Some(name.to_string())
            } else {
                None
            };
            if let Some(tok) = tok {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{}", tok)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Destination channels a target-site predicate can match against.
#[bitmask]
#[bitmask_config(vec_debug)]
pub enum DstChannel {
    DstIp,
    Sni,
    Cn,
    Host,
    Uri,
}

pub(crate) const CHANNEL_KEYWORDS: [(DstChannel, &str); 5] = [
    (DstChannel::DstIp, "ip"),
    (DstChannel::Sni, "sni"),
    (DstChannel::Cn, "cn"),
    (DstChannel::Host, "host"),
    (DstChannel::Uri, "uri"),
];

impl FromStr for DstChannel {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CHANNEL_KEYWORDS
            .iter()
            .find(|(_, kw)| *kw == s)
            .map(|(bit, _)| *bit)
            .ok_or_else(|| FilterError::InvalidChannel(s.to_string()))
    }
}

impl fmt::Display for DstChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, kw) in CHANNEL_KEYWORDS {
            if self.contains(bit) {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{}", kw)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A predicate token with exact/substring semantics.
///
/// A trailing `*` is stripped and marks the token as a prefix match; the
/// bare token `*` becomes the empty substring pattern, which matches
/// everything (the `all_sites` sentinel when used as a site).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub value: String,
    pub exact: bool,
}

impl Pattern {
    pub fn parse(token: &str) -> Pattern {
        if token == "*" {
            Pattern {
                value: String::new(),
                exact: false,
            }
        } else if let Some(prefix) = token.strip_suffix('*') {
            Pattern {
                value: prefix.to_string(),
                exact: false,
            }
        } else {
            Pattern {
                value: token.to_string(),
                exact: true,
            }
        }
    }

    pub fn all() -> Pattern {
        Pattern {
            value: String::new(),
            exact: false,
        }
    }

    /// True for the `*` sentinel.
    pub fn is_all(&self) -> bool {
        !self.exact && self.value.is_empty()
    }

    pub fn matches(&self, s: &str) -> bool {
        if self.exact {
            self.value == s
        } else {
            s.starts_with(&self.value)
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exact {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{}*", self.value)
        }
    }
}

/// One concrete filter rule, after macro expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub action: Action,
    pub log: LogSpec,

    /// `from user <pattern>`; [Self::all_users] is the `from user *` form.
    pub user: Option<Pattern>,
    pub all_users: bool,
    /// `from user <u> desc <pattern>` or `from desc <pattern>`.
    pub desc: Option<Pattern>,
    /// `from ip <pattern>`.
    pub src_ip: Option<Pattern>,

    /// Target site; the `all_sites` sentinel when the rule has no site.
    pub site: Pattern,
    /// Target port constraint, if any.
    pub port: Option<Pattern>,
    /// Channels the site applies to; all five when the rule has no
    /// `to` clause.
    pub channels: DstChannel,

    /// Computed by [Self::finalize].
    pub precedence: u8,
}

impl FilterRule {
    pub fn new(action: Action) -> FilterRule {
        FilterRule {
            action,
            log: LogSpec::default(),
            user: None,
            all_users: false,
            desc: None,
            src_ip: None,
            site: Pattern::all(),
            port: None,
            channels: DstChannel::all(),
            precedence: 0,
        }
    }

    pub fn has_source(&self) -> bool {
        self.user.is_some() || self.all_users || self.desc.is_some() || self.src_ip.is_some()
    }

    /// True when the rule constrains the target: a non-wildcard site or a
    /// port token.
    pub fn has_target(&self) -> bool {
        !self.site.is_all() || self.port.is_some()
    }

    /// Assigns the rule's precedence: one point per constraining clause
    /// (source, target, log), plus one point for a blanket `Block` so that
    /// an unconstrained Block outranks the other unconstrained actions.
    pub fn finalize(&mut self) {
        let mut precedence = 0;
        if self.has_source() {
            precedence += 1;
        }
        if self.has_target() {
            precedence += 1;
        } else if self.action.contains(Action::Block) {
            precedence += 1;
        }
        if !self.log.is_empty() {
            precedence += 1;
        }
        self.precedence = precedence;
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action)?;

        if self.all_users && self.desc.is_none() {
            write!(f, " from user *")?;
        } else if let Some(user) = &self.user {
            write!(f, " from user {}", user)?;
            if let Some(desc) = &self.desc {
                write!(f, " desc {}", desc)?;
            }
        } else if let Some(desc) = &self.desc {
            if self.all_users {
                write!(f, " from user * desc {}", desc)?;
            } else {
                write!(f, " from desc {}", desc)?;
            }
        } else if let Some(ip) = &self.src_ip {
            write!(f, " from ip {}", ip)?;
        }

        if self.has_target() || !self.channels.is_all() {
            if self.channels.is_all() && self.site.is_all() {
                write!(f, " to *")?;
            } else {
                write!(f, " to {} {}", self.channels, self.site)?;
            }
            if let Some(port) = &self.port {
                write!(f, " port {}", port)?;
            }
        }

        if !self.log.is_empty() {
            write!(f, " log {}", self.log)?;
        }
        Ok(())
    }
}
