//! Rule-text parser and macro expansion.
//!
//! Parsing is two-phase: the pest grammar turns one rule text into a
//! `RuleDraft` (one slot per predicate), then every slot holding a `$`-macro
//! reference is fanned out and the cartesian product of the slot values is
//! materialized into concrete [FilterRule]s. The `FilterRule { … }` block
//! form fills the same draft key-by-key and shares the expansion path.

use super::ast::*;
use super::defines::MacroTable;
use super::{FilterError, RuleOutcome};

use std::str::FromStr;

use itertools::Itertools;
use pest::iterators::Pair;
use pest::Parser as PestParser;

use anyhow::{bail, Result};

#[derive(Parser)]
#[grammar = "filter/grammar.pest"]
struct RuleGrammar;

#[derive(Debug, Clone)]
enum FromSlot {
    User { user: String, desc: Option<String> },
    Desc(String),
    Ip(String),
    All,
}

#[derive(Debug, Clone)]
struct ToSlot {
    channels: DstChannel,
    site: Option<String>,
    port: Option<String>,
}

#[derive(Debug, Clone)]
struct RuleDraft {
    action: Action,
    from: Option<FromSlot>,
    to: Option<ToSlot>,
    log_tokens: Vec<String>,
}

/// Parses one rule text (`Divert from ip 192.168.0.1 to ip * log connect`)
/// into its concrete rules. The text starts with the action keyword.
pub fn parse_rule(
    text: &str,
    macros: &MacroTable,
    user_auth: bool,
) -> Result<(Vec<FilterRule>, RuleOutcome)> {
    let draft = parse_draft(text)?;
    expand_draft(&draft, macros, user_auth)
}

fn parse_draft(text: &str) -> Result<RuleDraft> {
    let mut pairs = match RuleGrammar::parse(Rule::rule_line, text) {
        Ok(pairs) => pairs,
        Err(_) => bail!(FilterError::InvalidFormat(text.to_string())),
    };
    let line = pairs.next().unwrap();

    let mut action = None;
    let mut draft = RuleDraft {
        action: Action::none(),
        from: None,
        to: None,
        log_tokens: vec![],
    };

    for pair in line.into_inner() {
        match pair.as_rule() {
            Rule::action => {
                action = Some(Action::from_str(pair.as_str())?);
            }
            Rule::from_clause => {
                if draft.from.is_some() {
                    bail!(FilterError::DuplicateClause("from"));
                }
                draft.from = Some(parse_from(pair)?);
            }
            Rule::to_clause => {
                if draft.to.is_some() {
                    bail!(FilterError::DuplicateClause("to"));
                }
                draft.to = Some(parse_to(pair)?);
            }
            Rule::log_clause => {
                if !draft.log_tokens.is_empty() {
                    bail!(FilterError::DuplicateClause("log"));
                }
                draft.log_tokens = pair
                    .into_inner()
                    .filter(|p| p.as_rule() == Rule::log_token)
                    .map(|p| p.as_str().to_string())
                    .collect();
            }
            // a bare `*`: no source and no target constraint
            Rule::wildcard | Rule::EOI => {}
            _ => bail!(FilterError::InvalidFormat(text.to_string())),
        }
    }

    draft.action = action.ok_or_else(|| FilterError::InvalidFormat(text.to_string()))?;
    Ok(draft)
}

fn parse_from(pair: Pair<Rule>) -> Result<FromSlot> {
    let inner = pair.into_inner().next().unwrap();
    let slot = match inner.as_rule() {
        Rule::from_user => {
            let mut values = inner
                .into_inner()
                .filter(|p| p.as_rule() == Rule::value)
                .map(|p| p.as_str().to_string());
            FromSlot::User {
                user: values.next().unwrap(),
                desc: values.next(),
            }
        }
        Rule::from_desc => FromSlot::Desc(value_of(inner)),
        Rule::from_ip => FromSlot::Ip(value_of(inner)),
        Rule::from_all => FromSlot::All,
        _ => unreachable!("from clause shape is fixed by the grammar"),
    };
    Ok(slot)
}

fn parse_to(pair: Pair<Rule>) -> Result<ToSlot> {
    let inner = pair.into_inner().next().unwrap();
    let slot = match inner.as_rule() {
        Rule::to_target => {
            let mut channels = DstChannel::none();
            let mut site = None;
            let mut port = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::channel => channels |= DstChannel::from_str(p.as_str())?,
                    Rule::value => site = Some(p.as_str().to_string()),
                    Rule::port_spec => port = Some(value_of(p)),
                    _ => {}
                }
            }
            ToSlot {
                channels,
                site,
                port,
            }
        }
        Rule::port_only => ToSlot {
            channels: DstChannel::all(),
            site: None,
            port: Some(value_of(inner.into_inner().next().unwrap())),
        },
        Rule::to_all => {
            let port = inner.into_inner().next().map(value_of);
            ToSlot {
                channels: DstChannel::all(),
                site: None,
                port,
            }
        }
        _ => unreachable!("to clause shape is fixed by the grammar"),
    };
    Ok(slot)
}

fn value_of(pair: Pair<Rule>) -> String {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::value)
        .map(|p| p.as_str().to_string())
        .unwrap_or_default()
}

/// Expands one slot: absent and literal tokens are a single candidate, a
/// `$`-reference is one candidate per macro value.
fn expand_slot(
    token: Option<&str>,
    macros: &MacroTable,
    expanded: &mut bool,
) -> Result<Vec<Option<String>>> {
    match token {
        None => Ok(vec![None]),
        Some(t) if t.starts_with('$') => {
            let values = macros
                .lookup(t)
                .ok_or_else(|| FilterError::UndefinedMacro(t.to_string()))?;
            *expanded = true;
            Ok(values.iter().map(|v| Some(v.clone())).collect())
        }
        Some(t) => Ok(vec![Some(t.to_string())]),
    }
}

/// As [expand_slot] for a log token, which may carry a `!` negation in
/// front of the macro reference; the negation distributes over the values.
fn expand_log_token(
    token: &str,
    macros: &MacroTable,
    expanded: &mut bool,
) -> Result<Vec<Option<String>>> {
    let (neg, body) = match token.strip_prefix('!') {
        Some(body) => ("!", body),
        None => ("", token),
    };
    if !body.starts_with('$') {
        return Ok(vec![Some(token.to_string())]);
    }
    let values = macros
        .lookup(body)
        .ok_or_else(|| FilterError::UndefinedMacro(body.to_string()))?;
    *expanded = true;
    Ok(values.iter().map(|v| Some(format!("{}{}", neg, v))).collect())
}

fn expand_draft(
    draft: &RuleDraft,
    macros: &MacroTable,
    user_auth: bool,
) -> Result<(Vec<FilterRule>, RuleOutcome)> {
    // user and desc predicates are meaningless without user authentication
    if !user_auth
        && matches!(
            draft.from,
            Some(FromSlot::User { .. }) | Some(FromSlot::Desc(_))
        )
    {
        bail!(FilterError::RequiresUserAuth);
    }

    let (user_tok, desc_tok, ip_tok) = match &draft.from {
        Some(FromSlot::User { user, desc }) => (Some(user.as_str()), desc.as_deref(), None),
        Some(FromSlot::Desc(desc)) => (None, Some(desc.as_str()), None),
        Some(FromSlot::Ip(ip)) => (None, None, Some(ip.as_str())),
        Some(FromSlot::All) | None => (None, None, None),
    };
    let (site_tok, port_tok) = match &draft.to {
        Some(to) => (to.site.as_deref(), to.port.as_deref()),
        None => (None, None),
    };

    let mut expanded = false;
    // fixed slot order: user, desc, ip, site, port, then one slot per log token
    let mut slots: Vec<Vec<Option<String>>> = vec![
        expand_slot(user_tok, macros, &mut expanded)?,
        expand_slot(desc_tok, macros, &mut expanded)?,
        expand_slot(ip_tok, macros, &mut expanded)?,
        expand_slot(site_tok, macros, &mut expanded)?,
        expand_slot(port_tok, macros, &mut expanded)?,
    ];
    for token in &draft.log_tokens {
        slots.push(expand_log_token(token, macros, &mut expanded)?);
    }

    let mut rules = vec![];
    for combo in slots.into_iter().map(Vec::into_iter).multi_cartesian_product() {
        let mut rule = FilterRule::new(draft.action);

        if let Some(user) = &combo[0] {
            if user == "*" {
                rule.all_users = true;
            } else {
                rule.user = Some(Pattern::parse(user));
            }
        }
        if let Some(desc) = &combo[1] {
            rule.desc = Some(Pattern::parse(desc));
        }
        if let Some(ip) = &combo[2] {
            rule.src_ip = Some(Pattern::parse(ip));
        }
        if let Some(to) = &draft.to {
            rule.channels = to.channels;
        }
        if let Some(site) = &combo[3] {
            rule.site = Pattern::parse(site);
        }
        if let Some(port) = &combo[4] {
            rule.port = Some(Pattern::parse(port));
        }
        for token in combo[5..].iter().flatten() {
            rule.log.add_token(token)?;
        }

        rule.finalize();
        rules.push(rule);
    }

    let outcome = match expanded {
        true => RuleOutcome::Expanded(rules.len()),
        false => RuleOutcome::Literal,
    };
    Ok((rules, outcome))
}

/// Builder for the `FilterRule { … }` block form. The block fills the same
/// predicate slots as the one-line syntax, key by key, and closes into the
/// shared expansion path.
#[derive(Debug)]
pub struct RuleBlock {
    action: Option<String>,
    user: Option<String>,
    desc: Option<String>,
    src_ip: Option<String>,
    site: Option<String>,
    channels: DstChannel,
    port: Option<String>,
    log_tokens: Vec<String>,
}

impl Default for RuleBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBlock {
    pub fn new() -> Self {
        RuleBlock {
            action: None,
            user: None,
            desc: None,
            src_ip: None,
            site: None,
            channels: DstChannel::none(),
            port: None,
            log_tokens: vec![],
        }
    }

    /// Dispatches one `Key value` line inside the block. Returns `false`
    /// for keys this block does not know.
    pub fn set(&mut self, name: &str, value: &str) -> Result<bool> {
        match name {
            "Action" => self.action = Some(value.to_string()),
            "User" => self.user = Some(value.to_string()),
            "Desc" => self.desc = Some(value.to_string()),
            "SrcIp" => self.src_ip = Some(value.to_string()),
            "DstIp" => self.add_site(DstChannel::DstIp, value)?,
            "SNI" => self.add_site(DstChannel::Sni, value)?,
            "CN" => self.add_site(DstChannel::Cn, value)?,
            "Host" => self.add_site(DstChannel::Host, value)?,
            "URI" => self.add_site(DstChannel::Uri, value)?,
            "DstPort" => self.port = Some(value.to_string()),
            "Log" => {
                self.log_tokens
                    .extend(value.split_ascii_whitespace().map(str::to_string));
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn add_site(&mut self, channel: DstChannel, value: &str) -> Result<()> {
        if let Some(site) = &self.site {
            if site != value {
                bail!(FilterError::ConflictingSites(
                    site.clone(),
                    value.to_string()
                ));
            }
        }
        self.site = Some(value.to_string());
        self.channels |= channel;
        Ok(())
    }

    /// Closes the block into concrete rules.
    pub fn build(
        self,
        macros: &MacroTable,
        user_auth: bool,
    ) -> Result<(Vec<FilterRule>, RuleOutcome)> {
        let action = match &self.action {
            Some(a) => Action::from_str(a)?,
            None => bail!(FilterError::MissingField("Action")),
        };
        if self.src_ip.is_some() && (self.user.is_some() || self.desc.is_some()) {
            bail!(FilterError::InvalidFormat(
                "both user/desc and SrcIp given in one rule".to_string()
            ));
        }

        let from = if let Some(user) = self.user {
            Some(FromSlot::User {
                user,
                desc: self.desc,
            })
        } else if let Some(desc) = self.desc {
            Some(FromSlot::Desc(desc))
        } else {
            self.src_ip.map(FromSlot::Ip)
        };

        let to = if self.site.is_some() || self.port.is_some() {
            Some(ToSlot {
                channels: if self.channels.is_none() {
                    DstChannel::all()
                } else {
                    self.channels
                },
                site: self.site,
                port: self.port,
            })
        } else {
            None
        };

        let draft = RuleDraft {
            action,
            from,
            to,
            log_tokens: self.log_tokens,
        };
        expand_draft(&draft, macros, user_auth)
    }
}
