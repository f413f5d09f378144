//! The compiled filter tree.
//!
//! After parsing completes, the accumulated rules of one options scope are
//! folded into a `FilterTree`: a layered structure rooted in source buckets
//! (user×desc, user, desc, any-user, source IP, unconstrained), each holding
//! one site table per destination channel, each site holding an optional
//! port table. The tree is built once and queried read-only per connection.
//!
//! Rules that land on the same leaf merge: lower precedence is discarded,
//! equal or higher precedence OR-merges the action and log masks (negated
//! log bits clear their positive twins) and raises the stored precedence.
//! At lookup time the highest-precedence matching leaf wins; ties go to the
//! later declaration.

use std::fmt;

use hashlink::LinkedHashMap;

use crate::filter::ast::{Action, DstChannel, FilterRule, LogSpec, Pattern};

/// Query-side destination channel (exactly one per lookup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    DstIp,
    Sni,
    Cn,
    Host,
    Uri,
}

/// One per-connection filter query.
#[derive(Debug, Clone)]
pub struct FilterQuery<'a> {
    pub user: Option<&'a str>,
    pub desc: Option<&'a str>,
    pub src_ip: &'a str,
    pub channel: Channel,
    pub site: &'a str,
    pub port: Option<&'a str>,
}

/// The merged outcome stored at a leaf and returned from a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterVerdict {
    pub action: Action,
    pub log: LogSpec,
    pub precedence: u8,
    /// Declaration index of the last rule merged in; lookup tie-breaker.
    pub seq: usize,
}

impl FilterVerdict {
    fn from_rule(rule: &FilterRule, seq: usize) -> Self {
        FilterVerdict {
            action: rule.action,
            log: rule.log,
            precedence: rule.precedence,
            seq,
        }
    }

    /// Folds another rule into this leaf.
    fn absorb(&mut self, rule: &FilterRule, seq: usize) {
        if rule.precedence < self.precedence {
            return;
        }
        self.action |= rule.action;
        self.log.merge(&rule.log);
        self.precedence = rule.precedence;
        self.seq = self.seq.max(seq);
    }
}

impl fmt::Display for FilterVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action)?;
        if !self.log.is_empty() {
            write!(f, " log {}", self.log)?;
        }
        write!(f, " precedence {}", self.precedence)
    }
}

fn consider(best: &mut Option<FilterVerdict>, cand: &FilterVerdict) {
    let replace = match best {
        None => true,
        Some(b) => {
            cand.precedence > b.precedence
                || (cand.precedence == b.precedence && cand.seq >= b.seq)
        }
    };
    if replace {
        *best = Some(cand.clone());
    }
}

/// Finds or creates the entry for `pat` in a substring list, keeping the
/// catch-all pattern last.
fn upsert_substr<'a, T: Default>(list: &'a mut Vec<(Pattern, T)>, pat: &Pattern) -> &'a mut T {
    if let Some(idx) = list.iter().position(|(p, _)| p == pat) {
        return &mut list[idx].1;
    }
    let idx = if pat.is_all() {
        list.len()
    } else {
        // in front of the catch-all entry, after everything else
        list.iter()
            .position(|(p, _)| p.is_all())
            .unwrap_or(list.len())
    };
    list.insert(idx, (pat.clone(), T::default()));
    &mut list[idx].1
}

/// One site: the verdict for port-less rules plus port tables for rules
/// that also constrain the target port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteNode {
    pub verdict: Option<FilterVerdict>,
    pub port_exact: LinkedHashMap<String, FilterVerdict>,
    pub port_substr: Vec<(Pattern, FilterVerdict)>,
}

impl SiteNode {
    fn add(&mut self, rule: &FilterRule, seq: usize) {
        match &rule.port {
            None => match &mut self.verdict {
                Some(v) => v.absorb(rule, seq),
                None => self.verdict = Some(FilterVerdict::from_rule(rule, seq)),
            },
            Some(port) if port.exact => {
                match self.port_exact.get_mut(&port.value) {
                    Some(v) => v.absorb(rule, seq),
                    None => {
                        self.port_exact
                            .insert(port.value.clone(), FilterVerdict::from_rule(rule, seq));
                    }
                }
            }
            Some(port) => {
                match self.port_substr.iter().position(|(p, _)| p == port) {
                    Some(idx) => self.port_substr[idx].1.absorb(rule, seq),
                    None => insert_substr_verdict(
                        &mut self.port_substr,
                        port,
                        FilterVerdict::from_rule(rule, seq),
                    ),
                }
            }
        }
    }

    /// Port tables are consulted only when the site itself matched.
    fn collect(&self, port: Option<&str>, best: &mut Option<FilterVerdict>) -> bool {
        let mut hit = false;
        if let Some(v) = &self.verdict {
            consider(best, v);
            hit = true;
        }
        if let Some(p) = port {
            if let Some(v) = self.port_exact.get(p) {
                consider(best, v);
                hit = true;
            }
            for (pat, v) in &self.port_substr {
                if pat.matches(p) {
                    consider(best, v);
                    hit = true;
                }
            }
        }
        hit
    }
}

// FilterVerdict has no Default, so the generic upsert does not apply to
// port lists; this keeps the same catch-all-last ordering.
fn insert_substr_verdict(list: &mut Vec<(Pattern, FilterVerdict)>, pat: &Pattern, v: FilterVerdict) {
    let idx = if pat.is_all() {
        list.len()
    } else {
        list.iter()
            .position(|(p, _)| p.is_all())
            .unwrap_or(list.len())
    };
    list.insert(idx, (pat.clone(), v));
}

/// Site lookup for one destination channel: exact sites first, then the
/// substring list with the `all_sites` sentinel last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteTable {
    pub exact: LinkedHashMap<String, SiteNode>,
    pub substr: Vec<(Pattern, SiteNode)>,
}

impl SiteTable {
    fn add(&mut self, rule: &FilterRule, seq: usize) {
        if rule.site.exact {
            self.exact
                .entry(rule.site.value.clone())
                .or_insert_with(SiteNode::default)
                .add(rule, seq);
        } else {
            upsert_substr(&mut self.substr, &rule.site).add(rule, seq);
        }
    }

    fn collect(&self, site: &str, port: Option<&str>, best: &mut Option<FilterVerdict>) -> bool {
        let mut hit = false;
        if let Some(node) = self.exact.get(site) {
            hit |= node.collect(port, best);
        }
        for (pat, node) in &self.substr {
            if pat.matches(site) {
                hit |= node.collect(port, best);
            }
        }
        hit
    }

    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.substr.is_empty()
    }
}

/// The site tables of one source bucket, one per destination channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelTables {
    pub dstip: SiteTable,
    pub sni: SiteTable,
    pub cn: SiteTable,
    pub host: SiteTable,
    pub uri: SiteTable,
}

impl ChannelTables {
    fn add(&mut self, rule: &FilterRule, seq: usize) {
        if rule.channels.contains(DstChannel::DstIp) {
            self.dstip.add(rule, seq);
        }
        if rule.channels.contains(DstChannel::Sni) {
            self.sni.add(rule, seq);
        }
        if rule.channels.contains(DstChannel::Cn) {
            self.cn.add(rule, seq);
        }
        if rule.channels.contains(DstChannel::Host) {
            self.host.add(rule, seq);
        }
        if rule.channels.contains(DstChannel::Uri) {
            self.uri.add(rule, seq);
        }
    }

    pub fn table(&self, channel: Channel) -> &SiteTable {
        match channel {
            Channel::DstIp => &self.dstip,
            Channel::Sni => &self.sni,
            Channel::Cn => &self.cn,
            Channel::Host => &self.host,
            Channel::Uri => &self.uri,
        }
    }

    fn collect(&self, q: &FilterQuery, best: &mut Option<FilterVerdict>) -> bool {
        self.table(q.channel).collect(q.site, q.port, best)
    }

    fn is_empty(&self) -> bool {
        self.dstip.is_empty()
            && self.sni.is_empty()
            && self.cn.is_empty()
            && self.host.is_empty()
            && self.uri.is_empty()
    }
}

/// The compiled filter of one options scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterTree {
    /// Rules with both a user and a desc predicate, both exact.
    pub userkeyword_exact: LinkedHashMap<(String, String), ChannelTables>,
    /// Rules with user and desc predicates, at least one a prefix pattern.
    pub userkeyword_substr: Vec<(Pattern, Pattern, ChannelTables)>,
    pub user_exact: LinkedHashMap<String, ChannelTables>,
    pub user_substr: Vec<(Pattern, ChannelTables)>,
    pub keyword_exact: LinkedHashMap<String, ChannelTables>,
    pub keyword_substr: Vec<(Pattern, ChannelTables)>,
    /// Rules whose source was `from user *` (any authenticated user).
    pub all_user: ChannelTables,
    pub ip_exact: LinkedHashMap<String, ChannelTables>,
    pub ip_substr: Vec<(Pattern, ChannelTables)>,
    /// Rules with no source constraint at all.
    pub all: ChannelTables,
}

impl FilterTree {
    /// Folds a rule list, in declaration order, into a tree.
    pub fn compile(rules: &[FilterRule]) -> FilterTree {
        let mut tree = FilterTree::default();
        for (seq, rule) in rules.iter().enumerate() {
            tree.add(rule, seq);
        }
        tree
    }

    fn add(&mut self, rule: &FilterRule, seq: usize) {
        if let (Some(user), Some(desc)) = (&rule.user, &rule.desc) {
            if user.exact && desc.exact {
                self.userkeyword_exact
                    .entry((user.value.clone(), desc.value.clone()))
                    .or_insert_with(ChannelTables::default)
                    .add(rule, seq);
            } else {
                let tables = match self
                    .userkeyword_substr
                    .iter()
                    .position(|(u, d, _)| u == user && d == desc)
                {
                    Some(idx) => &mut self.userkeyword_substr[idx].2,
                    None => {
                        self.userkeyword_substr.push((
                            user.clone(),
                            desc.clone(),
                            ChannelTables::default(),
                        ));
                        &mut self.userkeyword_substr.last_mut().unwrap().2
                    }
                };
                tables.add(rule, seq);
            }
        } else if let Some(user) = &rule.user {
            if user.exact {
                self.user_exact
                    .entry(user.value.clone())
                    .or_insert_with(ChannelTables::default)
                    .add(rule, seq);
            } else {
                upsert_substr(&mut self.user_substr, user).add(rule, seq);
            }
        } else if let Some(desc) = &rule.desc {
            // includes `from user * desc D`: the desc constrains any user
            if desc.exact {
                self.keyword_exact
                    .entry(desc.value.clone())
                    .or_insert_with(ChannelTables::default)
                    .add(rule, seq);
            } else {
                upsert_substr(&mut self.keyword_substr, desc).add(rule, seq);
            }
        } else if rule.all_users {
            self.all_user.add(rule, seq);
        } else if let Some(ip) = &rule.src_ip {
            if ip.exact {
                self.ip_exact
                    .entry(ip.value.clone())
                    .or_insert_with(ChannelTables::default)
                    .add(rule, seq);
            } else {
                upsert_substr(&mut self.ip_substr, ip).add(rule, seq);
            }
        } else {
            self.all.add(rule, seq);
        }
    }

    /// Resolves one connection query to the highest-precedence matching
    /// rule, ties broken in favor of the later declaration. Returns `None`
    /// when nothing matches; the caller falls back to the scope's default
    /// mode.
    pub fn lookup(&self, q: &FilterQuery) -> Option<FilterVerdict> {
        let mut best: Option<FilterVerdict> = None;

        match (q.user, q.desc) {
            (Some(user), Some(desc)) => {
                let key = (user.to_string(), desc.to_string());
                let hit = match self.userkeyword_exact.get(&key) {
                    Some(tables) => tables.collect(q, &mut best),
                    None => false,
                };
                if !hit {
                    for (u, d, tables) in &self.userkeyword_substr {
                        if u.matches(user) && d.matches(desc) {
                            tables.collect(q, &mut best);
                        }
                    }
                }
            }
            (Some(user), None) => {
                let hit = match self.user_exact.get(user) {
                    Some(tables) => tables.collect(q, &mut best),
                    None => false,
                };
                if !hit {
                    for (u, tables) in &self.user_substr {
                        if u.matches(user) {
                            tables.collect(q, &mut best);
                        }
                    }
                }
            }
            (None, Some(desc)) => {
                let hit = match self.keyword_exact.get(desc) {
                    Some(tables) => tables.collect(q, &mut best),
                    None => false,
                };
                if !hit {
                    for (d, tables) in &self.keyword_substr {
                        if d.matches(desc) {
                            tables.collect(q, &mut best);
                        }
                    }
                }
            }
            (None, None) => {}
        }

        // the source-independent buckets always participate
        if q.user.is_some() {
            self.all_user.collect(q, &mut best);
        }
        let hit = match self.ip_exact.get(q.src_ip) {
            Some(tables) => tables.collect(q, &mut best),
            None => false,
        };
        if !hit {
            for (ip, tables) in &self.ip_substr {
                if ip.matches(q.src_ip) {
                    tables.collect(q, &mut best);
                }
            }
        }
        self.all.collect(q, &mut best);

        best
    }
}

impl fmt::Display for FilterTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "filter=>")?;
        for ((user, desc), tables) in self.userkeyword_exact.iter() {
            writeln!(f, "|- user {} desc {} (exact)=>", user, desc)?;
            pprint_tables(f, tables, "|  ")?;
        }
        for (user, desc, tables) in &self.userkeyword_substr {
            writeln!(f, "|- user {} desc {} (substring)=>", user, desc)?;
            pprint_tables(f, tables, "|  ")?;
        }
        for (user, tables) in self.user_exact.iter() {
            writeln!(f, "|- user {} (exact)=>", user)?;
            pprint_tables(f, tables, "|  ")?;
        }
        for (user, tables) in &self.user_substr {
            writeln!(f, "|- user {} (substring)=>", user)?;
            pprint_tables(f, tables, "|  ")?;
        }
        for (desc, tables) in self.keyword_exact.iter() {
            writeln!(f, "|- desc {} (exact)=>", desc)?;
            pprint_tables(f, tables, "|  ")?;
        }
        for (desc, tables) in &self.keyword_substr {
            writeln!(f, "|- desc {} (substring)=>", desc)?;
            pprint_tables(f, tables, "|  ")?;
        }
        if !self.all_user.is_empty() {
            writeln!(f, "|- all users=>")?;
            pprint_tables(f, &self.all_user, "|  ")?;
        }
        for (ip, tables) in self.ip_exact.iter() {
            writeln!(f, "|- ip {} (exact)=>", ip)?;
            pprint_tables(f, tables, "|  ")?;
        }
        for (ip, tables) in &self.ip_substr {
            writeln!(f, "|- ip {} (substring)=>", ip)?;
            pprint_tables(f, tables, "|  ")?;
        }
        if !self.all.is_empty() {
            writeln!(f, "`- all=>")?;
            pprint_tables(f, &self.all, "   ")?;
        }
        Ok(())
    }
}

fn pprint_tables(f: &mut fmt::Formatter<'_>, tables: &ChannelTables, prefix: &str) -> fmt::Result {
    for (name, table) in [
        ("dstip", &tables.dstip),
        ("sni", &tables.sni),
        ("cn", &tables.cn),
        ("host", &tables.host),
        ("uri", &tables.uri),
    ] {
        if table.is_empty() {
            continue;
        }
        writeln!(f, "{}|- {}=>", prefix, name)?;
        for (site, node) in table.exact.iter() {
            pprint_site(f, site, "exact", node, prefix)?;
        }
        for (pat, node) in &table.substr {
            let shown = if pat.is_all() {
                "all sites".to_string()
            } else {
                pat.to_string()
            };
            pprint_site(f, &shown, "substring", node, prefix)?;
        }
    }
    Ok(())
}

fn pprint_site(
    f: &mut fmt::Formatter<'_>,
    site: &str,
    kind: &str,
    node: &SiteNode,
    prefix: &str,
) -> fmt::Result {
    if let Some(v) = &node.verdict {
        writeln!(f, "{}|  |- {} ({})=> {}", prefix, site, kind, v)?;
    } else {
        writeln!(f, "{}|  |- {} ({})=>", prefix, site, kind)?;
    }
    for (port, v) in node.port_exact.iter() {
        writeln!(f, "{}|  |  |- port {} (exact)=> {}", prefix, port, v)?;
    }
    for (pat, v) in &node.port_substr {
        writeln!(f, "{}|  |  |- port {} (substring)=> {}", prefix, pat, v)?;
    }
    Ok(())
}
