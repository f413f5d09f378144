//! Listener specifications.
//!
//! A proxy specification binds a listening endpoint to a protocol and a
//! target resolution policy: an explicit target address, a NAT engine that
//! recovers the original destination, or the server name from the client's
//! SNI. Specs come in a one-line form, recognized by a small finite
//! automaton over whitespace tokens, and a block form (`ProxySpec { … }`)
//! handled by [SpecBlock].
//!
//! Each spec owns a deep clone of the options in effect at the moment of its
//! declaration.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::config::opts::Opts;

/// Protocols a listener can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Proto {
    Tcp,
    Ssl,
    Http,
    Https,
    Autossl,
    Pop3,
    Pop3s,
    Smtp,
    Smtps,
}

impl Proto {
    pub fn ssl(&self) -> bool {
        matches!(self, Proto::Ssl | Proto::Https | Proto::Pop3s | Proto::Smtps)
    }

    pub fn http(&self) -> bool {
        matches!(self, Proto::Http | Proto::Https)
    }

    /// Plain TCP that may upgrade to TLS mid-stream.
    pub fn upgrade(&self) -> bool {
        matches!(self, Proto::Autossl)
    }

    pub fn pop3(&self) -> bool {
        matches!(self, Proto::Pop3 | Proto::Pop3s)
    }

    pub fn smtp(&self) -> bool {
        matches!(self, Proto::Smtp | Proto::Smtps)
    }
}

/// NAT engines the platform adapters can provide. The adapters themselves
/// live outside this subsystem; the parser only validates names.
pub const NAT_ENGINES: [&str; 5] = ["netfilter", "tproxy", "pf", "ipfw", "ipfilter"];

pub fn is_nat_engine(name: &str) -> bool {
    NAT_ENGINES.contains(&name)
}

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("expected a protocol keyword, got '{0}'")]
    ExpectedProto(String),

    #[error("invalid address '{0}'")]
    InvalidAddr(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("unknown NAT engine '{0}'")]
    UnknownNatEngine(String),

    #[error("sni port requires an ssl protocol")]
    SniRequiresSsl,

    #[error("unexpected token '{0}' in proxy specification")]
    UnexpectedToken(String),

    #[error("incomplete proxy specification")]
    Incomplete,

    #[error("divert address (ua:) requires a divert port (up:)")]
    DivertAddrWithoutPort,

    #[error("target address and NAT engine are mutually exclusive")]
    TargetAndNat,

    #[error("Addr must precede Port")]
    AddrBeforePort,

    #[error("TargetAddr must precede TargetPort")]
    TargetAddrBeforePort,

    #[error("missing {0} in ProxySpec block")]
    MissingField(&'static str),
}

/// One listening endpoint and its target resolution policy.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub proto: Proto,
    pub ssl: bool,
    pub http: bool,
    pub upgrade: bool,
    pub pop3: bool,
    pub smtp: bool,

    pub listen_addr: Option<SocketAddr>,
    /// Where diverted connections are handed to the inspector.
    pub divert_addr: Option<SocketAddr>,
    /// Address the inspector returns traffic on.
    pub return_addr: Option<IpAddr>,
    /// Explicit upstream target; mutually exclusive with [Self::nat_engine].
    pub target_addr: Option<SocketAddr>,
    pub nat_engine: Option<String>,
    /// DNS port for SNI-derived destinations; requires an ssl protocol.
    pub sni_port: Option<u16>,

    pub opts: Opts,
}

impl ProxySpec {
    pub fn new(proto: Proto, opts: Opts) -> ProxySpec {
        ProxySpec {
            proto,
            ssl: proto.ssl(),
            http: proto.http(),
            upgrade: proto.upgrade(),
            pop3: proto.pop3(),
            smtp: proto.smtp(),
            listen_addr: None,
            divert_addr: None,
            return_addr: None,
            target_addr: None,
            nat_engine: None,
            sni_port: None,
            opts,
        }
    }

    /// Resolves the effective divert mode once parsing is complete: the
    /// global split flag forces split, a missing divert address forces
    /// split, otherwise the listener's own `Divert` toggle stands. Specs
    /// with no target policy fall back to `default_nat`.
    pub fn finalize(&mut self, split: bool, default_nat: &str) -> Result<(), SpecError> {
        if self.listen_addr.is_none() {
            return Err(SpecError::Incomplete);
        }
        if self.target_addr.is_none() && self.nat_engine.is_none() && self.sni_port.is_none() {
            if !is_nat_engine(default_nat) {
                return Err(SpecError::UnknownNatEngine(default_nat.to_string()));
            }
            self.nat_engine = Some(default_nat.to_string());
        }
        if split || self.divert_addr.is_none() {
            self.opts.divert = false;
        }
        if !self.opts.divert && self.divert_addr.is_some() {
            // non-fatal: recorded in the dump, parsing continues
            log::warn!(
                "listener {}: divert address {} ignored in split mode",
                self.listen_addr.map(|a| a.to_string()).unwrap_or_default(),
                self.divert_addr.map(|a| a.to_string()).unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Compiles the listener's accumulated filter rules.
    pub fn compile_filter(&mut self) {
        self.opts.compile_filter();
    }
}

impl fmt::Display for ProxySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.proto)?;
        if let Some(addr) = &self.listen_addr {
            write!(f, " {} {}", addr.ip(), addr.port())?;
        }
        if let Some(divert) = &self.divert_addr {
            write!(f, " up:{} ua:{}", divert.port(), divert.ip())?;
        }
        if let Some(ra) = &self.return_addr {
            write!(f, " ra:{}", ra)?;
        }
        if let Some(target) = &self.target_addr {
            write!(f, " {} {}", target.ip(), target.port())?;
        } else if let Some(port) = &self.sni_port {
            write!(f, " sni {}", port)?;
        } else if let Some(nat) = &self.nat_engine {
            write!(f, " {}", nat)?;
        }
        write!(f, " mode={}", if self.opts.divert { "divert" } else { "split" })?;
        if !self.opts.divert && self.divert_addr.is_some() {
            write!(f, " (divert address ignored)")?;
        }
        Ok(())
    }
}

/// States of the one-line recognizer, keyed on token classification. A
/// protocol keyword in [SpecState::Target] completes the current spec and
/// starts the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecState {
    /// Expecting a protocol keyword.
    Proto,
    /// Expecting the listen address.
    Addr,
    /// Expecting the listen port.
    Port,
    /// Expecting `up:`/`ua:`/`ra:` options, a NAT engine name, an explicit
    /// target address, or `sni`.
    Target,
    /// Expecting the explicit target port.
    TargetPort,
    /// Expecting the SNI DNS port.
    SniPort,
}

/// Recognizer for the one-line form. Feed it the whitespace-split tokens of
/// one `ProxySpec` value (several listeners may share a line), then call
/// [SpecBuilder::done].
pub struct SpecBuilder<'a> {
    opts: &'a Opts,
    state: SpecState,
    specs: Vec<ProxySpec>,
    cur: Option<ProxySpec>,
    listen_ip: Option<IpAddr>,
    divert_port: Option<u16>,
    divert_ip: Option<IpAddr>,
    target_ip: Option<IpAddr>,
}

impl<'a> SpecBuilder<'a> {
    /// `opts` is the scope whose clone every new listener receives.
    pub fn new(opts: &'a Opts) -> SpecBuilder<'a> {
        SpecBuilder {
            opts,
            state: SpecState::Proto,
            specs: vec![],
            cur: None,
            listen_ip: None,
            divert_port: None,
            divert_ip: None,
            target_ip: None,
        }
    }

    pub fn feed(&mut self, token: &str) -> Result<(), SpecError> {
        match self.state {
            SpecState::Proto => {
                let proto = Proto::from_str(token)
                    .map_err(|_| SpecError::ExpectedProto(token.to_string()))?;
                self.cur = Some(ProxySpec::new(proto, self.opts.clone()));
                self.state = SpecState::Addr;
            }
            SpecState::Addr => {
                self.listen_ip = Some(parse_ip(token)?);
                self.state = SpecState::Port;
            }
            SpecState::Port => {
                let port = parse_port(token)?;
                let ip = self.listen_ip.take().ok_or(SpecError::Incomplete)?;
                self.cur_mut().listen_addr = Some(SocketAddr::new(ip, port));
                self.state = SpecState::Target;
            }
            SpecState::Target => self.feed_target(token)?,
            SpecState::TargetPort => {
                let port = parse_port(token)?;
                let ip = self.target_ip.take().ok_or(SpecError::Incomplete)?;
                self.cur_mut().target_addr = Some(SocketAddr::new(ip, port));
                self.state = SpecState::Target;
            }
            SpecState::SniPort => {
                self.cur_mut().sni_port = Some(parse_port(token)?);
                self.state = SpecState::Target;
            }
        }
        Ok(())
    }

    fn feed_target(&mut self, token: &str) -> Result<(), SpecError> {
        // a protocol keyword starts the next listener
        if let Ok(proto) = Proto::from_str(token) {
            self.complete_current()?;
            self.cur = Some(ProxySpec::new(proto, self.opts.clone()));
            self.state = SpecState::Addr;
            return Ok(());
        }
        if let Some(port) = token.strip_prefix("up:") {
            self.divert_port = Some(parse_port(port)?);
            return Ok(());
        }
        if let Some(addr) = token.strip_prefix("ua:") {
            self.divert_ip = Some(parse_ip(addr)?);
            return Ok(());
        }
        if let Some(addr) = token.strip_prefix("ra:") {
            let ra = parse_ip(addr)?;
            self.cur_mut().return_addr = Some(ra);
            return Ok(());
        }
        if token == "sni" {
            if !self.cur_mut().ssl {
                return Err(SpecError::SniRequiresSsl);
            }
            self.state = SpecState::SniPort;
            return Ok(());
        }
        let cur = self.cur_mut();
        if cur.target_addr.is_some() || cur.nat_engine.is_some() || cur.sni_port.is_some() {
            return Err(SpecError::UnexpectedToken(token.to_string()));
        }
        if is_nat_engine(token) {
            cur.nat_engine = Some(token.to_string());
            return Ok(());
        }
        match parse_ip(token) {
            Ok(ip) => {
                self.target_ip = Some(ip);
                self.state = SpecState::TargetPort;
                Ok(())
            }
            Err(_) => Err(SpecError::UnknownNatEngine(token.to_string())),
        }
    }

    fn complete_current(&mut self) -> Result<(), SpecError> {
        if self.state != SpecState::Target {
            return Err(SpecError::Incomplete);
        }
        let mut spec = self.cur.take().ok_or(SpecError::Incomplete)?;
        match (self.divert_port.take(), self.divert_ip.take()) {
            (Some(port), ip) => {
                spec.divert_addr = Some(SocketAddr::new(
                    ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                    port,
                ));
            }
            (None, Some(_)) => return Err(SpecError::DivertAddrWithoutPort),
            (None, None) => {}
        }
        if spec.target_addr.is_some() && spec.nat_engine.is_some() {
            return Err(SpecError::TargetAndNat);
        }
        self.specs.push(spec);
        Ok(())
    }

    fn cur_mut(&mut self) -> &mut ProxySpec {
        // feed() only reaches the non-Proto states after creating a spec
        self.cur.as_mut().expect("proxy spec in progress")
    }

    pub fn done(mut self) -> Result<Vec<ProxySpec>, SpecError> {
        self.complete_current()?;
        Ok(self.specs)
    }
}

/// Parses the value of a one-line `ProxySpec` directive.
pub fn parse_specs(value: &str, opts: &Opts) -> Result<Vec<ProxySpec>, SpecError> {
    let mut builder = SpecBuilder::new(opts);
    for token in value.split_ascii_whitespace() {
        builder.feed(token)?;
    }
    builder.done()
}

/// Builder for the `ProxySpec { … }` block form. Unlike the one-line form,
/// field order is constrained: `Addr` must precede `Port`, and `TargetAddr`
/// must precede `TargetPort`.
pub struct SpecBlock {
    proto: Option<Proto>,
    listen_ip: Option<IpAddr>,
    listen_port: Option<u16>,
    divert_port: Option<u16>,
    divert_ip: Option<IpAddr>,
    return_ip: Option<IpAddr>,
    target_ip: Option<IpAddr>,
    target_port: Option<u16>,
    sni_port: Option<u16>,
    nat_engine: Option<String>,
    /// Listener-scope option overrides, applied on top of the template.
    pub opts: Opts,
}

impl SpecBlock {
    pub fn new(opts: Opts) -> SpecBlock {
        SpecBlock {
            proto: None,
            listen_ip: None,
            listen_port: None,
            divert_port: None,
            divert_ip: None,
            return_ip: None,
            target_ip: None,
            target_port: None,
            sni_port: None,
            nat_engine: None,
            opts,
        }
    }

    /// Dispatches one listener-topology key; returns `false` for names that
    /// belong to the options table instead.
    pub fn set(&mut self, name: &str, value: &str) -> Result<bool, SpecError> {
        match name {
            "Proto" => {
                self.proto = Some(
                    Proto::from_str(value)
                        .map_err(|_| SpecError::ExpectedProto(value.to_string()))?,
                );
            }
            "Addr" => self.listen_ip = Some(parse_ip(value)?),
            "Port" => {
                if self.listen_ip.is_none() {
                    return Err(SpecError::AddrBeforePort);
                }
                self.listen_port = Some(parse_port(value)?);
            }
            "DivertPort" => self.divert_port = Some(parse_port(value)?),
            "DivertAddr" => self.divert_ip = Some(parse_ip(value)?),
            "ReturnAddr" => self.return_ip = Some(parse_ip(value)?),
            "TargetAddr" => self.target_ip = Some(parse_ip(value)?),
            "TargetPort" => {
                if self.target_ip.is_none() {
                    return Err(SpecError::TargetAddrBeforePort);
                }
                self.target_port = Some(parse_port(value)?);
            }
            "SNIPort" => self.sni_port = Some(parse_port(value)?),
            "NatEngine" => {
                if !is_nat_engine(value) {
                    return Err(SpecError::UnknownNatEngine(value.to_string()));
                }
                self.nat_engine = Some(value.to_string());
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Closes the block into a spec.
    pub fn close(self) -> Result<ProxySpec, SpecError> {
        let proto = self.proto.ok_or(SpecError::MissingField("Proto"))?;
        let listen_ip = self.listen_ip.ok_or(SpecError::MissingField("Addr"))?;
        let listen_port = self.listen_port.ok_or(SpecError::MissingField("Port"))?;

        let mut spec = ProxySpec::new(proto, self.opts);
        spec.listen_addr = Some(SocketAddr::new(listen_ip, listen_port));
        spec.return_addr = self.return_ip;

        match (self.divert_port, self.divert_ip) {
            (Some(port), ip) => {
                spec.divert_addr = Some(SocketAddr::new(
                    ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                    port,
                ));
            }
            (None, Some(_)) => return Err(SpecError::DivertAddrWithoutPort),
            (None, None) => {}
        }

        match (self.target_ip, self.target_port) {
            (Some(ip), Some(port)) => spec.target_addr = Some(SocketAddr::new(ip, port)),
            (Some(_), None) => return Err(SpecError::MissingField("TargetPort")),
            (None, None) => {}
            (None, Some(_)) => return Err(SpecError::TargetAddrBeforePort),
        }
        if let Some(port) = self.sni_port {
            if !spec.ssl {
                return Err(SpecError::SniRequiresSsl);
            }
            spec.sni_port = Some(port);
        }
        if spec.target_addr.is_some() && self.nat_engine.is_some() {
            return Err(SpecError::TargetAndNat);
        }
        spec.nat_engine = self.nat_engine;
        Ok(spec)
    }
}

fn parse_ip(token: &str) -> Result<IpAddr, SpecError> {
    token
        .parse::<IpAddr>()
        .map_err(|_| SpecError::InvalidAddr(token.to_string()))
}

fn parse_port(token: &str) -> Result<u16, SpecError> {
    match token.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(SpecError::InvalidPort(token.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> Opts {
        Opts::new()
    }

    #[test]
    fn one_line_with_nat_engine() {
        let specs = parse_specs("https 127.0.0.1 8443 netfilter", &opts()).unwrap();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.proto, Proto::Https);
        assert!(spec.ssl && spec.http);
        assert_eq!(
            spec.listen_addr.unwrap(),
            "127.0.0.1:8443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(spec.nat_engine.as_deref(), Some("netfilter"));
    }

    #[test]
    fn one_line_with_explicit_target() {
        let specs = parse_specs("ssl 0.0.0.0 10443 10.0.0.1 443", &opts()).unwrap();
        let spec = &specs[0];
        assert_eq!(
            spec.target_addr.unwrap(),
            "10.0.0.1:443".parse::<SocketAddr>().unwrap()
        );
        assert!(spec.nat_engine.is_none());
    }

    #[test]
    fn one_line_with_divert_addresses() {
        let specs = parse_specs(
            "https 127.0.0.1 8443 up:8080 ua:192.168.1.1 ra:192.168.1.2 netfilter",
            &opts(),
        )
        .unwrap();
        let spec = &specs[0];
        assert_eq!(
            spec.divert_addr.unwrap(),
            "192.168.1.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(spec.return_addr.unwrap(), "192.168.1.2".parse::<IpAddr>().unwrap());

        // up: without ua: defaults to loopback
        let specs = parse_specs("https 127.0.0.1 8443 up:8080 netfilter", &opts()).unwrap();
        assert_eq!(
            specs[0].divert_addr.unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );

        // ua: without up: is an error
        assert!(parse_specs("https 127.0.0.1 8443 ua:192.168.1.1 netfilter", &opts()).is_err());
    }

    #[test]
    fn one_line_sni() {
        let specs = parse_specs("ssl 127.0.0.1 10443 sni 443", &opts()).unwrap();
        assert_eq!(specs[0].sni_port, Some(443));

        // sni requires an ssl protocol
        assert!(matches!(
            parse_specs("tcp 127.0.0.1 10025 sni 443", &opts()),
            Err(SpecError::SniRequiresSsl)
        ));
    }

    #[test]
    fn protocol_keyword_starts_next_listener() {
        let specs = parse_specs(
            "https 127.0.0.1 8443 netfilter smtp 127.0.0.1 10025 10.0.0.5 25",
            &opts(),
        )
        .unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].proto, Proto::Https);
        assert_eq!(specs[1].proto, Proto::Smtp);
        assert!(specs[1].smtp);
    }

    #[test]
    fn incomplete_and_malformed_lines_rejected() {
        for line in [
            "https",
            "https 127.0.0.1",
            "https 256.0.0.1 8443",
            "https 127.0.0.1 0",
            "https 127.0.0.1 8443 10.0.0.1",
            "bogus 127.0.0.1 8443",
            "https 127.0.0.1 8443 unknown-engine",
            "https 127.0.0.1 8443 netfilter 10.0.0.1 443",
        ] {
            assert!(parse_specs(line, &opts()).is_err(), "{}", line);
        }
    }

    #[test]
    fn listener_inherits_options_snapshot() {
        let mut global = opts();
        global.set_user_timeout("100").unwrap();
        let specs = parse_specs("https 127.0.0.1 8443 netfilter", &global).unwrap();
        global.set_user_timeout("200").unwrap();
        assert_eq!(specs[0].opts.user_timeout, 100);
        assert_eq!(global.user_timeout, 200);
    }

    #[test]
    fn finalize_resolves_divert_mode() {
        // no divert address: split regardless of the toggle
        let mut spec = parse_specs("https 127.0.0.1 8443 netfilter", &opts())
            .unwrap()
            .remove(0);
        spec.finalize(false, "netfilter").unwrap();
        assert!(!spec.opts.divert);

        // divert address present, global split wins
        let mut spec = parse_specs("https 127.0.0.1 8443 up:8080 netfilter", &opts())
            .unwrap()
            .remove(0);
        spec.finalize(true, "netfilter").unwrap();
        assert!(!spec.opts.divert);
        assert!(spec.to_string().contains("divert address ignored"));

        // divert address present, listener toggle stands
        let mut spec = parse_specs("https 127.0.0.1 8443 up:8080 netfilter", &opts())
            .unwrap()
            .remove(0);
        spec.finalize(false, "netfilter").unwrap();
        assert!(spec.opts.divert);
        assert!(spec.to_string().contains("mode=divert"));
    }

    #[test]
    fn finalize_defaults_to_nat_engine() {
        let mut spec = ProxySpec::new(Proto::Https, opts());
        spec.listen_addr = Some("127.0.0.1:8443".parse().unwrap());
        spec.finalize(false, "pf").unwrap();
        assert_eq!(spec.nat_engine.as_deref(), Some("pf"));

        let mut spec = ProxySpec::new(Proto::Https, opts());
        spec.listen_addr = Some("127.0.0.1:8443".parse().unwrap());
        assert!(spec.finalize(false, "not-an-engine").is_err());
    }

    #[test]
    fn block_form_field_order() {
        let mut block = SpecBlock::new(opts());
        assert!(matches!(
            block.set("Port", "8443"),
            Err(SpecError::AddrBeforePort)
        ));
        block.set("Proto", "https").unwrap();
        block.set("Addr", "127.0.0.1").unwrap();
        block.set("Port", "8443").unwrap();
        assert!(matches!(
            block.set("TargetPort", "443"),
            Err(SpecError::TargetAddrBeforePort)
        ));
        block.set("TargetAddr", "10.0.0.1").unwrap();
        block.set("TargetPort", "443").unwrap();
        assert!(!block.set("UserTimeout", "60").unwrap());

        let spec = block.close().unwrap();
        assert_eq!(spec.proto, Proto::Https);
        assert_eq!(
            spec.target_addr.unwrap(),
            "10.0.0.1:443".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn block_form_requires_addr_and_proto() {
        let block = SpecBlock::new(opts());
        assert!(block.close().is_err());

        let mut block = SpecBlock::new(opts());
        block.set("Proto", "https").unwrap();
        block.set("Addr", "127.0.0.1").unwrap();
        assert!(matches!(
            block.close(),
            Err(SpecError::MissingField("Port"))
        ));
    }

    #[test]
    fn block_form_target_port_required_once_addr_given() {
        let mut block = SpecBlock::new(opts());
        block.set("Proto", "https").unwrap();
        block.set("Addr", "127.0.0.1").unwrap();
        block.set("Port", "8443").unwrap();
        block.set("TargetAddr", "10.0.0.1").unwrap();
        assert!(matches!(
            block.close(),
            Err(SpecError::MissingField("TargetPort"))
        ));
    }
}
