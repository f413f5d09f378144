//! Configuration: global state, the file parser, and the directive
//! dispatcher.
//!
//! The configuration language is line oriented. Leaf directives set fields
//! on the global scope or on the top-level options; `ProxySpec` declares a
//! listener (one-line or block form); the five action keywords declare
//! filter rules; `Define` declares a macro; `Include` reads another file
//! in-line (top level only, no nesting). The [Directive] enum is the single
//! source of truth for valid names; command line and file dispatch through
//! the same table.
//!
//! Parsing mutates [Config] single-threaded; [Config::finalize] then
//! resolves each listener's divert mode and compiles every filter, after
//! which nothing is mutated again.

pub mod cmdline;
pub mod lexer;
pub mod opts;
pub mod proxyspec;

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use strum_macros::{AsRefStr, EnumIter, EnumString};

use crate::config::lexer::{get_name_required_value, significant, Sep};
use crate::config::opts::{ranged, yesno, CertHandle, Opts};
use crate::config::proxyspec::{is_nat_engine, parse_specs, ProxySpec, SpecBlock};
use crate::filter::parser::RuleBlock;

/// Every valid directive name. `FromStr` is case-sensitive, matching the
/// configuration file; the command line resolves case-insensitively through
/// the same table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumIter, AsRefStr)]
pub(crate) enum Directive {
    CACert,
    CAKey,
    CAChain,
    ClientCert,
    ClientKey,
    LeafKey,
    LeafKeyRSABits,
    LeafCRLURL,
    LeafCertDir,
    DefaultLeafCert,
    WriteGenCertsDir,
    WriteAllCertsDir,
    DenyOCSP,
    Passthrough,
    DHGroupParams,
    ECDHCurve,
    SSLCompression,
    ForceSSLProto,
    DisableSSLProto,
    EnableSSLProto,
    MinSSLProto,
    MaxSSLProto,
    Ciphers,
    CipherSuites,
    NATEngine,
    OpenSSLEngine,
    User,
    Group,
    Chroot,
    PidFile,
    ConnectLog,
    ContentLog,
    ContentLogDir,
    ContentLogPathSpec,
    LogProcInfo,
    MasterKeyLog,
    PcapLog,
    PcapLogDir,
    PcapLogPathSpec,
    MirrorIf,
    MirrorTarget,
    Daemon,
    Debug,
    DebugLevel,
    ConnIdleTimeout,
    ExpiredConnCheckPeriod,
    LogStats,
    StatsPeriod,
    RemoveHTTPAcceptEncoding,
    RemoveHTTPReferer,
    VerifyPeer,
    AllowWrongHost,
    UserAuth,
    UserAuthURL,
    UserTimeout,
    UserDBPath,
    DivertUsers,
    PassUsers,
    ValidateProto,
    MaxHTTPHeaderSize,
    OpenFilesLimit,
    Divert,
    Split,
    Pass,
    Block,
    Match,
    Define,
    Include,
    PassSite,
    FilterRule,
    ProxySpec,
}

/// Process-wide state: paths, logging targets, certificate directories, the
/// top-level options and the listener list.
#[derive(Debug)]
pub struct Config {
    pub conffile: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub connect_log: Option<PathBuf>,
    pub content_log: Option<PathBuf>,
    pub content_log_dir: Option<PathBuf>,
    pub content_log_path_spec: Option<String>,
    pub log_proc_info: bool,
    pub masterkey_log: Option<PathBuf>,
    pub pcap_log: Option<PathBuf>,
    pub pcap_log_dir: Option<PathBuf>,
    pub pcap_log_path_spec: Option<String>,
    pub mirror_if: Option<String>,
    pub mirror_target: Option<String>,
    pub daemon: bool,
    pub debug: bool,
    pub debug_level: Option<u8>,
    pub chroot: Option<PathBuf>,
    pub drop_user: Option<String>,
    pub drop_group: Option<String>,
    pub leaf_cert_dir: Option<PathBuf>,
    pub default_leaf_cert: Option<CertHandle>,
    pub leaf_key: Option<CertHandle>,
    pub leaf_key_rsa_bits: u32,
    pub write_gen_certs_dir: Option<PathBuf>,
    pub write_all_certs_dir: Option<PathBuf>,
    pub open_files_limit: Option<u32>,
    pub conn_idle_check_period: u32,
    pub log_stats: bool,
    pub stats_period: u32,
    pub nat_engine: String,
    pub openssl_engine: Option<String>,
    pub user_db_path: Option<PathBuf>,

    pub opts: Opts,
    pub specs: Vec<ProxySpec>,
}

/// Where the parser currently dispatches lines to.
enum Scope {
    Global,
    Spec(SpecBlock),
    Rule(RuleBlock),
    SpecRule(SpecBlock, RuleBlock),
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Config {
        Config {
            conffile: None,
            pidfile: None,
            connect_log: None,
            content_log: None,
            content_log_dir: None,
            content_log_path_spec: None,
            log_proc_info: false,
            masterkey_log: None,
            pcap_log: None,
            pcap_log_dir: None,
            pcap_log_path_spec: None,
            mirror_if: None,
            mirror_target: None,
            daemon: false,
            debug: false,
            debug_level: None,
            chroot: None,
            drop_user: None,
            drop_group: None,
            leaf_cert_dir: None,
            default_leaf_cert: None,
            leaf_key: None,
            leaf_key_rsa_bits: 2048,
            write_gen_certs_dir: None,
            write_all_certs_dir: None,
            open_files_limit: None,
            conn_idle_check_period: 10,
            log_stats: false,
            stats_period: 1,
            nat_engine: "netfilter".to_string(),
            openssl_engine: None,
            user_db_path: None,
            opts: Opts::new(),
            specs: vec![],
        }
    }

    /// Reads and parses the top-level configuration file.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        self.conffile = Some(path.to_path_buf());
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        self.parse_lines(&text, path, false)
    }

    /// Parses configuration text as if it were the top-level file.
    pub fn load_str(&mut self, text: &str) -> Result<()> {
        self.parse_lines(text, Path::new("<config>"), false)
    }

    fn parse_lines(&mut self, text: &str, path: &Path, included: bool) -> Result<()> {
        let mut scope = Scope::Global;
        for (idx, raw) in text.lines().enumerate() {
            let line = match significant(raw) {
                Some(line) => line,
                None => continue,
            };
            self.dispatch_line(line, &mut scope, included)
                .with_context(|| format!("{}:{}", path.display(), idx + 1))?;
        }
        if !matches!(scope, Scope::Global) {
            bail!("{}: unterminated block", path.display());
        }
        Ok(())
    }

    fn dispatch_line(&mut self, line: &str, scope: &mut Scope, included: bool) -> Result<()> {
        if line == "}" {
            return self.close_block(scope);
        }
        let (name, value) = get_name_required_value(line, Sep::Whitespace)?;

        match std::mem::replace(scope, Scope::Global) {
            Scope::Global => {
                self.global_line(&name, &value, scope, included)?;
            }
            Scope::Spec(mut block) => {
                if name == "FilterRule" && value == "{" {
                    *scope = Scope::SpecRule(block, RuleBlock::new());
                } else {
                    spec_line(&mut block, &name, &value)?;
                    *scope = Scope::Spec(block);
                }
            }
            Scope::Rule(mut block) => {
                rule_block_line(&mut block, &name, &value)?;
                *scope = Scope::Rule(block);
            }
            Scope::SpecRule(spec, mut block) => {
                rule_block_line(&mut block, &name, &value)?;
                *scope = Scope::SpecRule(spec, block);
            }
        }
        Ok(())
    }

    fn close_block(&mut self, scope: &mut Scope) -> Result<()> {
        match std::mem::replace(scope, Scope::Global) {
            Scope::Global => bail!("unmatched '}}'"),
            Scope::Spec(block) => {
                self.specs.push(block.close()?);
            }
            Scope::Rule(block) => {
                let (rules, _) = block.build(&self.opts.macros, self.opts.user_auth)?;
                self.opts.rules.extend(rules);
            }
            Scope::SpecRule(mut spec, block) => {
                let (rules, _) = block.build(&spec.opts.macros, spec.opts.user_auth)?;
                spec.opts.rules.extend(rules);
                *scope = Scope::Spec(spec);
            }
        }
        Ok(())
    }

    fn global_line(
        &mut self,
        name: &str,
        value: &str,
        scope: &mut Scope,
        included: bool,
    ) -> Result<()> {
        let directive = Directive::from_str(name)
            .map_err(|_| anyhow!("unknown directive '{}'", name))?;
        match directive {
            Directive::ProxySpec => {
                if value == "{" {
                    *scope = Scope::Spec(SpecBlock::new(self.opts.clone()));
                } else {
                    self.specs.extend(parse_specs(value, &self.opts)?);
                }
                return Ok(());
            }
            Directive::FilterRule => {
                if value != "{" {
                    bail!("FilterRule requires a block");
                }
                *scope = Scope::Rule(RuleBlock::new());
                return Ok(());
            }
            Directive::Include => {
                if included {
                    bail!("Include may not be nested");
                }
                let inc = PathBuf::from(value);
                let text = fs::read_to_string(&inc)
                    .with_context(|| format!("cannot read include file {}", inc.display()))?;
                return self.parse_lines(&text, &inc, true);
            }
            _ => {}
        }
        self.apply_directive(directive, value)
    }

    /// Leaf-directive dispatch shared by the file parser (global scope) and
    /// the command line.
    pub(crate) fn apply_directive(&mut self, directive: Directive, value: &str) -> Result<()> {
        if apply_opts_directive(&mut self.opts, directive, value)? {
            return Ok(());
        }
        match directive {
            Directive::LeafKey => self.leaf_key = Some(CertHandle::load("LeafKey", value)?),
            Directive::LeafKeyRSABits => self.leaf_key_rsa_bits = rsa_bits(value)?,
            Directive::LeafCertDir => self.leaf_cert_dir = Some(existing_dir("LeafCertDir", value)?),
            Directive::DefaultLeafCert => {
                self.default_leaf_cert = Some(CertHandle::load("DefaultLeafCert", value)?)
            }
            Directive::WriteGenCertsDir => {
                self.write_gen_certs_dir = Some(existing_dir("WriteGenCertsDir", value)?)
            }
            Directive::WriteAllCertsDir => {
                self.write_all_certs_dir = Some(existing_dir("WriteAllCertsDir", value)?)
            }
            Directive::NATEngine => {
                if !is_nat_engine(value) {
                    bail!("unknown NAT engine '{}'", value);
                }
                self.nat_engine = value.to_string();
            }
            Directive::OpenSSLEngine => self.openssl_engine = Some(value.to_string()),
            Directive::User => self.drop_user = Some(value.to_string()),
            Directive::Group => self.drop_group = Some(value.to_string()),
            Directive::Chroot => self.chroot = Some(existing_dir("Chroot", value)?),
            Directive::PidFile => self.pidfile = Some(PathBuf::from(value)),
            Directive::ConnectLog => self.connect_log = Some(PathBuf::from(value)),
            Directive::ContentLog => self.content_log = Some(PathBuf::from(value)),
            Directive::ContentLogDir => self.content_log_dir = Some(PathBuf::from(value)),
            Directive::ContentLogPathSpec => {
                self.content_log_path_spec = Some(value.to_string())
            }
            Directive::LogProcInfo => self.log_proc_info = yesno("LogProcInfo", value)?,
            Directive::MasterKeyLog => self.masterkey_log = Some(PathBuf::from(value)),
            Directive::PcapLog => self.pcap_log = Some(PathBuf::from(value)),
            Directive::PcapLogDir => self.pcap_log_dir = Some(PathBuf::from(value)),
            Directive::PcapLogPathSpec => self.pcap_log_path_spec = Some(value.to_string()),
            Directive::MirrorIf => self.mirror_if = Some(value.to_string()),
            Directive::MirrorTarget => self.mirror_target = Some(value.to_string()),
            Directive::Daemon => self.daemon = yesno("Daemon", value)?,
            Directive::Debug => self.debug = yesno("Debug", value)?,
            Directive::DebugLevel => {
                self.debug_level = Some(ranged("DebugLevel", value, 0, 4)? as u8)
            }
            Directive::ExpiredConnCheckPeriod => {
                self.conn_idle_check_period = ranged("ExpiredConnCheckPeriod", value, 10, 60)?
            }
            Directive::LogStats => self.log_stats = yesno("LogStats", value)?,
            Directive::StatsPeriod => self.stats_period = ranged("StatsPeriod", value, 1, 10)?,
            Directive::OpenFilesLimit => {
                self.open_files_limit = Some(ranged("OpenFilesLimit", value, 50, 10000)?)
            }
            Directive::UserDBPath => self.user_db_path = Some(PathBuf::from(value)),
            _ => bail!("directive '{}' not valid here", directive.as_ref()),
        }
        Ok(())
    }

    /// Applies one `Name`/`value` pair from the command line. One-line
    /// `ProxySpec` values and `Include` are accepted; block forms are not.
    pub fn apply_cmdline_directive(&mut self, name: &str, value: &str) -> Result<()> {
        let mut scope = Scope::Global;
        self.global_line(name, value, &mut scope, false)?;
        if !matches!(scope, Scope::Global) {
            bail!("block form of '{}' not allowed on the command line", name);
        }
        Ok(())
    }

    /// Resolves divert modes and compiles every filter. Call once, after
    /// all files and command-line options are applied. `split` is the
    /// command-line split flag (`-n`).
    pub fn finalize(&mut self, split: bool) -> Result<()> {
        self.opts.compile_filter();
        let default_nat = self.nat_engine.clone();
        for spec in &mut self.specs {
            spec.finalize(split, &default_nat)?;
            spec.compile_filter();
        }
        Ok(())
    }

    /// Textual dump of the whole configuration: global fields, the
    /// top-level options, then one section per listener.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let _ = writeln!(out, "natengine={}", self.nat_engine);
        let _ = writeln!(out, "leafkeyrsabits={}", self.leaf_key_rsa_bits);
        let _ = writeln!(out, "connidlecheckperiod={}", self.conn_idle_check_period);
        let _ = writeln!(out, "statsperiod={}", self.stats_period);
        let _ = writeln!(out, "daemon={}", if self.daemon { "yes" } else { "no" });
        out.push_str(&self.opts.dump());
        for (idx, spec) in self.specs.iter().enumerate() {
            let _ = writeln!(out, "proxyspec {}: {}", idx, spec);
        }
        out
    }
}

/// Routes one options-scope directive; returns `false` when the directive
/// belongs to the global table instead.
fn apply_opts_directive(opts: &mut Opts, directive: Directive, value: &str) -> Result<bool> {
    match directive {
        Directive::CACert => opts.set_ca_cert(value)?,
        Directive::CAKey => opts.set_ca_key(value)?,
        Directive::CAChain => opts.set_ca_chain(value)?,
        Directive::ClientCert => opts.set_client_cert(value)?,
        Directive::ClientKey => opts.set_client_key(value)?,
        Directive::DHGroupParams => opts.set_dh_params(value)?,
        Directive::ECDHCurve => opts.set_ecdh_curve(value)?,
        Directive::Ciphers => opts.set_ciphers(value)?,
        Directive::CipherSuites => opts.set_ciphersuites(value)?,
        Directive::SSLCompression => opts.set_ssl_compression(value)?,
        Directive::ForceSSLProto => opts.set_force_ssl_proto(value)?,
        Directive::DisableSSLProto => opts.set_disable_ssl_proto(value)?,
        Directive::EnableSSLProto => opts.set_enable_ssl_proto(value)?,
        Directive::MinSSLProto => opts.set_min_ssl_proto(value)?,
        Directive::MaxSSLProto => opts.set_max_ssl_proto(value)?,
        Directive::VerifyPeer => opts.set_verify_peer(value)?,
        Directive::AllowWrongHost => opts.set_allow_wrong_host(value)?,
        Directive::LeafCRLURL => opts.set_leaf_crl_url(value)?,
        Directive::DenyOCSP => opts.set_deny_ocsp(value)?,
        Directive::Passthrough => opts.set_passthrough(value)?,
        Directive::RemoveHTTPAcceptEncoding => opts.set_remove_http_accept_encoding(value)?,
        Directive::RemoveHTTPReferer => opts.set_remove_http_referer(value)?,
        Directive::ValidateProto => opts.set_validate_proto(value)?,
        Directive::MaxHTTPHeaderSize => opts.set_max_http_header_size(value)?,
        Directive::ConnIdleTimeout => opts.set_conn_idle_timeout(value)?,
        Directive::UserAuth => opts.set_user_auth(value)?,
        Directive::UserAuthURL => opts.set_user_auth_url(value)?,
        Directive::UserTimeout => opts.set_user_timeout(value)?,
        Directive::DivertUsers => opts.set_divert_users(value)?,
        Directive::PassUsers => opts.set_pass_users(value)?,
        // `Divert yes|no` toggles the mode; anything else is a rule
        Directive::Divert => divert_line(opts, value)?,
        Directive::Split | Directive::Pass | Directive::Block | Directive::Match => {
            opts.add_rule_text(&format!("{} {}", directive.as_ref(), value))?;
        }
        Directive::Define => opts.macros.define(value)?,
        Directive::PassSite => pass_site(opts, value)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn divert_line(opts: &mut Opts, value: &str) -> Result<()> {
    if value == "yes" || value == "no" {
        opts.set_divert(value)?;
    } else {
        opts.add_rule_text(&format!("Divert {}", value))?;
    }
    Ok(())
}

/// `PassSite <site> [<ip> | <user> [<desc>] | *]`, kept for compatibility:
/// desugars to a `Pass` rule over the sni and cn channels.
fn pass_site(opts: &mut Opts, value: &str) -> Result<()> {
    let mut tokens = value.split_ascii_whitespace();
    let site = tokens
        .next()
        .ok_or_else(|| anyhow!("PassSite requires a site"))?;
    let mut text = format!("Pass to sni cn {}", site);
    match (tokens.next(), tokens.next()) {
        (None, _) => {}
        (Some("*"), None) => text.push_str(" from user *"),
        (Some(arg), None) if arg.parse::<std::net::IpAddr>().is_ok() => {
            text.push_str(&format!(" from ip {}", arg));
        }
        (Some(user), None) => text.push_str(&format!(" from user {}", user)),
        (Some(user), Some(desc)) => {
            text.push_str(&format!(" from user {} desc {}", user, desc));
        }
    }
    if tokens.next().is_some() {
        bail!("too many arguments for PassSite");
    }
    opts.add_rule_text(&text)?;
    Ok(())
}

/// Dispatch inside a `ProxySpec { … }` block: listener-topology keys first,
/// then the options table of the listener's private scope.
fn spec_line(block: &mut SpecBlock, name: &str, value: &str) -> Result<()> {
    if block.set(name, value)? {
        return Ok(());
    }
    let directive = Directive::from_str(name)
        .map_err(|_| anyhow!("unknown directive '{}' in ProxySpec", name))?;
    if !apply_opts_directive(&mut block.opts, directive, value)? {
        bail!("directive '{}' not valid inside ProxySpec", name);
    }
    Ok(())
}

fn rule_block_line(block: &mut RuleBlock, name: &str, value: &str) -> Result<()> {
    if !block.set(name, value)? {
        bail!("unknown FilterRule field '{}'", name);
    }
    Ok(())
}

fn rsa_bits(value: &str) -> Result<u32> {
    let bits: u32 = value
        .parse()
        .map_err(|_| anyhow!("invalid value '{}' for LeafKeyRSABits", value))?;
    if ![1024, 2048, 3072, 4096].contains(&bits) {
        bail!("LeafKeyRSABits must be 1024, 2048, 3072 or 4096");
    }
    Ok(bits)
}

fn existing_dir(name: &'static str, value: &str) -> Result<PathBuf> {
    let path = PathBuf::from(value);
    if !path.is_dir() {
        bail!("{}: '{}' is not a directory", name, value);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ftree::{Channel, FilterQuery};
    use crate::filter::Action;
    use std::io::Write as _;

    #[test]
    fn parses_global_options_and_listener() {
        let mut config = Config::new();
        config
            .load_str(
                "# policy\n\
                 UserAuth yes\n\
                 UserTimeout 600\n\
                 MaxHTTPHeaderSize 4096\n\
                 ProxySpec https 127.0.0.1 8443 netfilter\n",
            )
            .unwrap();
        assert!(config.opts.user_auth);
        assert_eq!(config.opts.user_timeout, 600);
        assert_eq!(config.specs.len(), 1);
        // listener cloned the options before nothing else changed
        assert_eq!(config.specs[0].opts.user_timeout, 600);
    }

    #[test]
    fn listener_snapshot_precedes_later_global_changes() {
        let mut config = Config::new();
        config
            .load_str(
                "UserTimeout 100\n\
                 ProxySpec https 127.0.0.1 8443 netfilter\n\
                 UserTimeout 200\n\
                 ProxySpec https 127.0.0.1 9443 netfilter\n",
            )
            .unwrap();
        assert_eq!(config.specs[0].opts.user_timeout, 100);
        assert_eq!(config.specs[1].opts.user_timeout, 200);
        assert_eq!(config.opts.user_timeout, 200);
    }

    #[test]
    fn unknown_directive_reports_line() {
        let mut config = Config::new();
        let err = config
            .load_str("Daemon yes\nNoSuchThing 1\n")
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("<config>:2"), "{}", msg);
        assert!(msg.contains("NoSuchThing"), "{}", msg);
    }

    #[test]
    fn value_errors_report_line() {
        let mut config = Config::new();
        let err = config.load_str("\n\nDebugLevel 9\n").unwrap_err();
        assert!(format!("{:#}", err).contains("<config>:3"));
    }

    #[test]
    fn divert_homograph() {
        let mut config = Config::new();
        config
            .load_str("Divert no\nDivert from ip 192.168.0.1\n")
            .unwrap();
        assert!(!config.opts.divert);
        assert_eq!(config.opts.rules.len(), 1);
        assert_eq!(config.opts.rules[0].action, Action::Divert);
    }

    #[test]
    fn define_and_rule_compile_into_filter() {
        let mut config = Config::new();
        config
            .load_str(
                "Define $m 192.168.0.1 192.168.0.2\n\
                 Pass from ip $m\n",
            )
            .unwrap();
        config.finalize(false).unwrap();
        let tree = config.opts.filter.as_ref().unwrap();
        assert_eq!(tree.ip_exact.len(), 2);
    }

    #[test]
    fn pass_site_desugars_to_pass_rule() {
        let mut config = Config::new();
        config
            .load_str("PassSite example.com 192.168.0.1\nPassSite pinned.org\n")
            .unwrap();
        config.finalize(false).unwrap();
        let tree = config.opts.filter.as_ref().unwrap();
        let verdict = tree
            .lookup(&FilterQuery {
                user: None,
                desc: None,
                src_ip: "192.168.0.1",
                channel: Channel::Sni,
                site: "example.com",
                port: None,
            })
            .unwrap();
        assert_eq!(verdict.action, Action::Pass);
        // the cn channel matches too, the host channel does not
        assert!(tree
            .lookup(&FilterQuery {
                user: None,
                desc: None,
                src_ip: "10.0.0.9",
                channel: Channel::Cn,
                site: "pinned.org",
                port: None,
            })
            .is_some());
        assert!(tree
            .lookup(&FilterQuery {
                user: None,
                desc: None,
                src_ip: "10.0.0.9",
                channel: Channel::Host,
                site: "pinned.org",
                port: None,
            })
            .is_none());
    }

    #[test]
    fn proxyspec_block_with_overrides_and_rules() {
        let mut config = Config::new();
        config
            .load_str(
                "UserTimeout 300\n\
                 ProxySpec {\n\
                 Proto https\n\
                 Addr 127.0.0.1\n\
                 Port 8443\n\
                 DivertPort 8080\n\
                 UserTimeout 60\n\
                 Divert yes\n\
                 Pass to sni example.com\n\
                 FilterRule {\n\
                 Action Block\n\
                 SNI bad.example.org\n\
                 }\n\
                 }\n",
            )
            .unwrap();
        config.finalize(false).unwrap();
        assert_eq!(config.specs.len(), 1);
        let spec = &config.specs[0];
        assert_eq!(spec.opts.user_timeout, 60);
        assert_eq!(config.opts.user_timeout, 300);
        assert!(spec.opts.divert);
        assert_eq!(spec.opts.rules.len(), 2);
        // global rules list was not touched by the listener's rules
        assert!(config.opts.rules.is_empty());
    }

    #[test]
    fn filter_rule_block_at_global_scope() {
        let mut config = Config::new();
        config
            .load_str(
                "FilterRule {\n\
                 Action Divert\n\
                 SrcIp 192.168.0.1\n\
                 DstIp 192.168.0.2\n\
                 DstPort 443\n\
                 Log connect\n\
                 }\n",
            )
            .unwrap();
        assert_eq!(config.opts.rules.len(), 1);
        assert_eq!(config.opts.rules[0].precedence, 3);
    }

    #[test]
    fn unterminated_and_unmatched_blocks() {
        let mut config = Config::new();
        assert!(config.load_str("ProxySpec {\nProto https\n").is_err());
        let mut config = Config::new();
        assert!(config.load_str("}\n").is_err());
    }

    #[test]
    fn include_reads_file_but_rejects_nesting() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner.conf");
        let mut f = fs::File::create(&inner).unwrap();
        writeln!(f, "UserTimeout 77").unwrap();

        let mut config = Config::new();
        config
            .load_str(&format!("Include {}\n", inner.display()))
            .unwrap();
        assert_eq!(config.opts.user_timeout, 77);

        // an include file including another file is rejected
        let outer = dir.path().join("outer.conf");
        let mut f = fs::File::create(&outer).unwrap();
        writeln!(f, "Include {}", inner.display()).unwrap();
        let mut config = Config::new();
        let err = config
            .load_str(&format!("Include {}\n", outer.display()))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("nested"));
    }

    #[test]
    fn chroot_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new();
        config
            .load_str(&format!("Chroot {}\n", dir.path().display()))
            .unwrap();
        let mut config = Config::new();
        assert!(config.load_str("Chroot /definitely/not/there\n").is_err());
    }

    #[test]
    fn leaf_key_rsa_bits_whitelist() {
        let mut config = Config::new();
        config.load_str("LeafKeyRSABits 4096\n").unwrap();
        assert_eq!(config.leaf_key_rsa_bits, 4096);
        let mut config = Config::new();
        assert!(config.load_str("LeafKeyRSABits 1536\n").is_err());
    }

    #[test]
    fn finalize_applies_split_flag_to_all_listeners() {
        let mut config = Config::new();
        config
            .load_str("ProxySpec https 127.0.0.1 8443 up:8080 netfilter\n")
            .unwrap();
        config.finalize(true).unwrap();
        assert!(!config.specs[0].opts.divert);

        let mut config = Config::new();
        config
            .load_str("ProxySpec https 127.0.0.1 8443 up:8080 netfilter\n")
            .unwrap();
        config.finalize(false).unwrap();
        assert!(config.specs[0].opts.divert);
    }

    #[test]
    fn rules_inside_listener_use_listener_macros() {
        let mut config = Config::new();
        config
            .load_str(
                "Define $global 10.0.0.1\n\
                 ProxySpec {\n\
                 Proto https\n\
                 Addr 127.0.0.1\n\
                 Port 8443\n\
                 Define $local 10.0.0.2 10.0.0.3\n\
                 Pass from ip $local\n\
                 Pass from ip $global\n\
                 }\n",
            )
            .unwrap();
        let spec = &config.specs[0];
        // $global was cloned into the listener scope with the options
        assert_eq!(spec.opts.rules.len(), 3);
    }
}
