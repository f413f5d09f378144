//! The options container.
//!
//! One `Opts` holds the tunable policy of one scope: the global scope, one
//! listener, or the private copy a filter rule mutates. Listeners receive a
//! deep clone of the global options at the moment of their declaration, so
//! later global mutations never leak into existing listeners. Certificate
//! material is the exception: handles are reference counted and shared
//! across clones.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::filter::{parse_rule, FilterRule, FilterTree, MacroTable, RuleOutcome};

#[derive(Debug, Error)]
pub enum OptsError {
    #[error("invalid value '{value}' for {name}")]
    Invalid { name: &'static str, value: String },

    #[error("{name} value {value} out of range {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{name}: cannot load '{path}': {source}")]
    File {
        name: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[error("{name}: more than {max} users in one directive")]
    TooManyUsers { name: &'static str, max: usize },
}

/// SSL/TLS protocol versions accepted by the `*SSLProto` directives.
/// `tls1` is accepted as an alias of `tls10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SslProto {
    Ssl2,
    Ssl3,
    #[strum(to_string = "tls10", serialize = "tls1")]
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

/// A loaded certificate, key, chain or DH-parameter file.
///
/// The PKI engine parses the bytes elsewhere; this subsystem only validates
/// that the file is readable and keeps the bytes alive. Clones share the
/// bytes by reference count.
#[derive(Debug, Clone)]
pub struct CertHandle {
    path: PathBuf,
    data: Arc<Vec<u8>>,
}

impl CertHandle {
    pub fn load(name: &'static str, path: &str) -> Result<CertHandle, OptsError> {
        let data = fs::read(path).map_err(|source| OptsError::File {
            name,
            path: path.to_string(),
            source,
        })?;
        Ok(CertHandle {
            path: PathBuf::from(path),
            data: Arc::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of scopes currently sharing the handle.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

const MAX_USERS_PER_DIRECTIVE: usize = 50;

/// Tunable policy of one scope.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Divert to the inspector (`true`) or split without it (`false`).
    pub divert: bool,

    pub ca_cert: Option<CertHandle>,
    pub ca_key: Option<CertHandle>,
    pub ca_chain: Option<CertHandle>,
    pub client_cert: Option<CertHandle>,
    pub client_key: Option<CertHandle>,
    pub dh_params: Option<CertHandle>,
    pub ecdh_curve: Option<String>,
    pub ciphers: Option<String>,
    pub ciphersuites: Option<String>,
    pub ssl_compression: bool,
    pub force_ssl_proto: Option<SslProto>,
    pub disabled_ssl_protos: Vec<SslProto>,
    pub min_ssl_proto: SslProto,
    pub max_ssl_proto: SslProto,
    pub verify_peer: bool,
    pub allow_wrong_host: bool,
    pub leaf_crl_url: Option<String>,

    pub deny_ocsp: bool,
    pub passthrough: bool,
    pub remove_http_accept_encoding: bool,
    pub remove_http_referer: bool,
    pub validate_proto: bool,
    pub max_http_header_size: u32,
    pub conn_idle_timeout: u32,

    pub user_auth: bool,
    pub user_auth_url: Option<String>,
    pub user_timeout: u32,
    pub divert_users: Vec<String>,
    pub pass_users: Vec<String>,

    /// Parse-scope macro table, consumed by rule expansion.
    pub macros: MacroTable,
    /// Rules accumulated during parsing, in declaration order.
    pub rules: Vec<FilterRule>,
    /// Built once after parsing by [Opts::compile_filter].
    pub filter: Option<FilterTree>,
}

impl Default for Opts {
    fn default() -> Self {
        Self::new()
    }
}

impl Opts {
    pub fn new() -> Opts {
        Opts {
            divert: true,
            ca_cert: None,
            ca_key: None,
            ca_chain: None,
            client_cert: None,
            client_key: None,
            dh_params: None,
            ecdh_curve: None,
            ciphers: None,
            ciphersuites: None,
            ssl_compression: true,
            force_ssl_proto: None,
            disabled_ssl_protos: vec![],
            min_ssl_proto: SslProto::Tls10,
            max_ssl_proto: SslProto::Tls13,
            verify_peer: true,
            allow_wrong_host: false,
            leaf_crl_url: None,
            deny_ocsp: false,
            passthrough: false,
            remove_http_accept_encoding: false,
            remove_http_referer: true,
            validate_proto: false,
            max_http_header_size: 8192,
            conn_idle_timeout: 120,
            user_auth: false,
            user_auth_url: None,
            user_timeout: 300,
            divert_users: vec![],
            pass_users: vec![],
            macros: MacroTable::new(),
            rules: vec![],
            filter: None,
        }
    }

    pub fn set_ca_cert(&mut self, value: &str) -> Result<(), OptsError> {
        self.ca_cert = Some(CertHandle::load("CACert", value)?);
        Ok(())
    }

    pub fn set_ca_key(&mut self, value: &str) -> Result<(), OptsError> {
        self.ca_key = Some(CertHandle::load("CAKey", value)?);
        Ok(())
    }

    pub fn set_ca_chain(&mut self, value: &str) -> Result<(), OptsError> {
        self.ca_chain = Some(CertHandle::load("CAChain", value)?);
        Ok(())
    }

    pub fn set_client_cert(&mut self, value: &str) -> Result<(), OptsError> {
        self.client_cert = Some(CertHandle::load("ClientCert", value)?);
        Ok(())
    }

    pub fn set_client_key(&mut self, value: &str) -> Result<(), OptsError> {
        self.client_key = Some(CertHandle::load("ClientKey", value)?);
        Ok(())
    }

    pub fn set_dh_params(&mut self, value: &str) -> Result<(), OptsError> {
        self.dh_params = Some(CertHandle::load("DHGroupParams", value)?);
        Ok(())
    }

    pub fn set_ecdh_curve(&mut self, value: &str) -> Result<(), OptsError> {
        self.ecdh_curve = Some(nonempty("ECDHCurve", value)?);
        Ok(())
    }

    pub fn set_ciphers(&mut self, value: &str) -> Result<(), OptsError> {
        self.ciphers = Some(nonempty("Ciphers", value)?);
        Ok(())
    }

    pub fn set_ciphersuites(&mut self, value: &str) -> Result<(), OptsError> {
        self.ciphersuites = Some(nonempty("CipherSuites", value)?);
        Ok(())
    }

    pub fn set_ssl_compression(&mut self, value: &str) -> Result<(), OptsError> {
        self.ssl_compression = yesno("SSLCompression", value)?;
        Ok(())
    }

    pub fn set_force_ssl_proto(&mut self, value: &str) -> Result<(), OptsError> {
        self.force_ssl_proto = Some(proto("ForceSSLProto", value)?);
        Ok(())
    }

    pub fn set_disable_ssl_proto(&mut self, value: &str) -> Result<(), OptsError> {
        let p = proto("DisableSSLProto", value)?;
        if !self.disabled_ssl_protos.contains(&p) {
            self.disabled_ssl_protos.push(p);
        }
        Ok(())
    }

    pub fn set_enable_ssl_proto(&mut self, value: &str) -> Result<(), OptsError> {
        let p = proto("EnableSSLProto", value)?;
        self.disabled_ssl_protos.retain(|d| *d != p);
        Ok(())
    }

    pub fn set_min_ssl_proto(&mut self, value: &str) -> Result<(), OptsError> {
        self.min_ssl_proto = proto("MinSSLProto", value)?;
        Ok(())
    }

    pub fn set_max_ssl_proto(&mut self, value: &str) -> Result<(), OptsError> {
        self.max_ssl_proto = proto("MaxSSLProto", value)?;
        Ok(())
    }

    pub fn set_verify_peer(&mut self, value: &str) -> Result<(), OptsError> {
        self.verify_peer = yesno("VerifyPeer", value)?;
        Ok(())
    }

    pub fn set_allow_wrong_host(&mut self, value: &str) -> Result<(), OptsError> {
        self.allow_wrong_host = yesno("AllowWrongHost", value)?;
        Ok(())
    }

    pub fn set_leaf_crl_url(&mut self, value: &str) -> Result<(), OptsError> {
        self.leaf_crl_url = Some(nonempty("LeafCRLURL", value)?);
        Ok(())
    }

    pub fn set_deny_ocsp(&mut self, value: &str) -> Result<(), OptsError> {
        self.deny_ocsp = yesno("DenyOCSP", value)?;
        Ok(())
    }

    pub fn set_passthrough(&mut self, value: &str) -> Result<(), OptsError> {
        self.passthrough = yesno("Passthrough", value)?;
        Ok(())
    }

    pub fn set_remove_http_accept_encoding(&mut self, value: &str) -> Result<(), OptsError> {
        self.remove_http_accept_encoding = yesno("RemoveHTTPAcceptEncoding", value)?;
        Ok(())
    }

    pub fn set_remove_http_referer(&mut self, value: &str) -> Result<(), OptsError> {
        self.remove_http_referer = yesno("RemoveHTTPReferer", value)?;
        Ok(())
    }

    pub fn set_validate_proto(&mut self, value: &str) -> Result<(), OptsError> {
        self.validate_proto = yesno("ValidateProto", value)?;
        Ok(())
    }

    pub fn set_max_http_header_size(&mut self, value: &str) -> Result<(), OptsError> {
        self.max_http_header_size = ranged("MaxHTTPHeaderSize", value, 1024, 65536)?;
        Ok(())
    }

    pub fn set_conn_idle_timeout(&mut self, value: &str) -> Result<(), OptsError> {
        self.conn_idle_timeout = ranged("ConnIdleTimeout", value, 10, 3600)?;
        Ok(())
    }

    pub fn set_user_auth(&mut self, value: &str) -> Result<(), OptsError> {
        self.user_auth = yesno("UserAuth", value)?;
        Ok(())
    }

    pub fn set_user_auth_url(&mut self, value: &str) -> Result<(), OptsError> {
        self.user_auth_url = Some(nonempty("UserAuthURL", value)?);
        Ok(())
    }

    pub fn set_user_timeout(&mut self, value: &str) -> Result<(), OptsError> {
        self.user_timeout = ranged("UserTimeout", value, 0, 86400)?;
        Ok(())
    }

    pub fn set_divert_users(&mut self, value: &str) -> Result<(), OptsError> {
        append_users("DivertUsers", &mut self.divert_users, value)
    }

    pub fn set_pass_users(&mut self, value: &str) -> Result<(), OptsError> {
        append_users("PassUsers", &mut self.pass_users, value)
    }

    pub fn set_divert(&mut self, value: &str) -> Result<(), OptsError> {
        self.divert = yesno("Divert", value)?;
        Ok(())
    }

    /// Parses one rule text against this scope's macro table and appends the
    /// concrete rules.
    pub fn add_rule_text(&mut self, text: &str) -> anyhow::Result<RuleOutcome> {
        let (rules, outcome) = parse_rule(text, &self.macros, self.user_auth)?;
        self.rules.extend(rules);
        Ok(outcome)
    }

    /// Builds the compiled filter; called once, after parsing completes.
    pub fn compile_filter(&mut self) {
        self.filter = Some(FilterTree::compile(&self.rules));
    }

    /// Renders every field in a fixed order. Used by the configuration dump
    /// and by tests comparing scopes.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut kv = |k: &str, v: String| {
            let _ = writeln!(out, "{}={}", k, v);
        };
        kv("divert", yn(self.divert));
        kv("cacert", path_of(&self.ca_cert));
        kv("cakey", path_of(&self.ca_key));
        kv("cachain", path_of(&self.ca_chain));
        kv("clientcert", path_of(&self.client_cert));
        kv("clientkey", path_of(&self.client_key));
        kv("dhparams", path_of(&self.dh_params));
        kv("ecdhcurve", or_dash(&self.ecdh_curve));
        kv("ciphers", or_dash(&self.ciphers));
        kv("ciphersuites", or_dash(&self.ciphersuites));
        kv("sslcompression", yn(self.ssl_compression));
        kv(
            "forcesslproto",
            self.force_ssl_proto
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        kv(
            "disablesslprotos",
            if self.disabled_ssl_protos.is_empty() {
                "-".to_string()
            } else {
                self.disabled_ssl_protos
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            },
        );
        kv("minsslproto", self.min_ssl_proto.to_string());
        kv("maxsslproto", self.max_ssl_proto.to_string());
        kv("verifypeer", yn(self.verify_peer));
        kv("allowwronghost", yn(self.allow_wrong_host));
        kv("leafcrlurl", or_dash(&self.leaf_crl_url));
        kv("denyocsp", yn(self.deny_ocsp));
        kv("passthrough", yn(self.passthrough));
        kv("removehttpacceptencoding", yn(self.remove_http_accept_encoding));
        kv("removehttpreferer", yn(self.remove_http_referer));
        kv("validateproto", yn(self.validate_proto));
        kv("maxhttpheadersize", self.max_http_header_size.to_string());
        kv("connidletimeout", self.conn_idle_timeout.to_string());
        kv("userauth", yn(self.user_auth));
        kv("userauthurl", or_dash(&self.user_auth_url));
        kv("usertimeout", self.user_timeout.to_string());
        kv("divertusers", join_or_dash(&self.divert_users));
        kv("passusers", join_or_dash(&self.pass_users));
        drop(kv);
        out.push_str(&self.macros.to_string());
        for rule in &self.rules {
            let _ = writeln!(out, "{}", rule);
        }
        out
    }
}

fn yn(v: bool) -> String {
    if v { "yes" } else { "no" }.to_string()
}

fn path_of(handle: &Option<CertHandle>) -> String {
    match handle {
        Some(h) => h.path().display().to_string(),
        None => "-".to_string(),
    }
}

fn or_dash(v: &Option<String>) -> String {
    v.clone().unwrap_or_else(|| "-".to_string())
}

fn join_or_dash(users: &[String]) -> String {
    if users.is_empty() {
        "-".to_string()
    } else {
        users.join(",")
    }
}

pub(crate) fn yesno(name: &'static str, value: &str) -> Result<bool, OptsError> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(OptsError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

pub(crate) fn ranged(
    name: &'static str,
    value: &str,
    min: u64,
    max: u64,
) -> Result<u32, OptsError> {
    let n: u64 = value.parse().map_err(|_| OptsError::Invalid {
        name,
        value: value.to_string(),
    })?;
    if n < min || n > max {
        return Err(OptsError::OutOfRange {
            name,
            value: n,
            min,
            max,
        });
    }
    Ok(n as u32)
}

fn nonempty(name: &'static str, value: &str) -> Result<String, OptsError> {
    if value.is_empty() {
        return Err(OptsError::Invalid {
            name,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn proto(name: &'static str, value: &str) -> Result<SslProto, OptsError> {
    SslProto::from_str(value).map_err(|_| OptsError::Invalid {
        name,
        value: value.to_string(),
    })
}

fn append_users(
    name: &'static str,
    list: &mut Vec<String>,
    value: &str,
) -> Result<(), OptsError> {
    let users: Vec<&str> = value.split_ascii_whitespace().collect();
    if users.is_empty() {
        return Err(OptsError::Invalid {
            name,
            value: value.to_string(),
        });
    }
    if users.len() > MAX_USERS_PER_DIRECTIVE {
        return Err(OptsError::TooManyUsers {
            name,
            max: MAX_USERS_PER_DIRECTIVE,
        });
    }
    list.extend(users.into_iter().map(str::to_string));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults() {
        let opts = Opts::new();
        assert!(opts.divert);
        assert!(opts.ssl_compression);
        assert_eq!(opts.min_ssl_proto, SslProto::Tls10);
        assert_eq!(opts.max_ssl_proto, SslProto::Tls13);
        assert!(opts.verify_peer);
        assert!(opts.remove_http_referer);
        assert_eq!(opts.user_timeout, 300);
        assert_eq!(opts.max_http_header_size, 8192);
        assert!(!opts.user_auth);
    }

    #[test]
    fn booleans_accept_only_yes_and_no() {
        let mut opts = Opts::new();
        opts.set_verify_peer("no").unwrap();
        assert!(!opts.verify_peer);
        opts.set_verify_peer("yes").unwrap();
        assert!(opts.verify_peer);
        for bad in ["true", "1", "on", "Yes", ""] {
            assert!(opts.set_verify_peer(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn numeric_ranges_enforced() {
        let mut opts = Opts::new();
        opts.set_user_timeout("0").unwrap();
        opts.set_user_timeout("86400").unwrap();
        assert!(opts.set_user_timeout("86401").is_err());
        assert!(opts.set_user_timeout("x").is_err());

        opts.set_max_http_header_size("1024").unwrap();
        assert!(opts.set_max_http_header_size("1023").is_err());
        assert!(opts.set_max_http_header_size("65537").is_err());

        opts.set_conn_idle_timeout("10").unwrap();
        assert!(opts.set_conn_idle_timeout("9").is_err());
        assert!(opts.set_conn_idle_timeout("3601").is_err());
    }

    #[test]
    fn ssl_proto_names() {
        let mut opts = Opts::new();
        for (name, want) in [
            ("ssl2", SslProto::Ssl2),
            ("ssl3", SslProto::Ssl3),
            ("tls10", SslProto::Tls10),
            ("tls1", SslProto::Tls10),
            ("tls11", SslProto::Tls11),
            ("tls12", SslProto::Tls12),
            ("tls13", SslProto::Tls13),
        ] {
            opts.set_force_ssl_proto(name).unwrap();
            assert_eq!(opts.force_ssl_proto, Some(want), "{}", name);
        }
        assert!(opts.set_force_ssl_proto("tls14").is_err());
        assert!(opts.set_min_ssl_proto("sslv3").is_err());
    }

    #[test]
    fn disable_and_enable_ssl_proto() {
        let mut opts = Opts::new();
        opts.set_disable_ssl_proto("ssl3").unwrap();
        opts.set_disable_ssl_proto("tls10").unwrap();
        opts.set_disable_ssl_proto("ssl3").unwrap(); // no duplicate
        assert_eq!(
            opts.disabled_ssl_protos,
            vec![SslProto::Ssl3, SslProto::Tls10]
        );
        opts.set_enable_ssl_proto("ssl3").unwrap();
        assert_eq!(opts.disabled_ssl_protos, vec![SslProto::Tls10]);
    }

    #[test]
    fn user_list_capped_per_directive() {
        let mut opts = Opts::new();
        let fifty = (0..50).map(|i| format!("u{}", i)).collect::<Vec<_>>().join(" ");
        opts.set_divert_users(&fifty).unwrap();
        assert_eq!(opts.divert_users.len(), 50);

        let too_many = (0..51).map(|i| format!("v{}", i)).collect::<Vec<_>>().join(" ");
        assert!(opts.set_divert_users(&too_many).is_err());
        // a second directive may append another batch
        opts.set_divert_users("extra1 extra2").unwrap();
        assert_eq!(opts.divert_users.len(), 52);
    }

    #[test]
    fn cert_handles_are_shared_by_clones() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut opts = Opts::new();
        opts.set_ca_cert(&path).unwrap();
        assert_eq!(opts.ca_cert.as_ref().unwrap().ref_count(), 1);

        let clone = opts.clone();
        assert_eq!(opts.ca_cert.as_ref().unwrap().ref_count(), 2);
        assert_eq!(
            clone.ca_cert.as_ref().unwrap().path(),
            opts.ca_cert.as_ref().unwrap().path()
        );

        assert!(opts.set_ca_key("/nonexistent/ca.key").is_err());
    }

    #[test]
    fn clone_is_deep_and_independent() {
        let mut opts = Opts::new();
        opts.set_user_auth("yes").unwrap();
        opts.set_divert_users("alice bob").unwrap();
        opts.macros.define("$m 10.0.0.1").unwrap();
        opts.add_rule_text("Pass from ip $m").unwrap();

        let clone = opts.clone();
        assert_eq!(opts.dump(), clone.dump());

        // mutating the original does not affect the clone
        opts.set_user_timeout("60").unwrap();
        opts.set_pass_users("carol").unwrap();
        opts.add_rule_text("Block *").unwrap();
        assert_ne!(opts.dump(), clone.dump());
        assert_eq!(clone.rules.len(), 1);
        assert_eq!(clone.pass_users.len(), 0);
    }

    #[test]
    fn rule_user_auth_gate_follows_option() {
        let mut opts = Opts::new();
        assert!(opts.add_rule_text("Divert from user *").is_err());
        opts.set_user_auth("yes").unwrap();
        assert!(opts.add_rule_text("Divert from user *").is_ok());
    }
}
