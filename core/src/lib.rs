//! Policy core for a transparent TLS/SSL interception proxy.
//!
//! Divert terminates client connections, forges a leaf certificate signed by a
//! configured root authority, and streams traffic between the client and the
//! upstream server while applying per-connection filter policy. This crate is
//! the part of the proxy that turns a textual policy (command line plus a
//! hierarchical configuration file) into the runtime data structures the
//! connection engine queries:
//!
//! - A polymorphic options model: global defaults, per-listener overrides, and
//!   per-rule overrides of a curated subset ([config::opts]).
//! - A parser for a nested configuration language with `$`-macros and an
//!   `Include` directive ([config]).
//! - A filter-rule compiler that expands macros into the cartesian product of
//!   rules, classifies each rule by precedence, and projects the rules into a
//!   layered lookup structure used at connection time ([filter]).
//! - The proxy-specification state machine that turns listener declarations
//!   into listener descriptors ([config::proxyspec]).
//!
//! Parsing is single-threaded; once [config::Config::finalize] returns, the
//! compiled filters are immutable and may be shared across threads freely.
//! This crate never opens sockets: the TLS engine, certificate forging, and
//! the per-connection event loop live elsewhere and consume the compiled
//! state read-only.

#[macro_use]
extern crate pest_derive;
#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod filter;

pub use config::opts::Opts;
pub use config::proxyspec::ProxySpec;
pub use config::Config;
pub use filter::ast::{Action, DstChannel, FilterRule, LogAction};
pub use filter::ftree::{FilterTree, FilterVerdict};
pub use filter::RuleOutcome;
