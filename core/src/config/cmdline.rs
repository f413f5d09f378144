//! Command-line application of configuration directives.
//!
//! Every configuration directive has a command-line equivalent: `-o
//! KEY=VAL` applies any directive, and long options are the directive names
//! matched case-insensitively. The separator is `=` instead of whitespace;
//! the tokenizer is shared with the file parser.

use std::str::FromStr;

use anyhow::{anyhow, Result};
use strum::IntoEnumIterator;

use crate::config::lexer::{get_name_required_value, Sep};
use crate::config::{Config, Directive};

lazy_static! {
    /// Lowercased directive names, for long-option resolution.
    static ref LONG_OPTS: Vec<(String, Directive)> = Directive::iter()
        .map(|d| (d.as_ref().to_lowercase(), d))
        .collect();
}

/// Resolves a command-line option name to its directive: exact match first,
/// then case-insensitive.
pub(crate) fn resolve(name: &str) -> Option<Directive> {
    if let Ok(d) = Directive::from_str(name) {
        return Some(d);
    }
    let lower = name.to_lowercase();
    LONG_OPTS
        .iter()
        .find(|(n, _)| *n == lower)
        .map(|(_, d)| *d)
}

/// Applies one `KEY=VAL` pair.
pub fn apply_opt(config: &mut Config, pair: &str) -> Result<()> {
    let (name, value) = get_name_required_value(pair, Sep::Equals)?;
    let directive =
        resolve(&name).ok_or_else(|| anyhow!("unknown option '{}'", name))?;
    config.apply_cmdline_directive(directive.as_ref(), &value)
}

/// Applies a sequence of `-o KEY=VAL` pairs in order.
pub fn apply_opts(config: &mut Config, pairs: &[String]) -> Result<()> {
    for pair in pairs {
        apply_opt(config, pair)?;
    }
    Ok(())
}
