//! Filter rules: parsing, macro expansion, and the compiled lookup tree.
//!
//! One-line rule texts (and the `FilterRule { … }` block form, which the
//! configuration layer desugars into the same record) are parsed into
//! [ast::FilterRule] values, fanned out over `$`-macros, and accumulated on
//! the owning options scope. After parsing completes, [ftree::FilterTree]
//! folds the accumulated rules into the layered structure the connection
//! engine queries; the tree is immutable from then on.

pub mod ast;
pub mod defines;
pub mod ftree;
pub mod parser;

pub use ast::{Action, DstChannel, FilterRule, LogAction, LogSpec, Pattern};
pub use defines::MacroTable;
pub use ftree::{FilterTree, FilterVerdict};
pub use parser::{parse_rule, RuleBlock};

use thiserror::Error;

/// Distinguishes a rule that parsed as written from one that went through
/// macro expansion, so callers never conflate "one rule was produced" with
/// "the text expanded into its cartesian product".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    /// The text produced exactly the written rule.
    Literal,
    /// At least one slot held a macro reference; carries the number of
    /// concrete rules produced.
    Expanded(usize),
}

impl RuleOutcome {
    pub fn is_expanded(&self) -> bool {
        matches!(self, RuleOutcome::Expanded(_))
    }
}

#[derive(Debug, Error)]
pub enum FilterError {
    // Umbrella for texts that do not satisfy the grammar.
    #[error("invalid filter rule syntax: {0}")]
    InvalidFormat(String),

    #[error("invalid filter action: {0}")]
    InvalidAction(String),

    #[error("invalid log channel: {0}")]
    InvalidLogChannel(String),

    #[error("invalid target channel: {0}")]
    InvalidChannel(String),

    #[error("duplicate '{0}' clause in filter rule")]
    DuplicateClause(&'static str),

    #[error("user or description filter requires UserAuth yes")]
    RequiresUserAuth,

    #[error("undefined macro: {0}")]
    UndefinedMacro(String),

    #[error("malformed macro definition: {0}")]
    MalformedMacro(String),

    #[error("macro {name} refers to macro {value}: macros cannot be nested")]
    NestedMacro { name: String, value: String },

    #[error("missing value in filter rule field {0}")]
    MissingField(&'static str),

    #[error("conflicting target sites in filter rule block: {0} vs {1}")]
    ConflictingSites(String, String),
}
