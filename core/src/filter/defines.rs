//! `Define` macro table.
//!
//! A macro is a parser-scope named list of tokens; the name carries a `$`
//! sigil. Macros are expanded inside rule texts into the cartesian product of
//! concrete rules. Expansion is single-level: a macro value may not itself be
//! a macro reference.

use std::fmt;

use hashlink::LinkedHashMap;

use crate::filter::FilterError;

#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    map: LinkedHashMap<String, Vec<String>>,
}

impl MacroTable {
    pub fn new() -> Self {
        MacroTable {
            map: LinkedHashMap::new(),
        }
    }

    /// Defines a macro from the value of a `Define` directive: the macro name
    /// followed by one or more whitespace-separated tokens. A later `Define`
    /// for the same name replaces the earlier one.
    pub fn define(&mut self, value: &str) -> Result<(), FilterError> {
        let mut tokens = value.split_ascii_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| FilterError::MalformedMacro(value.to_string()))?;
        if !name.starts_with('$') || name.len() < 2 {
            return Err(FilterError::MalformedMacro(name.to_string()));
        }

        let values: Vec<String> = tokens.map(str::to_string).collect();
        if values.is_empty() {
            return Err(FilterError::MalformedMacro(name.to_string()));
        }
        if let Some(nested) = values.iter().find(|v| v.starts_with('$')) {
            return Err(FilterError::NestedMacro {
                name: name.to_string(),
                value: nested.to_string(),
            });
        }

        self.map.insert(name.to_string(), values);
        Ok(())
    }

    /// Looks up a macro by its `$`-prefixed name.
    pub fn lookup(&self, name: &str) -> Option<&[String]> {
        self.map.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Display for MacroTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, values) in self.map.iter() {
            writeln!(f, "Define {} {}", name, values.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_and_lookup() {
        let mut macros = MacroTable::new();
        macros.define("$ips 192.168.0.1 192.168.0.2").unwrap();
        assert_eq!(
            macros.lookup("$ips").unwrap(),
            &["192.168.0.1".to_string(), "192.168.0.2".to_string()]
        );
        assert!(macros.lookup("$other").is_none());
    }

    #[test]
    fn redefinition_replaces() {
        let mut macros = MacroTable::new();
        macros.define("$m a b").unwrap();
        macros.define("$m c").unwrap();
        assert_eq!(macros.lookup("$m").unwrap(), &["c".to_string()]);
        assert_eq!(macros.len(), 1);
    }

    #[test]
    fn rejects_bad_names_and_nesting() {
        let mut macros = MacroTable::new();
        assert!(macros.define("ips 192.168.0.1").is_err());
        assert!(macros.define("$").is_err());
        assert!(macros.define("$empty").is_err());
        assert!(macros.define("$outer $inner x").is_err());
    }

    #[test]
    fn dump_round_trips() {
        let mut macros = MacroTable::new();
        macros.define("$ports 80 443").unwrap();
        assert_eq!(macros.to_string(), "Define $ports 80 443\n");
    }
}
