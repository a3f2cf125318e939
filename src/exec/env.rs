use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

pub type EnvMap = BTreeMap<String, String>;

static ENV_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("env name pattern is valid")
});

/// Environment sources for one command, lowest precedence first:
/// global < run context < expander-computed < per-invocation.
#[derive(Debug, Clone, Default)]
pub struct EnvLayers {
    pub global: EnvMap,
    pub run_context: EnvMap,
    pub expanded: EnvMap,
    pub invocation: EnvMap,
}

impl EnvLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(mut self, vars: EnvMap) -> Self {
        self.global = vars;
        self
    }

    pub fn with_run_context(mut self, vars: EnvMap) -> Self {
        self.run_context = vars;
        self
    }

    pub fn with_expanded(mut self, vars: EnvMap) -> Self {
        self.expanded = vars;
        self
    }

    pub fn with_invocation(mut self, vars: EnvMap) -> Self {
        self.invocation = vars;
        self
    }

    /// Add per-invocation `NAME=value` lines. `$$` in values collapses to `$`;
    /// lines without `=` are ignored.
    pub fn with_invocation_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for line in lines {
            if let Some((name, value)) = line.as_ref().split_once('=') {
                self.invocation
                    .insert(name.to_string(), value.replace("$$", "$"));
            }
        }
        self
    }

    /// Merge all layers; later layers win on name collisions.
    pub fn merge(&self) -> EnvMap {
        let mut merged = EnvMap::new();
        for layer in [&self.global, &self.run_context, &self.expanded, &self.invocation] {
            merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

/// Names the remote shell can export without quoting.
pub fn is_valid_name(name: &str) -> bool {
    ENV_NAME.is_match(name)
}

/// Wrap `value` in single quotes, escaping embedded single quotes.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `export NAME='value'` for every exportable variable, in name order.
/// Variables with names the shell would reject are skipped.
pub fn export_statements(env: &EnvMap) -> Vec<String> {
    env.iter()
        .filter(|(name, _)| {
            let valid = is_valid_name(name);
            if !valid {
                tracing::trace!(name = %name, "Skipping env var with invalid name");
            }
            valid
        })
        .map(|(name, value)| format!("export {}={}", name, shell_quote(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn later_layers_override_earlier() {
        let layers = EnvLayers::new()
            .with_global(env(&[("A", "1")]))
            .with_run_context(env(&[("A", "2"), ("B", "1")]))
            .with_expanded(env(&[]))
            .with_invocation(env(&[("B", "2")]));

        assert_eq!(layers.merge(), env(&[("A", "2"), ("B", "2")]));
    }

    #[test]
    fn merge_is_idempotent() {
        let layers = EnvLayers::new()
            .with_global(env(&[("A", "1"), ("C", "3")]))
            .with_invocation(env(&[("A", "9")]));
        let once = layers.merge();
        let twice = EnvLayers::new().with_global(once.clone()).merge();
        assert_eq!(once, twice);
        assert_eq!(layers.merge(), once);
    }

    #[test]
    fn invocation_lines_are_parsed_and_dollars_collapsed() {
        let layers = EnvLayers::new().with_invocation_lines(["PRICE=$$5", "EMPTY=", "NOEQUALS", "K=a=b"]);
        assert_eq!(
            layers.invocation,
            env(&[("PRICE", "$5"), ("EMPTY", ""), ("K", "a=b")])
        );
    }

    #[test]
    fn valid_names() {
        assert!(is_valid_name("PATH"));
        assert!(is_valid_name("_x1"));
        assert!(!is_valid_name("1ABC"));
        assert!(!is_valid_name("A-B"));
        assert!(!is_valid_name("A B"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME `x`"), "'$HOME `x`'");
    }

    #[test]
    fn export_statements_skip_invalid_names() {
        let statements = export_statements(&env(&[("GOOD", "v'1"), ("bad-name", "x"), ("A", "")]));
        assert_eq!(statements, vec!["export A=''", r"export GOOD='v'\''1'"]);
    }
}
