//! Environment placeholder substitution for provider params.
//!
//! String leaves of a params tree may contain `${NAME}` placeholders that
//! are filled in from the calling environment at registration time. Unknown
//! placeholders are left literal and reported, so the caller can decide
//! whether a missing variable is fatal.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Outcome of a placeholder substitution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    /// The params tree with known placeholders filled in.
    pub replaced: Value,
    /// Variable names that were substituted at least once.
    pub replaced_variables: BTreeSet<String>,
    /// Variable names that were referenced but not provided.
    pub missing_variables: BTreeSet<String>,
}

impl Substitution {
    /// Total count of distinct variables referenced by the template.
    pub fn total_variables(&self) -> usize {
        self.replaced_variables.len() + self.missing_variables.len()
    }
}

/// Replace `${NAME}` placeholders in all string leaves of `template`.
///
/// Non-string leaves pass through untouched. Placeholders without a matching
/// entry in `variables` stay literal and are recorded as missing.
pub fn replace_variables(template: &Value, variables: &HashMap<String, String>) -> Substitution {
    let mut replaced_variables = BTreeSet::new();
    let mut missing_variables = BTreeSet::new();
    let replaced = walk(template, variables, &mut replaced_variables, &mut missing_variables);

    Substitution {
        replaced,
        replaced_variables,
        missing_variables,
    }
}

fn walk(
    value: &Value,
    variables: &HashMap<String, String>,
    replaced: &mut BTreeSet<String>,
    missing: &mut BTreeSet<String>,
) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, variables, replaced, missing)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| walk(item, variables, replaced, missing))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), walk(v, variables, replaced, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute(
    input: &str,
    variables: &HashMap<String, String>,
    replaced: &mut BTreeSet<String>,
    missing: &mut BTreeSet<String>,
) -> String {
    placeholder_re()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match variables.get(name) {
                Some(value) => {
                    replaced.insert(name.to_string());
                    value.clone()
                }
                None => {
                    missing.insert(name.to_string());
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_basic_replacement() {
        let template = json!({"env": {"KEY": "${VAR}"}});
        let result = replace_variables(&template, &vars(&[("VAR", "value")]));

        assert_eq!(result.replaced, json!({"env": {"KEY": "value"}}));
        assert_eq!(names(&result.replaced_variables), vec!["VAR"]);
        assert!(result.missing_variables.is_empty());
    }

    #[test]
    fn test_stdio_env_params() {
        let template = json!({
            "command": "npx",
            "args": ["-y", "@brave/brave-search-mcp-server"],
            "env": {"BRAVE_API_KEY": "${BRAVE_API_KEY}"},
        });
        let result = replace_variables(&template, &vars(&[("BRAVE_API_KEY", "secret123")]));

        assert_eq!(result.replaced["env"]["BRAVE_API_KEY"], "secret123");
        assert_eq!(result.replaced["command"], "npx");
        assert_eq!(names(&result.replaced_variables), vec!["BRAVE_API_KEY"]);
    }

    #[test]
    fn test_header_params() {
        let template = json!({
            "url": "https://api.github.com/mcp/",
            "headers": {"Authorization": "Bearer ${GITHUB_API_KEY}"},
        });
        let result = replace_variables(&template, &vars(&[("GITHUB_API_KEY", "ghp_token123")]));

        assert_eq!(
            result.replaced["headers"]["Authorization"],
            "Bearer ghp_token123"
        );
        assert_eq!(result.replaced["url"], "https://api.github.com/mcp/");
    }

    #[test]
    fn test_missing_variable_left_literal() {
        let template = json!({"env": {"KEY": "${MISSING_VAR}"}});
        let result = replace_variables(&template, &HashMap::new());

        assert_eq!(result.replaced, template);
        assert!(result.replaced_variables.is_empty());
        assert_eq!(names(&result.missing_variables), vec!["MISSING_VAR"]);
    }

    #[test]
    fn test_mixed_replaced_and_missing() {
        let template = json!({"env": {"API_KEY": "${API_KEY}", "SECRET": "${SECRET}"}});
        let result = replace_variables(&template, &vars(&[("API_KEY", "provided")]));

        assert_eq!(result.replaced["env"]["API_KEY"], "provided");
        assert_eq!(result.replaced["env"]["SECRET"], "${SECRET}");
        assert_eq!(names(&result.replaced_variables), vec!["API_KEY"]);
        assert_eq!(names(&result.missing_variables), vec!["SECRET"]);
        assert_eq!(result.total_variables(), 2);
    }

    #[test]
    fn test_nested_maps_and_lists() {
        let template = json!({
            "a": {"b": {"c": "${VAR}"}},
            "servers": [
                {"name": "one", "token": "${TOKEN1}"},
                {"name": "two", "token": "${TOKEN2}"},
            ],
        });
        let result = replace_variables(
            &template,
            &vars(&[("VAR", "deep"), ("TOKEN1", "t1"), ("TOKEN2", "t2")]),
        );

        assert_eq!(result.replaced["a"]["b"]["c"], "deep");
        assert_eq!(result.replaced["servers"][0]["token"], "t1");
        assert_eq!(result.replaced["servers"][1]["token"], "t2");
    }

    #[test]
    fn test_non_string_passthrough() {
        let template = json!({
            "port": 8080,
            "enabled": true,
            "data": null,
            "ratio": 3.14,
            "items": ["${VAR}", 123, false, null],
        });
        let result = replace_variables(&template, &vars(&[("VAR", "str_val")]));

        assert_eq!(result.replaced["port"], 8080);
        assert_eq!(result.replaced["enabled"], true);
        assert_eq!(result.replaced["items"], json!(["str_val", 123, false, null]));
    }

    #[test]
    fn test_multiple_variables_in_one_string() {
        let template = json!({"auth": "Bearer ${TOKEN} for user ${USER}"});
        let result = replace_variables(&template, &vars(&[("TOKEN", "abc123"), ("USER", "john")]));

        assert_eq!(result.replaced["auth"], "Bearer abc123 for user john");
        assert_eq!(names(&result.replaced_variables), vec!["TOKEN", "USER"]);
    }

    #[test]
    fn test_hyphenated_names_not_matched() {
        let template = json!({"key": "${foo-bar}", "other": "${valid}"});
        let result = replace_variables(
            &template,
            &vars(&[("foo-bar", "nope"), ("valid", "matched")]),
        );

        assert_eq!(result.replaced["key"], "${foo-bar}");
        assert_eq!(result.replaced["other"], "matched");
        assert!(result.missing_variables.is_empty());
    }

    #[test]
    fn test_same_variable_counted_once() {
        let template = json!({"first": "${VAR}", "second": "${VAR}", "nested": {"third": "${VAR}"}});
        let result = replace_variables(&template, &vars(&[("VAR", "value")]));

        assert_eq!(result.replaced["first"], "value");
        assert_eq!(result.replaced["nested"]["third"], "value");
        assert_eq!(result.replaced_variables.len(), 1);
    }

    #[test]
    fn test_empty_template() {
        let result = replace_variables(&json!({}), &vars(&[("VAR", "value")]));
        assert_eq!(result.replaced, json!({}));
        assert_eq!(result.total_variables(), 0);
    }

    #[test]
    fn test_no_placeholders_passthrough() {
        let template = json!({
            "command": "python",
            "args": ["-m", "mymodule"],
            "env": {"PATH": "/usr/bin"},
        });
        let result = replace_variables(&template, &vars(&[("UNUSED", "value")]));

        assert_eq!(result.replaced, template);
        assert!(result.replaced_variables.is_empty());
        assert!(result.missing_variables.is_empty());
    }
}
