//! `{{ name }}` variable substitution
//!
//! Used for VBoxManage command arguments (`name`) and the guest additions
//! upload path (`version`). Variables that are not supplied are left in the
//! output untouched.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid placeholder regex")
    })
}

/// Render a template against a set of variables
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Render a template with a single variable
pub fn render_one(template: &str, name: &str, value: &str) -> String {
    let mut variables = HashMap::new();
    variables.insert(name.to_string(), value.to_string());
    render(template, &variables)
}
