//! `TemplateRenderer`: binds named variables into a role's content string
//! with required/default semantics, per SPEC_FULL.md §4.4.

use crate::error::{RenderError, Result};
use crate::model::TemplateVarDef;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static BRACE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("valid regex"));

/// Renders `content` against `vars`, validating `var_defs` first.
///
/// `tera` provides the extended `{{ }}`/`{% %}` block form; it has no
/// filesystem/network access surface of its own, which stands in for a
/// sandbox. `{name}` single-brace references are converted to `{{ name }}`
/// before rendering.
pub fn render(
    content: &str,
    vars: &HashMap<String, String>,
    var_defs: &HashMap<String, TemplateVarDef>,
) -> Result<String> {
    let mut effective_vars = vars.clone();

    for (name, def) in var_defs {
        if !effective_vars.contains_key(name) {
            if let Some(default) = &def.default {
                effective_vars.insert(name.clone(), default.clone());
            } else if def.required {
                return Err(RenderError::MissingRequired(name.clone()).into());
            }
        }
    }

    // Unsafe-content guard: a data-only path (no declared vars, no passed
    // vars) that still contains template-looking syntax is refused rather
    // than rendered, to block smuggling template expressions through data.
    if var_defs.is_empty() && vars.is_empty() {
        if content.contains("{{") || content.contains("{%") || content.contains("__") {
            return Err(RenderError::UnsafeContent.into());
        }
        return Ok(content.to_string());
    }

    let converted = BRACE_VAR.replace_all(content, "{{ $1 }}").into_owned();

    let mut context = tera::Context::new();
    for (k, v) in &effective_vars {
        context.insert(k, v);
    }

    let mut tera = tera::Tera::default();
    tera.add_raw_template("role", &converted)
        .map_err(|e| RenderError::Template(e.to_string()))?;
    tera.render("role", &context)
        .map_err(|e| RenderError::Template(e.to_string()))
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(required: bool, default: Option<&str>) -> TemplateVarDef {
        TemplateVarDef {
            required,
            default: default.map(str::to_string),
        }
    }

    #[test]
    fn plain_data_with_no_vars_passes_through() {
        let out = render("hello there", &HashMap::new(), &HashMap::new()).unwrap();
        assert_eq!(out, "hello there");
    }

    #[test]
    fn unsafe_content_without_declared_vars_is_blocked() {
        let err = render("{{ evil() }}", &HashMap::new(), &HashMap::new());
        assert!(err.is_err());

        let err2 = render("__import__('os')", &HashMap::new(), &HashMap::new());
        assert!(err2.is_err());
    }

    #[test]
    fn brace_substitution_works() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "Ada".to_string());
        let out = render("Hello {name}!", &vars, &HashMap::new()).unwrap();
        assert_eq!(out, "Hello Ada!");
    }

    #[test]
    fn missing_required_variable_with_no_default_fails() {
        let mut defs = HashMap::new();
        defs.insert("name".to_string(), def(true, None));
        let err = render("Hello {name}!", &HashMap::new(), &defs);
        assert!(err.is_err());
    }

    #[test]
    fn missing_optional_variable_with_default_is_injected() {
        let mut defs = HashMap::new();
        defs.insert("name".to_string(), def(false, Some("World")));
        let out = render("Hello {name}!", &HashMap::new(), &defs).unwrap();
        assert_eq!(out, "Hello World!");
    }

    #[test]
    fn block_form_renders_through_tera() {
        let mut vars = HashMap::new();
        vars.insert("count".to_string(), "3".to_string());
        let out = render(
            "{% if count %}has count{% endif %}",
            &vars,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(out, "has count");
    }
}
