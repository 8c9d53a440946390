//! `${{ key }}` substitution against the run environment
//!
//! Keys are looked up verbatim in the environment map, so the same syntax
//! covers plain variables (`${{ REGISTRY }}` or `${{ env.REGISTRY }}`),
//! settings (`${{ settings.image }}`), event fields (`${{ event.sha }}`),
//! credentials (`${{ secrets.token }}`) and step outputs
//! (`${{ steps.build.outputs.artifact }}`).
//!
//! Rendering is a single pass. Only configuration values (plain variables
//! and `settings.*`) may themselves contain expressions, and those are
//! expanded up to [`MAX_DEPTH`] levels deep. Runtime data (event fields,
//! secrets, run metadata and step outputs) is inserted literally and never
//! scanned again.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use thiserror::Error;

static EXPRESSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]*?)\s*\}\}").expect("valid expression regex"));

/// Maximum nesting of expressions inside substituted values
pub const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Empty expression in: {0}")]
    Empty(String),

    #[error("Expression nesting deeper than {MAX_DEPTH} levels: {0}")]
    TooDeep(String),
}

/// Check whether a string contains any expression
pub fn has_expression(input: &str) -> bool {
    EXPRESSION_REGEX.is_match(input)
}

/// Render all expressions in `input`
pub fn render(input: &str, env: &HashMap<String, String>) -> Result<String, ExpressionError> {
    render_at(input, env, 0)
}

fn render_at(
    input: &str,
    env: &HashMap<String, String>,
    depth: usize,
) -> Result<String, ExpressionError> {
    if depth > MAX_DEPTH {
        return Err(ExpressionError::TooDeep(input.to_string()));
    }

    let mut result = String::with_capacity(input.len());
    let mut last = 0;

    for cap in EXPRESSION_REGEX.captures_iter(input) {
        let (Some(full), Some(expr)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        let key = expr.as_str().trim();
        if key.is_empty() {
            return Err(ExpressionError::Empty(input.to_string()));
        }

        let name = key.strip_prefix("env.").unwrap_or(key);
        let value = env
            .get(name)
            .ok_or_else(|| ExpressionError::UnknownVariable(key.to_string()))?;

        result.push_str(&input[last..full.start()]);
        if is_config_key(name) && has_expression(value) {
            result.push_str(&render_at(value, env, depth + 1)?);
        } else {
            result.push_str(value);
        }
        last = full.end();
    }

    result.push_str(&input[last..]);
    Ok(result)
}

/// Keys whose values come from pipeline configuration
fn is_config_key(name: &str) -> bool {
    !name.contains('.') || name.starts_with("settings.")
}

/// Render every value of a map, keeping the keys
pub fn render_map(
    values: &HashMap<String, String>,
    env: &HashMap<String, String>,
) -> Result<HashMap<String, String>, ExpressionError> {
    values
        .iter()
        .map(|(k, v)| Ok((k.clone(), render(v, env)?)))
        .collect()
}
