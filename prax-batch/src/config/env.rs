//! Environment lookup and `${VAR}` interpolation for configuration values.

use std::collections::HashMap;

use crate::error::{BatchError, BatchResult};

/// Source for environment variables.
pub trait EnvSource: Send + Sync {
    /// Get a variable value.
    fn get(&self, name: &str) -> Option<String>;
}

/// Environment source backed by the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdEnvSource;

impl EnvSource for StdEnvSource {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Environment source backed by a map, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapEnvSource {
    vars: HashMap<String, String>,
}

impl MapEnvSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvSource for MapEnvSource {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

/// Expand `${VAR}`, `${VAR:-default}`, `${VAR:?message}` and `$VAR`
/// references in `input`.
///
/// ```rust
/// use prax_batch::config::{MapEnvSource, expand_vars};
///
/// let env = MapEnvSource::new().set("DB_HOST", "db.internal");
/// let url = expand_vars("mysql://${DB_HOST}:${DB_PORT:-3306}/app", &env).unwrap();
/// assert_eq!(url, "mysql://db.internal:3306/app");
/// ```
pub fn expand_vars(input: &str, source: &dyn EnvSource) -> BatchResult<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        output.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            let end = braced
                .find('}')
                .ok_or_else(|| BatchError::config(format!("unterminated variable in '{}'", input)))?;
            output.push_str(&expand_braced(&braced[..end], source)?);
            rest = &braced[end + 1..];
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if len == 0 {
                output.push('$');
            } else {
                let name = &after[..len];
                let value = source
                    .get(name)
                    .ok_or_else(|| BatchError::config(format!("environment variable not found: {}", name)))?;
                output.push_str(&value);
            }
            rest = &after[len..];
        }
    }

    output.push_str(rest);
    Ok(output)
}

fn expand_braced(body: &str, source: &dyn EnvSource) -> BatchResult<String> {
    let (name, modifier) = match body.split_once(':') {
        Some((name, modifier)) => (name, Some(modifier)),
        None => (body, None),
    };

    if name.is_empty() {
        return Err(BatchError::config("empty environment variable name"));
    }

    match source.get(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => match modifier {
            Some(m) if m.starts_with('-') => Ok(m[1..].to_string()),
            Some(m) if m.starts_with('?') && m.len() > 1 => Err(BatchError::config(m[1..].to_string())),
            _ => Err(BatchError::config(format!(
                "required environment variable '{}' is not set",
                name
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> MapEnvSource {
        MapEnvSource::new()
            .set("HOST", "localhost")
            .set("PORT", "3307")
            .set("EMPTY", "")
    }

    #[test]
    fn test_expand_braced_and_simple() {
        assert_eq!(
            expand_vars("mysql://${HOST}:$PORT/db", &env()).unwrap(),
            "mysql://localhost:3307/db"
        );
    }

    #[test]
    fn test_expand_default() {
        assert_eq!(expand_vars("${MISSING:-fallback}", &env()).unwrap(), "fallback");
        assert_eq!(expand_vars("${EMPTY:-fallback}", &env()).unwrap(), "fallback");
    }

    #[test]
    fn test_expand_required_message() {
        let err = expand_vars("${MISSING:?DATABASE_URL must be set}", &env()).unwrap_err();
        assert_eq!(err, BatchError::config("DATABASE_URL must be set"));
    }

    #[test]
    fn test_expand_missing() {
        assert!(expand_vars("${MISSING}", &env()).is_err());
        assert!(expand_vars("$MISSING", &env()).is_err());
        assert!(expand_vars("${HOST", &env()).is_err());
    }

    #[test]
    fn test_literal_dollar() {
        assert_eq!(expand_vars("cost: $ 5", &env()).unwrap(), "cost: $ 5");
        assert_eq!(expand_vars("no vars", &env()).unwrap(), "no vars");
    }
}
