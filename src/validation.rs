//! Agent id checks consulted at join time.

use regex::Regex;

/// Accepts or rejects an agent id. The `Err` text is shown to the agent.
pub trait IdValidator: Send + Sync {
    fn validate(&self, id: &str) -> Result<(), String>;
}

/// 3–20 characters of letters, digits, `-` or `_`.
#[derive(Debug, Clone)]
pub struct CharsetValidator {
    pattern: Regex,
}

impl CharsetValidator {
    pub fn new() -> Self {
        let pattern = Regex::new(r"^[A-Za-z0-9_-]{3,20}$").expect("id pattern is a valid regex");
        Self { pattern }
    }
}

impl Default for CharsetValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdValidator for CharsetValidator {
    fn validate(&self, id: &str) -> Result<(), String> {
        if self.pattern.is_match(id) {
            Ok(())
        } else {
            Err("ID must be 3-20 characters and only contain letters, numbers, - or _".to_string())
        }
    }
}

/// Runs `inner` first, then rejects ids containing any denied word
/// (case-insensitive).
pub struct DenyListValidator<V> {
    inner: V,
    denied: Vec<String>,
}

impl<V: IdValidator> DenyListValidator<V> {
    pub fn new<I, S>(inner: V, denied: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let denied = denied
            .into_iter()
            .map(|w| w.as_ref().trim().to_ascii_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        Self { inner, denied }
    }
}

impl<V: IdValidator> IdValidator for DenyListValidator<V> {
    fn validate(&self, id: &str) -> Result<(), String> {
        self.inner.validate(id)?;
        let lowered = id.to_ascii_lowercase();
        if self.denied.iter().any(|w| lowered.contains(w.as_str())) {
            return Err("Please use appropriate language.".to_string());
        }
        Ok(())
    }
}
