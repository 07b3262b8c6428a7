//! Secret wrapper for API keys and other sensitive values

use std::fmt;
use zeroize::Zeroize;

/// Number of trailing characters shown by `Secret::<String>::redacted`.
const VISIBLE_SUFFIX: usize = 4;

/// Secrets this short or shorter are masked entirely; a 4-char suffix of an
/// 8-char key would reveal half of it.
const MIN_LEN_FOR_SUFFIX: usize = 8;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Short identifier safe for logs and status output, e.g. `…x9Qa`.
    pub fn redacted(&self) -> String {
        let count = self.0.chars().count();
        if count <= MIN_LEN_FOR_SUFFIX {
            return "****".to_string();
        }
        let suffix: String = self.0.chars().skip(count - VISIBLE_SUFFIX).collect();
        format!("…{suffix}")
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Secret<String> {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}
