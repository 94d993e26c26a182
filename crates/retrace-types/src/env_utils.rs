//! Environment variable parsing utilities.
//!
//! Configuration overrides are read from `RETRACE_*` variables. These helpers
//! remove the repeated `std::env::var(..).ok().and_then(..)` boilerplate.
//!
//! # Example
//!
//! ```
//! use retrace_types::env_utils::{env_flag, env_string, env_var};
//!
//! let monitor: Option<u8> = env_var("RETRACE_MONITOR");
//! let stacktraces: Option<bool> = env_flag("RETRACE_STACKTRACES");
//! let fork_path: Option<String> = env_string("RETRACE_FORK_PATH");
//! # let _ = (monitor, stacktraces, fork_path);
//! ```

use std::str::FromStr;

/// Parse an environment variable into a type that implements `FromStr`.
///
/// Returns `None` if the variable is not set or cannot be parsed.
pub fn env_var<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Tri-state flag: `None` when unset, otherwise whether the value is
/// "1", "true", "yes" or "on" (case-insensitive).
///
/// Used where an unset variable must leave a configured value untouched.
pub fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| {
        matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Read a string variable, treating empty values as unset.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_unset() {
        let value: Option<u64> = env_var("RETRACE_TEST_DEFINITELY_UNSET_VAR");
        assert_eq!(value, None);
        assert_eq!(env_flag("RETRACE_TEST_DEFINITELY_UNSET_VAR"), None);
    }

    #[test]
    fn test_env_var_parse() {
        std::env::set_var("RETRACE_TEST_ENV_UTILS_NUM", " 42 ");
        std::env::set_var("RETRACE_TEST_ENV_UTILS_FLAG", "Yes");
        std::env::set_var("RETRACE_TEST_ENV_UTILS_EMPTY", "  ");

        assert_eq!(env_var::<u32>("RETRACE_TEST_ENV_UTILS_NUM"), Some(42));
        assert_eq!(env_flag("RETRACE_TEST_ENV_UTILS_FLAG"), Some(true));
        assert_eq!(env_string("RETRACE_TEST_ENV_UTILS_EMPTY"), None);

        std::env::remove_var("RETRACE_TEST_ENV_UTILS_NUM");
        std::env::remove_var("RETRACE_TEST_ENV_UTILS_FLAG");
        std::env::remove_var("RETRACE_TEST_ENV_UTILS_EMPTY");
    }
}
