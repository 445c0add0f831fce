//! Configuration read from environment variables.

/// Environment variable which enables verbose logging of rewrites and
/// verification when the default configuration is used.
pub const VERBOSE_VAR: &str = "RTEN_EXTDATA_VERBOSE";

/// Parse a boolean flag value such as "1", "yes" or "off".
///
/// Returns `None` if the value is not recognized.
pub fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Return the value of the boolean flag in environment variable `name`, or
/// `default` if the variable is unset.
///
/// Unrecognized values are reported on stderr and treated as false.
pub fn env_flag(name: &str, default: bool) -> bool {
    let Ok(value) = std::env::var(name) else {
        return default;
    };
    parse_flag(&value).unwrap_or_else(|| {
        eprintln!("Unrecognized value \"{}\" for {}", value, name);
        false
    })
}
