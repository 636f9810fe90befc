/// Parse a boolean switch written as text.
///
/// Accepts `on`/`off`, `true`/`false`, `yes`/`no` and `1`/`0`, ignoring case
/// and surrounding whitespace. Anything else yields `None`.
pub fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
