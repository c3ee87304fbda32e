//! Field-level validation shared by the specification builders.
//!
//! The patterns mirror what the external tool accepts for the corresponding
//! fields; checking them here fails fast instead of surfacing a cryptic CLI
//! error mid-lifecycle.

/// `^[a-z][a-z0-9-]*$`, at most 64 characters. Cluster-side resource names.
pub(crate) fn is_resource_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 64 {
        return false;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// `^[a-z0-9][a-z0-9-]*$`, at most 64 characters. Namespaces.
pub(crate) fn is_namespace(s: &str) -> bool {
    if s.is_empty() || s.len() > 64 {
        return false;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// `^[a-zA-Z][a-zA-Z0-9_-]*$`, at most 64 characters. Local-side names
/// (intercepts, handlers, the specification itself).
pub(crate) fn is_local_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 64 {
        return false;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `^[a-zA-Z_][a-zA-Z0-9_]*$`. Environment variable names.
pub(crate) fn is_env_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// IPv4 dotted quad, the only address form the external tool accepts here.
pub(crate) fn is_ipv4(s: &str) -> bool {
    let octets: Vec<&str> = s.split('.').collect();
    if octets.len() != 4 {
        return false;
    }
    octets.iter().all(|o| {
        !o.is_empty()
            && o.len() <= 3
            && o.chars().all(|c| c.is_ascii_digit())
            && o.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
    })
}

/// Lowercase and replace `.`/`_` with `-`, the normalization applied to every
/// convention-derived name.
pub(crate) fn normalize_name(s: &str) -> String {
    s.to_ascii_lowercase().replace(['.', '_'], "-")
}

/// Convention-based default name: the current executable's file stem,
/// normalized. The analogue of deriving a name from the entry assembly.
pub(crate) fn default_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    let stem = exe.file_stem()?.to_str()?;
    let normalized = normalize_name(stem);
    if is_local_name(&normalized) {
        Some(normalized)
    } else {
        None
    }
}

/// Best-effort local username, used for the auto-generated intercept header.
pub(crate) fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
