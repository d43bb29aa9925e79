//! Input validation and sanitization functions for portsync
//!
//! Every value that ends up as an argument to a privileged command or a
//! cloud API call passes through here first. Commands are never built via a
//! shell, but a chain name or list identifier that slipped through unchecked
//! could still address the wrong object.

/// Sanitizes free text for use in an iptables comment or rule description.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use portsync::validators::sanitize_comment;
///
/// assert_eq!(sanitize_comment("portsync:80/tcp"), "portsync:80/tcp");
///
/// let messy = "web\n\"front\"";
/// let safe = sanitize_comment(messy);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | '/'))
        .take(64)
        .collect()
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates an iptables chain name.
///
/// Netfilter rules:
/// - 1 to 28 characters (`XT_EXTENSION_MAXNAMELEN` - 1)
/// - ASCII alphanumerics, dash, underscore
/// - Must not start with `-` (would be read as an option)
///
/// # Errors
///
/// Returns `Err` if the name violates any of the constraints above.
pub fn validate_chain_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Chain name cannot be empty".to_string());
    }

    if name.len() > 28 {
        return Err("Chain name too long (max 28 characters)".to_string());
    }

    if name.starts_with('-') {
        return Err("Chain name cannot start with '-'".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err("Chain name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a cloud security list identifier (OCID).
///
/// Expected shape: `ocid1.securitylist.<realm>.<region>.<unique id>`,
/// lowercase ASCII alphanumerics, dots, dashes and underscores only.
///
/// # Errors
///
/// Returns `Err` if the identifier is not a security list OCID.
pub fn validate_security_list_id(id: &str) -> Result<String, String> {
    let id = id.trim();

    if id.len() > 255 {
        return Err("Security list id too long (max 255 characters)".to_string());
    }

    if !id.starts_with("ocid1.securitylist.") {
        return Err("Security list id must start with 'ocid1.securitylist.'".to_string());
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Security list id contains invalid characters".to_string());
    }

    if id.split('.').count() < 5 {
        return Err("Security list id is incomplete".to_string());
    }

    Ok(id.to_string())
}

/// Validates a `host:port` management endpoint.
///
/// # Errors
///
/// Returns `Err` if the port is missing, zero or not numeric, or the host is empty.
pub fn validate_endpoint(endpoint: &str) -> Result<String, String> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| "Endpoint must be host:port".to_string())?;

    if host.is_empty() {
        return Err("Endpoint host cannot be empty".to_string());
    }

    if host.contains('/') || host.contains(char::is_whitespace) {
        return Err("Endpoint host contains invalid characters".to_string());
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| format!("Invalid endpoint port '{port}'"))?;
    validate_port(port)?;

    Ok(endpoint.to_string())
}
