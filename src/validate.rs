use std::net::IpAddr;

use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::SpecError;

static HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("hostname regex")
});

static DANGEROUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[;|&`$(){}\[\]!<>\\"']"#).expect("metachar regex"));

/// Check that `target` is an IP address, a CIDR block or a hostname.
///
/// CIDR blocks wider than /16 (IPv4) or /48 (IPv6) are rejected.
pub fn validate_target(target: &str) -> Result<(), SpecError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(SpecError::InvalidTarget("target cannot be empty".into()));
    }
    if DANGEROUS.is_match(target) {
        return Err(SpecError::InvalidTarget(
            "target contains invalid characters".into(),
        ));
    }
    if target.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if let Ok(net) = target.parse::<IpNet>() {
        return match net {
            IpNet::V4(n) if n.prefix_len() < 16 => Err(SpecError::InvalidTarget(format!(
                "CIDR range /{} is too large (minimum /16)",
                n.prefix_len()
            ))),
            IpNet::V6(n) if n.prefix_len() < 48 => Err(SpecError::InvalidTarget(format!(
                "IPv6 CIDR range /{} is too large (minimum /48)",
                n.prefix_len()
            ))),
            _ => Ok(()),
        };
    }
    if target.len() > 253 {
        return Err(SpecError::InvalidTarget("hostname too long".into()));
    }
    if !HOSTNAME.is_match(target) {
        return Err(SpecError::InvalidTarget(format!("invalid hostname: {target}")));
    }
    Ok(())
}

/// Check that `target` is an http(s) URL free of shell metacharacters.
pub fn validate_url(target: &str) -> Result<(), SpecError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(SpecError::InvalidUrl("URL cannot be empty".into()));
    }
    if DANGEROUS.is_match(target) {
        // `&` is legal inside a query string.
        let cleaned: String = target.chars().filter(|c| *c != '&').collect();
        if DANGEROUS.is_match(&cleaned) {
            return Err(SpecError::InvalidUrl("URL contains invalid characters".into()));
        }
    }
    if !target.starts_with("http://") && !target.starts_with("https://") {
        return Err(SpecError::InvalidUrl(
            "URL must start with http:// or https://".into(),
        ));
    }
    Ok(())
}

/// Strip shell metacharacters from a single argument.
pub fn sanitize_arg(arg: &str) -> String {
    DANGEROUS.replace_all(arg, "").into_owned()
}
