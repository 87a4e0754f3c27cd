//! Turn raw tool output into ordered findings.
//!
//! Every parser here sees untrusted text. None of them may panic, and a
//! payload that cannot be understood produces no findings rather than an error.

use serde::Deserialize;
use serde_json::json;

use crate::specs::ExternalTool;
use crate::types::Finding;

/// Parse the captured stdout of `tool`.
///
/// Tools without a dedicated parser yield their whole stdout as one `raw` finding.
pub fn parse(tool: ExternalTool, stdout: &str) -> Vec<Finding> {
    match tool {
        ExternalTool::Whois => parse_whois(stdout),
        ExternalTool::Dig => parse_dig(stdout),
        ExternalTool::Nmap => parse_nmap_xml(stdout),
        ExternalTool::Curl => parse_http_headers(stdout),
        other => raw_finding(other.name(), stdout),
    }
}

fn raw_finding(tool: &str, stdout: &str) -> Vec<Finding> {
    if stdout.trim().is_empty() {
        return Vec::new();
    }
    vec![Finding::new("raw", tool, stdout)]
}

const WHOIS_FIELDS: &[(&str, &str)] = &[
    ("Registrar:", "registrar"),
    ("Registrant Organization:", "registrant_org"),
    ("Creation Date:", "creation_date"),
    ("Updated Date:", "updated_date"),
    ("Registry Expiry Date:", "expiry_date"),
    ("Name Server:", "nameserver"),
    ("Registrant Country:", "registrant_country"),
    ("Registrant State/Province:", "registrant_state"),
    ("DNSSEC:", "dnssec"),
];

/// Registration text: one finding per known label with a non-empty value.
pub fn parse_whois(raw: &str) -> Vec<Finding> {
    raw.lines()
        .map(str::trim)
        .filter_map(|line| {
            WHOIS_FIELDS.iter().find_map(|(prefix, key)| {
                let value = line.strip_prefix(prefix)?.trim();
                (!value.is_empty()).then(|| Finding::new("whois", *key, value))
            })
        })
        .collect()
}

/// `name ttl class type value...` answer records. Comments and short lines are skipped.
pub fn parse_dig(raw: &str) -> Vec<Finding> {
    let mut out = Vec::new();
    for line in raw.lines().map(str::trim) {
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        out.push(
            Finding::new("dns", fields[3], fields[4..].join(" ")).with_details(json!({
                "name": fields[0],
                "ttl": fields[1],
                "class": fields[2],
            })),
        );
    }
    out
}

/// Status line plus `Name: Value` headers, across every response in a redirect chain.
pub fn parse_http_headers(raw: &str) -> Vec<Finding> {
    let mut out = Vec::new();
    for line in raw.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if line.starts_with("HTTP/") {
            if let Some((_, status)) = line.split_once(' ') {
                let status = status.trim();
                if !status.is_empty() {
                    out.push(Finding::new("header", "status", status));
                }
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            out.push(Finding::new("header", name.trim(), value.trim()));
        }
    }
    out
}

#[derive(Debug, Default, Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, Default, Deserialize)]
struct NmapHost {
    #[serde(rename = "address", default)]
    addresses: Vec<NmapAddress>,
    #[serde(default)]
    ports: NmapPorts,
    #[serde(default)]
    os: NmapOs,
}

#[derive(Debug, Default, Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr", default)]
    addr: String,
    #[serde(rename = "@addrtype", default)]
    addr_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, Default, Deserialize)]
struct NmapPort {
    #[serde(rename = "@protocol", default)]
    protocol: String,
    #[serde(rename = "@portid", default)]
    port_id: String,
    #[serde(default)]
    state: NmapState,
    #[serde(default)]
    service: NmapService,
}

#[derive(Debug, Default, Deserialize)]
struct NmapState {
    #[serde(rename = "@state", default)]
    state: String,
    #[serde(rename = "@reason", default)]
    reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct NmapService {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@product", default)]
    product: String,
    #[serde(rename = "@version", default)]
    version: String,
}

#[derive(Debug, Default, Deserialize)]
struct NmapOs {
    #[serde(rename = "osmatch", default)]
    matches: Vec<NmapOsMatch>,
}

#[derive(Debug, Default, Deserialize)]
struct NmapOsMatch {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@accuracy", default)]
    accuracy: String,
}

impl NmapService {
    fn describe(&self) -> String {
        let mut s = self.name.clone();
        if !self.product.is_empty() {
            s.push_str(" (");
            s.push_str(&self.product);
            if !self.version.is_empty() {
                s.push(' ');
                s.push_str(&self.version);
            }
            s.push(')');
        }
        s
    }
}

/// nmap `-oX` output: one `port` finding per port and one `os` finding per OS match.
pub fn parse_nmap_xml(raw: &str) -> Vec<Finding> {
    let run: NmapRun = match quick_xml::de::from_str(raw) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "nmap XML did not parse, no structured results");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for host in &run.hosts {
        let addr = host
            .addresses
            .iter()
            .find(|a| a.addr_type == "ipv4" || a.addr_type == "ipv6")
            .map(|a| a.addr.as_str())
            .unwrap_or_default();

        for port in &host.ports.ports {
            out.push(
                Finding::new(
                    "port",
                    format!("{}/{}", port.port_id, port.protocol),
                    port.state.state.as_str(),
                )
                .with_details(json!({
                    "host": addr,
                    "service": port.service.describe(),
                    "reason": port.state.reason,
                })),
            );
        }

        for m in &host.os.matches {
            out.push(
                Finding::new("os", "os_match", m.name.as_str()).with_details(json!({
                    "accuracy": m.accuracy,
                    "host": addr,
                })),
            );
        }
    }
    out
}
