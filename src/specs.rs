//! The tool catalog: every tool a scan may name, and how external tools are invoked.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config::ToolOverride;
use crate::error::SpecError;
use crate::ports;
use crate::runner::ToolSpec;
use crate::validate::{sanitize_arg, validate_target, validate_url};

/// Tools executed as external processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalTool {
    Whois,
    Dig,
    TheHarvester,
    DnsRecon,
    Nmap,
    Traceroute,
    SnmpWalk,
    Netcat,
    Curl,
    WhatWeb,
    Gobuster,
}

/// Probes that run in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinProbe {
    GoogleDorking,
    OsintAggregator,
    SslCheck,
    RobotsSitemap,
    MetadataExtract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Builtin(BuiltinProbe),
    External(ExternalTool),
}

static CATALOG: Lazy<HashMap<&'static str, ToolKind>> = Lazy::new(|| {
    let external = ExternalTool::ALL
        .iter()
        .map(|t| (t.name(), ToolKind::External(*t)));
    let builtin = BuiltinProbe::ALL
        .iter()
        .map(|p| (p.name(), ToolKind::Builtin(*p)));
    external.chain(builtin).collect()
});

impl ToolKind {
    /// Look up a tool by its identifier (`"nmap"`, `"ssl_check"`, ...).
    pub fn resolve(name: &str) -> Option<ToolKind> {
        CATALOG.get(name).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::Builtin(p) => p.name(),
            ToolKind::External(t) => t.name(),
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ToolKind::Builtin(p) => p.display_name(),
            ToolKind::External(t) => t.display_name(),
        }
    }

    pub fn is_builtin(self) -> bool {
        matches!(self, ToolKind::Builtin(_))
    }

    /// Every tool, external ones first.
    pub fn all() -> impl Iterator<Item = ToolKind> {
        ExternalTool::ALL
            .into_iter()
            .map(ToolKind::External)
            .chain(BuiltinProbe::ALL.into_iter().map(ToolKind::Builtin))
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl BuiltinProbe {
    pub const ALL: [BuiltinProbe; 5] = [
        BuiltinProbe::GoogleDorking,
        BuiltinProbe::OsintAggregator,
        BuiltinProbe::SslCheck,
        BuiltinProbe::RobotsSitemap,
        BuiltinProbe::MetadataExtract,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinProbe::GoogleDorking => "google_dorking",
            BuiltinProbe::OsintAggregator => "osint_aggregator",
            BuiltinProbe::SslCheck => "ssl_check",
            BuiltinProbe::RobotsSitemap => "robots_sitemap",
            BuiltinProbe::MetadataExtract => "metadata_extract",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            BuiltinProbe::GoogleDorking => "Google Dorking",
            BuiltinProbe::OsintAggregator => "OSINT Aggregator",
            BuiltinProbe::SslCheck => "SSL/TLS Check",
            BuiltinProbe::RobotsSitemap => "Robots/Sitemap",
            BuiltinProbe::MetadataExtract => "Metadata Extractor",
        }
    }
}

impl ExternalTool {
    pub const ALL: [ExternalTool; 11] = [
        ExternalTool::Whois,
        ExternalTool::Dig,
        ExternalTool::TheHarvester,
        ExternalTool::DnsRecon,
        ExternalTool::Nmap,
        ExternalTool::Traceroute,
        ExternalTool::SnmpWalk,
        ExternalTool::Netcat,
        ExternalTool::Curl,
        ExternalTool::WhatWeb,
        ExternalTool::Gobuster,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExternalTool::Whois => "whois",
            ExternalTool::Dig => "dig",
            ExternalTool::TheHarvester => "theharvester",
            ExternalTool::DnsRecon => "dnsrecon",
            ExternalTool::Nmap => "nmap",
            ExternalTool::Traceroute => "traceroute",
            ExternalTool::SnmpWalk => "snmpwalk",
            ExternalTool::Netcat => "netcat",
            ExternalTool::Curl => "curl",
            ExternalTool::WhatWeb => "whatweb",
            ExternalTool::Gobuster => "gobuster",
        }
    }

    pub fn binary(self) -> &'static str {
        match self {
            ExternalTool::TheHarvester => "theHarvester",
            ExternalTool::Netcat => "nc",
            other => other.name(),
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ExternalTool::Whois => "WHOIS",
            ExternalTool::Dig => "dig",
            ExternalTool::TheHarvester => "theHarvester",
            ExternalTool::DnsRecon => "DNSRecon",
            ExternalTool::Nmap => "Nmap",
            ExternalTool::Traceroute => "Traceroute",
            ExternalTool::SnmpWalk => "SNMP Walk",
            ExternalTool::Netcat => "Netcat",
            ExternalTool::Curl => "curl",
            ExternalTool::WhatWeb => "WhatWeb",
            ExternalTool::Gobuster => "Gobuster",
        }
    }

    /// Argument that makes the binary print its version, if it has one.
    pub fn version_arg(self) -> Option<&'static str> {
        match self {
            ExternalTool::Nmap | ExternalTool::WhatWeb | ExternalTool::Curl => Some("--version"),
            ExternalTool::Traceroute => Some("--version"),
            ExternalTool::TheHarvester | ExternalTool::DnsRecon => Some("--help"),
            ExternalTool::Dig => Some("-v"),
            ExternalTool::Netcat => Some("-h"),
            ExternalTool::Gobuster => Some("version"),
            ExternalTool::SnmpWalk => Some("-V"),
            ExternalTool::Whois => None,
        }
    }

    /// Build the invocation for `target`. Fails before anything is spawned.
    pub fn build_spec(
        self,
        target: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<ToolSpec, SpecError> {
        let target = target.trim();
        let spec = |name: String, args: Vec<String>, timeout: Duration| ToolSpec {
            name,
            binary: self.binary().to_string(),
            args,
            timeout: Some(timeout),
        };

        match self {
            ExternalTool::Whois => {
                validate_target(target)?;
                Ok(spec("WHOIS Lookup".into(), vec![target.into()], Duration::from_secs(30)))
            }
            ExternalTool::Dig => {
                validate_target(target)?;
                let record = param(params, "record_type")?
                    .unwrap_or_else(|| "ANY".into())
                    .to_uppercase();
                const VALID: &[&str] = &["A", "AAAA", "MX", "NS", "TXT", "SOA", "CNAME", "PTR", "ANY"];
                if !VALID.contains(&record.as_str()) {
                    return Err(SpecError::InvalidParameter {
                        name: "record_type",
                        reason: format!("invalid record type: {record}"),
                    });
                }
                Ok(spec(
                    format!("DNS Lookup ({record})"),
                    vec![
                        target.into(),
                        record,
                        "+noall".into(),
                        "+answer".into(),
                        "+authority".into(),
                    ],
                    Duration::from_secs(30),
                ))
            }
            ExternalTool::TheHarvester => {
                validate_target(target)?;
                let sources =
                    param(params, "sources")?.unwrap_or_else(|| "bing,crtsh,dnsdumpster".into());
                Ok(spec(
                    "theHarvester".into(),
                    vec!["-d".into(), target.into(), "-b".into(), sources],
                    Duration::from_secs(5 * 60),
                ))
            }
            ExternalTool::DnsRecon => {
                validate_target(target)?;
                let args = match param(params, "scan_mode")?.as_deref() {
                    Some("reverse") => vec!["-r".into(), target.into()],
                    Some("axfr") => vec!["-d".into(), target.into(), "-t".into(), "axfr".into()],
                    _ => vec!["-d".into(), target.into()],
                };
                Ok(spec("DNSRecon".into(), args, Duration::from_secs(5 * 60)))
            }
            ExternalTool::Nmap => {
                validate_target(target)?;
                let mut args = vec!["-T4".to_string()];
                let scan_flag = match param(params, "scan_type")?.as_deref() {
                    Some("service") => "-sV",
                    Some("os") => "-O",
                    Some("ping") => "-sn",
                    Some("banner") => "--script=banner",
                    _ => "-sT",
                };
                args.push(scan_flag.into());
                if let Some(list) = param(params, "ports")? {
                    let parsed = ports::parse_port_spec(&list)?;
                    args.push("-p".into());
                    args.push(ports::format_port_spec(&parsed));
                }
                // XML on stdout feeds the structured parser.
                args.extend(["-oX".into(), "-".into(), target.into()]);
                Ok(spec("Nmap".into(), args, Duration::from_secs(30 * 60)))
            }
            ExternalTool::Traceroute => {
                validate_target(target)?;
                Ok(spec("Traceroute".into(), vec![target.into()], Duration::from_secs(2 * 60)))
            }
            ExternalTool::SnmpWalk => {
                validate_target(target)?;
                let community = param(params, "community")?.unwrap_or_else(|| "public".into());
                let oid = param(params, "oid")?.unwrap_or_else(|| "1.3.6.1.2.1".into());
                Ok(spec(
                    "SNMP Walk".into(),
                    vec!["-v2c".into(), "-c".into(), community, target.into(), oid],
                    Duration::from_secs(2 * 60),
                ))
            }
            ExternalTool::Netcat => {
                validate_target(target)?;
                let port = param(params, "port")?
                    .ok_or(SpecError::MissingParameter("port for banner grab"))?;
                let port = match port.parse::<u16>() {
                    Ok(p) if p > 0 => p,
                    _ => {
                        return Err(SpecError::InvalidParameter {
                            name: "port",
                            reason: format!("not a port number: {port}"),
                        })
                    }
                };
                Ok(spec(
                    "Banner Grab".into(),
                    vec!["-w".into(), "5".into(), "-v".into(), target.into(), port.to_string()],
                    Duration::from_secs(30),
                ))
            }
            ExternalTool::Curl => {
                validate_url(target)?;
                Ok(spec(
                    "HTTP Headers".into(),
                    vec![
                        "-I".into(),
                        "-s".into(),
                        "-L".into(),
                        "--max-time".into(),
                        "15".into(),
                        target.into(),
                    ],
                    Duration::from_secs(30),
                ))
            }
            ExternalTool::WhatWeb => {
                validate_url(target)?;
                let aggression = param(params, "aggression")?.unwrap_or_else(|| "1".into());
                if !matches!(aggression.as_str(), "1" | "2" | "3" | "4") {
                    return Err(SpecError::InvalidParameter {
                        name: "aggression",
                        reason: format!("must be 1-4, got {aggression}"),
                    });
                }
                Ok(spec(
                    "WhatWeb".into(),
                    vec!["-a".into(), aggression, "--color=never".into(), target.into()],
                    Duration::from_secs(2 * 60),
                ))
            }
            ExternalTool::Gobuster => {
                validate_url(target)?;
                let wordlist = param(params, "wordlist")?
                    .unwrap_or_else(|| "/usr/share/wordlists/dirb/common.txt".into());
                let mut args = vec![
                    "dir".into(),
                    "-u".into(),
                    target.into(),
                    "-w".into(),
                    wordlist,
                    "-t".into(),
                    "10".into(),
                    "--no-color".into(),
                    "-q".into(),
                ];
                if let Some(ext) = param(params, "extensions")? {
                    args.push("-x".into());
                    args.push(ext);
                }
                Ok(spec("Gobuster".into(), args, Duration::from_secs(15 * 60)))
            }
        }
    }
}

impl ToolSpec {
    /// Apply a configured binary/timeout replacement.
    pub fn with_override(mut self, o: &ToolOverride) -> Self {
        if let Some(cmd) = &o.command {
            self.binary = cmd.clone();
        }
        if let Some(t) = o.timeout() {
            self.timeout = Some(t);
        }
        self
    }
}

/// Fetch an optional parameter, stripped of shell metacharacters.
///
/// Blank values count as absent; values that would be read as a flag are rejected.
fn param(params: &BTreeMap<String, String>, name: &'static str) -> Result<Option<String>, SpecError> {
    let Some(raw) = params.get(name) else {
        return Ok(None);
    };
    let value = sanitize_arg(raw.trim());
    if value.is_empty() {
        return Ok(None);
    }
    if value.starts_with('-') {
        return Err(SpecError::InvalidParameter {
            name,
            reason: "must not start with '-'".into(),
        });
    }
    Ok(Some(value))
}
