//! In-process probes that need no external binary.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CipherSuite, ClientConfig, DigitallySignedStruct, ProtocolVersion, SignatureScheme,
};
use serde_json::json;
use ::time::format_description::well_known::Rfc3339;
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::ProbeError;
use crate::specs::BuiltinProbe;
use crate::types::Finding;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ROBOTS_TIMEOUT: Duration = Duration::from_secs(15);
const METADATA_TIMEOUT: Duration = Duration::from_secs(20);
const ROBOTS_CAP: usize = 64 * 1024;
const SITEMAP_CAP: usize = 256 * 1024;
const PAGE_CAP: usize = 2 * 1024 * 1024;
const MAX_TEXT: usize = 500;
const USER_AGENT: &str = "ReconSuite/1.0 (Metadata Extractor)";

const INTERESTING_HEADERS: &[&str] = &[
    "server",
    "x-powered-by",
    "content-type",
    "x-frame-options",
    "x-content-type-options",
    "strict-transport-security",
    "content-security-policy",
    "x-xss-protection",
    "access-control-allow-origin",
    "via",
    "x-cache",
    "x-aspnet-version",
    "x-generator",
];

/// What a probe produced.
#[derive(Debug, Default)]
pub struct ProbeReport {
    /// Progress lines to show before the findings.
    pub notes: Vec<String>,
    pub findings: Vec<Finding>,
}

/// Run `probe` against `target`, giving up as soon as `cancel` fires.
pub async fn run_probe(
    probe: BuiltinProbe,
    target: &str,
    cancel: &CancellationToken,
) -> Result<ProbeReport, ProbeError> {
    let target = target.trim();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        report = dispatch(probe, target) => report,
    }
}

async fn dispatch(probe: BuiltinProbe, target: &str) -> Result<ProbeReport, ProbeError> {
    match probe {
        BuiltinProbe::GoogleDorking => Ok(ProbeReport {
            notes: vec![format!("Generated Google dork queries for: {target}")],
            findings: google_dorks(target),
        }),
        BuiltinProbe::OsintAggregator => Ok(ProbeReport {
            notes: vec![format!("Generated OSINT resource links for: {target}")],
            findings: osint_links(target),
        }),
        BuiltinProbe::SslCheck => Ok(ProbeReport {
            notes: Vec::new(),
            findings: ssl_check(target).await?,
        }),
        BuiltinProbe::RobotsSitemap => Ok(ProbeReport {
            notes: Vec::new(),
            findings: robots_sitemap(target).await?,
        }),
        BuiltinProbe::MetadataExtract => Ok(ProbeReport {
            notes: vec![format!("Extracting metadata from: {target}")],
            findings: metadata_extract(target).await?,
        }),
    }
}

pub fn google_dorks(target: &str) -> Vec<Finding> {
    let dorks = [
        ("files", format!("site:{target} filetype:pdf")),
        ("files", format!("site:{target} filetype:doc OR filetype:docx OR filetype:xls")),
        ("files", format!("site:{target} filetype:sql OR filetype:bak OR filetype:log")),
        ("login", format!("site:{target} inurl:login OR inurl:admin OR inurl:signin")),
        ("login", format!("site:{target} intitle:\"index of\"")),
        ("sensitive", format!("site:{target} intext:\"password\" OR intext:\"username\" filetype:log")),
        ("sensitive", format!("site:{target} ext:env OR ext:cfg OR ext:conf")),
        ("subdomains", format!("site:*.{target} -www")),
        ("technology", format!("site:{target} inurl:wp-content OR inurl:wp-admin")),
        ("errors", format!("site:{target} \"error\" OR \"warning\" OR \"stack trace\"")),
    ];

    dorks
        .into_iter()
        .map(|(category, query)| {
            let url = format!("https://www.google.com/search?q={}", query.replace(' ', "+"));
            Finding::new("google_dork", category, url).with_details(json!({ "query": query }))
        })
        .collect()
}

pub fn osint_links(target: &str) -> Vec<Finding> {
    let mut links = vec![
        ("VirusTotal", format!("https://www.virustotal.com/gui/domain/{target}")),
        ("crt.sh", format!("https://crt.sh/?q=%25.{target}")),
        ("SecurityTrails", format!("https://securitytrails.com/domain/{target}")),
        ("DNSDumpster", "https://dnsdumpster.com/".to_string()),
        ("Wayback Machine", format!("https://web.archive.org/web/*/{target}")),
    ];

    if target.parse::<IpAddr>().is_ok() {
        links.extend([
            ("Shodan", format!("https://www.shodan.io/host/{target}")),
            ("Censys", format!("https://search.censys.io/hosts/{target}")),
            ("GreyNoise", format!("https://viz.greynoise.io/ip/{target}")),
            ("AbuseIPDB", format!("https://www.abuseipdb.com/check/{target}")),
        ]);
    } else {
        links.extend([
            ("Shodan", format!("https://www.shodan.io/search?query=hostname:{target}")),
            ("Censys", format!("https://search.censys.io/search?resource=hosts&q={target}")),
        ]);
    }

    links
        .into_iter()
        .map(|(name, url)| Finding::new("osint_link", name, url))
        .collect()
}

/// Split `host[:port]`, `[v6]:port` or a URL into host and port (default 443).
pub fn split_host_port(target: &str) -> (String, u16) {
    let rest = target
        .strip_prefix("https://")
        .or_else(|| target.strip_prefix("http://"))
        .unwrap_or(target);
    let authority = rest.split('/').next().unwrap_or(rest);

    if let Some(v6) = authority.strip_prefix('[') {
        if let Some((host, tail)) = v6.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(443);
            return (host.to_string(), port);
        }
    }
    // A bare IPv6 address has several colons and no port.
    if authority.matches(':').count() == 1 {
        if let Some((host, port)) = authority.split_once(':') {
            if let Ok(port) = port.parse() {
                return (host.to_string(), port);
            }
        }
    }
    (authority.to_string(), 443)
}

/// Accepts any server certificate; the probe reports on it instead of trusting it.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector() -> Result<TlsConnector, ProbeError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn ssl_check(target: &str) -> Result<Vec<Finding>, ProbeError> {
    let (host, port) = split_host_port(target);
    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| ProbeError::Tls(format!("{host}: {e}")))?;

    let tcp = time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| ProbeError::Tls(format!("connect to {host}:{port} timed out")))??;

    let stream = time::timeout(CONNECT_TIMEOUT, tls_connector()?.connect(server_name, tcp))
        .await
        .map_err(|_| ProbeError::Tls(format!("handshake with {host}:{port} timed out")))?
        .map_err(|e| ProbeError::Tls(e.to_string()))?;

    let (_, session) = stream.get_ref();
    let mut findings = Vec::new();
    if let Some(version) = session.protocol_version() {
        findings.push(Finding::new("ssl", "tls_version", tls_version_name(version)));
    }
    if let Some(suite) = session.negotiated_cipher_suite() {
        findings.push(Finding::new("ssl", "cipher_suite", cipher_suite_name(suite.suite())));
    }
    if let Some(leaf) = session.peer_certificates().and_then(|chain| chain.first()) {
        findings.extend(certificate_findings(leaf.as_ref())?);
    }
    Ok(findings)
}

fn tls_version_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_0 => "TLS 1.0".into(),
        ProtocolVersion::TLSv1_1 => "TLS 1.1".into(),
        ProtocolVersion::TLSv1_2 => "TLS 1.2".into(),
        ProtocolVersion::TLSv1_3 => "TLS 1.3".into(),
        other => format!("Unknown (0x{:04x})", u16::from(other)),
    }
}

fn cipher_suite_name(suite: CipherSuite) -> String {
    suite
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{suite:?}"))
}

/// Describe a DER-encoded leaf certificate.
pub fn certificate_findings(der: &[u8]) -> Result<Vec<Finding>, ProbeError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| ProbeError::Certificate(e.to_string()))?;

    let common_name = |name: &x509_parser::x509::X509Name<'_>| {
        name.iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| name.to_string())
    };
    let rfc3339 = |t: &x509_parser::time::ASN1Time| {
        t.to_datetime()
            .format(&Rfc3339)
            .unwrap_or_else(|_| t.to_string())
    };

    let validity = cert.validity();
    let mut findings = vec![
        Finding::new("ssl", "subject", common_name(cert.subject())),
        Finding::new("ssl", "issuer", common_name(cert.issuer())),
        Finding::new("ssl", "not_before", rfc3339(&validity.not_before)),
        Finding::new("ssl", "not_after", rfc3339(&validity.not_after)),
    ];

    let sans: Vec<&str> = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(d) => Some(*d),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    findings.push(Finding::new("ssl", "san", sans.join(", ")));
    findings.push(Finding::new("ssl", "serial", cert.raw_serial_as_string()));

    let self_signed = cert.subject().to_string() == cert.issuer().to_string();
    findings.push(Finding::new("ssl", "self_signed", self_signed.to_string()));

    Ok(findings)
}

fn base_url(target: &str) -> String {
    let url = if target.starts_with("http") {
        target.to_string()
    } else {
        format!("https://{target}")
    };
    url.trim_end_matches('/').to_string()
}

async fn robots_sitemap(target: &str) -> Result<Vec<Finding>, ProbeError> {
    let base = base_url(target);
    let client = reqwest::Client::builder()
        .timeout(ROBOTS_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;

    let mut findings = Vec::new();

    // Either file may be missing; only both missing is an error.
    match fetch_ok(&client, &format!("{base}/robots.txt"), ROBOTS_CAP).await {
        Ok(Some(body)) => {
            findings.push(Finding::new("robots", "robots.txt", body.clone()));
            findings.extend(disallowed_paths(&body));
        }
        Ok(None) => {}
        Err(e) => tracing::debug!(base = %base, error = %e, "robots.txt fetch failed"),
    }
    match fetch_ok(&client, &format!("{base}/sitemap.xml"), SITEMAP_CAP).await {
        Ok(Some(body)) => findings.push(Finding::new("sitemap", "sitemap.xml", body)),
        Ok(None) => {}
        Err(e) => tracing::debug!(base = %base, error = %e, "sitemap.xml fetch failed"),
    }

    if findings.is_empty() {
        return Err(ProbeError::NotFound(
            "neither robots.txt nor sitemap.xml found".into(),
        ));
    }
    Ok(findings)
}

/// GET `url`, returning the capped body on 200 and `None` on any other status.
async fn fetch_ok(
    client: &reqwest::Client,
    url: &str,
    cap: usize,
) -> Result<Option<String>, reqwest::Error> {
    let resp = client.get(url).send().await?;
    if resp.status() != reqwest::StatusCode::OK {
        return Ok(None);
    }
    read_capped(resp, cap).await.map(Some)
}

async fn read_capped(mut resp: reqwest::Response, cap: usize) -> Result<String, reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = cap - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

pub fn disallowed_paths(robots: &str) -> Vec<Finding> {
    robots
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (field, path) = line.split_once(':')?;
            if !field.trim().eq_ignore_ascii_case("disallow") {
                return None;
            }
            let path = path.trim();
            (!path.is_empty()).then(|| Finding::new("disallowed_path", path, "disallowed"))
        })
        .collect()
}

async fn metadata_extract(target: &str) -> Result<Vec<Finding>, ProbeError> {
    let client = reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(USER_AGENT)
        .build()?;

    let resp = client.get(base_url(target)).send().await?;
    let mut findings = vec![
        Finding::new("metadata", "http_status", resp.status().to_string()),
        Finding::new("metadata", "final_url", resp.url().to_string()),
    ];
    for name in INTERESTING_HEADERS {
        if let Some(value) = resp.headers().get(*name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                findings.push(Finding::new("metadata", format!("header:{name}"), value));
            }
        }
    }

    // A body that fails midway still leaves the header findings.
    match read_capped(resp, PAGE_CAP).await {
        Ok(html) => findings.extend(html_metadata(&html)),
        Err(e) => tracing::debug!(error = %e, "page body read failed"),
    }
    Ok(findings)
}

static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));
static META_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("meta regex"));
static LINK_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<link\b[^>]*>").expect("link regex"));
static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)([a-z][a-z0-9:_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("attr regex")
});

fn attributes(tag: &str) -> BTreeMap<String, String> {
    ATTR.captures_iter(tag)
        .filter_map(|c| {
            let value = c.get(2).or_else(|| c.get(3))?;
            Some((c[1].to_ascii_lowercase(), value.as_str().to_string()))
        })
        .collect()
}

fn truncate(s: &str) -> String {
    s.chars().take(MAX_TEXT).collect()
}

fn link_href(html: &str, rel: &str) -> Option<String> {
    LINK_TAG.find_iter(html).find_map(|m| {
        let attrs = attributes(m.as_str());
        let matches = attrs
            .get("rel")
            .is_some_and(|r| r.to_ascii_lowercase().contains(rel));
        attrs.get("href").filter(|h| matches && !h.is_empty()).cloned()
    })
}

/// Title, meta tags, canonical link and favicon of an HTML page.
pub fn html_metadata(html: &str) -> Vec<Finding> {
    let mut findings = Vec::new();

    if let Some(title) = TITLE.captures(html).map(|c| c[1].trim().to_string()) {
        if !title.is_empty() {
            findings.push(Finding::new("metadata", "title", truncate(&title)));
        }
    }

    let mut metas = BTreeMap::new();
    for tag in META_TAG.find_iter(html) {
        let attrs = attributes(tag.as_str());
        let name = attrs.get("name").or_else(|| attrs.get("property"));
        if let (Some(name), Some(content)) = (name, attrs.get("content")) {
            if !name.is_empty() && !content.is_empty() {
                metas.insert(name.to_ascii_lowercase(), truncate(content));
            }
        }
    }
    findings.extend(
        metas
            .into_iter()
            .map(|(name, content)| Finding::new("metadata", name, content)),
    );

    if let Some(href) = link_href(html, "canonical") {
        findings.push(Finding::new("metadata", "canonical", href));
    }
    if let Some(href) = link_href(html, "icon") {
        findings.push(Finding::new("metadata", "favicon", href));
    }
    findings
}
