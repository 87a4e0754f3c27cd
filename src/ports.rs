use std::collections::HashSet;

use crate::error::SpecError;

/// Parse an nmap-style port list into a deduplicated list of TCP ports (1..=65535).
///
/// Supported forms, separated by commas:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - whitespace around entries is ignored
pub fn parse_port_spec(s: &str) -> Result<Vec<u16>, SpecError> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for raw in s.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }

        if let Some((a, b)) = entry.split_once('-') {
            let start = parse_port(a.trim())?;
            let end = parse_port(b.trim())?;
            if start > end {
                return Err(invalid(format!("range {start}-{end} (start > end)")));
            }
            for p in start..=end {
                if seen.insert(p) {
                    out.push(p);
                }
            }
            continue;
        }

        let p = parse_port(entry)?;
        if seen.insert(p) {
            out.push(p);
        }
    }

    if out.is_empty() {
        return Err(invalid("no ports given".into()));
    }
    Ok(out)
}

/// Render ports back into a compact list, folding consecutive runs into ranges.
pub fn format_port_spec(ports: &[u16]) -> String {
    let mut sorted = ports.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end.wrapping_add(1))) && end < u16::MAX {
            end = iter.next().unwrap_or(end);
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}

fn parse_port(s: &str) -> Result<u16, SpecError> {
    let val: u32 = s
        .parse()
        .map_err(|_| invalid(format!("invalid port value: {s:?}")))?;
    if val == 0 || val > 65535 {
        return Err(invalid(format!("port out of range: {val}")));
    }
    Ok(val as u16)
}

fn invalid(reason: String) -> SpecError {
    SpecError::InvalidParameter {
        name: "ports",
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ports() {
        let ports = parse_port_spec("80, 22 ,443").unwrap();
        assert_eq!(ports, vec![80, 22, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_spec("8000-8002,80,8001").unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_port_spec("70000").is_err());
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("90-80").is_err());
        assert!(parse_port_spec("80;id").is_err());
        assert!(parse_port_spec(" , ").is_err());
    }

    #[test]
    fn format_folds_runs() {
        assert_eq!(format_port_spec(&[443, 80, 81, 82, 22]), "22,80-82,443");
        assert_eq!(format_port_spec(&[65535, 65534]), "65534-65535");
    }
}
