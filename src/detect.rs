use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::process::Command;
use tokio::time;

use crate::config::ToolOverride;
use crate::specs::ExternalTool;

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const VERSION_MAX: usize = 100;

/// Installation status of one external tool.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolStatus {
    pub tool: String,
    pub name: String,
    pub binary: String,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Check every external tool, honoring configured binary overrides.
pub async fn detect_all(overrides: &HashMap<String, ToolOverride>) -> Vec<ToolStatus> {
    join_all(ExternalTool::ALL.iter().map(|tool| {
        let binary = overrides
            .get(tool.name())
            .and_then(|o| o.command.clone())
            .unwrap_or_else(|| tool.binary().to_string());
        detect(*tool, binary)
    }))
    .await
}

async fn detect(tool: ExternalTool, binary: String) -> ToolStatus {
    let mut status = ToolStatus {
        tool: tool.name().to_string(),
        name: tool.display_name().to_string(),
        binary: binary.clone(),
        installed: false,
        path: None,
        version: None,
    };

    let Ok(path) = which::which(&binary) else {
        return status;
    };
    status.installed = true;
    status.path = Some(path.display().to_string());

    if let Some(arg) = tool.version_arg() {
        status.version = version_line(&binary, arg).await;
    }
    status
}

async fn version_line(binary: &str, arg: &str) -> Option<String> {
    let output = Command::new(binary)
        .arg(arg)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match time::timeout(VERSION_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => out,
        Ok(Ok(_)) | Ok(Err(_)) => return None,
        Err(_) => {
            tracing::debug!(binary, "version probe timed out");
            return None;
        }
    };

    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    first_line(&String::from_utf8_lossy(&text))
}

fn first_line(text: &str) -> Option<String> {
    let line = text.trim().lines().next()?.trim();
    if line.is_empty() {
        return None;
    }
    Some(line.chars().take(VERSION_MAX).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_is_trimmed_and_capped() {
        assert_eq!(first_line("\n  Nmap version 7.94\nPlatform: x\n").as_deref(), Some("Nmap version 7.94"));
        assert_eq!(first_line("   \n").as_deref(), None);
        assert_eq!(first_line(&"v".repeat(300)).map(|s| s.len()), Some(VERSION_MAX));
    }

    #[tokio::test]
    async fn reports_every_tool_and_missing_binaries() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "nmap".to_string(),
            ToolOverride {
                command: Some("definitely-not-installed-nmap".into()),
                timeout_secs: None,
            },
        );
        let all = detect_all(&overrides).await;
        assert_eq!(all.len(), ExternalTool::ALL.len());

        let nmap = all.iter().find(|s| s.tool == "nmap").unwrap();
        assert_eq!(nmap.binary, "definitely-not-installed-nmap");
        assert!(!nmap.installed);
        assert!(nmap.path.is_none());
    }
}
