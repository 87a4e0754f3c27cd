use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reconsuite_rs::config::{Config, ToolOverride};
use reconsuite_rs::executor::Executor;
use reconsuite_rs::hub::Publisher;
use reconsuite_rs::store::{MemoryStore, ScanStore};
use reconsuite_rs::types::{LiveEvent, NewScan, Scan, ScanId, ScanStatus, Stream};
use tempfile::TempDir;

/// Records every published event, including those nobody would be subscribed for.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(ScanId, LiveEvent)>>,
}

impl Publisher for Recorder {
    fn publish(&self, scan_id: ScanId, event: LiveEvent) {
        self.events.lock().unwrap().push((scan_id, event));
    }
}

impl Recorder {
    fn for_scan(&self, id: ScanId) -> Vec<LiveEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(sid, _)| *sid == id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn lines(&self, id: ScanId) -> Vec<(Stream, String)> {
        self.for_scan(id)
            .into_iter()
            .filter_map(|e| match e {
                LiveEvent::Line(l) => Some((l.stream, l.line)),
                LiveEvent::Done(_) => None,
            })
            .collect()
    }
}

struct Harness {
    exec: Executor,
    store: Arc<MemoryStore>,
    events: Arc<Recorder>,
    _dir: TempDir,
}

impl Harness {
    /// `tools` maps a tool name to a shell script body that stands in for it.
    fn new(tools: &[(&str, &str, Option<u64>)], max_concurrent: Option<usize>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.executor.max_concurrent_scans = max_concurrent;
        for (tool, body, timeout_secs) in tools {
            let path = dir.path().join(format!("fake-{tool}"));
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            config.tools.insert(
                tool.to_string(),
                ToolOverride {
                    command: Some(path.display().to_string()),
                    timeout_secs: *timeout_secs,
                },
            );
        }

        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(Recorder::default());
        let exec = Executor::new(store.clone(), events.clone(), &config);
        Self {
            exec,
            store,
            events,
            _dir: dir,
        }
    }

    async fn start(&self, tool: &str, target: &str) -> Scan {
        self.exec
            .start(NewScan {
                scan_type: "recon".into(),
                tool: tool.into(),
                target: target.into(),
                ..Default::default()
            })
            .await
            .expect("scan accepted")
    }

    /// Wait for the done event; the scan is fully persisted once it is out.
    async fn finished(&self, id: ScanId) -> Scan {
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            if self.events.for_scan(id).iter().any(LiveEvent::is_done) {
                return self.store.get_scan(id).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scan {id} produced no done event");
    }

    fn done_statuses(&self, id: ScanId) -> Vec<ScanStatus> {
        self.events
            .for_scan(id)
            .into_iter()
            .filter_map(|e| match e {
                LiveEvent::Done(d) => Some(d.status),
                LiveEvent::Line(_) => None,
            })
            .collect()
    }
}

#[tokio::test]
async fn successful_tool_completes_with_parsed_findings() {
    let h = Harness::new(
        &[(
            "whois",
            "echo 'Registrar: Example, Inc.'\necho 'Creation Date: 2020-01-01'\necho 'noise' 1>&2",
            None,
        )],
        None,
    );
    let scan = h.start("whois", "example.com").await;
    assert_eq!(scan.status, ScanStatus::Pending);
    assert_eq!(serde_json::to_string(&scan.parameters).unwrap(), "{}");

    let done = h.finished(scan.id).await;
    assert_eq!(done.status, ScanStatus::Completed);
    assert!(done.started_at.is_some() && done.completed_at.is_some());
    assert!(done.raw_output.contains("Registrar: Example, Inc.\n"));
    assert!(done.raw_output.contains("noise\n"));

    let results = h.store.results_for_scan(scan.id).await.unwrap();
    let pairs: Vec<_> = results
        .iter()
        .map(|r| (r.finding.key.as_str(), r.finding.value.as_str()))
        .collect();
    assert_eq!(
        pairs,
        vec![("registrar", "Example, Inc."), ("creation_date", "2020-01-01")]
    );

    // The done event is the last one and there is exactly one.
    let events = h.events.for_scan(scan.id);
    assert!(events.last().unwrap().is_done());
    assert_eq!(h.done_statuses(scan.id), vec![ScanStatus::Completed]);
    assert!(h.events.lines(scan.id).contains(&(Stream::Stderr, "noise".into())));
}

#[tokio::test]
async fn terminal_status_never_changes_again() {
    let h = Harness::new(&[("whois", "echo 'Registrar: X'", None)], None);
    let scan = h.start("whois", "example.com").await;
    let done = h.finished(scan.id).await;

    h.exec.cancel(scan.id);
    h.exec.cancel(scan.id);
    h.exec.cancel(424242);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = h.store.get_scan(scan.id).await.unwrap();
    assert_eq!(after.status, done.status);
    assert_eq!(after.completed_at, done.completed_at);
    assert_eq!(h.done_statuses(scan.id).len(), 1);
    assert!(!h.exec.is_active(scan.id));
}

#[tokio::test]
async fn malformed_xml_still_completes_with_raw_output() {
    let h = Harness::new(&[("nmap", "echo '<nmaprun><host><ports'", None)], None);
    let scan = h.start("nmap", "10.0.0.1").await;
    let done = h.finished(scan.id).await;

    assert_eq!(done.status, ScanStatus::Completed);
    assert_eq!(done.raw_output, "<nmaprun><host><ports\n");
    assert!(h.store.results_for_scan(scan.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_builtin_reports_error_line_and_done() {
    let h = Harness::new(&[], None);
    let scan = h.start("ssl_check", "127.0.0.1:1").await;
    let done = h.finished(scan.id).await;

    assert_eq!(done.status, ScanStatus::Failed);
    let lines = h.events.lines(scan.id);
    assert!(lines
        .iter()
        .any(|(s, l)| *s == Stream::Stderr && l.starts_with("Error: ")));
    assert_eq!(h.done_statuses(scan.id), vec![ScanStatus::Failed]);
    assert!(done.raw_output.starts_with("Error: "));
}

#[tokio::test]
async fn spec_build_failure_spawns_nothing() {
    let h = Harness::new(&[("whois", "touch ran-anyway", None)], None);
    let scan = h.start("whois", "example.com; reboot").await;
    let done = h.finished(scan.id).await;

    assert_eq!(done.status, ScanStatus::Failed);
    assert!(done.started_at.is_none());
    assert_eq!(h.events.lines(scan.id).len(), 1);
    assert!(done.raw_output.starts_with("Error: invalid target"));
}

#[tokio::test]
async fn nonzero_exit_fails_and_keeps_output() {
    let h = Harness::new(&[("dig", "echo 'partial answer'\nexit 9", None)], None);
    let scan = h.start("dig", "example.com").await;
    let done = h.finished(scan.id).await;

    assert_eq!(done.status, ScanStatus::Failed);
    assert!(done.raw_output.contains("partial answer\n"));
    assert!(done.raw_output.contains("Error: exited with status 9"));
    assert!(h.store.results_for_scan(scan.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelling_one_scan_leaves_the_other_alone() {
    let h = Harness::new(
        &[
            ("traceroute", "echo hop1\nexec sleep 30", None),
            (
                "whois",
                "sleep 0.5\necho 'Registrar: Other'\necho 'Status: ok'",
                None,
            ),
        ],
        None,
    );
    let slow = h.start("traceroute", "10.0.0.1").await;
    let other = h.start("whois", "example.org").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    h.exec.cancel(slow.id);

    let cancelled = h.finished(slow.id).await;
    assert_eq!(cancelled.status, ScanStatus::Failed);
    assert!(cancelled.raw_output.ends_with("Scan cancelled\n"));

    let done = h.finished(other.id).await;
    assert_eq!(done.status, ScanStatus::Completed);
    assert_eq!(
        h.events.lines(other.id),
        vec![
            (Stream::Stdout, "Registrar: Other".to_string()),
            (Stream::Stdout, "Status: ok".to_string()),
        ]
    );
}

#[tokio::test]
async fn timeout_fails_and_kills_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("pid");
    let body = format!("echo started\necho $$ > {}\nexec sleep 60", pidfile.display());
    let h = Harness::new(&[("dnsrecon", body.as_str(), Some(1))], None);

    let started = Instant::now();
    let scan = h.start("dnsrecon", "example.com").await;
    let done = h.finished(scan.id).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(done.status, ScanStatus::Failed);
    assert!(done.raw_output.contains("started\n"));
    assert!(done.raw_output.contains("Error: timed out after 1s"));

    let pid = std::fs::read_to_string(&pidfile).unwrap();
    let alive = std::process::Command::new("kill")
        .args(["-0", pid.trim()])
        .status()
        .unwrap()
        .success();
    assert!(!alive, "tool process {} still running", pid.trim());
}

/// Whether `pid` is a live process; zombies awaiting reaping count as dead.
#[cfg(target_os = "linux")]
fn running(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z'),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn timeout_kills_processes_the_tool_spawned() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("pid");
    let body = format!("echo started\nsleep 60 &\necho $! > {}\nwait", pidfile.display());
    let h = Harness::new(&[("dnsrecon", body.as_str(), Some(1))], None);

    let started = Instant::now();
    let scan = h.start("dnsrecon", "example.com").await;
    let done = h.finished(scan.id).await;

    // Well under the reader grace period: the pipes closed with the group.
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(done.status, ScanStatus::Failed);
    assert!(done.raw_output.contains("Error: timed out after 1s"));

    let pid = std::fs::read_to_string(&pidfile).unwrap();
    let pid = pid.trim();
    for _ in 0..100 {
        if !running(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("background process {pid} outlived its scan");
}

#[tokio::test]
async fn bounded_concurrency_keeps_queued_scans_pending() {
    let h = Harness::new(&[("traceroute", "exec sleep 30", None)], Some(1));
    let first = h.start("traceroute", "10.0.0.1").await;
    let queued = h.start("traceroute", "10.0.0.2").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.store.get_scan(first.id).await.unwrap().status, ScanStatus::Running);
    assert_eq!(h.store.get_scan(queued.id).await.unwrap().status, ScanStatus::Pending);

    h.exec.cancel(queued.id);
    let dropped = h.finished(queued.id).await;
    assert_eq!(dropped.status, ScanStatus::Failed);
    assert!(dropped.started_at.is_none());
    assert_eq!(dropped.raw_output, "Scan cancelled\n");

    h.exec.cancel(first.id);
    assert_eq!(h.finished(first.id).await.status, ScanStatus::Failed);
}

#[tokio::test]
async fn shutdown_cancels_everything_in_flight() {
    let h = Harness::new(&[("traceroute", "exec sleep 30", None)], None);
    let a = h.start("traceroute", "10.0.0.1").await;
    let b = h.start("traceroute", "10.0.0.2").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(10), h.exec.shutdown())
        .await
        .expect("shutdown finished");

    for id in [a.id, b.id] {
        let scan = h.store.get_scan(id).await.unwrap();
        assert_eq!(scan.status, ScanStatus::Failed);
        assert_eq!(h.done_statuses(id), vec![ScanStatus::Failed]);
    }
    assert_eq!(h.exec.active_count(), 0);
}
