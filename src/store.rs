use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{Finding, NewScan, Scan, ScanId, ScanStatus, StoredResult};

/// Persistence for scans and their findings.
///
/// Implementations must be safe to call from many scan tasks at once.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Insert a new `pending` scan and return it with its id.
    async fn create_scan(&self, new: &NewScan) -> Result<Scan, StoreError>;

    /// Move a scan forward. `running` stamps `started_at`; terminal states stamp
    /// `completed_at`. Backward or sideways moves are rejected.
    async fn update_status(&self, id: ScanId, status: ScanStatus) -> Result<(), StoreError>;

    async fn update_raw_output(&self, id: ScanId, raw: &str) -> Result<(), StoreError>;

    /// Store every finding or none of them.
    async fn insert_results(&self, id: ScanId, findings: &[Finding]) -> Result<(), StoreError>;

    async fn get_scan(&self, id: ScanId) -> Result<Scan, StoreError>;

    async fn results_for_scan(&self, id: ScanId) -> Result<Vec<StoredResult>, StoreError>;

    /// Newest first.
    async fn recent_scans(&self, limit: usize) -> Result<Vec<Scan>, StoreError>;
}

#[derive(Default)]
struct Tables {
    next_scan_id: ScanId,
    next_result_id: i64,
    scans: HashMap<ScanId, Scan>,
    results: HashMap<ScanId, Vec<StoredResult>>,
}

/// In-process store backed by maps behind a `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create_scan(&self, new: &NewScan) -> Result<Scan, StoreError> {
        let mut t = self.tables.write().await;
        t.next_scan_id += 1;
        let scan = Scan {
            id: t.next_scan_id,
            project_id: new.project_id,
            scan_type: new.scan_type.clone(),
            tool: new.tool.clone(),
            target: new.target.clone(),
            parameters: new.parameters.clone(),
            status: ScanStatus::Pending,
            raw_output: String::new(),
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            completed_at: None,
        };
        t.scans.insert(scan.id, scan.clone());
        Ok(scan)
    }

    async fn update_status(&self, id: ScanId, status: ScanStatus) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let scan = t.scans.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !scan.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: scan.status,
                to: status,
            });
        }
        let now = OffsetDateTime::now_utc();
        match status {
            ScanStatus::Running => scan.started_at = Some(now),
            s if s.is_terminal() => scan.completed_at = Some(now),
            _ => {}
        }
        scan.status = status;
        Ok(())
    }

    async fn update_raw_output(&self, id: ScanId, raw: &str) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let scan = t.scans.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        scan.raw_output = raw.to_string();
        Ok(())
    }

    async fn insert_results(&self, id: ScanId, findings: &[Finding]) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        if !t.scans.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let now = OffsetDateTime::now_utc();
        let first = t.next_result_id + 1;
        t.next_result_id += findings.len() as i64;
        let rows = findings.iter().zip(first..).map(|(f, rid)| StoredResult {
            id: rid,
            scan_id: id,
            finding: f.clone(),
            created_at: now,
        });
        t.results.entry(id).or_default().extend(rows);
        Ok(())
    }

    async fn get_scan(&self, id: ScanId) -> Result<Scan, StoreError> {
        let t = self.tables.read().await;
        t.scans.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn results_for_scan(&self, id: ScanId) -> Result<Vec<StoredResult>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.results.get(&id).cloned().unwrap_or_default())
    }

    async fn recent_scans(&self, limit: usize) -> Result<Vec<Scan>, StoreError> {
        let t = self.tables.read().await;
        let mut scans: Vec<Scan> = t.scans.values().cloned().collect();
        // Ids are monotonic, so they break ties between equal timestamps.
        scans.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        scans.truncate(limit);
        Ok(scans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whois(target: &str) -> NewScan {
        NewScan {
            scan_type: "recon".into(),
            tool: "whois".into(),
            target: target.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lifecycle_stamps_times() {
        let store = MemoryStore::new();
        let scan = store.create_scan(&whois("example.com")).await.unwrap();
        assert_eq!(scan.status, ScanStatus::Pending);
        assert!(scan.started_at.is_none());

        store.update_status(scan.id, ScanStatus::Running).await.unwrap();
        let running = store.get_scan(scan.id).await.unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        store.update_status(scan.id, ScanStatus::Completed).await.unwrap();
        let done = store.get_scan(scan.id).await.unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn rejects_backward_transitions() {
        let store = MemoryStore::new();
        let id = store.create_scan(&whois("example.com")).await.unwrap().id;
        store.update_status(id, ScanStatus::Failed).await.unwrap();
        let err = store.update_status(id, ScanStatus::Running).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition {
                from: ScanStatus::Failed,
                to: ScanStatus::Running
            }
        );
        assert_eq!(
            store.update_status(99, ScanStatus::Running).await,
            Err(StoreError::NotFound(99))
        );
    }

    #[tokio::test]
    async fn results_and_recent_listing() {
        let store = MemoryStore::new();
        let a = store.create_scan(&whois("a.example")).await.unwrap().id;
        let b = store.create_scan(&whois("b.example")).await.unwrap().id;

        store
            .insert_results(a, &[Finding::new("whois", "Registrar", "X"), Finding::new("whois", "Status", "ok")])
            .await
            .unwrap();
        let rows = store.results_for_scan(a).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].finding.key, "Registrar");
        assert!(rows[0].id < rows[1].id);
        assert!(store.results_for_scan(b).await.unwrap().is_empty());
        assert!(store.insert_results(42, &[]).await.is_err());

        let recent = store.recent_scans(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, b);
    }
}
