//! Durable GPU set -> process mapping with startup reconciliation.
//!
//! The registry keeps the whole document in memory and rewrites the file on
//! every mutation (write `<file>.tmp`, fsync, rename over the target), so a
//! crash mid-write leaves the previous snapshot intact. A failed write marks
//! the registry dirty; the next mutation or [`ProcessRegistry::flush`] retries
//! with the full snapshot. In-memory state stays authoritative either way.

use core::error::Error;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api_types::InstanceState;
use api_types::OrphanCleanupReport;
use api_types::OrphanFailure;
use api_types::RegistryDocument;
use api_types::RegistryEntry;
use api_types::REGISTRY_VERSION;
use chrono::Utc;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::allocator::Allocator;
use super::allocator::GpuSet;
use super::error::LifecycleError;
use super::supervisor::terminate;
use super::traits::ProcessTable;
use super::types::StopOutcome;

#[derive(Debug, Display)]
pub enum RegistryError {
    #[display("Failed to write registry file: {message}")]
    Write { message: String },
    #[display("Failed to serialize registry document: {message}")]
    Serialization { message: String },
    #[display("Failed to enumerate processes: {message}")]
    ProcessScan { message: String },
}

impl Error for RegistryError {}

struct RegistryState {
    document: RegistryDocument,
    dirty: bool,
}

pub struct ProcessRegistry {
    path: PathBuf,
    /// Executable every tracked process is expected to run
    executable: String,
    table: Arc<dyn ProcessTable>,
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    /// Empty registry backed by `path`. Nothing is read until
    /// [`ProcessRegistry::recover_on_startup`].
    pub fn new(
        path: impl Into<PathBuf>,
        executable: impl Into<String>,
        table: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            path: path.into(),
            executable: executable.into(),
            table,
            state: Mutex::new(RegistryState {
                document: RegistryDocument::default(),
                dirty: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub async fn register(&self, entry: RegistryEntry) -> Result<(), Report<RegistryError>> {
        let mut state = self.state.lock().await;
        info!(gpu_set = %entry.gpu_set, pid = entry.pid, model_id = %entry.model_id, "Registering process");
        state.document.processes.insert(entry.gpu_set.clone(), entry);
        self.persist(&mut state).await
    }

    /// Remove `key`. Unknown keys are not an error.
    pub async fn unregister(&self, key: &str) -> Result<(), Report<RegistryError>> {
        let mut state = self.state.lock().await;
        match state.document.processes.remove(key) {
            Some(entry) => {
                info!(gpu_set = %key, pid = entry.pid, "Unregistered process");
                self.persist(&mut state).await
            }
            None => {
                debug!(gpu_set = %key, "No registry entry to remove");
                Ok(())
            }
        }
    }

    /// Set the status of `key` if its entry still records `pid`. An entry
    /// rewritten by a newer instance is left untouched.
    pub async fn update_status(
        &self,
        key: &str,
        pid: u32,
        status: InstanceState,
    ) -> Result<(), Report<RegistryError>> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.document.processes.get_mut(key) else {
            return Ok(());
        };
        if entry.pid != pid {
            debug!(gpu_set = %key, pid = pid, current_pid = entry.pid, "Registry entry belongs to another process, status not updated");
            return Ok(());
        }
        entry.status = status;
        self.persist(&mut state).await
    }

    pub async fn get(&self, key: &str) -> Option<RegistryEntry> {
        self.state.lock().await.document.processes.get(key).cloned()
    }

    /// Entries ordered by GPU set key.
    pub async fn snapshot(&self) -> Vec<RegistryEntry> {
        self.state
            .lock()
            .await
            .document
            .processes
            .values()
            .cloned()
            .collect()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Rewrite the document if an earlier write failed.
    pub async fn flush(&self) -> Result<(), Report<RegistryError>> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }
        info!(path = %self.path.display(), "Retrying registry write");
        self.persist(&mut state).await
    }

    async fn persist(&self, state: &mut RegistryState) -> Result<(), Report<RegistryError>> {
        state.document.last_updated = Utc::now();
        match write_document(&self.path, &state.document).await {
            Ok(()) => {
                state.dirty = false;
                Ok(())
            }
            Err(report) => {
                state.dirty = true;
                Err(report)
            }
        }
    }

    /// Load the persisted document and keep only entries whose process is
    /// still ours. Survivors are returned for adoption, marked `Running`;
    /// everything else is dropped from the document.
    pub async fn recover_on_startup(&self, allocator: &Allocator) -> Vec<(GpuSet, RegistryEntry)> {
        let loaded = self.load_from_disk().await;
        let total = loaded.processes.len();

        let mut adopted: Vec<(GpuSet, RegistryEntry)> = Vec::new();
        let mut kept = BTreeMap::new();
        for (key, mut entry) in loaded.processes {
            let gpu_set = match allocator.parse(&key) {
                Ok(gpu_set) => gpu_set,
                Err(err) => {
                    warn!(gpu_set = %key, pid = entry.pid, error = %err, "Discarding registry entry with unusable key");
                    continue;
                }
            };
            if let Some((other, _)) = adopted.iter().find(|(other, _)| other.intersects(&gpu_set)) {
                warn!(gpu_set = %key, overlaps = %other, pid = entry.pid, "Discarding registry entry overlapping an adopted one");
                continue;
            }
            if let Err(reason) = self.verify(&entry).await {
                warn!(gpu_set = %key, pid = entry.pid, reason = %reason, "Discarding stale registry entry");
                continue;
            }

            info!(gpu_set = %gpu_set, pid = entry.pid, model_id = %entry.model_id, "Adopting running process from registry");
            entry.gpu_set = gpu_set.key();
            entry.status = InstanceState::Running;
            kept.insert(gpu_set.key(), entry.clone());
            adopted.push((gpu_set, entry));
        }

        let mut state = self.state.lock().await;
        state.document.processes = kept;
        if total > 0 {
            if let Err(report) = self.persist(&mut state).await {
                let err = LifecycleError::RegistryIo {
                    message: report.current_context().to_string(),
                };
                warn!(error = %err, "Registry rewrite after recovery failed, will retry");
            }
        }
        info!(
            adopted = adopted.len(),
            discarded = total - adopted.len(),
            "Registry recovery finished"
        );
        adopted
    }

    async fn verify(&self, entry: &RegistryEntry) -> Result<(), String> {
        let Some(identity) = self.table.identity(entry.pid).await else {
            return Err("process no longer exists".to_string());
        };
        if !self.table.is_alive(entry.pid).await {
            return Err("process is not running".to_string());
        }
        if !identity.matches_executable(&self.executable) {
            return Err(format!(
                "pid now belongs to '{}', expected '{}'",
                identity.name, self.executable
            ));
        }
        if let (Some(expected), Some(actual)) = (entry.process_start_time, identity.start_time) {
            if expected != actual {
                return Err(format!(
                    "pid was reused, start time {actual} does not match recorded {expected}"
                ));
            }
        }
        Ok(())
    }

    async fn load_from_disk(&self) -> RegistryDocument {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No registry file, starting empty");
                return RegistryDocument::default();
            }
            Err(e) => {
                let err = LifecycleError::RegistryIo {
                    message: e.to_string(),
                };
                warn!(path = %self.path.display(), error = %err, "Cannot read registry file, starting empty");
                return RegistryDocument::default();
            }
        };

        match serde_json::from_slice::<RegistryDocument>(&bytes) {
            Ok(document) => {
                if document.version != REGISTRY_VERSION {
                    warn!(
                        version = %document.version,
                        expected = REGISTRY_VERSION,
                        "Registry document version differs, loading anyway"
                    );
                }
                document
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Registry file is corrupt");
                self.quarantine().await;
                RegistryDocument::default()
            }
        }
    }

    /// Move a corrupt file aside as `<file>.corrupt-<unix-ts>`.
    async fn quarantine(&self) {
        let target = with_suffix(&self.path, &format!(".corrupt-{}", Utc::now().timestamp()));
        match fs::rename(&self.path, &target).await {
            Ok(()) => warn!(moved_to = %target.display(), "Corrupt registry file moved aside"),
            Err(e) => warn!(error = %e, "Failed to move corrupt registry file aside"),
        }
    }

    /// Live processes matching `executable` that neither the registry nor
    /// `also_tracked` accounts for. The controller's own pid is never listed.
    pub async fn find_orphans(
        &self,
        executable: &str,
        also_tracked: &HashSet<u32>,
    ) -> Result<Vec<u32>, Report<RegistryError>> {
        let candidates = self
            .table
            .find_by_name(executable)
            .await
            .change_context(RegistryError::ProcessScan {
                message: format!("searching for '{executable}'"),
            })?;

        let own_pid = std::process::id();
        let tracked: HashSet<u32> = {
            let state = self.state.lock().await;
            state.document.processes.values().map(|entry| entry.pid).collect()
        };

        let mut orphans: Vec<u32> = candidates
            .into_iter()
            .filter(|pid| *pid != own_pid && !tracked.contains(pid) && !also_tracked.contains(pid))
            .collect();
        orphans.sort_unstable();
        orphans.dedup();
        Ok(orphans)
    }

    /// Terminate every orphan of the managed executable. `force` skips the
    /// SIGTERM grace period. Per-pid failures are collected, not fatal.
    pub async fn cleanup_orphans(
        &self,
        force: bool,
        grace: Duration,
        also_tracked: &HashSet<u32>,
    ) -> Result<OrphanCleanupReport, Report<RegistryError>> {
        let orphans = self.find_orphans(&self.executable, also_tracked).await?;
        let mut report = OrphanCleanupReport {
            found: orphans.len(),
            ..OrphanCleanupReport::default()
        };
        if orphans.is_empty() {
            info!("No orphaned processes found");
            return Ok(report);
        }
        info!(count = orphans.len(), pids = ?orphans, force = force, "Cleaning up orphaned processes");

        for pid in orphans {
            match terminate(self.table.as_ref(), pid, !force, grace).await {
                Ok(StopOutcome::AlreadyExited) => {
                    debug!(pid = pid, "Orphan exited before it was signalled");
                }
                Ok(_) => report.killed += 1,
                Err(e) => report.failures.push(OrphanFailure {
                    pid,
                    reason: e.current_context().to_string(),
                }),
            }
        }

        if !report.failures.is_empty() {
            let err = LifecycleError::OrphanCleanupPartialFailure {
                failures: report.failures.clone(),
            };
            warn!(error = %err, failures = ?report.failures, "Some orphans survived cleanup");
        }
        info!(found = report.found, killed = report.killed, "Orphan cleanup finished");
        Ok(report)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

async fn write_document(path: &Path, document: &RegistryDocument) -> Result<(), Report<RegistryError>> {
    let bytes = serde_json::to_vec_pretty(document).change_context(RegistryError::Serialization {
        message: "registry document".to_string(),
    })?;

    let write_error = || RegistryError::Write {
        message: path.display().to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .change_context_lazy(write_error)
            .attach_printable_lazy(|| format!("creating directory {}", parent.display()))?;
    }

    let tmp = with_suffix(path, ".tmp");
    let mut file = fs::File::create(&tmp)
        .await
        .change_context_lazy(write_error)
        .attach_printable_lazy(|| format!("creating {}", tmp.display()))?;
    file.write_all(&bytes).await.change_context_lazy(write_error)?;
    file.sync_all().await.change_context_lazy(write_error)?;
    drop(file);

    fs::rename(&tmp, path)
        .await
        .change_context_lazy(write_error)
        .attach_printable_lazy(|| format!("renaming {} over target", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use api_types::InstanceState;
    use chrono::DateTime;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::allocator::PortPolicy;
    use crate::domain::mock::FakeProcessTable;
    use crate::domain::types::ProcessIdentity;

    fn entry(key: &str, pid: u32) -> RegistryEntry {
        RegistryEntry {
            pid,
            model_id: "m1".to_string(),
            model_name: "Model One".to_string(),
            model_path: "/models/m1.gguf".to_string(),
            gpu_set: key.to_string(),
            port: 8080,
            started_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .expect("valid timestamp")
                .with_timezone(&Utc),
            launch_arguments: vec!["llama-server".to_string()],
            status: InstanceState::Running,
            process_start_time: Some(u64::from(pid) * 10),
        }
    }

    fn registry(dir: &Path, table: Arc<FakeProcessTable>) -> ProcessRegistry {
        ProcessRegistry::new(dir.join("processes.json"), "llama-server", table)
    }

    fn read_document(path: &Path) -> RegistryDocument {
        let raw = std::fs::read(path).expect("registry file should exist");
        serde_json::from_slice(&raw).expect("registry file should parse")
    }

    async fn seed(path: &Path, entries: Vec<RegistryEntry>) {
        let mut document = RegistryDocument::default();
        for entry in entries {
            document.processes.insert(entry.gpu_set.clone(), entry);
        }
        write_document(path, &document)
            .await
            .expect("should seed registry file");
    }

    #[test(tokio::test)]
    async fn register_and_unregister_rewrite_document() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let registry = registry(dir.path(), Arc::new(FakeProcessTable::new()));

        registry.register(entry("0", 11)).await.expect("should register");
        registry.register(entry("1", 12)).await.expect("should register");
        registry.unregister("0").await.expect("should unregister");

        let document = read_document(registry.path());
        assert_eq!(document.processes.keys().collect::<Vec<_>>(), vec!["1"]);
        assert!(
            !with_suffix(registry.path(), ".tmp").exists(),
            "temporary file must be renamed away"
        );
    }

    #[test(tokio::test)]
    async fn status_update_only_applies_to_the_recorded_pid() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let registry = registry(dir.path(), Arc::new(FakeProcessTable::new()));
        registry.register(entry("0", 21)).await.expect("should register");

        registry
            .update_status("0", 20, InstanceState::Crashed)
            .await
            .expect("stale update should not fail");
        let current = registry.get("0").await.expect("entry should remain");
        assert_eq!(current.status, InstanceState::Running);

        registry
            .update_status("0", 21, InstanceState::Crashed)
            .await
            .expect("should update status");
        assert_eq!(
            read_document(registry.path()).processes["0"].status,
            InstanceState::Crashed
        );
    }

    #[test(tokio::test)]
    async fn failed_write_marks_dirty_and_flush_retries() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let blocker = dir.path().join("data");
        std::fs::write(&blocker, b"not a directory").expect("should create blocker");
        let registry = ProcessRegistry::new(
            blocker.join("processes.json"),
            "llama-server",
            Arc::new(FakeProcessTable::new()),
        );

        let result = registry.register(entry("0", 11)).await;
        assert!(result.is_err(), "write under a regular file must fail");
        assert!(registry.is_dirty().await);
        assert_eq!(registry.snapshot().await.len(), 1, "memory stays authoritative");

        std::fs::remove_file(&blocker).expect("should remove blocker");
        registry.flush().await.expect("retry should succeed");

        assert!(!registry.is_dirty().await);
        assert!(read_document(registry.path()).processes.contains_key("0"));
    }

    #[test(tokio::test)]
    async fn corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let registry = registry(dir.path(), Arc::new(FakeProcessTable::new()));
        std::fs::write(registry.path(), b"{ not json").expect("should write corrupt file");

        let adopted = registry
            .recover_on_startup(&Allocator::new(2, PortPolicy::default()))
            .await;

        assert!(adopted.is_empty());
        assert!(registry.snapshot().await.is_empty());
        let quarantined = std::fs::read_dir(dir.path())
            .expect("should list dir")
            .filter_map(|entry| entry.ok())
            .any(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("processes.json.corrupt-")
            });
        assert!(quarantined, "corrupt file should be renamed aside");
    }

    #[test(tokio::test)]
    async fn recovery_adopts_live_and_discards_stale_entries() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let table = Arc::new(FakeProcessTable::new());
        let live = table.add_process("llama-server");
        let foreign = table.add_process("postgres");
        let reused = table.add_process("llama-server");
        let registry = registry(dir.path(), table.clone());

        let mut reused_entry = entry("2", reused);
        reused_entry.process_start_time = Some(1);
        seed(
            registry.path(),
            vec![
                entry("0", live),
                entry("1", 4242),
                reused_entry,
                entry("3", foreign),
                entry("9", live),
            ],
        )
        .await;

        let adopted = registry
            .recover_on_startup(&Allocator::new(4, PortPolicy::default()))
            .await;

        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].0.key(), "0");
        assert_eq!(adopted[0].1.pid, live);
        assert_eq!(adopted[0].1.status, InstanceState::Running);
        let persisted = read_document(registry.path());
        assert_eq!(persisted.processes.keys().collect::<Vec<_>>(), vec!["0"]);
        assert!(table.signals().is_empty(), "recovery never signals processes");
    }

    #[test(tokio::test)]
    async fn recovery_skips_overlapping_keys() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let table = Arc::new(FakeProcessTable::new());
        let first = table.add_process("llama-server");
        let second = table.add_process("llama-server");
        let registry = registry(dir.path(), table);
        seed(registry.path(), vec![entry("0", first), entry("0,1", second)]).await;

        let adopted = registry
            .recover_on_startup(&Allocator::new(2, PortPolicy::default()))
            .await;

        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].0.key(), "0");
    }

    #[test(tokio::test)]
    async fn orphans_exclude_tracked_pids() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let table = Arc::new(FakeProcessTable::new());
        let registry = registry(dir.path(), table.clone());

        let tracked: Vec<u32> = (0..3).map(|_| table.add_process("llama-server")).collect();
        let untracked: Vec<u32> = (0..2).map(|_| table.add_process("llama-server")).collect();
        table.add_process("bash");
        for (i, pid) in tracked.iter().take(2).enumerate() {
            registry
                .register(entry(&i.to_string(), *pid))
                .await
                .expect("should register");
        }
        let in_table: HashSet<u32> = [tracked[2]].into_iter().collect();

        let orphans = registry
            .find_orphans("llama-server", &in_table)
            .await
            .expect("should scan");

        assert_eq!(orphans, untracked);
    }

    #[test(tokio::test)]
    async fn own_pid_is_never_an_orphan() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let table = Arc::new(FakeProcessTable::new());
        table.insert(ProcessIdentity {
            pid: std::process::id(),
            name: "llama-server".to_string(),
            exe: None,
            start_time: None,
        });
        let registry = registry(dir.path(), table);

        let orphans = registry
            .find_orphans("llama-server", &HashSet::new())
            .await
            .expect("should scan");
        assert!(orphans.is_empty());
    }

    #[test(tokio::test)]
    async fn cleanup_reports_partial_failures() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let table = Arc::new(FakeProcessTable::new());
        let registry = registry(dir.path(), table.clone());
        let killable = table.add_process("llama-server");
        let stubborn = table.add_process("llama-server");
        table.deny_signals(stubborn);

        let report = registry
            .cleanup_orphans(true, Duration::from_millis(50), &HashSet::new())
            .await
            .expect("cleanup should return a report");

        assert_eq!(report.found, 2);
        assert_eq!(report.killed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].pid, stubborn);
        assert_eq!(table.alive_pids(), vec![stubborn]);
        assert_eq!(table.signals(), vec![(killable, crate::domain::types::Signal::Kill)]);
    }
}
