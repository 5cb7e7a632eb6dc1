//! Reconciliation pipeline: per-line tasks, fill-if-absent patching, and the
//! run coordinator.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sdr_core::SiteRecord;
use sdr_dump::{parse_dump_line, DumpError, LineAssembler};
use sdr_storage::{SiteStore, StoreError};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sdr-restore";

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// The two fields the fill-if-absent policy may touch. Each is considered
/// independently of the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileField {
    Address,
    Note,
}

impl ReconcileField {
    pub const ALL: [ReconcileField; 2] = [ReconcileField::Address, ReconcileField::Note];

    pub fn name(self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Note => "note",
        }
    }

    fn get(self, site: &SiteRecord) -> Option<&str> {
        match self {
            Self::Address => site.present_address(),
            Self::Note => site.present_note(),
        }
    }

    fn set(self, site: &mut SiteRecord, value: String) {
        let description = site.description.get_or_insert_with(Default::default);
        match self {
            Self::Address => description.address = Some(value),
            Self::Note => description.note = Some(value),
        }
    }
}

/// One staged fill, kept for narration and auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedField {
    pub field: &'static str,
    pub value: String,
}

/// Result of pushing one actionable line through the pipeline. Lines that do
/// not match the dump format produce no outcome at all.
#[derive(Debug)]
pub enum LineOutcome {
    NoSourceData,
    LookupFailed(StoreError),
    NoChangeNeeded,
    Updated { fields: Vec<StagedField> },
    UpdateFailed(StoreError),
    InvalidLine(DumpError),
}

/// Compute the fill-if-absent patch for one source/persisted pair.
///
/// The persisted record is the baseline; a field is staged only when the
/// source carries text for it and the persisted record does not. Returns the
/// merged record and the staged fills, empty when nothing needs to change.
pub fn plan_patch(source: &SiteRecord, persisted: &SiteRecord) -> (SiteRecord, Vec<StagedField>) {
    let label = persisted.label().to_string();
    let mut merged = persisted.clone();
    let mut staged = Vec::new();
    for field in ReconcileField::ALL {
        let Some(value) = field.get(source) else {
            debug!(site = %label, field = field.name(), "no source value for field");
            continue;
        };
        if field.get(persisted).is_some() {
            info!(site = %label, field = field.name(), "will not update field, already set");
            continue;
        }
        info!(site = %label, field = field.name(), value, "will update field");
        field.set(&mut merged, value.to_string());
        staged.push(StagedField {
            field: field.name(),
            value: value.to_string(),
        });
    }
    (merged, staged)
}

/// Reconcile one parsed source record against the store.
pub async fn reconcile_site(store: &dyn SiteStore, source: &SiteRecord, dry_run: bool) -> LineOutcome {
    if source.present_address().is_none() && source.present_note().is_none() {
        info!(site = %source.label(), "no address or note for site was found");
        return LineOutcome::NoSourceData;
    }

    let persisted = match store.find_by_id(&source.id).await {
        Ok(site) => site,
        Err(err) => {
            warn!(site = %source.label(), error = %err, "site lookup failed");
            return LineOutcome::LookupFailed(err);
        }
    };

    let (merged, staged) = plan_patch(source, &persisted);
    if staged.is_empty() {
        info!(site = %persisted.label(), "will not update site");
        return LineOutcome::NoChangeNeeded;
    }
    apply_patch(store, &merged, staged, dry_run).await
}

/// Persist a merged record carrying at least one staged fill. A write failure
/// is terminal for this record only.
pub async fn apply_patch(
    store: &dyn SiteStore,
    merged: &SiteRecord,
    fields: Vec<StagedField>,
    dry_run: bool,
) -> LineOutcome {
    let label = merged.label();
    if dry_run {
        info!(site = %label, staged = fields.len(), "dry run, skipping site update");
        return LineOutcome::Updated { fields };
    }
    match store.update(merged).await {
        Ok(()) => {
            info!(site = %label, "updated site");
            LineOutcome::Updated { fields }
        }
        Err(err) => {
            warn!(site = %label, error = %err, "failed to update site");
            LineOutcome::UpdateFailed(err)
        }
    }
}

/// Drive one raw line through parse and reconcile. `None` means the line did
/// not match the dump format and was skipped without comment.
pub async fn process_line(store: &dyn SiteStore, line: &str, dry_run: bool) -> Option<LineOutcome> {
    match parse_dump_line(line) {
        Ok(None) => None,
        Ok(Some(site)) => Some(reconcile_site(store, &site, dry_run).await),
        Err(err) => {
            warn!(line, error = %err, "invalid dump line");
            Some(LineOutcome::InvalidLine(err))
        }
    }
}

/// What one restore run did, assembled after every per-line task settled.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub lines_seen: usize,
    pub records_matched: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub no_source_data: usize,
    pub invalid_lines: usize,
    pub lookup_failures: usize,
    pub update_failures: usize,
}

impl RestoreSummary {
    fn tally(&mut self, outcome: &LineOutcome) {
        self.records_matched += 1;
        match outcome {
            LineOutcome::NoSourceData => self.no_source_data += 1,
            LineOutcome::LookupFailed(_) => self.lookup_failures += 1,
            LineOutcome::NoChangeNeeded => self.unchanged += 1,
            LineOutcome::Updated { .. } => self.updated += 1,
            LineOutcome::UpdateFailed(_) => self.update_failures += 1,
            LineOutcome::InvalidLine(_) => self.invalid_lines += 1,
        }
    }
}

/// Run coordinator: drains the dump stream, dispatches one task per line and
/// waits for all of them to settle.
///
/// Per-record failures are folded into outcomes inside each task; only
/// stream-level read errors (or a panicked task) abort the run.
pub struct RestoreRunner {
    store: Arc<dyn SiteStore>,
    dry_run: bool,
}

impl RestoreRunner {
    pub fn new(store: Arc<dyn SiteStore>) -> Self {
        Self {
            store,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run<R>(&self, mut input: R) -> Result<RestoreSummary>
    where
        R: AsyncRead + Unpin,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, dry_run = self.dry_run, "restore run started");

        let mut assembler = LineAssembler::new();
        let mut tasks: Vec<JoinHandle<Option<LineOutcome>>> = Vec::new();
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            let n = input.read(&mut buf).await.context("reading dump input")?;
            if n == 0 {
                break;
            }
            for line in assembler.push(&buf[..n]) {
                tasks.push(self.dispatch(line));
            }
        }
        tasks.push(self.dispatch(assembler.finish()));

        let mut summary = RestoreSummary {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run: self.dry_run,
            lines_seen: tasks.len(),
            records_matched: 0,
            updated: 0,
            unchanged: 0,
            no_source_data: 0,
            invalid_lines: 0,
            lookup_failures: 0,
            update_failures: 0,
        };
        // Await in dispatch order so outcomes form an ordered list; the task
        // bodies themselves interleave freely.
        for task in tasks {
            if let Some(outcome) = task.await.context("joining line task")? {
                summary.tally(&outcome);
            }
        }
        summary.finished_at = Utc::now();
        info!(
            %run_id,
            lines = summary.lines_seen,
            updated = summary.updated,
            "restore run finished"
        );
        Ok(summary)
    }

    fn dispatch(&self, line: String) -> JoinHandle<Option<LineOutcome>> {
        let store = Arc::clone(&self.store);
        let dry_run = self.dry_run;
        tokio::spawn(async move { process_line(store.as_ref(), &line, dry_run).await })
    }
}

/// What a parse-only pass over a dump saw.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckSummary {
    pub lines_seen: usize,
    pub records_parsed: usize,
    pub invalid_lines: usize,
}

impl CheckSummary {
    fn observe(&mut self, line: &str) {
        self.lines_seen += 1;
        match parse_dump_line(line) {
            Ok(None) => {}
            Ok(Some(site)) => {
                debug!(site = %site.label(), "parsed site record");
                self.records_parsed += 1;
            }
            Err(err) => {
                warn!(line, error = %err, "invalid dump line");
                self.invalid_lines += 1;
            }
        }
    }
}

/// Validation pass: parse every line of the dump, narrate the invalid ones,
/// touch no store.
pub async fn check_dump<R>(mut input: R) -> Result<CheckSummary>
where
    R: AsyncRead + Unpin,
{
    let mut assembler = LineAssembler::new();
    let mut summary = CheckSummary::default();
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        let n = input.read(&mut buf).await.context("reading dump input")?;
        if n == 0 {
            break;
        }
        for line in assembler.push(&buf[..n]) {
            summary.observe(&line);
        }
    }
    summary.observe(&assembler.finish());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use sdr_core::{Description, Identification};
    use sdr_storage::MemorySiteStore;

    fn site_with(id: &str, address: Option<&str>, note: Option<&str>) -> SiteRecord {
        SiteRecord {
            id: id.to_string(),
            description: Some(Description {
                address: address.map(str::to_string),
                note: note.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Store wrapper that counts calls and can be told to fail.
    #[derive(Default)]
    struct ProbeStore {
        inner: MemorySiteStore,
        fail_find: bool,
        fail_update: bool,
        finds: AtomicUsize,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl SiteStore for ProbeStore {
        async fn find_by_id(&self, id: &str) -> Result<SiteRecord, StoreError> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            if self.fail_find {
                return Err(StoreError::NotFound { id: id.to_string() });
            }
            self.inner.find_by_id(id).await
        }

        async fn update(&self, site: &SiteRecord) -> Result<(), StoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.fail_update {
                return Err(StoreError::NotFound {
                    id: site.id.clone(),
                });
            }
            self.inner.update(site).await
        }
    }

    #[test]
    fn existing_address_is_never_overwritten() {
        let source = site_with("a", Some("Dump St 1"), None);
        let persisted = site_with("a", Some("Existing Rd 9"), None);
        let (merged, staged) = plan_patch(&source, &persisted);
        assert!(staged.is_empty());
        assert_eq!(merged, persisted);
    }

    #[test]
    fn note_fills_into_a_record_without_a_description() {
        let source = site_with("a", None, Some("rear gate"));
        let mut persisted = SiteRecord {
            id: "a".to_string(),
            identification: Some(Identification {
                name: Some("Alpha".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        persisted
            .extra
            .insert("status".into(), serde_json::Value::from("active"));

        let (merged, staged) = plan_patch(&source, &persisted);
        assert_eq!(
            staged,
            vec![StagedField {
                field: "note",
                value: "rear gate".to_string()
            }]
        );
        assert_eq!(merged.present_note(), Some("rear gate"));
        assert_eq!(merged.identification, persisted.identification);
        assert_eq!(merged.extra, persisted.extra);
    }

    #[test]
    fn fields_are_considered_independently() {
        let source = site_with("a", Some("Dump St 1"), Some("rear gate"));
        let persisted = site_with("a", Some("Existing Rd 9"), None);
        let (merged, staged) = plan_patch(&source, &persisted);
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].field, "note");
        assert_eq!(merged.present_address(), Some("Existing Rd 9"));
        assert_eq!(merged.present_note(), Some("rear gate"));
    }

    #[test]
    fn empty_persisted_value_counts_as_absent() {
        let source = site_with("a", Some("Dump St 1"), None);
        let persisted = site_with("a", Some(""), None);
        let (merged, staged) = plan_patch(&source, &persisted);
        assert_eq!(staged.len(), 1);
        assert_eq!(merged.present_address(), Some("Dump St 1"));
    }

    #[test]
    fn replanning_a_merged_record_stages_nothing() {
        let source = site_with("a", Some("Dump St 1"), Some("rear gate"));
        let persisted = SiteRecord {
            id: "a".to_string(),
            ..Default::default()
        };
        let (merged, staged) = plan_patch(&source, &persisted);
        assert_eq!(staged.len(), 2);

        let (again, staged) = plan_patch(&source, &merged);
        assert!(staged.is_empty());
        assert_eq!(again, merged);
    }

    #[tokio::test]
    async fn source_without_data_skips_the_lookup() {
        let store = ProbeStore::default();
        let source = SiteRecord {
            id: "a".to_string(),
            ..Default::default()
        };
        let outcome = reconcile_site(&store, &source, false).await;
        assert!(matches!(outcome, LineOutcome::NoSourceData));
        assert_eq!(store.finds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lookup_failure_is_contained() {
        let store = ProbeStore {
            fail_find: true,
            ..Default::default()
        };
        let source = site_with("a", Some("Dump St 1"), None);
        let outcome = reconcile_site(&store, &source, false).await;
        assert!(matches!(outcome, LineOutcome::LookupFailed(_)));
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_failure_is_contained() {
        let store = ProbeStore {
            fail_update: true,
            ..Default::default()
        };
        store.inner.insert(site_with("a", None, None)).await;
        let source = site_with("a", Some("Dump St 1"), None);
        let outcome = reconcile_site(&store, &source, false).await;
        assert!(matches!(outcome, LineOutcome::UpdateFailed(_)));
        assert_eq!(store.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dry_run_plans_but_never_writes() {
        let store = ProbeStore::default();
        store.inner.insert(site_with("a", None, None)).await;
        let source = site_with("a", Some("Dump St 1"), None);
        let outcome = reconcile_site(&store, &source, true).await;
        assert!(matches!(outcome, LineOutcome::Updated { .. }));
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
        assert_eq!(store.inner.get("a").await.unwrap().present_address(), None);
    }

    #[tokio::test]
    async fn invalid_line_never_reaches_the_store() {
        let store = ProbeStore::default();
        let outcome = process_line(
            &store,
            "SET     site:'{\"description\":{\"address\":\"X\"}}'",
            false,
        )
        .await;
        assert!(matches!(outcome, Some(LineOutcome::InvalidLine(_))));
        assert_eq!(store.finds.load(Ordering::SeqCst), 0);

        let outcome = process_line(&store, "SET     site:'{not json}'", false).await;
        assert!(matches!(outcome, Some(LineOutcome::InvalidLine(_))));
        assert_eq!(store.finds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_line_produces_no_outcome() {
        let store = ProbeStore::default();
        let outcome = process_line(&store, "KEYS *", false).await;
        assert!(outcome.is_none());
        assert_eq!(store.finds.load(Ordering::SeqCst), 0);
    }
}
