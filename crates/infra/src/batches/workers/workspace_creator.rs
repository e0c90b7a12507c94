//! Resolves a batch spec into the repository workspaces it will run in.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use batchforge_batches::{
    BatchSpecResolutionJob, BatchSpecWorkspace, ResolveOptions, WorkspaceResolver,
};

use crate::batches::store::BatchesTx;
use crate::jobs::{Handler, HandlerError, QueueRecord};

/// Handler for batch spec resolution jobs.
///
/// All workspaces of one job are written through the job's transaction, so
/// a failure anywhere leaves no workspace behind.
pub struct WorkspaceCreator {
    resolver: Arc<dyn WorkspaceResolver>,
}

impl WorkspaceCreator {
    pub fn new(resolver: Arc<dyn WorkspaceResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl<Tx: BatchesTx> Handler<BatchSpecResolutionJob, Tx> for WorkspaceCreator {
    async fn handle(
        &self,
        tx: &mut Tx,
        record: &QueueRecord<BatchSpecResolutionJob>,
    ) -> Result<(), HandlerError> {
        let job = &record.payload;
        let spec = tx.get_batch_spec(job.batch_spec_id).await?;
        let document = spec.parse().map_err(HandlerError::retryable)?;

        let opts = ResolveOptions {
            allow_unsupported: job.allow_unsupported,
            allow_ignored: job.allow_ignored,
        };
        let resolution = self.resolver.resolve(&document, opts).await?;
        debug!(
            batch_spec_id = %job.batch_spec_id,
            unsupported = resolution.unsupported.len(),
            ignored = resolution.ignored.len(),
            "resolved workspaces"
        );

        let workspaces: Vec<BatchSpecWorkspace> = resolution
            .workspaces
            .into_iter()
            .map(|ws| BatchSpecWorkspace::from_resolved(job.batch_spec_id, ws))
            .collect();
        let ids = tx.create_batch_spec_workspaces(&workspaces).await?;

        info!(
            record_id = record.id,
            batch_spec_id = %job.batch_spec_id,
            workspaces = ids.len(),
            "created batch spec workspaces"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use batchforge_batches::{BatchSpec, BatchSpecDocument, Changeset, RepoWorkspace, Resolution};
    use batchforge_core::{BatchSpecId, ChangesetId, RepoId, UserId, WorkspaceId};

    use super::*;
    use crate::batches::store::fixtures::batch_spec;
    use crate::batches::store::{InMemoryBatchesStore, InMemoryBatchesTx};
    use crate::jobs::{
        InMemoryStore, Processed, QueueOptions, RecordState, StoreError, Transact, Worker,
        WorkerConfig,
    };

    const SPEC: &str = r#"
name: hello-world
on:
  - repositoriesMatchingQuery: file:README.md
steps:
  - run: echo Hello >> README.md
    container: alpine:3
changesetTemplate:
  title: Hello World
  body: My first batch change!
  branch: hello-world
  commit:
    message: Append Hello to all README.md files
"#;

    /// Resolves to one workspace per repo, with per-repo values in every field.
    struct FixedResolver {
        repos: Vec<i64>,
        seen: Mutex<Option<ResolveOptions>>,
        returned: Mutex<Vec<RepoWorkspace>>,
    }

    impl FixedResolver {
        fn new(repos: Vec<i64>) -> Arc<Self> {
            Arc::new(Self {
                repos,
                seen: Mutex::new(None),
                returned: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl WorkspaceResolver for FixedResolver {
        async fn resolve(
            &self,
            spec: &BatchSpecDocument,
            opts: ResolveOptions,
        ) -> anyhow::Result<Resolution> {
            *self.seen.lock().unwrap() = Some(opts);
            let workspaces: Vec<RepoWorkspace> = self
                .repos
                .iter()
                .enumerate()
                .map(|(i, &repo)| RepoWorkspace {
                    repo_id: RepoId::new(repo),
                    branch: format!("refs/heads/release-{repo}"),
                    commit: format!("c{repo}"),
                    path: if i % 2 == 0 { String::new() } else { format!("services/{repo}") },
                    file_matches: (0..=i).map(|n| format!("dir{n}/README.md")).collect(),
                    steps: spec.steps.clone(),
                    only_fetch_workspace: i % 2 == 1,
                    unsupported: repo == 5,
                    ignored: false,
                })
                .collect();
            *self.returned.lock().unwrap() = workspaces.clone();
            Ok(Resolution {
                workspaces,
                unsupported: vec![RepoId::new(5)],
                ignored: vec![],
            })
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl WorkspaceResolver for FailingResolver {
        async fn resolve(
            &self,
            _: &BatchSpecDocument,
            _: ResolveOptions,
        ) -> anyhow::Result<Resolution> {
            anyhow::bail!("search backend unavailable")
        }
    }

    /// In-memory tables whose connection drops on the `fail_at`-th workspace insert.
    struct DroppingStore {
        inner: Arc<InMemoryBatchesStore>,
        fail_at: usize,
    }

    struct DroppingTx {
        inner: InMemoryBatchesTx,
        fail_at: usize,
    }

    #[async_trait]
    impl Transact for DroppingStore {
        type Tx = DroppingTx;

        async fn begin(&self) -> Result<DroppingTx, StoreError> {
            Ok(DroppingTx {
                inner: self.inner.begin().await?,
                fail_at: self.fail_at,
            })
        }

        async fn commit(&self, tx: DroppingTx) -> Result<(), StoreError> {
            self.inner.commit(tx.inner).await
        }

        async fn rollback(&self, tx: DroppingTx) -> Result<(), StoreError> {
            self.inner.rollback(tx.inner).await
        }
    }

    #[async_trait]
    impl BatchesTx for DroppingTx {
        async fn get_batch_spec(&mut self, id: BatchSpecId) -> Result<BatchSpec, StoreError> {
            self.inner.get_batch_spec(id).await
        }

        async fn create_batch_spec_workspaces(
            &mut self,
            workspaces: &[BatchSpecWorkspace],
        ) -> Result<Vec<WorkspaceId>, StoreError> {
            let written = workspaces.len().min(self.fail_at - 1);
            self.inner.create_batch_spec_workspaces(&workspaces[..written]).await?;
            if written < workspaces.len() {
                return Err(StoreError::Transient("connection reset".into()));
            }
            Ok(Vec::new())
        }

        async fn get_changeset(&mut self, id: ChangesetId) -> Result<Changeset, StoreError> {
            self.inner.get_changeset(id).await
        }

        async fn update_changeset(&mut self, changeset: &Changeset) -> Result<(), StoreError> {
            self.inner.update_changeset(changeset).await
        }

        async fn set_pending_batch_spec_result(
            &mut self,
            id: i64,
            rand_id: &str,
        ) -> Result<(), StoreError> {
            self.inner.set_pending_batch_spec_result(id, rand_id).await
        }
    }

    type Queue = InMemoryStore<BatchSpecResolutionJob>;

    fn job() -> BatchSpecResolutionJob {
        BatchSpecResolutionJob {
            batch_spec_id: BatchSpecId::new(1),
            initiator_id: UserId::new(1),
            allow_unsupported: true,
            allow_ignored: false,
        }
    }

    fn queue() -> Arc<Queue> {
        let queue = Arc::new(InMemoryStore::new(QueueOptions::new("resolution", "jobs")));
        queue.enqueue(QueueRecord::queued(1, job())).unwrap();
        queue
    }

    fn harness(
        raw_spec: &str,
        resolver: Arc<dyn WorkspaceResolver>,
    ) -> (
        Arc<Queue>,
        Arc<InMemoryBatchesStore>,
        Worker<BatchSpecResolutionJob, Queue, InMemoryBatchesStore, WorkspaceCreator>,
    ) {
        let queue = queue();
        let batches = Arc::new(InMemoryBatchesStore::new());
        batches.insert_batch_spec(batch_spec(1, raw_spec)).unwrap();
        let worker = Worker::new(
            queue.clone(),
            batches.clone(),
            Arc::new(WorkspaceCreator::new(resolver)),
            WorkerConfig::default(),
        );
        (queue, batches, worker)
    }

    #[tokio::test]
    async fn persists_one_workspace_per_resolved_repo() {
        let resolver = FixedResolver::new(vec![4, 5, 6]);
        let (queue, batches, worker) = harness(SPEC, resolver.clone());

        assert_eq!(worker.process_next().await.unwrap(), Some(Processed::Completed));

        let expected: Vec<BatchSpecWorkspace> = resolver
            .returned
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(|ws| BatchSpecWorkspace::from_resolved(BatchSpecId::new(1), ws))
            .collect();
        let created = batches.workspaces(BatchSpecId::new(1)).unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(created, expected);
        assert_eq!(created[1].path, "services/5");
        assert!(created[1].only_fetch_workspace && created[1].unsupported);
        assert_eq!(created[2].file_matches.len(), 3);
        assert_eq!(created[0].steps.len(), 1);
        assert!(created.iter().all(|ws| ws.changeset_spec_ids.is_empty()));

        assert_eq!(
            *resolver.seen.lock().unwrap(),
            Some(ResolveOptions { allow_unsupported: true, allow_ignored: false })
        );
        assert_eq!(queue.get(1).unwrap().unwrap().state, RecordState::Completed);
    }

    #[tokio::test]
    async fn empty_resolution_completes_without_rows() {
        let (_, batches, worker) = harness(SPEC, FixedResolver::new(vec![]));

        assert_eq!(worker.process_next().await.unwrap(), Some(Processed::Completed));
        assert!(batches.workspaces(BatchSpecId::new(1)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_midway_through_inserts_commits_nothing() {
        let queue = queue();
        let batches = Arc::new(InMemoryBatchesStore::new());
        batches.insert_batch_spec(batch_spec(1, SPEC)).unwrap();
        let worker = Worker::new(
            queue.clone(),
            Arc::new(DroppingStore { inner: batches.clone(), fail_at: 3 }),
            Arc::new(WorkspaceCreator::new(FixedResolver::new(vec![4, 5, 6, 7]))),
            WorkerConfig::default(),
        );

        assert_eq!(worker.process_next().await.unwrap(), Some(Processed::Requeued));
        assert!(batches.workspaces(BatchSpecId::new(1)).unwrap().is_empty());
        let r = queue.get(1).unwrap().unwrap();
        assert_eq!((r.state, r.attempts), (RecordState::Queued, 0));
    }

    #[tokio::test]
    async fn unparsable_spec_is_a_retryable_failure() {
        let resolver = FixedResolver::new(vec![1]);
        let (queue, batches, worker) = harness("name: [unterminated", resolver.clone());

        assert_eq!(worker.process_next().await.unwrap(), Some(Processed::Errored));
        let r = queue.get(1).unwrap().unwrap();
        assert_eq!((r.state, r.attempts), (RecordState::Queued, 1));
        assert!(r.failure_message.is_some());
        assert!(resolver.seen.lock().unwrap().is_none());
        assert!(batches.workspaces(BatchSpecId::new(1)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolver_error_leaves_no_workspaces() {
        let (queue, batches, worker) = harness(SPEC, Arc::new(FailingResolver));

        assert_eq!(worker.process_next().await.unwrap(), Some(Processed::Errored));
        assert_eq!(
            queue.get(1).unwrap().unwrap().failure_message.as_deref(),
            Some("search backend unavailable")
        );
        assert!(batches.workspaces(BatchSpecId::new(1)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_batch_spec_is_retried() {
        let queue = queue();
        let worker = Worker::new(
            queue.clone(),
            Arc::new(InMemoryBatchesStore::new()),
            Arc::new(WorkspaceCreator::new(FixedResolver::new(vec![1]))),
            WorkerConfig::default(),
        );

        assert_eq!(worker.process_next().await.unwrap(), Some(Processed::Errored));
        assert_eq!(queue.get(1).unwrap().unwrap().state, RecordState::Queued);
    }
}
