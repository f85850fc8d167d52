//! The task manager: owns every tracked main task, its active subtask, its
//! instance, and its worktree; drives each main task's sequential loop;
//! and runs the periodic health check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::executor::{run_sub_task, ExecutorError};
use crate::instance::{Instance, InstanceOptions};
use crate::storage::TaskStore;
use crate::task::{update_sub_task_status, validate_main_task, MainTask, SubTask, TaskStatus};
use crate::webhook::payload;
use crate::webhook::{WebhookClient, WebhookQueue};
use crate::worktree::WorktreeDriver;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Constructs the [`Instance`] used to run a subtask. Boxed so the manager
/// does not depend on a concrete instance implementation.
pub type InstanceFactory = Arc<dyn Fn() -> Box<dyn Instance> + Send + Sync>;

struct Shared {
    main_tasks: RwLock<HashMap<String, MainTask>>,
    active_sub_tasks: RwLock<HashMap<String, String>>, // subtask id -> main task id
    instances: RwLock<HashMap<String, Arc<dyn Instance>>>,
    worktree_driver: Arc<dyn WorktreeDriver>,
    instance_factory: InstanceFactory,
    webhook_queue: RwLock<Option<WebhookQueue>>,
    task_store: RwLock<Option<Arc<dyn TaskStore>>>,
    cancel: CancellationToken,
}

/// Owns the engine's mutable state and drives main tasks to completion.
///
/// Cloning a `TaskManager` shares the same underlying state (it is a thin
/// `Arc` handle), matching the single-owner-with-shared-lock model in
/// SPEC_FULL.md section 5.
#[derive(Clone)]
pub struct TaskManager {
    shared: Arc<Shared>,
    loops: Arc<RwLock<Vec<JoinHandle<()>>>>,
    health_check: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl TaskManager {
    pub fn new(worktree_driver: Arc<dyn WorktreeDriver>, instance_factory: InstanceFactory) -> Self {
        let shared = Shared {
            main_tasks: RwLock::new(HashMap::new()),
            active_sub_tasks: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            worktree_driver,
            instance_factory,
            webhook_queue: RwLock::new(None),
            task_store: RwLock::new(None),
            cancel: CancellationToken::new(),
        };
        Self {
            shared: Arc::new(shared),
            loops: Arc::new(RwLock::new(Vec::new())),
            health_check: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the webhook queue and the periodic health-check loop. Must be
    /// called before [`Self::execute`].
    pub async fn start(&self, webhook_client: WebhookClient, queue_config: crate::webhook::WebhookQueueConfig) {
        let queue = WebhookQueue::start(webhook_client, queue_config, self.shared.cancel.clone());
        *self.shared.webhook_queue.write().await = Some(queue);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.health_check_loop().await });
        *self.health_check.write().await = Some(handle);
    }

    /// Configure the [`TaskStore`] used to persist a snapshot of each main
    /// task after its loop reaches a terminal status. Optional -- with no
    /// store configured, completed tasks are only ever visible in memory
    /// via [`Self::get`]/[`Self::list`].
    pub async fn set_task_store(&self, store: Arc<dyn TaskStore>) {
        *self.shared.task_store.write().await = Some(store);
    }

    /// Validate, register, set up the worktree, and launch the main-task
    /// loop in the background. Returns once worktree setup succeeds (or
    /// fails); the loop itself runs asynchronously.
    pub async fn execute(&self, mut mt: MainTask) -> Result<(), EngineError> {
        validate_main_task(&mt)?;

        {
            let tasks = self.shared.main_tasks.read().await;
            if tasks.contains_key(&mt.id) {
                return Err(EngineError::AlreadyTracked(mt.id));
            }
        }

        let repo_path = std::path::PathBuf::from(&mt.repo_path);
        let info = self
            .shared
            .worktree_driver
            .setup(&mt.id, &repo_path)
            .await?;
        mt.worktree_path = info.path.to_string_lossy().to_string();
        mt.branch_name = info.branch.unwrap_or_else(|| self.shared.worktree_driver.branch_name(&mt.id));

        let id = mt.id.clone();
        self.shared.main_tasks.write().await.insert(id.clone(), mt);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_main_task_loop(id).await });
        self.loops.write().await.push(handle);

        Ok(())
    }

    /// Cancel everything, kill every tracked instance, clean every tracked
    /// worktree, and wait for the health-check loop and webhook queue to
    /// finish.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();

        let instance_ids: Vec<String> = self.shared.instances.read().await.keys().cloned().collect();
        for sub_task_id in instance_ids {
            self.cleanup_sub_task(&sub_task_id).await;
        }

        let main_task_ids: Vec<String> = self.shared.main_tasks.read().await.keys().cloned().collect();
        for id in main_task_ids {
            let repo_path = {
                let tasks = self.shared.main_tasks.read().await;
                tasks.get(&id).map(|mt| mt.repo_path.clone())
            };
            if let Some(repo_path) = repo_path {
                let _ = self
                    .shared
                    .worktree_driver
                    .cleanup(&id, std::path::Path::new(&repo_path))
                    .await;
            }
            self.shared.main_tasks.write().await.remove(&id);
        }

        if let Some(queue) = self.shared.webhook_queue.write().await.take() {
            queue.stop().await;
        }

        if let Some(handle) = self.health_check.write().await.take() {
            let _ = handle.await;
        }
        for handle in self.loops.write().await.drain(..) {
            let _ = handle.await;
        }
    }

    pub async fn get(&self, id: &str) -> Option<MainTask> {
        self.shared.main_tasks.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<MainTask> {
        self.shared.main_tasks.read().await.values().cloned().collect()
    }

    pub async fn list_active_sub_tasks(&self) -> Vec<String> {
        self.shared.active_sub_tasks.read().await.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Main-task loop
    // ------------------------------------------------------------------

    async fn run_main_task_loop(&self, main_task_id: String) {
        {
            let mut tasks = self.shared.main_tasks.write().await;
            if let Some(mt) = tasks.get_mut(&main_task_id) {
                mt.status = TaskStatus::Running;
            }
        }

        let sub_task_ids: Vec<String> = {
            let tasks = self.shared.main_tasks.read().await;
            tasks
                .get(&main_task_id)
                .map(|mt| mt.sub_tasks.iter().map(|s| s.id.clone()).collect())
                .unwrap_or_default()
        };

        let mut failed = false;
        for sub_task_id in sub_task_ids {
            if self.shared.cancel.is_cancelled() {
                break;
            }
            match self.execute_sub_task(&main_task_id, &sub_task_id).await {
                Ok(()) => {}
                Err(e) => {
                    let mut tasks = self.shared.main_tasks.write().await;
                    if let Some(mt) = tasks.get_mut(&main_task_id) {
                        mt.status = TaskStatus::Failed;
                        mt.error_message = format!("SubTask {sub_task_id} failed: {e}");
                        mt.completed_at = Some(chrono::Utc::now());
                    }
                    failed = true;
                    break;
                }
            }
        }

        let final_payload = {
            let tasks = self.shared.main_tasks.read().await;
            tasks.get(&main_task_id).map(|mt| {
                if failed {
                    payload::main_task_failed(mt)
                } else {
                    payload::main_task_completed(mt)
                }
            })
        };

        if let (Some(p), Some(url)) = (
            final_payload,
            self.shared
                .main_tasks
                .read()
                .await
                .get(&main_task_id)
                .map(|mt| mt.webhook_url.clone()),
        ) {
            self.enqueue_webhook(url, p).await;
        }

        self.cleanup_main_task(&main_task_id).await;
    }

    async fn execute_sub_task(&self, main_task_id: &str, sub_task_id: &str) -> Result<(), ExecutorError> {
        {
            let mut tasks = self.shared.main_tasks.write().await;
            if let Some(mt) = tasks.get_mut(main_task_id) {
                update_sub_task_status(mt, sub_task_id, |s| s.mark_running());
            }
        }
        self.shared
            .active_sub_tasks
            .write()
            .await
            .insert(sub_task_id.to_string(), main_task_id.to_string());

        self.emit_sub_task_event(main_task_id, sub_task_id, SubTaskEvent::Started)
            .await;

        let (opts, prompt, timeout, markers) = {
            let tasks = self.shared.main_tasks.read().await;
            let mt = tasks.get(main_task_id).expect("main task must be tracked");
            let st = mt
                .sub_tasks
                .iter()
                .find(|s| s.id == sub_task_id)
                .expect("subtask must belong to main task");
            (
                InstanceOptions {
                    title: format!("{main_task_id}-{sub_task_id}"),
                    path: mt.worktree_path.clone(),
                    program: st.program.clone(),
                    auto_yes: true,
                },
                st.prompt.clone(),
                st.timeout.clone(),
                st.completion_markers.clone(),
            )
        };

        let instance: Arc<dyn Instance> = Arc::from((self.shared.instance_factory)());

        let result = match instance.start(&opts, true).await {
            Err(e) => Err(ExecutorError::StartFailed(e.to_string())),
            Ok(()) => {
                // Register before `send_prompt` so a health check can observe
                // this instance for the entire time its subtask is active.
                self.shared
                    .instances
                    .write()
                    .await
                    .insert(sub_task_id.to_string(), instance.clone());

                run_sub_task(instance.as_ref(), &prompt, &timeout, &markers, &self.shared.cancel).await
            }
        };

        match &result {
            Ok(outcome) => {
                let mut tasks = self.shared.main_tasks.write().await;
                if let Some(mt) = tasks.get_mut(main_task_id) {
                    update_sub_task_status(mt, sub_task_id, |s| {
                        s.mark_completed(outcome.output.clone())
                    });
                }
                drop(tasks);
                self.emit_sub_task_event(main_task_id, sub_task_id, SubTaskEvent::CompletedSuccess)
                    .await;
            }
            Err(ExecutorError::TimedOut(_)) => {
                let mut tasks = self.shared.main_tasks.write().await;
                if let Some(mt) = tasks.get_mut(main_task_id) {
                    update_sub_task_status(mt, sub_task_id, |s| s.mark_timed_out());
                }
                drop(tasks);
                self.emit_sub_task_event(main_task_id, sub_task_id, SubTaskEvent::CompletedTimeout)
                    .await;
            }
            Err(e) => {
                let mut tasks = self.shared.main_tasks.write().await;
                if let Some(mt) = tasks.get_mut(main_task_id) {
                    update_sub_task_status(mt, sub_task_id, |s| s.mark_failed(e.to_string()));
                }
                drop(tasks);
                self.emit_sub_task_event(main_task_id, sub_task_id, SubTaskEvent::CompletedFailed)
                    .await;
            }
        }

        self.cleanup_sub_task(sub_task_id).await;

        result.map(|_| ())
    }

    async fn emit_sub_task_event(&self, main_task_id: &str, sub_task_id: &str, event: SubTaskEvent) {
        let (payload, url) = {
            let tasks = self.shared.main_tasks.read().await;
            let Some(mt) = tasks.get(main_task_id) else {
                return;
            };
            let Some(st) = mt.sub_tasks.iter().find(|s| s.id == sub_task_id) else {
                return;
            };
            let p = match event {
                SubTaskEvent::Started => payload::sub_task_started(mt, st),
                SubTaskEvent::CompletedSuccess => payload::sub_task_completed_success(mt, st),
                SubTaskEvent::CompletedFailed => payload::sub_task_completed_failed(mt, st),
                SubTaskEvent::CompletedTimeout => payload::sub_task_completed_timeout(mt, st),
            };
            (p, mt.webhook_url.clone())
        };
        self.enqueue_webhook(url, payload).await;
    }

    async fn enqueue_webhook(&self, url: String, payload: payload::WebhookPayload) {
        let queue = self.shared.webhook_queue.read().await;
        if let Some(queue) = queue.as_ref() {
            if let Err(e) = queue.enqueue(url, payload) {
                tracing::warn!(error = %e, "failed to enqueue webhook delivery");
            }
        }
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    async fn cleanup_sub_task(&self, sub_task_id: &str) {
        self.shared.active_sub_tasks.write().await.remove(sub_task_id);

        // Take the instance out from under the lock, then kill it with the
        // lock released -- `instance.kill()` must not run while holding the
        // `instances` write lock, since the health-check loop needs a read
        // lock on the same map.
        let instance = self.shared.instances.write().await.remove(sub_task_id);
        if let Some(instance) = instance {
            if let Err(e) = instance.kill().await {
                tracing::error!(sub_task_id, error = %e, "failed to kill instance during cleanup");
            }
        }
    }

    async fn cleanup_main_task(&self, main_task_id: &str) {
        let repo_path = {
            let tasks = self.shared.main_tasks.read().await;
            tasks.get(main_task_id).map(|mt| mt.repo_path.clone())
        };
        if let Some(repo_path) = repo_path {
            if let Err(e) = self
                .shared
                .worktree_driver
                .cleanup(main_task_id, std::path::Path::new(&repo_path))
                .await
            {
                tracing::error!(main_task_id, error = %e, "failed to clean up worktree");
            }
        }

        let snapshot = self.shared.main_tasks.read().await.get(main_task_id).cloned();
        if let (Some(snapshot), Some(store)) =
            (snapshot, self.shared.task_store.read().await.as_ref())
        {
            if let Err(e) = store.save(&snapshot) {
                tracing::error!(main_task_id, error = %e, "failed to persist task snapshot");
            }
        }
    }

    // ------------------------------------------------------------------
    // Health check
    // ------------------------------------------------------------------

    async fn health_check_loop(&self) {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.health_check().await,
                _ = self.shared.cancel.cancelled() => return,
            }
        }
    }

    async fn health_check(&self) {
        let instances = self.shared.instances.read().await;
        for (sub_task_id, instance) in instances.iter() {
            if !instance.tmux_alive().await {
                tracing::warn!(sub_task_id, "instance session is not alive");
            }
        }
    }
}

enum SubTaskEvent {
    Started,
    CompletedSuccess,
    CompletedFailed,
    CompletedTimeout,
}
