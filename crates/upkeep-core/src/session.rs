//! One logged-in planner session
//!
//! Owns the tree, the recent completion set and the sync engine. Every
//! mutating operation validates first, changes memory, then enqueues the
//! affected chunks as a single write. Writes are not awaited; use
//! [`Session::settled`] to wait for them.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use upkeep_api::{
    Command, PLANNER_ITEMS_CHUNK, RECENT_COMPLETIONS_CHUNK, ResponsePayload, Transport,
    old_completions_chunk,
};
use upkeep_config::ClientSettings;
use upkeep_util::{CalendarDate, MonotonicInstant, TaskId};

use crate::{
    CHUNK_SCHEMA_VERSION, Category, Completion, CompletionForm, CompletionId, CompletionIds,
    CoreError, CoreResult, CredentialBundle, CredentialStore, ItemId, OldCompletionsChunk, Parent,
    PlainChunks, PlannerItem, PlannerTree, RecentCompletions, RecentCompletionsChunk, SaveState,
    SyncEngine, SyncError, Task, TaskForm, TaskStatus, check_due_date, decode_chunk, derive_key,
    encode_chunk, generate_salt, hash_password, insert_sorted, needs_flush, plan_flush, resort,
    status_of,
};

/// Name given to categories created without one
pub const NEW_CATEGORY_NAME: &str = "New Category";

/// Chunks touched by one operation
#[derive(Debug, Default)]
struct Dirty {
    planner: bool,
    recent: bool,
    archives: BTreeSet<TaskId>,
}

impl Dirty {
    fn planner() -> Self {
        Self {
            planner: true,
            ..Default::default()
        }
    }
}

pub struct Session {
    username: String,
    tree: PlannerTree,
    recent: RecentCompletions,
    completion_ids: CompletionIds,
    sync: SyncEngine,
    flush_threshold: usize,
    today_override: Option<CalendarDate>,
}

impl Session {
    /// Start the sync engine for a saved bundle and load the planner.
    ///
    /// `transport` must already be bound to the bundle's account.
    pub async fn open(
        transport: Arc<dyn Transport>,
        bundle: &CredentialBundle,
        settings: &ClientSettings,
    ) -> CoreResult<Self> {
        let salts = match transport
            .call(Command::GetSalts)
            .await
            .map_err(SyncError::from)?
        {
            ResponsePayload::Salts(salts) => salts,
            _ => return Err(SyncError::UnexpectedResponse("get_salts").into()),
        };
        if salts.key_version != bundle.key_version {
            return Err(CoreError::KeyVersionMismatch {
                saved: bundle.key_version,
                current: salts.key_version,
            });
        }

        let sync = SyncEngine::new(
            transport,
            derive_key(&bundle.key_hash),
            salts.key_version,
            salts.chunks_version,
            settings.saved_indicator,
        );
        let mut session = Self {
            username: bundle.username.clone(),
            tree: PlannerTree::new(),
            recent: RecentCompletions::new(),
            completion_ids: CompletionIds::default(),
            sync,
            flush_threshold: settings.flush_threshold,
            today_override: None,
        };
        session.load().await?;
        Ok(session)
    }

    async fn load(&mut self) -> CoreResult<()> {
        let mut chunks = self
            .sync
            .get_chunks(vec![
                PLANNER_ITEMS_CHUNK.to_string(),
                RECENT_COMPLETIONS_CHUNK.to_string(),
            ])
            .await?;

        self.tree = match chunks.remove(PLANNER_ITEMS_CHUNK).flatten() {
            Some(value) => PlannerTree::from_chunk(decode_chunk(PLANNER_ITEMS_CHUNK, value)?)?,
            None => PlannerTree::new(),
        };

        if let Some(value) = chunks.remove(RECENT_COMPLETIONS_CHUNK).flatten() {
            let chunk: RecentCompletionsChunk = decode_chunk(RECENT_COMPLETIONS_CHUNK, value)?;
            for record in &chunk.completions {
                let Some(item) = self.tree.find_task(record.task_id) else {
                    warn!(task_id = %record.task_id, "Dropping completion of unknown task");
                    continue;
                };
                let completion =
                    Completion::from_recent_record(self.completion_ids.allocate(), record)?;
                self.recent.insert(&completion);
                insert_sorted(&mut self.tree.task_mut(item)?.completions, completion);
            }
        }

        let today = self.today();
        let mut changed = false;
        for item in self.tree.all_tasks() {
            changed |= check_due_date(self.tree.task_mut(item)?, false, today);
        }
        if changed {
            debug!("Due dates moved since last save");
            self.persist(Dirty::planner())?;
        }

        info!(
            username = %self.username,
            tasks = self.tree.all_tasks().len(),
            recent = self.recent.len(),
            chunks_version = self.sync.chunks_version(),
            "Planner loaded"
        );
        Ok(())
    }

    // Accessors

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn tree(&self) -> &PlannerTree {
        &self.tree
    }

    pub fn recent(&self) -> &RecentCompletions {
        &self.recent
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    /// Today's date, unless pinned
    pub fn today(&self) -> CalendarDate {
        self.today_override.unwrap_or_else(CalendarDate::today)
    }

    /// Evaluate dates against `date` instead of the wall clock
    pub fn pin_today(&mut self, date: CalendarDate) {
        self.today_override = Some(date);
    }

    pub fn status(&self, item: ItemId) -> CoreResult<TaskStatus> {
        Ok(status_of(self.tree.task(item)?, self.today()))
    }

    pub fn save_state(&self) -> SaveState {
        self.sync.save_state(MonotonicInstant::now())
    }

    /// Wait for every enqueued write
    pub async fn settled(&self) -> CoreResult<()> {
        Ok(self.sync.settled().await?)
    }

    /// Re-run the due-date check for every task, e.g. after midnight
    pub fn refresh_due_dates(&mut self) -> CoreResult<bool> {
        self.ensure_writable()?;
        let today = self.today();
        let mut changed = false;
        for item in self.tree.all_tasks() {
            changed |= check_due_date(self.tree.task_mut(item)?, false, today);
        }
        if changed {
            self.persist(Dirty::planner())?;
        }
        Ok(changed)
    }

    // Tasks

    pub fn create_task(
        &mut self,
        parent: Parent,
        form: &TaskForm,
        index: Option<usize>,
    ) -> CoreResult<ItemId> {
        self.ensure_writable()?;
        let fields = form.validate()?;
        self.tree.children(parent)?;

        let mut task = Task::new(self.tree.allocate_task_id(), String::new());
        fields.apply(&mut task);
        check_due_date(&mut task, false, self.today());
        let task_id = task.id;
        let item = self.tree.add_item(parent, PlannerItem::Task(task), index)?;

        debug!(task_id = %task_id, "Task created");
        self.persist(Dirty::planner())?;
        Ok(item)
    }

    pub fn update_task(&mut self, item: ItemId, form: &TaskForm) -> CoreResult<()> {
        self.ensure_writable()?;
        let fields = form.validate()?;
        let today = self.today();
        let task = live_task(&mut self.tree, item)?;
        fields.apply(task);
        check_due_date(task, false, today);
        self.persist(Dirty::planner())
    }

    /// Soft-delete: detach, drop its recent completions, tombstone its archive
    pub fn delete_task(&mut self, item: ItemId) -> CoreResult<()> {
        self.ensure_writable()?;
        let task_id = live_task(&mut self.tree, item)?.id;
        self.tree.delete_task(item)?;

        let mut dirty = Dirty::planner();
        dirty.recent = self.recent.remove_task(task_id);
        dirty.archives.insert(task_id);
        info!(task_id = %task_id, "Task deleted");
        self.persist(dirty)
    }

    // Categories

    pub fn create_category(
        &mut self,
        parent: Parent,
        name: &str,
        index: Option<usize>,
    ) -> CoreResult<ItemId> {
        self.ensure_writable()?;
        let name = match name.trim() {
            "" => NEW_CATEGORY_NAME,
            name => name,
        };
        let item = self
            .tree
            .add_item(parent, PlannerItem::Category(Category::new(name)), index)?;
        self.persist(Dirty::planner())?;
        Ok(item)
    }

    pub fn rename_category(&mut self, item: ItemId, name: &str) -> CoreResult<()> {
        self.ensure_writable()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("Please enter a category name."));
        }
        self.tree.category_mut(item)?.name = name.to_string();
        self.persist(Dirty::planner())
    }

    /// Remove a category, promoting its children into its slot
    pub fn delete_category(&mut self, item: ItemId) -> CoreResult<()> {
        self.ensure_writable()?;
        self.tree.delete_category(item)?;
        self.persist(Dirty::planner())
    }

    // Moves

    pub fn move_up(&mut self, item: ItemId) -> CoreResult<bool> {
        self.ensure_writable()?;
        let moved = self.tree.move_up(item)?;
        self.persist_if(moved)
    }

    pub fn move_down(&mut self, item: ItemId) -> CoreResult<bool> {
        self.ensure_writable()?;
        let moved = self.tree.move_down(item)?;
        self.persist_if(moved)
    }

    pub fn enter_category(&mut self, item: ItemId) -> CoreResult<bool> {
        self.ensure_writable()?;
        let moved = self.tree.enter_category(item)?;
        self.persist_if(moved)
    }

    pub fn exit_category(&mut self, item: ItemId) -> CoreResult<bool> {
        self.ensure_writable()?;
        let moved = self.tree.exit_category(item)?;
        self.persist_if(moved)
    }

    // Completions

    /// Mark a task complete, then compact the recent set if it grew too far
    pub async fn record_completion(
        &mut self,
        item: ItemId,
        form: &CompletionForm,
    ) -> CoreResult<CompletionId> {
        self.ensure_writable()?;
        let today = self.today();
        let (date, is_approximate) = form.validate(today)?;
        let id = self.completion_ids.allocate();

        let task = live_task(&mut self.tree, item)?;
        let completion = Completion::new(id, task.id, date, is_approximate, form.notes.clone());
        self.recent.insert(&completion);
        insert_sorted(&mut task.completions, completion);
        let due_changed = check_due_date(task, true, today);

        self.persist(Dirty {
            planner: due_changed,
            recent: true,
            ..Default::default()
        })?;
        self.flush_if_needed().await?;
        Ok(id)
    }

    /// Change the date or notes of one completion. Loads the task's archive
    /// first, like `delete_completion`.
    pub async fn edit_completion(
        &mut self,
        item: ItemId,
        completion: CompletionId,
        form: &CompletionForm,
    ) -> CoreResult<()> {
        self.ensure_writable()?;
        let today = self.today();
        let (date, is_approximate) = form.validate(today)?;
        if live_task(&mut self.tree, item)?.completion(completion).is_none() {
            return Err(CoreError::UnknownCompletion);
        }
        self.load_old_completions(&[item]).await?;
        let in_recent = self.recent.contains(completion);

        let task = live_task(&mut self.tree, item)?;
        let entry = task
            .completions
            .iter_mut()
            .find(|c| c.id == completion)
            .ok_or(CoreError::UnknownCompletion)?;
        entry.edit(date, is_approximate, form.notes.clone());
        resort(&mut task.completions);
        let due_changed = check_due_date(task, true, today);
        let task_id = task.id;

        let mut dirty = Dirty {
            planner: due_changed,
            recent: in_recent,
            ..Default::default()
        };
        if !in_recent {
            dirty.archives.insert(task_id);
        }
        self.persist(dirty)
    }

    /// Delete one completion. Loads the task's archive first so the due
    /// date is recomputed from the full history.
    pub async fn delete_completion(
        &mut self,
        item: ItemId,
        completion: CompletionId,
    ) -> CoreResult<()> {
        self.ensure_writable()?;
        if live_task(&mut self.tree, item)?.completion(completion).is_none() {
            return Err(CoreError::UnknownCompletion);
        }
        self.load_old_completions(&[item]).await?;

        let today = self.today();
        let in_recent = self.recent.remove(completion);
        let task = live_task(&mut self.tree, item)?;
        task.completions.retain(|c| c.id != completion);
        let due_changed = check_due_date(task, false, today);
        let task_id = task.id;

        let mut dirty = Dirty {
            planner: due_changed,
            recent: in_recent,
            ..Default::default()
        };
        if !in_recent {
            dirty.archives.insert(task_id);
        }
        self.persist(dirty)
    }

    /// Fetch and merge the archives of tasks not loaded yet
    pub async fn load_old_completions(&mut self, items: &[ItemId]) -> CoreResult<()> {
        let mut wanted = Vec::new();
        for item in items {
            let task = self.tree.task(*item)?;
            if !task.loaded_old_completions && !task.is_deleted {
                wanted.push((*item, task.id));
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let names = wanted
            .iter()
            .map(|(_, task_id)| old_completions_chunk(*task_id))
            .collect();
        let mut chunks = self.sync.get_chunks(names).await?;

        for (item, task_id) in wanted {
            let name = old_completions_chunk(task_id);
            let archived = match chunks.remove(&name).flatten() {
                Some(value) => {
                    let chunk: OldCompletionsChunk = decode_chunk(&name, value)?;
                    chunk
                        .completions
                        .iter()
                        .map(|record| {
                            Completion::from_archive_record(
                                self.completion_ids.allocate(),
                                task_id,
                                record,
                            )
                        })
                        .collect::<CoreResult<Vec<_>>>()?
                }
                None => Vec::new(),
            };

            // Another caller may have loaded it while we were waiting
            let task = self.tree.task_mut(item)?;
            if task.loaded_old_completions {
                continue;
            }
            let count = archived.len();
            for completion in archived {
                insert_sorted(&mut task.completions, completion);
            }
            task.loaded_old_completions = true;
            debug!(task_id = %task_id, archived = count, "Old completions loaded");
        }
        Ok(())
    }

    /// Compact the recent set to one completion per task when it has grown
    /// by at least the flush threshold. Returns whether a flush happened.
    pub async fn flush_if_needed(&mut self) -> CoreResult<bool> {
        let task_count = self.tree.all_tasks().len();
        if !needs_flush(&self.recent, task_count, self.flush_threshold) {
            return Ok(false);
        }
        self.ensure_writable()?;

        let plan = loop {
            let plan = plan_flush(
                &self.recent,
                self.tree
                    .all_tasks()
                    .into_iter()
                    .filter_map(|item| self.tree.task(item).ok()),
            );

            let missing: Vec<ItemId> = plan
                .affected_tasks
                .iter()
                .filter_map(|task_id| self.tree.find_task(*task_id))
                .filter(|item| {
                    self.tree
                        .task(*item)
                        .is_ok_and(|task| !task.loaded_old_completions && !task.is_deleted)
                })
                .collect();
            if missing.is_empty() {
                break plan;
            }
            self.load_old_completions(&missing).await?;
        };

        info!(
            dropped = plan.dropped.len(),
            affected = plan.affected_tasks.len(),
            "Flushing recent completions"
        );
        self.recent = plan.recent;
        self.persist(Dirty {
            recent: true,
            archives: plan.affected_tasks,
            ..Default::default()
        })?;
        Ok(true)
    }

    // Account

    /// Re-key every chunk under a new password and save the new bundle
    pub async fn change_password(
        &mut self,
        old_password: &str,
        new_password: &str,
        store: &dyn CredentialStore,
    ) -> CoreResult<()> {
        self.ensure_writable()?;
        if old_password.is_empty() {
            return Err(CoreError::validation("Please enter your old password."));
        }
        if new_password.is_empty() {
            return Err(CoreError::validation("Please enter a new password."));
        }

        let salts = self.sync.get_salts().await?;
        let old_auth_hash = hash_password(old_password, &salts.auth_salt);
        self.sync.validate_auth_hash(old_auth_hash.clone()).await?;

        let items = self.tree.all_tasks();
        self.load_old_completions(&items).await?;

        let mut chunks = PlainChunks::new();
        chunks.insert(PLANNER_ITEMS_CHUNK.to_string(), Some(self.planner_value()?));
        chunks.insert(
            RECENT_COMPLETIONS_CHUNK.to_string(),
            Some(self.recent_value()?),
        );
        for item in items {
            let task = self.tree.task(item)?;
            if let Some(value) = self.archive_value(task)? {
                chunks.insert(old_completions_chunk(task.id), Some(value));
            }
        }

        let new_auth_salt = generate_salt();
        let new_key_salt = generate_salt();
        let new_auth_hash = hash_password(new_password, &new_auth_salt);
        let key_hash = hash_password(new_password, &new_key_salt);

        let key_version = self
            .sync
            .change_password(
                old_auth_hash,
                new_auth_salt,
                new_auth_hash.clone(),
                new_key_salt,
                derive_key(&key_hash),
                &chunks,
            )
            .await?;

        store.save(&CredentialBundle {
            username: self.username.clone(),
            auth_hash: new_auth_hash,
            key_hash,
            key_version,
        })?;
        Ok(())
    }

    // Persistence

    fn ensure_writable(&self) -> CoreResult<()> {
        if self.sync.is_faulted() {
            return Err(SyncError::Faulted.into());
        }
        Ok(())
    }

    fn persist_if(&self, changed: bool) -> CoreResult<bool> {
        if changed {
            self.persist(Dirty::planner())?;
        }
        Ok(changed)
    }

    fn planner_value(&self) -> CoreResult<serde_json::Value> {
        encode_chunk(PLANNER_ITEMS_CHUNK, &self.tree.to_chunk())
    }

    fn recent_value(&self) -> CoreResult<serde_json::Value> {
        let mut completions: Vec<&Completion> = self
            .recent
            .ids()
            .filter_map(|id| {
                let item = self.tree.find_task(self.recent.owner(id)?)?;
                self.tree.task(item).ok()?.completion(id)
            })
            .collect();
        completions.sort_by_key(|c| (c.timestamp(), c.id));

        let chunk = RecentCompletionsChunk {
            version: CHUNK_SCHEMA_VERSION,
            completions: completions.iter().map(|c| c.to_recent_record()).collect(),
        };
        encode_chunk(RECENT_COMPLETIONS_CHUNK, &chunk)
    }

    /// Archive contents of `task`: everything not in the recent set.
    /// `None` (tombstone) when empty or deleted.
    fn archive_value(&self, task: &Task) -> CoreResult<Option<serde_json::Value>> {
        if task.is_deleted {
            return Ok(None);
        }
        let completions: Vec<_> = task
            .completions
            .iter()
            .filter(|c| !self.recent.contains(c.id))
            .map(|c| c.to_archive_record())
            .collect();
        if completions.is_empty() {
            return Ok(None);
        }
        let chunk = OldCompletionsChunk {
            version: CHUNK_SCHEMA_VERSION,
            completions,
        };
        Ok(Some(encode_chunk(&old_completions_chunk(task.id), &chunk)?))
    }

    fn persist(&self, dirty: Dirty) -> CoreResult<()> {
        let mut chunks = PlainChunks::new();
        if dirty.planner {
            chunks.insert(PLANNER_ITEMS_CHUNK.to_string(), Some(self.planner_value()?));
        }
        if dirty.recent {
            chunks.insert(
                RECENT_COMPLETIONS_CHUNK.to_string(),
                Some(self.recent_value()?),
            );
        }
        for task_id in dirty.archives {
            let Some(item) = self.tree.find_task(task_id) else {
                continue;
            };
            let task = self.tree.task(item)?;
            if !task.is_deleted && !task.loaded_old_completions {
                warn!(task_id = %task_id, "Skipping archive write for unloaded task");
                continue;
            }
            chunks.insert(old_completions_chunk(task_id), self.archive_value(task)?);
        }

        if chunks.is_empty() {
            return Ok(());
        }
        let _ticket = self.sync.set_chunks(&chunks)?;
        Ok(())
    }
}

/// A task that has not been deleted
fn live_task(tree: &mut PlannerTree, item: ItemId) -> CoreResult<&mut Task> {
    let task = tree.task_mut(item)?;
    if task.is_deleted {
        return Err(CoreError::UnknownItem(item));
    }
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use upkeep_api::{MockAccount, MockServer};
    use upkeep_util::add_days;

    fn date(day: u32) -> CalendarDate {
        CalendarDate::new(2025, 5, day).unwrap()
    }

    fn bundle() -> CredentialBundle {
        CredentialBundle {
            username: "mock-user".into(),
            auth_hash: "mock-auth-hash".into(),
            key_hash: "mock-key-hash".into(),
            key_version: 0,
        }
    }

    async fn open(server: &Arc<MockServer>) -> Session {
        Session::open(server.clone(), &bundle(), &ClientSettings::default())
            .await
            .unwrap()
    }

    fn weekly(name: &str) -> TaskForm {
        TaskForm {
            frequency: "7".into(),
            ..TaskForm::named(name)
        }
    }

    #[tokio::test]
    async fn completing_a_weekly_task_moves_its_due_date() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;
        session.pin_today(date(5));

        let item = session
            .create_task(Parent::Root, &weekly("Water plants"), None)
            .unwrap();
        assert_eq!(session.tree().task(item).unwrap().due_date, Some(date(5)));

        session
            .record_completion(item, &CompletionForm::today())
            .await
            .unwrap();
        let task = session.tree().task(item).unwrap();
        assert_eq!(task.due_date, Some(date(12)));
        assert_eq!(session.status(item).unwrap(), TaskStatus::Completed);
        session.settled().await.unwrap();

        let reopened = open(&server).await;
        let items = reopened.tree().all_tasks();
        assert_eq!(items.len(), 1);
        let task = reopened.tree().task(items[0]).unwrap();
        assert_eq!(task.name, "Water plants");
        assert_eq!(task.due_date, Some(date(12)));
        assert_eq!(task.completions.len(), 1);
        assert_eq!(reopened.recent().len(), 1);
    }

    #[tokio::test]
    async fn tree_moves_survive_reload() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;

        let task = session
            .create_task(Parent::Root, &TaskForm::named("Mow"), None)
            .unwrap();
        let garden = session.create_category(Parent::Root, "Garden", None).unwrap();
        assert!(session.enter_category(task).unwrap());
        assert!(!session.move_up(task).unwrap());
        session.settled().await.unwrap();

        let reopened = open(&server).await;
        let root = reopened.tree().children(Parent::Root).unwrap().to_vec();
        assert_eq!(root.len(), 1);
        assert_eq!(reopened.tree().get(root[0]).unwrap().name(), "Garden");
        let inside = reopened.tree().children(Parent::Category(root[0])).unwrap();
        assert_eq!(inside.len(), 1);
        assert_eq!(reopened.tree().get(inside[0]).unwrap().name(), "Mow");

        assert!(session.exit_category(task).unwrap());
        assert_eq!(
            session.tree().children(Parent::Root).unwrap(),
            &[garden, task][..]
        );
    }

    #[tokio::test]
    async fn empty_category_name_gets_default() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;

        let item = session.create_category(Parent::Root, "  ", None).unwrap();
        assert_eq!(session.tree().category(item).unwrap().name, NEW_CATEGORY_NAME);

        assert!(session.rename_category(item, "").is_err());
        session.rename_category(item, "Kitchen").unwrap();
        assert_eq!(session.tree().category(item).unwrap().name, "Kitchen");
    }

    #[tokio::test]
    async fn invalid_form_sends_nothing() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;
        let before = server.request_count();

        let err = session
            .create_task(Parent::Root, &TaskForm::named(""), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        session.settled().await.unwrap();
        assert_eq!(server.request_count(), before);
        assert!(session.tree().all_tasks().is_empty());
    }

    #[tokio::test]
    async fn flush_keeps_one_recent_completion_per_task() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;
        session.pin_today(date(20));

        let a = session.create_task(Parent::Root, &weekly("A"), None).unwrap();
        session.create_task(Parent::Root, &weekly("B"), None).unwrap();
        let a_id = session.tree().task(a).unwrap().id;

        for day in 1..=4 {
            session
                .record_completion(a, &CompletionForm::on(date(day)))
                .await
                .unwrap();
        }
        assert_eq!(session.recent().len(), 4);

        session
            .record_completion(a, &CompletionForm::on(date(5)))
            .await
            .unwrap();
        assert_eq!(session.recent().len(), 1);
        assert_eq!(session.tree().task(a).unwrap().completions.len(), 5);
        session.settled().await.unwrap();
        assert!(server.chunk(&old_completions_chunk(a_id)).is_some());

        let mut reopened = open(&server).await;
        let a = reopened.tree().find_task(a_id).unwrap();
        let task = reopened.tree().task(a).unwrap();
        assert_eq!(task.completions.len(), 1);
        assert_eq!(task.completions[0].date, date(5));
        assert!(!task.loaded_old_completions);

        reopened.load_old_completions(&[a]).await.unwrap();
        let requests = server.request_count();
        reopened.load_old_completions(&[a]).await.unwrap();
        assert_eq!(server.request_count(), requests);

        let dates: Vec<_> = reopened
            .tree()
            .task(a)
            .unwrap()
            .completions
            .iter()
            .map(|c| c.date)
            .collect();
        assert_eq!(dates, (1..=5).map(date).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn deleting_an_archived_completion_rewrites_the_archive() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;
        session.pin_today(date(20));

        let item = session.create_task(Parent::Root, &weekly("A"), None).unwrap();
        let first = session
            .record_completion(item, &CompletionForm::on(date(1)))
            .await
            .unwrap();
        for day in 2..=4 {
            session
                .record_completion(item, &CompletionForm::on(date(day)))
                .await
                .unwrap();
        }
        assert_eq!(session.recent().len(), 1);
        assert!(!session.recent().contains(first));

        session.delete_completion(item, first).await.unwrap();
        assert_eq!(session.tree().task(item).unwrap().completions.len(), 3);
        session.settled().await.unwrap();

        let mut reopened = open(&server).await;
        let item = reopened.tree().all_tasks()[0];
        reopened.load_old_completions(&[item]).await.unwrap();
        let dates: Vec<_> = reopened
            .tree()
            .task(item)
            .unwrap()
            .completions
            .iter()
            .map(|c| c.date)
            .collect();
        assert_eq!(dates, vec![date(2), date(3), date(4)]);
    }

    #[tokio::test]
    async fn editing_a_completion_keeps_order_and_due_date() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;
        session.pin_today(date(20));

        let item = session.create_task(Parent::Root, &weekly("A"), None).unwrap();
        session
            .record_completion(item, &CompletionForm::on(date(10)))
            .await
            .unwrap();
        let later = session
            .record_completion(item, &CompletionForm::on(date(12)))
            .await
            .unwrap();
        assert_eq!(session.tree().task(item).unwrap().due_date, Some(date(19)));

        session
            .edit_completion(item, later, &CompletionForm::on(date(5)))
            .await
            .unwrap();
        let task = session.tree().task(item).unwrap();
        let dates: Vec<_> = task.completions.iter().map(|c| c.date).collect();
        assert_eq!(dates, vec![date(5), date(10)]);
        assert_eq!(task.due_date, Some(date(17)));
    }

    #[tokio::test]
    async fn editing_a_completion_sees_archived_history() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;
        session.pin_today(date(20));

        let item = session.create_task(Parent::Root, &weekly("A"), None).unwrap();
        for day in 1..=4 {
            session
                .record_completion(item, &CompletionForm::on(date(day)))
                .await
                .unwrap();
        }
        session.settled().await.unwrap();

        let mut reopened = open(&server).await;
        reopened.pin_today(date(20));
        let item = reopened.tree().all_tasks()[0];
        let recent = reopened.tree().task(item).unwrap().completions[0].id;
        let april = CalendarDate::new(2025, 4, 30).unwrap();
        reopened
            .edit_completion(item, recent, &CompletionForm::on(april))
            .await
            .unwrap();

        let task = reopened.tree().task(item).unwrap();
        assert!(task.loaded_old_completions);
        let dates: Vec<_> = task.completions.iter().map(|c| c.date).collect();
        assert_eq!(dates, vec![april, date(1), date(2), date(3)]);
        assert_eq!(task.due_date, Some(date(10)));
        reopened.settled().await.unwrap();
    }

    #[tokio::test]
    async fn deleting_a_task_tombstones_its_history() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;
        session.pin_today(date(20));

        let item = session.create_task(Parent::Root, &weekly("A"), None).unwrap();
        let task_id = session.tree().task(item).unwrap().id;
        for day in 1..=4 {
            session
                .record_completion(item, &CompletionForm::on(date(day)))
                .await
                .unwrap();
        }
        session.settled().await.unwrap();
        assert!(server.chunk(&old_completions_chunk(task_id)).is_some());

        session.delete_task(item).unwrap();
        assert!(session.recent().is_empty());
        assert!(session.tree().task(item).unwrap().is_deleted);
        assert!(session.delete_task(item).is_err());
        session.settled().await.unwrap();
        assert!(server.chunk(&old_completions_chunk(task_id)).is_none());

        let reopened = open(&server).await;
        assert!(reopened.tree().all_tasks().is_empty());
        assert!(reopened.recent().is_empty());
    }

    #[tokio::test]
    async fn manual_due_date_cleared_by_completion() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;
        session.pin_today(date(1));

        let form = TaskForm {
            due_date: date(10).to_string(),
            ..TaskForm::named("Taxes")
        };
        let item = session.create_task(Parent::Root, &form, None).unwrap();
        session
            .record_completion(item, &CompletionForm::on(date(3)))
            .await
            .unwrap();
        assert_eq!(session.tree().task(item).unwrap().due_date, Some(date(10)));

        session
            .record_completion(item, &CompletionForm::on(date(11)))
            .await
            .unwrap();
        let task = session.tree().task(item).unwrap();
        assert_eq!(task.due_date, None);
        assert_eq!(task.due_date_is_manual, None);
    }

    #[tokio::test]
    async fn failed_save_refuses_further_edits() {
        let server = Arc::new(MockServer::new());
        let mut session = open(&server).await;

        server.set_fail_communication(true);
        session
            .create_task(Parent::Root, &TaskForm::named("A"), None)
            .unwrap();
        assert!(session.settled().await.is_err());
        assert_eq!(session.save_state(), SaveState::Error);

        server.set_fail_communication(false);
        let err = session
            .create_task(Parent::Root, &TaskForm::named("B"), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Sync(SyncError::Faulted)));
    }

    #[tokio::test]
    async fn change_password_rekeys_every_chunk() {
        let old_auth = hash_password("hunter2", "mock-auth-salt");
        let server = Arc::new(MockServer::with_account(MockAccount::new(
            "mock-user",
            old_auth.clone(),
        )));
        let old_bundle = CredentialBundle {
            username: "mock-user".into(),
            auth_hash: old_auth,
            key_hash: hash_password("hunter2", "mock-key-salt"),
            key_version: 0,
        };
        let settings = ClientSettings::default();
        let mut session = Session::open(server.clone(), &old_bundle, &settings)
            .await
            .unwrap();
        session.pin_today(date(20));

        let item = session.create_task(Parent::Root, &weekly("A"), None).unwrap();
        for day in 1..=4 {
            session
                .record_completion(item, &CompletionForm::on(date(day)))
                .await
                .unwrap();
        }

        let store = crate::InMemoryCredentialStore::default();
        let err = session
            .change_password("wrong", "correct horse", &store)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Sync(_)));
        assert!(!session.sync().is_faulted());

        session
            .change_password("hunter2", "correct horse", &store)
            .await
            .unwrap();
        let new_bundle = store.load().unwrap().unwrap();
        assert_eq!(new_bundle.key_version, 1);

        let err = Session::open(server.clone(), &old_bundle, &settings)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::KeyVersionMismatch { saved: 0, current: 1 }));

        let mut reopened = Session::open(server.clone(), &new_bundle, &settings)
            .await
            .unwrap();
        let item = reopened.tree().all_tasks()[0];
        reopened.load_old_completions(&[item]).await.unwrap();
        let task = reopened.tree().task(item).unwrap();
        assert_eq!(task.completions.len(), 4);
        assert_eq!(task.due_date, Some(add_days(date(4), 7)));
    }
}
