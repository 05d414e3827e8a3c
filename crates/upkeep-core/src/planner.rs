//! Planner tree: categories and tasks in an id-addressed arena

use std::collections::HashMap;
use std::fmt;
use upkeep_api::PLANNER_ITEMS_CHUNK;
use upkeep_util::{ActiveMonths, CalendarDate, TaskId};

use crate::{
    CHUNK_SCHEMA_VERSION, CategoryRecord, Completion, CoreError, CoreResult, MAX_FREQUENCY_DAYS,
    PlannerItemRecord, PlannerItemsChunk, TaskRecord,
};

/// Arena handle of a planner item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(usize);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Container an item lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    Root,
    Category(ItemId),
}

/// A leaf planner item
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Days between repetitions; `None` for one-off tasks
    pub frequency: Option<u32>,
    pub due_date: Option<CalendarDate>,
    /// `None` means no due-date policy
    pub due_date_is_manual: Option<bool>,
    pub upcoming_period: Option<u32>,
    pub grace_period: Option<u32>,
    /// `None` means every month is active
    pub active_months: Option<ActiveMonths>,
    pub notes: String,
    /// Sorted ascending by timestamp
    pub completions: Vec<Completion>,
    pub loaded_old_completions: bool,
    pub is_deleted: bool,
}

impl Task {
    pub fn new(id: TaskId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            frequency: None,
            due_date: None,
            due_date_is_manual: None,
            upcoming_period: None,
            grace_period: None,
            active_months: None,
            notes: String::new(),
            completions: Vec::new(),
            loaded_old_completions: false,
            is_deleted: false,
        }
    }

    pub fn last_completion_date(&self) -> Option<CalendarDate> {
        self.completions.last().map(|c| c.date)
    }

    pub fn completion(&self, id: crate::CompletionId) -> Option<&Completion> {
        self.completions.iter().find(|c| c.id == id)
    }

    fn from_record(record: TaskRecord) -> Self {
        Self {
            frequency: record.frequency,
            due_date: record.due_date,
            due_date_is_manual: record.due_date_is_manual,
            upcoming_period: record.upcoming_period,
            grace_period: record.grace_period,
            active_months: record.active_months,
            notes: record.notes,
            ..Self::new(record.id, record.name)
        }
    }

    fn to_record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id,
            name: self.name.clone(),
            frequency: self.frequency,
            due_date: self.due_date,
            due_date_is_manual: self.due_date_is_manual,
            upcoming_period: self.upcoming_period,
            grace_period: self.grace_period,
            active_months: self.active_months,
            notes: self.notes.clone(),
        }
    }
}

/// A container of ordered child items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    children: Vec<ItemId>,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn children(&self) -> &[ItemId] {
        &self.children
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerItem {
    Task(Task),
    Category(Category),
}

impl PlannerItem {
    pub fn name(&self) -> &str {
        match self {
            PlannerItem::Task(task) => &task.name,
            PlannerItem::Category(category) => &category.name,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<Parent>,
    item: PlannerItem,
}

/// The in-memory planner
///
/// Items are owned by the arena; containers hold ids. A detached item stays
/// in the arena with no parent (deleted tasks end up like this).
#[derive(Debug, Clone)]
pub struct PlannerTree {
    nodes: HashMap<ItemId, Node>,
    root: Vec<ItemId>,
    next_item: usize,
    next_task_id: TaskId,
    task_index: HashMap<TaskId, ItemId>,
}

impl PlannerTree {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root: Vec::new(),
            next_item: 0,
            next_task_id: TaskId::new(1),
            task_index: HashMap::new(),
        }
    }

    // Lookup

    pub fn get(&self, item: ItemId) -> Option<&PlannerItem> {
        self.nodes.get(&item).map(|node| &node.item)
    }

    pub fn task(&self, item: ItemId) -> CoreResult<&Task> {
        match self.get(item) {
            Some(PlannerItem::Task(task)) => Ok(task),
            _ => Err(CoreError::UnknownItem(item)),
        }
    }

    pub fn task_mut(&mut self, item: ItemId) -> CoreResult<&mut Task> {
        match self.nodes.get_mut(&item).map(|node| &mut node.item) {
            Some(PlannerItem::Task(task)) => Ok(task),
            _ => Err(CoreError::UnknownItem(item)),
        }
    }

    pub fn category(&self, item: ItemId) -> CoreResult<&Category> {
        match self.get(item) {
            Some(PlannerItem::Category(category)) => Ok(category),
            _ => Err(CoreError::UnknownItem(item)),
        }
    }

    pub fn category_mut(&mut self, item: ItemId) -> CoreResult<&mut Category> {
        match self.nodes.get_mut(&item).map(|node| &mut node.item) {
            Some(PlannerItem::Category(category)) => Ok(category),
            _ => Err(CoreError::UnknownItem(item)),
        }
    }

    /// Arena id of the task with this stable id
    pub fn find_task(&self, task_id: TaskId) -> Option<ItemId> {
        self.task_index.get(&task_id).copied()
    }

    pub fn parent(&self, item: ItemId) -> Option<Parent> {
        self.nodes.get(&item).and_then(|node| node.parent)
    }

    /// Children of a container, in order
    pub fn children(&self, parent: Parent) -> CoreResult<&[ItemId]> {
        match parent {
            Parent::Root => Ok(&self.root),
            Parent::Category(id) => Ok(self.category(id)?.children()),
        }
    }

    fn container_mut(&mut self, parent: Parent) -> CoreResult<&mut Vec<ItemId>> {
        match parent {
            Parent::Root => Ok(&mut self.root),
            Parent::Category(id) => Ok(&mut self.category_mut(id)?.children),
        }
    }

    /// Reserve the next stable task id
    pub fn allocate_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id = id.next();
        id
    }

    pub fn next_task_id(&self) -> TaskId {
        self.next_task_id
    }

    // Structure

    /// Put a new item into the arena and attach it under `parent`
    pub fn add_item(
        &mut self,
        parent: Parent,
        item: PlannerItem,
        index: Option<usize>,
    ) -> CoreResult<ItemId> {
        self.children(parent)?;

        let id = ItemId(self.next_item);
        self.next_item += 1;
        if let PlannerItem::Task(task) = &item {
            if self.task_index.contains_key(&task.id) {
                return Err(CoreError::validation(format!("Duplicate task id {}", task.id)));
            }
            self.task_index.insert(task.id, id);
            if task.id >= self.next_task_id {
                self.next_task_id = task.id.next();
            }
        }
        self.nodes.insert(id, Node { parent: None, item });
        self.attach(id, parent, index)?;
        Ok(id)
    }

    /// Move an existing item under `parent` at `index` (append when `None`).
    /// Detaches it from its current container first.
    pub fn attach(&mut self, item: ItemId, parent: Parent, index: Option<usize>) -> CoreResult<()> {
        if !self.nodes.contains_key(&item) {
            return Err(CoreError::UnknownItem(item));
        }
        let into_itself = match parent {
            Parent::Category(target) => self.is_within(target, item),
            Parent::Root => false,
        };
        if into_itself {
            return Err(CoreError::validation("A category cannot be moved into itself."));
        }
        self.children(parent)?;

        self.remove(item)?;
        let container = self.container_mut(parent)?;
        let index = index.unwrap_or(container.len()).min(container.len());
        container.insert(index, item);
        if let Some(node) = self.nodes.get_mut(&item) {
            node.parent = Some(parent);
        }
        Ok(())
    }

    /// Detach from the current container. No-op if already detached.
    pub fn remove(&mut self, item: ItemId) -> CoreResult<()> {
        let Some(parent) = self.parent(item) else {
            return Ok(());
        };
        self.container_mut(parent)?.retain(|child| *child != item);
        if let Some(node) = self.nodes.get_mut(&item) {
            node.parent = None;
        }
        Ok(())
    }

    fn position(&self, item: ItemId) -> CoreResult<Option<(Parent, usize)>> {
        let Some(parent) = self.parent(item) else {
            return Ok(None);
        };
        let index = self
            .children(parent)?
            .iter()
            .position(|child| *child == item)
            .ok_or(CoreError::UnknownItem(item))?;
        Ok(Some((parent, index)))
    }

    /// Swap with the previous sibling. Returns whether anything moved.
    pub fn move_up(&mut self, item: ItemId) -> CoreResult<bool> {
        match self.position(item)? {
            Some((parent, index)) if index > 0 => {
                self.container_mut(parent)?.swap(index, index - 1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Swap with the next sibling. Returns whether anything moved.
    pub fn move_down(&mut self, item: ItemId) -> CoreResult<bool> {
        let Some((parent, index)) = self.position(item)? else {
            return Ok(false);
        };
        let container = self.container_mut(parent)?;
        if index + 1 < container.len() {
            container.swap(index, index + 1);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Become the first child of the next sibling, if that is a category
    pub fn enter_category(&mut self, item: ItemId) -> CoreResult<bool> {
        let Some((parent, index)) = self.position(item)? else {
            return Ok(false);
        };
        let next = self.children(parent)?.get(index + 1).copied();
        match next {
            Some(sibling) if matches!(self.get(sibling), Some(PlannerItem::Category(_))) => {
                self.attach(item, Parent::Category(sibling), Some(0))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Move out of the enclosing category to sit right after it
    pub fn exit_category(&mut self, item: ItemId) -> CoreResult<bool> {
        let Some(Parent::Category(category)) = self.parent(item) else {
            return Ok(false);
        };
        let Some((outer, index)) = self.position(category)? else {
            return Ok(false);
        };
        self.attach(item, outer, Some(index + 1))?;
        Ok(true)
    }

    /// Remove a category, splicing its children into its former slot
    pub fn delete_category(&mut self, category: ItemId) -> CoreResult<()> {
        let children = self.category(category)?.children.clone();
        let position = self.position(category)?;
        self.remove(category)?;

        match position {
            Some((parent, index)) => {
                for child in &children {
                    if let Some(node) = self.nodes.get_mut(child) {
                        node.parent = Some(parent);
                    }
                }
                let container = self.container_mut(parent)?;
                container.splice(index..index, children);
            }
            None => {
                for child in &children {
                    if let Some(node) = self.nodes.get_mut(child) {
                        node.parent = None;
                    }
                }
            }
        }

        self.nodes.remove(&category);
        Ok(())
    }

    /// Soft-delete a task: flag it and detach it from the tree
    pub fn delete_task(&mut self, item: ItemId) -> CoreResult<()> {
        self.task_mut(item)?.is_deleted = true;
        self.remove(item)
    }

    /// Whether `item` is `ancestor` or sits somewhere below it
    fn is_within(&self, item: ItemId, ancestor: ItemId) -> bool {
        let mut current = Some(item);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = match self.parent(id) {
                Some(Parent::Category(parent)) => Some(parent),
                _ => None,
            };
        }
        false
    }

    // Traversal

    fn walk(&self, container: &[ItemId], out: &mut Vec<ItemId>) {
        for id in container {
            out.push(*id);
            if let Some(PlannerItem::Category(category)) = self.get(*id) {
                self.walk(&category.children, out);
            }
        }
    }

    /// Every attached item, pre-order
    pub fn all_items(&self) -> Vec<ItemId> {
        let mut out = Vec::new();
        self.walk(&self.root, &mut out);
        out
    }

    /// Attached tasks, pre-order
    pub fn all_tasks(&self) -> Vec<ItemId> {
        self.all_items()
            .into_iter()
            .filter(|id| matches!(self.get(*id), Some(PlannerItem::Task(_))))
            .collect()
    }

    /// Attached categories, pre-order
    pub fn all_categories(&self) -> Vec<ItemId> {
        self.all_items()
            .into_iter()
            .filter(|id| matches!(self.get(*id), Some(PlannerItem::Category(_))))
            .collect()
    }

    /// Depth below the root (top-level items are 0)
    pub fn depth(&self, item: ItemId) -> usize {
        let mut depth = 0;
        let mut current = self.parent(item);
        while let Some(Parent::Category(id)) = current {
            depth += 1;
            current = self.parent(id);
        }
        depth
    }

    // Serialization

    pub fn to_chunk(&self) -> PlannerItemsChunk {
        PlannerItemsChunk {
            version: CHUNK_SCHEMA_VERSION,
            next_task_id: self.next_task_id,
            items: self.records(&self.root),
        }
    }

    fn records(&self, container: &[ItemId]) -> Vec<PlannerItemRecord> {
        container
            .iter()
            .filter_map(|id| match self.get(*id)? {
                PlannerItem::Task(task) => Some(PlannerItemRecord::Task(task.to_record())),
                PlannerItem::Category(category) => {
                    Some(PlannerItemRecord::Category(CategoryRecord {
                        name: category.name.clone(),
                        items: self.records(&category.children),
                    }))
                }
            })
            .collect()
    }

    pub fn from_chunk(chunk: PlannerItemsChunk) -> CoreResult<Self> {
        let mut tree = Self::new();
        tree.insert_records(Parent::Root, chunk.items)?;
        if chunk.next_task_id < tree.next_task_id {
            return Err(CoreError::schema(
                PLANNER_ITEMS_CHUNK,
                format!(
                    "nextTaskId {} is not above every task id",
                    chunk.next_task_id
                ),
            ));
        }
        tree.next_task_id = chunk.next_task_id;
        Ok(tree)
    }

    fn insert_records(&mut self, parent: Parent, records: Vec<PlannerItemRecord>) -> CoreResult<()> {
        for record in records {
            match record {
                PlannerItemRecord::Task(record) => {
                    if self.task_index.contains_key(&record.id) {
                        return Err(CoreError::schema(
                            PLANNER_ITEMS_CHUNK,
                            format!("duplicate task id {}", record.id),
                        ));
                    }
                    if let Some(days) = record.frequency.filter(|days| *days > MAX_FREQUENCY_DAYS) {
                        return Err(CoreError::schema(
                            PLANNER_ITEMS_CHUNK,
                            format!("task {} repeats every {} days", record.id, days),
                        ));
                    }
                    self.add_item(parent, PlannerItem::Task(Task::from_record(record)), None)?;
                }
                PlannerItemRecord::Category(record) => {
                    let id = self.add_item(
                        parent,
                        PlannerItem::Category(Category::new(record.name)),
                        None,
                    )?;
                    self.insert_records(Parent::Category(id), record.items)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for PlannerTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(tree: &mut PlannerTree, parent: Parent, name: &str) -> ItemId {
        let id = tree.allocate_task_id();
        tree.add_item(parent, PlannerItem::Task(Task::new(id, name)), None)
            .unwrap()
    }

    fn category(tree: &mut PlannerTree, parent: Parent, name: &str) -> ItemId {
        tree.add_item(parent, PlannerItem::Category(Category::new(name)), None)
            .unwrap()
    }

    fn names(tree: &PlannerTree, parent: Parent) -> Vec<String> {
        tree.children(parent)
            .unwrap()
            .iter()
            .map(|id| tree.get(*id).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn add_with_index_and_append() {
        let mut tree = PlannerTree::new();
        task(&mut tree, Parent::Root, "a");
        task(&mut tree, Parent::Root, "c");
        let id = tree.allocate_task_id();
        tree.add_item(Parent::Root, PlannerItem::Task(Task::new(id, "b")), Some(1))
            .unwrap();
        assert_eq!(names(&tree, Parent::Root), ["a", "b", "c"]);
    }

    #[test]
    fn move_up_and_down_stop_at_bounds() {
        let mut tree = PlannerTree::new();
        let a = task(&mut tree, Parent::Root, "a");
        let b = task(&mut tree, Parent::Root, "b");

        assert!(!tree.move_up(a).unwrap());
        assert!(!tree.move_down(b).unwrap());
        assert!(tree.move_down(a).unwrap());
        assert_eq!(names(&tree, Parent::Root), ["b", "a"]);
        assert!(tree.move_up(a).unwrap());
        assert_eq!(names(&tree, Parent::Root), ["a", "b"]);
    }

    #[test]
    fn enter_category_needs_category_sibling() {
        let mut tree = PlannerTree::new();
        let t1 = task(&mut tree, Parent::Root, "t1");
        let t2 = task(&mut tree, Parent::Root, "t2");
        let home = category(&mut tree, Parent::Root, "Home");
        task(&mut tree, Parent::Category(home), "existing");

        assert!(!tree.enter_category(t1).unwrap());
        assert!(tree.enter_category(t2).unwrap());
        assert_eq!(names(&tree, Parent::Category(home)), ["t2", "existing"]);
        assert_eq!(tree.parent(t2), Some(Parent::Category(home)));
        assert!(!tree.enter_category(home).unwrap());
    }

    #[test]
    fn exit_category_lands_after_parent() {
        let mut tree = PlannerTree::new();
        let before = task(&mut tree, Parent::Root, "before");
        let home = category(&mut tree, Parent::Root, "Home");
        task(&mut tree, Parent::Root, "after");
        let t1 = task(&mut tree, Parent::Category(home), "T1");

        assert!(!tree.exit_category(before).unwrap());
        assert!(tree.exit_category(t1).unwrap());
        assert_eq!(names(&tree, Parent::Root), ["before", "Home", "T1", "after"]);
        assert_eq!(tree.parent(t1), Some(Parent::Root));
        assert!(tree.children(Parent::Category(home)).unwrap().is_empty());
    }

    #[test]
    fn delete_category_promotes_children_in_place() {
        let mut tree = PlannerTree::new();
        task(&mut tree, Parent::Root, "a");
        let home = category(&mut tree, Parent::Root, "Home");
        task(&mut tree, Parent::Root, "z");
        let x = task(&mut tree, Parent::Category(home), "x");
        let inner = category(&mut tree, Parent::Category(home), "Inner");
        task(&mut tree, Parent::Category(inner), "deep");

        tree.delete_category(home).unwrap();
        assert_eq!(names(&tree, Parent::Root), ["a", "x", "Inner", "z"]);
        assert_eq!(tree.parent(x), Some(Parent::Root));
        assert_eq!(tree.parent(inner), Some(Parent::Root));
        assert!(tree.get(home).is_none());
        assert_eq!(tree.depth(inner), 0);
    }

    #[test]
    fn category_cannot_enter_its_own_subtree() {
        let mut tree = PlannerTree::new();
        let outer = category(&mut tree, Parent::Root, "Outer");
        let inner = category(&mut tree, Parent::Category(outer), "Inner");
        assert!(tree.attach(outer, Parent::Category(inner), None).is_err());
        assert!(tree.attach(outer, Parent::Category(outer), None).is_err());
    }

    #[test]
    fn traversal_is_preorder() {
        let mut tree = PlannerTree::new();
        let home = category(&mut tree, Parent::Root, "Home");
        let t1 = task(&mut tree, Parent::Category(home), "t1");
        let garden = category(&mut tree, Parent::Category(home), "Garden");
        let t2 = task(&mut tree, Parent::Category(garden), "t2");
        let t3 = task(&mut tree, Parent::Root, "t3");

        assert_eq!(tree.all_tasks(), vec![t1, t2, t3]);
        assert_eq!(tree.all_categories(), vec![home, garden]);
        assert_eq!(tree.depth(t2), 2);
    }

    #[test]
    fn deleted_tasks_leave_traversal_but_keep_ids() {
        let mut tree = PlannerTree::new();
        let a = task(&mut tree, Parent::Root, "a");
        let a_id = tree.task(a).unwrap().id;
        tree.delete_task(a).unwrap();

        assert!(tree.all_tasks().is_empty());
        assert!(tree.task(a).unwrap().is_deleted);
        assert_eq!(tree.find_task(a_id), Some(a));
        assert!(tree.allocate_task_id() > a_id);
    }

    #[test]
    fn chunk_round_trip_preserves_shape() {
        let mut tree = PlannerTree::new();
        let home = category(&mut tree, Parent::Root, "Home");
        let plants = task(&mut tree, Parent::Category(home), "Water plants");
        tree.task_mut(plants).unwrap().frequency = Some(7);
        task(&mut tree, Parent::Root, "Taxes");
        let gone = task(&mut tree, Parent::Root, "Gone");
        tree.delete_task(gone).unwrap();

        let chunk = tree.to_chunk();
        assert_eq!(chunk.next_task_id, TaskId::new(4));

        let restored = PlannerTree::from_chunk(chunk.clone()).unwrap();
        assert_eq!(restored.to_chunk(), chunk);
        assert_eq!(names(&restored, Parent::Root), ["Home", "Taxes"]);
        assert_eq!(restored.next_task_id(), TaskId::new(4));
    }

    fn bare_record(id: u64) -> TaskRecord {
        TaskRecord {
            id: TaskId::new(id),
            name: "bare".into(),
            frequency: None,
            due_date: None,
            due_date_is_manual: None,
            upcoming_period: None,
            grace_period: None,
            active_months: None,
            notes: String::new(),
        }
    }

    #[test]
    fn from_chunk_rejects_oversized_frequency() {
        let record = TaskRecord {
            frequency: Some(100_000_000),
            ..bare_record(1)
        };
        let chunk = PlannerItemsChunk {
            version: CHUNK_SCHEMA_VERSION,
            next_task_id: TaskId::new(2),
            items: vec![PlannerItemRecord::Task(record)],
        };
        assert!(matches!(
            PlannerTree::from_chunk(chunk),
            Err(CoreError::Schema { .. })
        ));
    }

    #[test]
    fn from_chunk_rejects_duplicate_ids() {
        let record = TaskRecord {
            id: TaskId::new(1),
            name: "dup".into(),
            frequency: None,
            due_date: None,
            due_date_is_manual: None,
            upcoming_period: None,
            grace_period: None,
            active_months: None,
            notes: String::new(),
        };
        let chunk = PlannerItemsChunk {
            version: CHUNK_SCHEMA_VERSION,
            next_task_id: TaskId::new(2),
            items: vec![
                PlannerItemRecord::Task(record.clone()),
                PlannerItemRecord::Task(record),
            ],
        };
        assert!(matches!(
            PlannerTree::from_chunk(chunk),
            Err(CoreError::Schema { .. })
        ));
    }
}
