//! Text rendering of the planner and path lookup

use anyhow::{Result, anyhow, bail};
use std::fmt::Write;
use upkeep_core::{ItemId, Parent, PlannerItem, PlannerTree, Task, TaskStatus, status_of};
use upkeep_util::CalendarDate;

const INDENT: &str = "  ";

/// Render the whole tree, one item per line, categories before their
/// children and every task followed by its status.
pub fn render_tree(tree: &PlannerTree, today: CalendarDate) -> String {
    let mut out = String::new();
    render_children(tree, Parent::Root, 0, today, &mut out);
    if out.is_empty() {
        out.push_str("No tasks yet. Add one with `upkeep add-task`.\n");
    }
    out
}

fn render_children(
    tree: &PlannerTree,
    parent: Parent,
    depth: usize,
    today: CalendarDate,
    out: &mut String,
) {
    let Ok(children) = tree.children(parent) else {
        return;
    };
    for &child in children {
        let indent = INDENT.repeat(depth);
        match tree.get(child) {
            Some(PlannerItem::Category(category)) => {
                let _ = writeln!(out, "{indent}{}/", category.name);
                render_children(tree, Parent::Category(child), depth + 1, today, out);
            }
            Some(PlannerItem::Task(task)) => {
                let _ = writeln!(out, "{indent}{}", task_line(task, status_of(task, today)));
            }
            None => {}
        }
    }
}

fn task_line(task: &Task, status: TaskStatus) -> String {
    let mut line = format!("{} [{}]", task.name, status);
    if let Some(due) = task.due_date {
        let _ = write!(line, " due {due}");
    }
    if let Some(last) = task.last_completion_date() {
        let _ = write!(line, ", last done {last}");
    }
    line
}

/// Completion history of one task, newest first
pub fn render_history(task: &Task) -> String {
    if task.completions.is_empty() {
        return format!("{} has never been completed.\n", task.name);
    }
    let mut out = String::new();
    for completion in task.completions.iter().rev() {
        let marker = if completion.is_approximate { "~" } else { "" };
        let _ = write!(out, "{marker}{}", completion.date);
        if !completion.notes.is_empty() {
            let _ = write!(out, "  {}", completion.notes);
        }
        out.push('\n');
    }
    out
}

/// Find an item by its `/`-separated name path, e.g. `Garden/Water plants`
pub fn resolve(tree: &PlannerTree, path: &str) -> Result<ItemId> {
    let mut parent = Parent::Root;
    let mut found = None;
    for segment in path.split('/').map(str::trim).filter(|s| !s.is_empty()) {
        let children = tree.children(parent)?;
        let item = children
            .iter()
            .copied()
            .find(|child| tree.get(*child).is_some_and(|item| item.name() == segment))
            .ok_or_else(|| anyhow!("No item named '{segment}' in '{path}'"))?;
        found = Some(item);
        parent = Parent::Category(item);
    }
    found.ok_or_else(|| anyhow!("Please give the path of an item."))
}

/// Resolve a path that must name a category; empty means the top level
pub fn resolve_parent(tree: &PlannerTree, path: Option<&str>) -> Result<Parent> {
    let Some(path) = path.filter(|p| !p.trim().is_empty()) else {
        return Ok(Parent::Root);
    };
    let item = resolve(tree, path)?;
    if tree.category(item).is_err() {
        bail!("'{path}' is a task, not a category");
    }
    Ok(Parent::Category(item))
}
