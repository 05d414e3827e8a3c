//! Task status derivation

use serde::{Deserialize, Serialize};
use std::fmt;
use upkeep_util::{CalendarDate, whole_days_between};

use crate::Task;

/// Display status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    NeverCompleted,
    Completed,
    Upcoming,
    Grace,
    Overdue,
    Inactive,
}

impl TaskStatus {
    /// Every status, in legend order
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::NeverCompleted,
        TaskStatus::Completed,
        TaskStatus::Upcoming,
        TaskStatus::Grace,
        TaskStatus::Overdue,
        TaskStatus::Inactive,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::NeverCompleted => "neverCompleted",
            TaskStatus::Completed => "completed",
            TaskStatus::Upcoming => "upcoming",
            TaskStatus::Grace => "grace",
            TaskStatus::Overdue => "overdue",
            TaskStatus::Inactive => "inactive",
        }
    }

    pub fn display_text(&self) -> &'static str {
        match self {
            TaskStatus::NeverCompleted => "Never completed",
            TaskStatus::Completed => "Completed",
            TaskStatus::Upcoming => "Due date is upcoming",
            TaskStatus::Grace => "Grace period after due date",
            TaskStatus::Overdue => "Overdue",
            TaskStatus::Inactive => "Out of season",
        }
    }

    /// Legend colour as `#RRGGBB`
    pub fn colour(&self) -> &'static str {
        match self {
            TaskStatus::NeverCompleted => "#4444FF",
            TaskStatus::Completed => "#44FF44",
            TaskStatus::Upcoming => "#DDDD00",
            TaskStatus::Grace => "#FF8800",
            TaskStatus::Overdue => "#FF0000",
            TaskStatus::Inactive => "#CCCCCC",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_text())
    }
}

/// Status of `task` on `today`. First matching rule wins, so an overdue
/// task stays overdue out of season.
pub fn status_of(task: &Task, today: CalendarDate) -> TaskStatus {
    if let Some(due) = task.due_date {
        let offset = whole_days_between(today, due);
        if offset >= 0 {
            return match task.grace_period {
                Some(grace) if offset < i64::from(grace) => TaskStatus::Grace,
                _ => TaskStatus::Overdue,
            };
        }
        let upcoming = task
            .upcoming_period
            .is_some_and(|period| offset >= -i64::from(period));
        if upcoming {
            return TaskStatus::Upcoming;
        }
    }

    if task
        .active_months
        .as_ref()
        .is_some_and(|months| !months.contains(today))
    {
        return TaskStatus::Inactive;
    }

    if task.completions.is_empty() {
        TaskStatus::NeverCompleted
    } else {
        TaskStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Completion, CompletionId};
    use upkeep_util::{ActiveMonths, TaskId, add_days};

    fn today() -> CalendarDate {
        CalendarDate::new(2025, 7, 15).unwrap()
    }

    fn task_due(offset_days: i64) -> Task {
        let mut task = Task::new(TaskId::new(1), "t");
        task.due_date = Some(add_days(today(), offset_days));
        task.due_date_is_manual = Some(true);
        task
    }

    #[test]
    fn grace_then_overdue() {
        let mut task = task_due(-1);
        task.grace_period = Some(2);
        assert_eq!(status_of(&task, today()), TaskStatus::Grace);

        task.grace_period = Some(0);
        assert_eq!(status_of(&task, today()), TaskStatus::Overdue);

        task.grace_period = None;
        assert_eq!(status_of(&task, today()), TaskStatus::Overdue);
    }

    #[test]
    fn due_today_counts_as_past_due() {
        let mut task = task_due(0);
        task.grace_period = Some(1);
        assert_eq!(status_of(&task, today()), TaskStatus::Grace);
    }

    #[test]
    fn upcoming_window() {
        let mut task = task_due(3);
        task.upcoming_period = Some(3);
        assert_eq!(status_of(&task, today()), TaskStatus::Upcoming);

        task.upcoming_period = Some(2);
        assert_eq!(status_of(&task, today()), TaskStatus::NeverCompleted);
    }

    #[test]
    fn overdue_wins_over_inactive() {
        let mut task = task_due(-5);
        task.active_months = Some(ActiveMonths::only(&[1]).unwrap());
        assert_eq!(status_of(&task, today()), TaskStatus::Overdue);

        let mut task = task_due(30);
        task.active_months = Some(ActiveMonths::only(&[1]).unwrap());
        assert_eq!(status_of(&task, today()), TaskStatus::Inactive);
    }

    #[test]
    fn completed_versus_never() {
        let mut task = Task::new(TaskId::new(1), "t");
        assert_eq!(status_of(&task, today()), TaskStatus::NeverCompleted);
        task.completions.push(Completion::new(
            CompletionId::new(0),
            task.id,
            today(),
            false,
            "",
        ));
        assert_eq!(status_of(&task, today()), TaskStatus::Completed);
    }

    #[test]
    fn legend_matches_names() {
        assert_eq!(TaskStatus::Grace.colour(), "#FF8800");
        assert_eq!(TaskStatus::Inactive.to_string(), "Out of season");
        let names: Vec<_> = TaskStatus::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), 6);
    }
}
