//! Validation of user-entered task and completion fields

use upkeep_util::{ActiveMonths, CalendarDate, parse_completion_date, parse_date};

use crate::{CoreError, CoreResult, Task};

/// Longest accepted repetition interval, about a century
pub const MAX_FREQUENCY_DAYS: u32 = 36_500;

/// Raw task editor input. Empty text means "not set".
#[derive(Debug, Clone, Default)]
pub struct TaskForm {
    pub name: String,
    pub frequency: String,
    pub due_date: String,
    pub upcoming_period: String,
    pub grace_period: String,
    /// `None` means every month is active
    pub active_months: Option<ActiveMonths>,
    pub notes: String,
}

/// Validated task fields
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFields {
    pub name: String,
    pub frequency: Option<u32>,
    pub due_date: Option<CalendarDate>,
    pub upcoming_period: Option<u32>,
    pub grace_period: Option<u32>,
    pub active_months: Option<ActiveMonths>,
    pub notes: String,
}

impl TaskForm {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Check every field; nothing is applied on error
    pub fn validate(&self) -> CoreResult<TaskFields> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("Please enter a task name."));
        }

        let frequency = parse_day_count(&self.frequency, "frequency")?;
        if frequency == Some(0) {
            return Err(CoreError::validation("Frequency must be at least one day."));
        }
        if frequency.is_some_and(|days| days > MAX_FREQUENCY_DAYS) {
            return Err(CoreError::validation(format!(
                "Frequency must be at most {} days.",
                MAX_FREQUENCY_DAYS
            )));
        }

        let due_date = match self.due_date.trim() {
            "" => None,
            text => Some(
                parse_date(text)
                    .map_err(|_| CoreError::validation("Please enter a valid due date."))?,
            ),
        };

        if self.active_months.is_some_and(|months| !months.any_active()) {
            return Err(CoreError::validation("Please select at least one active month."));
        }

        Ok(TaskFields {
            name: name.to_string(),
            frequency,
            due_date,
            upcoming_period: parse_day_count(&self.upcoming_period, "upcoming period")?,
            grace_period: parse_day_count(&self.grace_period, "grace period")?,
            active_months: self.active_months,
            notes: self.notes.clone(),
        })
    }

    /// Pre-fill from an existing task
    pub fn from_task(task: &Task) -> Self {
        let text = |value: Option<u32>| value.map(|v| v.to_string()).unwrap_or_default();
        Self {
            name: task.name.clone(),
            frequency: text(task.frequency),
            due_date: match task.due_date_is_manual {
                Some(true) => task.due_date.map(|d| d.to_string()).unwrap_or_default(),
                _ => String::new(),
            },
            upcoming_period: text(task.upcoming_period),
            grace_period: text(task.grace_period),
            active_months: task.active_months,
            notes: task.notes.clone(),
        }
    }
}

impl TaskFields {
    /// Write the fields into `task` and pick its due-date policy.
    ///
    /// An entered due date is manual. Otherwise a recurring task is
    /// automatic and a one-off task has no due date.
    pub fn apply(self, task: &mut Task) {
        task.name = self.name;
        task.frequency = self.frequency;
        task.upcoming_period = self.upcoming_period;
        task.grace_period = self.grace_period;
        task.active_months = self.active_months;
        task.notes = self.notes;

        match (self.due_date, self.frequency) {
            (Some(due), _) => {
                task.due_date = Some(due);
                task.due_date_is_manual = Some(true);
            }
            (None, Some(_)) => {
                task.due_date_is_manual = Some(false);
            }
            (None, None) => {
                task.due_date = None;
                task.due_date_is_manual = None;
            }
        }
    }
}

fn parse_day_count(text: &str, field: &str) -> CoreResult<Option<u32>> {
    match text.trim() {
        "" => Ok(None),
        text => text
            .parse::<u32>()
            .map(Some)
            .map_err(|_| CoreError::validation(format!("Please enter a valid {}.", field))),
    }
}

/// Raw completion input
#[derive(Debug, Clone, Default)]
pub struct CompletionForm {
    /// `YYYY-MM-DD`, optionally prefixed with `~`; empty means today
    pub date: String,
    pub notes: String,
}

impl CompletionForm {
    pub fn today() -> Self {
        Self::default()
    }

    pub fn on(date: CalendarDate) -> Self {
        Self {
            date: date.to_string(),
            notes: String::new(),
        }
    }

    /// Returns the date and whether it is approximate
    pub fn validate(&self, today: CalendarDate) -> CoreResult<(CalendarDate, bool)> {
        match self.date.trim() {
            "" => Ok((today, false)),
            text => parse_completion_date(text)
                .map_err(|_| CoreError::validation("Please enter a valid completion date.")),
        }
    }
}
