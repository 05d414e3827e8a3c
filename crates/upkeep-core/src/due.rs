//! Due-date state machine

use upkeep_util::{CalendarDate, project_due_date};

use crate::Task;

/// Re-derive a task's due date after a completion change or a day passing.
///
/// - No policy (`due_date_is_manual == None`): untouched.
/// - Manual: kept until the latest completion lands on or after it (when
///   `completion_added`), or until `today` passes it. Then a one-off task
///   drops its due date and policy, and a recurring one switches to the
///   automatic projection.
/// - Automatic with a frequency: always the projection of the latest
///   completion.
///
/// Returns whether the due date or policy changed.
pub fn check_due_date(task: &mut Task, completion_added: bool, today: CalendarDate) -> bool {
    let before = (task.due_date, task.due_date_is_manual);

    match task.due_date_is_manual {
        None => {}
        Some(true) => {
            let Some(due) = task.due_date else {
                task.due_date_is_manual = None;
                return before != (task.due_date, task.due_date_is_manual);
            };
            let completed_on_time = completion_added
                && task.last_completion_date().is_some_and(|last| last >= due);
            let passed = today > due;

            if completed_on_time || passed {
                match task.frequency {
                    None => {
                        task.due_date = None;
                        task.due_date_is_manual = None;
                    }
                    Some(frequency) => {
                        task.due_date = Some(projection(task, frequency, today));
                        task.due_date_is_manual = Some(false);
                    }
                }
            }
        }
        Some(false) => {
            if let Some(frequency) = task.frequency {
                task.due_date = Some(projection(task, frequency, today));
            }
        }
    }

    before != (task.due_date, task.due_date_is_manual)
}

fn projection(task: &Task, frequency: u32, today: CalendarDate) -> CalendarDate {
    project_due_date(
        frequency,
        task.active_months.as_ref(),
        task.last_completion_date(),
        today,
    )
}
