//! Review-task spawning and closing.
//!
//! These run inside a [`StateStore::mutate`](crate::services::task_store::StateStore::mutate)
//! closure, so they operate on `&mut AppState` directly.

use crate::domain::models::{ActivityEvent, Role, Task, TaskStatus, TaskType};
use crate::domain::models::ids::issue_id;
use crate::services::task_store::AppState;

/// Role that handles each review type.
pub const fn reviewer_role(task_type: TaskType) -> Role {
    match task_type {
        TaskType::PmReview => Role::Pm,
        TaskType::TlReview | TaskType::TlMerge | TaskType::Implementation => Role::TechLead,
    }
}

/// Queue a follow-on review task for `target_id`.
///
/// Skips review-type targets, targets with an open (todo/doing) review of
/// the same type, and stages with no routed reviewer. Returns the new task
/// id when one was created.
pub fn queue_review(
    state: &mut AppState,
    events: &mut Vec<ActivityEvent>,
    target_id: &str,
    review_type: TaskType,
) -> Option<String> {
    let target = state.task(target_id)?;
    if target.is_review_task() {
        return None;
    }

    let Some(reviewer) = state
        .agent_for_role(reviewer_role(review_type))
        .map(|p| p.agent_id.clone())
    else {
        events.push(
            ActivityEvent::system(
                format!("{}_queue_skipped", review_type.as_str()),
                format!("{} role not found for {target_id}", reviewer_role(review_type)),
            )
            .with_workflow(target.workflow_id.clone()),
        );
        return None;
    };

    let duplicate = state.tasks.iter().any(|t| {
        t.task_type == Some(review_type)
            && t.review_target_task_id.as_deref() == Some(target_id)
            && matches!(t.status, TaskStatus::Todo | TaskStatus::Doing)
    });
    if duplicate {
        return None;
    }

    let description = format!(
        "Review target={target_id}\n{}",
        target.description.as_deref().unwrap_or_default()
    )
    .trim()
    .to_string();
    let mut review = Task::with_id(
        issue_id("review"),
        format!("{} {}", review_type.title_prefix(), target.title),
        Some(description),
    );
    review.task_type = Some(review_type);
    review.review_target_task_id = Some(target_id.to_string());
    review.assignee = Some(reviewer.clone());
    review.workflow_id.clone_from(&target.workflow_id);

    let review_id = review.id.clone();
    events.push(
        ActivityEvent::workflow(
            format!("{}_queued", review_type.as_str()),
            format!("{review_id} for {target_id} assigned to {reviewer}"),
        )
        .with_agent(reviewer)
        .with_workflow(review.workflow_id.clone()),
    );
    state.tasks.push(review);
    Some(review_id)
}

/// Close open review tasks pointing at `target_id`.
///
/// With `only` set, just that review type is closed. Returns the closed ids.
pub fn close_reviews(state: &mut AppState, target_id: &str, only: Option<TaskType>) -> Vec<String> {
    let mut closed = Vec::new();
    for task in &mut state.tasks {
        let Some(kind) = task.task_type.filter(TaskType::is_review) else {
            continue;
        };
        if task.review_target_task_id.as_deref() != Some(target_id) || task.status == TaskStatus::Done {
            continue;
        }
        if only.is_some_and(|o| o != kind) {
            continue;
        }
        task.status = TaskStatus::Done;
        task.touch();
        closed.push(task.id.clone());
    }
    closed
}
