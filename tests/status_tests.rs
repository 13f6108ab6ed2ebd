use mlplane::status::{calculate, Derived, JobStatus, Lifecycle, RunStatus, StepStatus, TaskStatus};

fn assert_terminal_is_final<S: Lifecycle>(all: &[S]) {
    for from in all.iter().copied().filter(|s| s.is_terminal()) {
        for to in all.iter().copied() {
            assert!(
                !from.can_transition_to(to),
                "{} {} -> {} must not be allowed",
                S::LEVEL,
                from,
                to
            );
        }
    }
}

fn assert_no_self_edges<S: Lifecycle>(all: &[S]) {
    for status in all.iter().copied() {
        assert!(!status.can_transition_to(status), "{} {}", S::LEVEL, status);
    }
}

/// Every ordering of `items`.
fn orderings<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in orderings(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

fn assert_order_free(children: &[TaskStatus], expected: Derived) {
    for ordering in orderings(children) {
        assert_eq!(calculate(ordering.clone()), expected, "children {:?}", ordering);
    }
}

#[test]
fn test_terminal_states_have_no_outgoing_edges() {
    assert_terminal_is_final(&TaskStatus::ALL);
    assert_terminal_is_final(&StepStatus::ALL);
    assert_terminal_is_final(&JobStatus::ALL);
    assert_terminal_is_final(&RunStatus::ALL);
}

#[test]
fn test_repeating_a_status_is_not_a_transition() {
    assert_no_self_edges(&TaskStatus::ALL);
    assert_no_self_edges(&StepStatus::ALL);
    assert_no_self_edges(&JobStatus::ALL);
    assert_no_self_edges(&RunStatus::ALL);
}

#[test]
fn test_every_run_status_maps_onto_a_reachable_task_status() {
    for run in RunStatus::ALL {
        let task = run.task_view();
        assert!(TaskStatus::ALL.contains(&task));
        assert_eq!(run.is_terminal(), task.is_terminal(), "{}", run);
    }
}

#[test]
fn test_non_terminal_states_can_always_be_canceled() {
    for status in TaskStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
        assert!(status.can_transition_to(TaskStatus::Canceled), "{}", status);
    }
    for status in JobStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
        assert!(status.can_transition_to(JobStatus::Canceled), "{}", status);
    }
}

#[test]
fn test_calculator_ignores_child_order() {
    use TaskStatus::*;

    // any child active
    assert_order_free(&[Running, Fail, Success, Created], Derived::Running);
    assert_order_free(&[Preparing, Canceled, Success], Derived::Running);
    // all terminal, some failed
    assert_order_free(&[Fail, Success, Canceled, Success], Derived::Fail);
    // all canceled
    assert_order_free(&[Canceled, Canceled, Canceled], Derived::Canceled);
    // all succeeded
    assert_order_free(&[Success, Success, Success, Success], Derived::Success);
    // anything else
    assert_order_free(&[Success, Created, Fail], Derived::Created);
    assert_order_free(&[Success, Canceled, Success], Derived::Created);
}

#[test]
fn test_calculator_is_repeatable() {
    let children = [
        StepStatus::Success,
        StepStatus::Canceled,
        StepStatus::Fail,
    ];
    let first = calculate(children);
    for _ in 0..10 {
        assert_eq!(calculate(children), first);
    }
    assert_eq!(first, Derived::Fail);
}
