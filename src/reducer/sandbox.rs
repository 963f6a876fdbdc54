//! Time-bounded execution of predicate conditions
//!
//! Conditions run on the blocking pool so a slow or spinning condition can
//! not stall the async workers. A panic is caught by the join handle, and the
//! wall-clock bound is enforced with `tokio::time::timeout`. A timed-out
//! condition keeps its blocking thread until it returns; its result is dropped.

use super::conditions::Condition;
use super::strategy::Evaluation;
use super::types::EventRecord;
use std::time::Duration;

pub async fn run_condition(
    name: &str,
    condition: Condition,
    members: Vec<EventRecord>,
    timeout: Duration,
) -> Evaluation {
    let handle = tokio::task::spawn_blocking(move || condition(members.as_slice()));

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(true))) => Evaluation::complete(format!("condition {} satisfied", name)),
        Ok(Ok(Ok(false))) => Evaluation::NotComplete,
        Ok(Ok(Err(reason))) => Evaluation::Error(format!("condition {} failed: {}", name, reason)),
        Ok(Err(join_err)) if join_err.is_panic() => {
            Evaluation::Error(format!("condition {} panicked", name))
        }
        Ok(Err(join_err)) => Evaluation::Error(format!("condition {} aborted: {}", name, join_err)),
        Err(_) => Evaluation::Error(format!(
            "condition {} timed out after {}ms",
            name,
            timeout.as_millis()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::conditions::condition_fn;

    #[tokio::test]
    async fn test_condition_result_passthrough() {
        let yes = condition_fn(|_: &[EventRecord]| Ok(true));
        let no = condition_fn(|_: &[EventRecord]| Ok(false));

        let verdict = run_condition("yes", yes, vec![], Duration::from_secs(1)).await;
        assert!(verdict.is_complete());
        assert_eq!(
            run_condition("no", no, vec![], Duration::from_secs(1)).await,
            Evaluation::NotComplete
        );
    }

    #[tokio::test]
    async fn test_condition_error_is_reported() {
        let failing = condition_fn(|_: &[EventRecord]| Err("not a boolean".to_string()));
        let verdict = run_condition("failing", failing, vec![], Duration::from_secs(1)).await;

        match verdict {
            Evaluation::Error(reason) => assert!(reason.contains("not a boolean")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_condition_panic_is_contained() {
        let panicking = condition_fn(|_: &[EventRecord]| panic!("boom"));
        let verdict = run_condition("panicking", panicking, vec![], Duration::from_secs(1)).await;

        assert_eq!(verdict, Evaluation::Error("condition panicking panicked".to_string()));
    }

    #[tokio::test]
    async fn test_condition_timeout() {
        let slow = condition_fn(|_: &[EventRecord]| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(true)
        });
        let verdict = run_condition("slow", slow, vec![], Duration::from_millis(20)).await;

        match verdict {
            Evaluation::Error(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
