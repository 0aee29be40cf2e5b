use std::sync::Arc;
use std::thread;
use std::time::Duration;

use UrbanFetch::config::job::RetryPolicy;
use UrbanFetch::data_model::{
    Column, FailureKind, FetchRequest, FetchResult, FieldValue, HttpResponse, InputRow, Payload,
    Record, RowOutcome,
};
use UrbanFetch::error::{FetchError, Result};
use UrbanFetch::executor::BatchExecutor;
use UrbanFetch::pipeline::fetcher::Fetcher;
use UrbanFetch::pipeline::sources::Source;

mod common;
use common::{status_only, ScriptedTransport};

/// Echoes the `code` field back as the HTTP status; rows without one cannot be planned.
struct EchoSource;

impl Source for EchoSource {
    fn name(&self) -> &'static str {
        "Echo"
    }

    fn columns(&self) -> Vec<Column> {
        vec![Column::utf8("echo")]
    }

    fn plan(&self, input: &InputRow) -> Result<Vec<FetchRequest>> {
        let code = input
            .field("code")
            .ok_or_else(|| FetchError::InputError(format!("{} has no code", input.id)))?;
        Ok(vec![FetchRequest::new(
            "http://echo.test/",
            vec![
                ("code".to_string(), code.to_string()),
                ("id".to_string(), input.id.clone()),
            ],
        )])
    }

    fn interpret(
        &self,
        input: &InputRow,
        _request: &FetchRequest,
        _response: &HttpResponse,
    ) -> FetchResult {
        FetchResult::Success(Payload::single(
            Record::new(input.id.clone()).with("echo", FieldValue::text(input.id.clone())),
        ))
    }
}

fn echo_transport() -> Arc<ScriptedTransport> {
    Arc::new(ScriptedTransport::new(|request, _| {
        // Stagger completions so later rows often finish first.
        let id: usize = request
            .param("id")
            .and_then(|id| id.trim_start_matches('r').parse().ok())
            .unwrap_or(0);
        thread::sleep(Duration::from_millis(((20 - id % 20) as u64) / 2));
        let status = request.param("code").and_then(|c| c.parse().ok()).unwrap_or(500);
        Ok(status_only(status))
    }))
}

fn executor(transport: Arc<ScriptedTransport>, pool_size: usize, max_fatal: usize) -> BatchExecutor {
    BatchExecutor::new(
        Fetcher::new(transport, RetryPolicy::immediate(1)),
        pool_size,
        max_fatal,
    )
    .expect("executor")
}

fn rows(codes: &[&str]) -> Vec<InputRow> {
    codes
        .iter()
        .enumerate()
        .map(|(i, code)| {
            let row = InputRow::new(format!("r{}", i));
            if code.is_empty() {
                row
            } else {
                row.with_field("code", *code)
            }
        })
        .collect()
}

#[test]
fn test_outcomes_keep_input_order() {
    let batch = rows(&["200"; 20]);
    let executor = executor(echo_transport(), 4, 5);

    let outcomes = executor.run_batch(&EchoSource, &batch);

    let ids: Vec<&str> = outcomes.iter().map(RowOutcome::input_id).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("r{}", i)).collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(outcomes.iter().all(RowOutcome::is_resolved));
}

#[test]
fn test_outcome_kinds() {
    let batch = rows(&["200", "404", "503", "401", ""]);
    let executor = executor(echo_transport(), 2, 10);

    let outcomes = executor.run_batch(&EchoSource, &batch);

    assert!(matches!(outcomes[0], RowOutcome::Fetched { .. }));
    assert!(matches!(outcomes[1], RowOutcome::NotFound { sentinel: None, .. }));
    assert!(matches!(
        outcomes[2],
        RowOutcome::Failed {
            kind: FailureKind::Transient,
            ..
        }
    ));
    assert!(matches!(
        outcomes[3],
        RowOutcome::Failed {
            kind: FailureKind::Fatal,
            ..
        }
    ));
    assert!(matches!(
        outcomes[4],
        RowOutcome::Failed {
            kind: FailureKind::InvalidInput,
            ..
        }
    ));
    assert!(!executor.is_aborted());
}

#[test]
fn test_consecutive_fatal_failures_abort_the_run() {
    let transport = echo_transport();
    let executor = executor(transport.clone(), 1, 3);

    let first = executor.run_batch(&EchoSource, &rows(&["403", "403", "403", "403"]));
    assert!(executor.is_aborted());
    let fatal = first
        .iter()
        .filter(|o| matches!(o, RowOutcome::Failed { .. }))
        .count();
    assert!(fatal >= 3, "Expected at least 3 fatal outcomes, got {}", fatal);

    let calls_before = transport.calls();
    let second = executor.run_batch(&EchoSource, &rows(&["200", "200"]));
    assert!(second
        .iter()
        .all(|o| matches!(o, RowOutcome::Skipped { .. })));
    assert_eq!(transport.calls(), calls_before);

    match executor.abort_error() {
        Some(FetchError::Aborted {
            consecutive,
            last_reason,
        }) => {
            assert!(consecutive >= 3);
            assert!(last_reason.contains("403"), "Unexpected reason: {}", last_reason);
        }
        other => panic!("Expected Aborted, got {:?}", other),
    }
}

#[test]
fn test_success_resets_the_fatal_streak() {
    let executor = executor(echo_transport(), 1, 3);

    for codes in [["403", "403"], ["200", "200"], ["403", "403"]] {
        executor.run_batch(&EchoSource, &rows(&codes));
    }

    assert!(!executor.is_aborted());
    assert!(executor.abort_error().is_none());
}

#[test]
fn test_invalid_rows_do_not_trip_the_breaker() {
    let executor = executor(echo_transport(), 1, 2);

    let outcomes = executor.run_batch(&EchoSource, &rows(&["", "", "", "", ""]));

    assert!(!executor.is_aborted());
    assert!(outcomes.iter().all(|o| matches!(
        o,
        RowOutcome::Failed {
            kind: FailureKind::InvalidInput,
            ..
        }
    )));
}

#[test]
fn test_zero_pool_size_is_rejected() {
    let transport = echo_transport();
    let result = BatchExecutor::new(
        Fetcher::new(transport, RetryPolicy::immediate(1)),
        0,
        5,
    );
    assert!(matches!(
        result,
        Err(FetchError::InvalidParameter { .. })
    ));
}
