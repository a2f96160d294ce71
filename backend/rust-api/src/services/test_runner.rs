use serde_json::Value;
use std::sync::Arc;

use crate::metrics::TEST_RUNS_TOTAL;
use crate::models::{TestCase, TestResult, TestRun};
use crate::services::executor::{CallOutcome, CodeExecutor, Execution};

/// Runs student code against the visible test cases of a question or
/// problem. Hidden cases never leave this module.
#[derive(Clone)]
pub struct TestRunner {
    executor: Arc<dyn CodeExecutor>,
}

impl TestRunner {
    pub fn new(executor: Arc<dyn CodeExecutor>) -> Self {
        Self { executor }
    }

    pub async fn run(&self, code: &str, function_name: &str, test_cases: &[TestCase]) -> TestRun {
        let visible: Vec<&TestCase> = test_cases.iter().filter(|tc| !tc.is_hidden).collect();
        let calls: Vec<Vec<Value>> = visible
            .iter()
            .map(|tc| spread_arguments(&tc.input))
            .collect();

        let execution = match self.executor.execute(code, function_name, &calls).await {
            Ok(execution) => execution,
            Err(e) => {
                tracing::warn!("Code execution failed: {:#}", e);
                TEST_RUNS_TOTAL.with_label_values(&["error"]).inc();
                return TestRun::failed(format!("Could not run your code: {}", e));
            }
        };

        let run = match execution {
            Execution::FunctionMissing => TestRun::failed(format!(
                "Function \"{}\" not found. Make sure you define it.",
                function_name
            )),
            Execution::LoadFailed { message } => TestRun::failed(message),
            Execution::Completed { outcomes } => {
                let mut outcomes = outcomes.into_iter();
                let results = visible
                    .iter()
                    .map(|tc| grade(tc, outcomes.next()))
                    .collect();
                TestRun {
                    results,
                    error: None,
                }
            }
        };

        let label = if run.error.is_some() {
            "error"
        } else if run.all_passed() {
            "passed"
        } else {
            "failed"
        };
        TEST_RUNS_TOTAL.with_label_values(&[label]).inc();

        run
    }
}

fn grade(test_case: &TestCase, outcome: Option<CallOutcome>) -> TestResult {
    let (passed, actual, error) = match outcome {
        Some(CallOutcome::Returned { value }) => {
            (deep_equal(&value, &test_case.expected_output), value, None)
        }
        Some(CallOutcome::Undefined) => (
            false,
            Value::Null,
            Some("Function returned undefined".to_string()),
        ),
        Some(CallOutcome::Threw { message }) | Some(CallOutcome::Unserializable { message }) => {
            (false, Value::Null, Some(message))
        }
        None => (false, Value::Null, Some("No result was produced".to_string())),
    };

    TestResult {
        test_case_id: test_case.id.clone(),
        description: test_case.description.clone(),
        passed,
        actual,
        expected: test_case.expected_output.clone(),
        error,
    }
}

/// Arrays are positional arguments, `null` means no arguments, anything else
/// is a single argument.
pub fn spread_arguments(input: &Value) -> Vec<Value> {
    match input {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Structural equality; numbers compare by value so `6` equals `6.0`.
pub fn deep_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| deep_equal(x, y)))
        }
        _ => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records the calls it receives and doubles every number.
    struct Doubler {
        seen: Mutex<Vec<Vec<Value>>>,
    }

    #[async_trait]
    impl CodeExecutor for Doubler {
        async fn execute(
            &self,
            _code: &str,
            function_name: &str,
            calls: &[Vec<Value>],
        ) -> anyhow::Result<Execution> {
            self.seen.lock().unwrap().extend(calls.iter().cloned());
            if function_name != "doubleAll" {
                return Ok(Execution::FunctionMissing);
            }
            let outcomes = calls
                .iter()
                .map(|args| match args.first() {
                    Some(Value::String(s)) if s == "nothing" => CallOutcome::Undefined,
                    Some(Value::String(s)) if s == "huge" => CallOutcome::Unserializable {
                        message: "Do not know how to serialize a BigInt".into(),
                    },
                    Some(Value::Array(items)) => CallOutcome::Returned {
                        value: Value::Array(
                            items
                                .iter()
                                .map(|v| json!(v.as_i64().unwrap_or_default() * 2))
                                .collect(),
                        ),
                    },
                    _ => CallOutcome::Threw {
                        message: "items is not iterable".into(),
                    },
                })
                .collect();
            Ok(Execution::Completed { outcomes })
        }
    }

    fn case(id: &str, input: Value, expected: Value, hidden: bool) -> TestCase {
        TestCase {
            id: id.into(),
            description: format!("case {}", id),
            input,
            expected_output: expected,
            is_hidden: hidden,
        }
    }

    fn runner() -> (TestRunner, Arc<Doubler>) {
        let executor = Arc::new(Doubler {
            seen: Mutex::new(Vec::new()),
        });
        (TestRunner::new(executor.clone()), executor)
    }

    #[tokio::test]
    async fn fresh_array_with_same_contents_passes() {
        let (runner, _) = runner();
        let run = runner
            .run(
                "function doubleAll(a) { return a.map(x => x * 2); }",
                "doubleAll",
                &[case("1", json!([[1, 2, 3]]), json!([2, 4, 6]), false)],
            )
            .await;

        assert!(run.error.is_none());
        assert!(run.all_passed());
        assert_eq!(run.results[0].actual, json!([2, 4, 6]));
    }

    #[tokio::test]
    async fn hidden_cases_are_never_executed() {
        let (runner, executor) = runner();
        let run = runner
            .run(
                "",
                "doubleAll",
                &[
                    case("1", json!([[1]]), json!([2]), false),
                    case("2", json!([[5]]), json!([10]), true),
                ],
            )
            .await;

        assert_eq!(run.results.len(), 1);
        assert_eq!(executor.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_function_yields_error_without_results() {
        let (runner, _) = runner();
        let run = runner
            .run(
                "const x = 1;",
                "sumPair",
                &[case("1", json!([1, 2]), json!(3), false)],
            )
            .await;

        assert!(run.results.is_empty());
        assert!(run.error.unwrap().contains("sumPair"));
    }

    #[tokio::test]
    async fn exception_is_reported_per_case() {
        let (runner, _) = runner();
        let run = runner
            .run(
                "",
                "doubleAll",
                &[
                    case("1", json!(7), json!(14), false),
                    case("2", json!([[1]]), json!([2]), false),
                ],
            )
            .await;

        assert!(run.error.is_none());
        assert!(!run.results[0].passed);
        assert_eq!(
            run.results[0].error.as_deref(),
            Some("items is not iterable")
        );
        assert!(run.results[1].passed);
    }

    #[tokio::test]
    async fn undefined_never_matches_null() {
        let (runner, _) = runner();
        let run = runner
            .run(
                "",
                "doubleAll",
                &[
                    case("1", json!("nothing"), Value::Null, false),
                    case("2", json!("huge"), json!(1), false),
                    case("3", json!([[3]]), json!([6]), false),
                ],
            )
            .await;

        assert!(run.error.is_none());
        assert!(!run.results[0].passed);
        assert_eq!(
            run.results[0].error.as_deref(),
            Some("Function returned undefined")
        );
        assert!(!run.results[1].passed);
        assert!(run.results[1].error.as_deref().unwrap().contains("BigInt"));
        assert!(run.results[2].passed);
    }

    #[test]
    fn arguments_are_spread_by_shape() {
        assert_eq!(spread_arguments(&json!([1, 2])), vec![json!(1), json!(2)]);
        assert_eq!(spread_arguments(&Value::Null), Vec::<Value>::new());
        assert_eq!(spread_arguments(&json!("abc")), vec![json!("abc")]);
        assert_eq!(
            spread_arguments(&json!({ "a": 1 })),
            vec![json!({ "a": 1 })]
        );
    }

    #[test]
    fn deep_equality_covers_nesting() {
        assert!(deep_equal(
            &json!({ "a": [1, { "b": 2 }] }),
            &json!({ "a": [1, { "b": 2.0 }] })
        ));
        assert!(!deep_equal(&json!([1, 2]), &json!([2, 1])));
        assert!(!deep_equal(&json!({ "a": 1 }), &json!({ "a": 1, "b": 2 })));
        assert!(!deep_equal(&json!("1"), &json!(1)));
    }
}
