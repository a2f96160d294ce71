use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Result of loading student code and calling one function with each
/// argument list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Execution {
    Completed { outcomes: Vec<CallOutcome> },
    FunctionMissing,
    LoadFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallOutcome {
    Returned {
        #[serde(default)]
        value: Value,
    },
    /// The function finished without returning a value.
    Undefined,
    Threw {
        message: String,
    },
    /// The return value has no JSON form (BigInt, cycles, functions).
    Unserializable {
        message: String,
    },
}

/// Runs untrusted student code. Implementations never judge results.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        function_name: &str,
        calls: &[Vec<Value>],
    ) -> Result<Execution>;
}

lazy_static! {
    static ref JS_IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap();
}

pub fn is_valid_function_name(name: &str) -> bool {
    JS_IDENTIFIER.is_match(name)
}

const HARNESS: &str = r#"
const chunks = [];
const write = (s) => process.stderr.write(s + '\n');
console.log = console.info = console.warn = console.error = (...a) => write(a.map(String).join(' '));
process.stdin.on('data', (c) => chunks.push(c));
process.stdin.on('end', () => {
  const emit = (r) => process.stdout.write(JSON.stringify(r));
  const { code, functionName, calls } = JSON.parse(Buffer.concat(chunks).toString());
  let fn;
  try {
    fn = new Function(code + `\nreturn typeof ${functionName} === 'function' ? ${functionName} : undefined;`)();
  } catch (e) {
    emit({ status: 'load_failed', message: String((e && e.message) || e) });
    return;
  }
  if (typeof fn !== 'function') {
    emit({ status: 'function_missing' });
    return;
  }
  const outcomes = calls.map((args) => {
    let value;
    try {
      value = fn(...args);
    } catch (e) {
      return { kind: 'threw', message: String((e && e.message) || e) };
    }
    if (value === undefined) return { kind: 'undefined' };
    let encoded;
    try {
      encoded = JSON.stringify(value);
    } catch (e) {
      return { kind: 'unserializable', message: String((e && e.message) || e) };
    }
    if (encoded === undefined) {
      return { kind: 'unserializable', message: `Cannot compare a returned ${typeof value}` };
    }
    return { kind: 'returned', value };
  });
  emit({ status: 'completed', outcomes });
});
"#;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarnessInput<'a> {
    code: &'a str,
    function_name: &'a str,
    calls: &'a [Vec<Value>],
}

/// Executes JavaScript with a local `node` binary, one child process per run.
pub struct NodeExecutor {
    node_binary: String,
    timeout: Duration,
}

impl NodeExecutor {
    pub fn new(node_binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            node_binary: node_binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CodeExecutor for NodeExecutor {
    async fn execute(
        &self,
        code: &str,
        function_name: &str,
        calls: &[Vec<Value>],
    ) -> Result<Execution> {
        if !is_valid_function_name(function_name) {
            return Ok(Execution::FunctionMissing);
        }

        let input = serde_json::to_vec(&HarnessInput {
            code,
            function_name,
            calls,
        })
        .context("Failed to encode harness input")?;

        let mut child = Command::new(&self.node_binary)
            .arg("-e")
            .arg(HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.node_binary))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("child stdin unavailable"))?;
        stdin
            .write_all(&input)
            .await
            .context("Failed to write harness input")?;
        drop(stdin);

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.context("Failed to collect harness output")?,
            Err(_) => {
                tracing::warn!("Student code timed out after {:?}", self.timeout);
                return Ok(Execution::LoadFailed {
                    message: format!(
                        "Execution timed out after {} ms",
                        self.timeout.as_millis()
                    ),
                });
            }
        };

        if output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(Execution::LoadFailed {
                message: stderr
                    .lines()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("Execution produced no output")
                    .to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).context("Harness produced an unreadable report")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn function_names_are_plain_identifiers() {
        assert!(is_valid_function_name("doubleAll"));
        assert!(is_valid_function_name("_x$1"));
        assert!(!is_valid_function_name("a; process.exit()"));
        assert!(!is_valid_function_name("1abc"));
        assert!(!is_valid_function_name(""));
    }

    #[test]
    fn harness_report_decodes() {
        let report: Execution = serde_json::from_value(json!({
            "status": "completed",
            "outcomes": [
                { "kind": "returned", "value": [2, 4] },
                { "kind": "returned" },
                { "kind": "threw", "message": "boom" },
                { "kind": "undefined" },
                { "kind": "unserializable", "message": "Do not know how to serialize a BigInt" }
            ]
        }))
        .unwrap();

        assert_eq!(
            report,
            Execution::Completed {
                outcomes: vec![
                    CallOutcome::Returned { value: json!([2, 4]) },
                    CallOutcome::Returned { value: Value::Null },
                    CallOutcome::Threw {
                        message: "boom".into()
                    },
                    CallOutcome::Undefined,
                    CallOutcome::Unserializable {
                        message: "Do not know how to serialize a BigInt".into()
                    },
                ]
            }
        );

        let missing: Execution =
            serde_json::from_value(json!({ "status": "function_missing" })).unwrap();
        assert_eq!(missing, Execution::FunctionMissing);
    }
}
