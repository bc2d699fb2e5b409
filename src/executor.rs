//! Step execution
//!
//! A `Sandbox` runs one statement at a time against a persistent
//! environment and reports display blocks or an error message. Nothing a
//! statement does can escape the sandbox as a panic or an `Err`.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as Json};
use std::sync::Mutex;

use crate::block::{DisplayBlock, Table};
use crate::interp::{Execution, Interpreter, Value};

/// Result of executing one statement
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Ok(Vec<DisplayBlock>),
    Failed(String),
}

impl ExecOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecOutcome::Ok(_))
    }

    /// `{ok: true, blocks}` or `{ok: false, error}`
    pub fn to_value(&self) -> Json {
        match self {
            ExecOutcome::Ok(blocks) => json!({
                "ok": true,
                "blocks": blocks.iter().map(DisplayBlock::to_value).collect::<Vec<_>>(),
            }),
            ExecOutcome::Failed(error) => json!({ "ok": false, "error": error, "blocks": [] }),
        }
    }

    pub fn from_value(value: &Json) -> Self {
        if value.get("ok").and_then(Json::as_bool).unwrap_or(false) {
            let blocks = value
                .get("blocks")
                .and_then(Json::as_array)
                .map(|items| items.iter().cloned().map(DisplayBlock::from_value).collect())
                .unwrap_or_default();
            ExecOutcome::Ok(blocks)
        } else {
            let error = value
                .get("error")
                .and_then(Json::as_str)
                .unwrap_or("Execution failed")
                .to_string();
            ExecOutcome::Failed(error)
        }
    }
}

impl Serialize for ExecOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ExecOutcome {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(ExecOutcome::from_value(&Json::deserialize(deserializer)?))
    }
}

/// An environment that executes statements one at a time
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Fresh environment; called at the start of every query
    async fn reset(&self) -> crate::Result<()>;

    /// Run one statement against the current environment
    async fn execute(&self, expr: &str) -> ExecOutcome;

    /// Hard-stop any in-flight execution; the next call starts over
    async fn terminate(&self);
}

/// Map an execution's captured output and value to display blocks
pub fn format_blocks(execution: &Execution) -> Vec<DisplayBlock> {
    let mut blocks = Vec::new();

    let stdout = execution.stdout.trim();
    if !stdout.is_empty() {
        blocks.push(DisplayBlock::text(stdout));
    }

    let Some(value) = &execution.value else {
        return blocks;
    };

    match value {
        Value::Dict(pairs) => blocks.push(DisplayBlock::Table(Table {
            headers: vec!["key".into(), "value".into()],
            rows: pairs
                .iter()
                .map(|(k, v)| vec![k.to_string(), v.to_string()])
                .collect(),
        })),
        Value::List(rows) | Value::Tuple(rows) if rows.first().is_some_and(Value::is_sequence) => {
            let cells: Vec<Vec<String>> = rows
                .iter()
                .map(|row| match row {
                    Value::List(items) | Value::Tuple(items) => {
                        items.iter().map(Value::to_string).collect()
                    }
                    other => vec![other.to_string()],
                })
                .collect();
            let ncols = cells.iter().map(Vec::len).max().unwrap_or(0);
            blocks.push(DisplayBlock::Table(Table {
                headers: (0..ncols).map(|i| i.to_string()).collect(),
                rows: cells,
            }));
        }
        other => blocks.push(DisplayBlock::text(other.to_string())),
    }
    blocks
}

/// In-process sandbox around the interpreter
#[derive(Default)]
pub struct LocalSandbox {
    interp: Mutex<Interpreter>,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous execution; shared with the worker process
    pub fn execute_now(&self, expr: &str) -> ExecOutcome {
        let mut interp = match self.interp.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match interp.run(expr) {
            Ok(execution) => ExecOutcome::Ok(format_blocks(&execution)),
            Err(e) => {
                tracing::debug!(%expr, error = %e, "statement failed");
                ExecOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn reset_now(&self) {
        match self.interp.lock() {
            Ok(mut guard) => guard.reset(),
            Err(poisoned) => poisoned.into_inner().reset(),
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn reset(&self) -> crate::Result<()> {
        self.reset_now();
        Ok(())
    }

    async fn execute(&self, expr: &str) -> ExecOutcome {
        self.execute_now(expr)
    }

    async fn terminate(&self) {
        self.reset_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(expr: &str) -> ExecOutcome {
        LocalSandbox::new().execute_now(expr)
    }

    #[test]
    fn test_mapping_becomes_key_value_table() {
        let outcome = run("{'a': 1, 'b': 2}");
        assert_eq!(
            outcome,
            ExecOutcome::Ok(vec![DisplayBlock::Table(Table {
                headers: vec!["key".into(), "value".into()],
                rows: vec![vec!["a".into(), "1".into()], vec!["b".into(), "2".into()]],
            })])
        );
    }

    #[test]
    fn test_sequence_of_sequences_becomes_indexed_table() {
        let ExecOutcome::Ok(blocks) = run("[(2, 3), (3, 2, 'x')]") else {
            panic!("expected success");
        };
        let DisplayBlock::Table(table) = &blocks[0] else {
            panic!("expected table, got {:?}", blocks[0]);
        };
        assert_eq!(table.headers, vec!["0", "1", "2"]);
        assert_eq!(table.rows[1], vec!["3", "2", "x"]);
    }

    #[test]
    fn test_scalars_and_flat_lists_are_text() {
        assert_eq!(run("divisors(12)"), ExecOutcome::Ok(vec![DisplayBlock::text("[1, 2, 3, 4, 6, 12]")]));
        assert_eq!(run("is_prime(7)"), ExecOutcome::Ok(vec![DisplayBlock::text("True")]));
        assert_eq!(run("[]"), ExecOutcome::Ok(vec![DisplayBlock::text("[]")]));
    }

    #[test]
    fn test_output_leads_and_absent_value_adds_nothing() {
        assert_eq!(run("x = 5"), ExecOutcome::Ok(vec![]));
        assert_eq!(
            run("print('  hello  ')"),
            ExecOutcome::Ok(vec![DisplayBlock::text("hello")])
        );
    }

    #[test]
    fn test_errors_are_captured() {
        assert_eq!(run("1 / 0"), ExecOutcome::Failed("division by zero".into()));
        let ExecOutcome::Failed(msg) = run("divisors(") else {
            panic!("expected failure");
        };
        assert!(msg.starts_with("Syntax error"));
    }

    #[tokio::test]
    async fn test_environment_persists_until_reset() {
        let sandbox = LocalSandbox::new();
        assert!(sandbox.execute("n = 360").await.is_ok());
        assert_eq!(
            sandbox.execute("len(divisors(n))").await,
            ExecOutcome::Ok(vec![DisplayBlock::text("24")])
        );
        sandbox.reset().await.unwrap();
        assert!(!sandbox.execute("n").await.is_ok());
    }

    #[test]
    fn test_outcome_wire_shape() {
        let ok = ExecOutcome::Ok(vec![DisplayBlock::text("6")]);
        let wire = serde_json::to_value(&ok).unwrap();
        assert_eq!(wire["ok"], true);
        assert_eq!(wire["blocks"][0]["type"], "text");
        assert_eq!(serde_json::from_value::<ExecOutcome>(wire).unwrap(), ok);

        let failed: ExecOutcome = serde_json::from_str(r#"{"ok":false,"error":"boom"}"#).unwrap();
        assert_eq!(failed, ExecOutcome::Failed("boom".into()));
    }
}
