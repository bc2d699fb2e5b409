//! Display blocks: the renderable units of a query's output
//!
//! Wire shape is `{"type": "...", ...}`. Unknown `type` values are kept as a
//! raw JSON dump so newer bridges never lose output on older clients.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

/// One renderable unit of output
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayBlock {
    Step(StepBlock),
    Error { content: String },
    Text { content: String },
    Latex { content: String },
    Table(Table),
    /// Any `type` this client does not know; rendered as a structural dump
    Unknown { kind: String, raw: Value },
}

/// A plan step together with whatever it produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepBlock {
    pub title: Option<String>,
    pub explain: Option<String>,
    pub expr: Option<String>,
    pub error: Option<String>,
    pub result: Vec<DisplayBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl DisplayBlock {
    pub fn text(content: impl Into<String>) -> Self {
        DisplayBlock::Text {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        DisplayBlock::Error {
            content: content.into(),
        }
    }

    pub fn step(title: &str, explain: &str, expr: &str) -> Self {
        DisplayBlock::Step(StepBlock {
            title: Some(title.to_string()),
            explain: non_empty(explain),
            expr: non_empty(expr),
            ..Default::default()
        })
    }

    /// The wire `type` tag
    pub fn kind(&self) -> &str {
        match self {
            DisplayBlock::Step(_) => "step",
            DisplayBlock::Error { .. } => "error",
            DisplayBlock::Text { .. } => "text",
            DisplayBlock::Latex { .. } => "latex",
            DisplayBlock::Table(_) => "table",
            DisplayBlock::Unknown { kind, .. } => kind,
        }
    }

    /// Title of a step block, if this is one
    pub fn step_title(&self) -> Option<&str> {
        match self {
            DisplayBlock::Step(step) => step.title.as_deref(),
            _ => None,
        }
    }

    /// Decode a block from loosely-shaped JSON
    pub fn from_value(value: Value) -> Self {
        let Value::Object(obj) = value else {
            return DisplayBlock::Unknown {
                kind: "block".into(),
                raw: value,
            };
        };

        let kind = obj.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "step" => DisplayBlock::Step(StepBlock {
                title: opt_string(&obj, "title"),
                explain: opt_string(&obj, "explain"),
                expr: opt_string(&obj, "expr"),
                error: opt_string(&obj, "error"),
                result: obj
                    .get("result")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().cloned().map(DisplayBlock::from_value).collect())
                    .unwrap_or_default(),
            }),
            "error" => DisplayBlock::Error {
                content: content_string(&obj),
            },
            "text" => DisplayBlock::Text {
                content: content_string(&obj),
            },
            "latex" => DisplayBlock::Latex {
                content: content_string(&obj),
            },
            "table" => {
                let content = obj.get("content");
                let headers = content
                    .and_then(|c| c.get("headers"))
                    .and_then(Value::as_array)
                    .map(|cells| cells.iter().map(cell_string).collect())
                    .unwrap_or_default();
                let rows = content
                    .and_then(|c| c.get("rows"))
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .map(|row| {
                                row.as_array()
                                    .map(|cells| cells.iter().map(cell_string).collect())
                                    .unwrap_or_else(|| vec![cell_string(row)])
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                DisplayBlock::Table(Table { headers, rows })
            }
            other => DisplayBlock::Unknown {
                kind: if other.is_empty() { "block".into() } else { other.to_string() },
                raw: Value::Object(obj),
            },
        }
    }

    /// Encode to the wire shape
    pub fn to_value(&self) -> Value {
        match self {
            DisplayBlock::Step(step) => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!("step"));
                for (key, field) in [
                    ("title", &step.title),
                    ("explain", &step.explain),
                    ("expr", &step.expr),
                    ("error", &step.error),
                ] {
                    if let Some(v) = field {
                        obj.insert(key.into(), json!(v));
                    }
                }
                if !step.result.is_empty() {
                    obj.insert(
                        "result".into(),
                        Value::Array(step.result.iter().map(DisplayBlock::to_value).collect()),
                    );
                }
                Value::Object(obj)
            }
            DisplayBlock::Error { content } => json!({"type": "error", "content": content}),
            DisplayBlock::Text { content } => json!({"type": "text", "content": content}),
            DisplayBlock::Latex { content } => json!({"type": "latex", "content": content}),
            DisplayBlock::Table(table) => json!({"type": "table", "content": table}),
            DisplayBlock::Unknown { raw, .. } => raw.clone(),
        }
    }
}

impl Serialize for DisplayBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DisplayBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(DisplayBlock::from_value)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn opt_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(String::from)
}

fn content_string(obj: &Map<String, Value>) -> String {
    obj.get("content").map(cell_string).unwrap_or_default()
}

fn cell_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_step_with_children() {
        let v = json!({
            "type": "step",
            "title": "Step 1",
            "expr": "divisors(12)",
            "result": [{"type": "text", "content": "[1, 2, 3, 4, 6, 12]"}]
        });
        let block = DisplayBlock::from_value(v);
        let DisplayBlock::Step(step) = block else {
            panic!("expected step block");
        };
        assert_eq!(step.title.as_deref(), Some("Step 1"));
        assert_eq!(step.explain, None);
        assert_eq!(step.result, vec![DisplayBlock::text("[1, 2, 3, 4, 6, 12]")]);
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let v = json!({"type": "plot", "points": [1, 2, 3]});
        let block = DisplayBlock::from_value(v.clone());
        assert_eq!(block.kind(), "plot");
        assert_eq!(block.to_value(), v);
    }

    #[test]
    fn test_missing_type_is_unknown_not_dropped() {
        let block = DisplayBlock::from_value(json!({"content": "orphan"}));
        assert!(matches!(block, DisplayBlock::Unknown { .. }));
    }

    #[test]
    fn test_table_cells_are_stringified() {
        let v = json!({"type": "table", "content": {"headers": ["n", "p"], "rows": [[1, true], ["x", null]]}});
        let DisplayBlock::Table(table) = DisplayBlock::from_value(v) else {
            panic!("expected table");
        };
        assert_eq!(table.rows, vec![vec!["1", "true"], vec!["x", ""]]);
    }

    #[test]
    fn test_serde_goes_through_wire_shape() {
        let block = DisplayBlock::step("Session Start", "Import NumThy", "import numthy as nt");
        let s = serde_json::to_string(&block).unwrap();
        assert!(s.contains(r#""type":"step""#));
        let back: DisplayBlock = serde_json::from_str(&s).unwrap();
        assert_eq!(back.step_title(), Some("Session Start"));
    }
}
