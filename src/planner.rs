//! Plan generation: prompt composition, model call, defensive parsing
//!
//! The model is asked for `{"steps": [{label, expr, explain}], "final": ""}`.
//! Responses come back in every shape imaginable, so extraction tries a
//! direct parse, wrapped payloads, fenced blocks and finally the outermost
//! brace span before giving up.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::docs::DocCatalog;
use crate::error::{Error, Result};

/// One executable statement with its label and explanation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub label: String,
    pub expr: String,
    pub explain: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<ExecutionStep>,
    #[serde(rename = "final", default)]
    pub final_text: String,
}

/// Anything that turns a prompt into response text
#[async_trait]
pub trait PlanModel: Send + Sync {
    async fn complete(&self, prompt: &str, model: &str) -> Result<String>;
}

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("static regex"));
static BRACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[\s\S]*\}").expect("static regex"));

const RAW_PREVIEW_CHARS: usize = 500;

/// Output schema handed to the model
pub fn plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "label": {"type": "string"},
                        "expr": {"type": "string"},
                        "explain": {"type": "string"}
                    },
                    "required": ["label", "expr", "explain"],
                    "additionalProperties": false
                }
            },
            "final": {"type": "string"}
        },
        "required": ["steps", "final"],
        "additionalProperties": false
    })
}

/// Planner prompt: rules, allowed names, ranked snippets, the question
pub fn build_prompt(question: &str, docs: &DocCatalog, limit: usize) -> String {
    let snippets = docs.snippets(question, limit);
    let catalog_line = if docs.names.is_empty() {
        "Allowed NumThy names: (catalog not loaded)".to_string()
    } else {
        format!("Allowed NumThy names: {}", docs.names.join(", "))
    };

    [
        "You are a NumThy planner. Convert the user request into a multi-step plan that uses ONLY NumThy.",
        "Rules:",
        "- Builtins: len, list, range, sum, min, max, abs, sorted, str, int and print are available.",
        "- No numpy, no sympy, no external imports.",
        "- The session starts with: import numthy as nt (already done). Use nt.<function> for clarity.",
        "- You may define variables and reuse them in later steps.",
        "- Each step must be a SINGLE Python statement or expression. NEVER use semicolons to combine multiple statements.",
        "- Prefer small, tutorial-like steps and explain each step.",
        "- If a function returns an Iterator, wrap it in list(...) for display.",
        "- IMPORTANT: The FINAL STEP in the steps array must have an expr that is an EXPRESSION (not an assignment) to display the answer. If you compute `result = ...` in one step, add another step whose expr is just `result`. Every expression must be a step.",
        "- The \"final\" field is for an optional prose summary (e.g., \"The answer is 42\"). Leave it empty (\"\") if not needed. Do NOT put code or variable names in \"final\".",
        "- Return JSON that matches the provided schema exactly.",
        &catalog_line,
        "Relevant NumThy API:",
        &snippets,
        "",
        &format!("User request: {}", question),
    ]
    .join("\n")
}

/// Planner prompt plus the strict JSON-only instruction block
pub fn build_model_prompt(question: &str, docs: &DocCatalog, limit: usize) -> String {
    format!(
        "{}\n\nIMPORTANT: You MUST respond with ONLY valid JSON matching this exact schema:\n{}\n\n\
         Rules for your response:\n\
         - Output ONLY the JSON object, nothing else\n\
         - Do NOT include any text before or after the JSON\n\
         - Do NOT wrap the JSON in markdown code blocks\n\
         - The response must be directly parseable as JSON",
        build_prompt(question, docs, limit),
        plan_schema()
    )
}

/// Pull a JSON value out of free-form model output
pub fn extract_json(output: &str) -> Result<Value> {
    let trimmed = output.trim();

    if let Ok(direct) = serde_json::from_str::<Value>(trimmed) {
        for key in ["result", "content", "response"] {
            if let Some(inner) = direct.get(key).and_then(Value::as_str) {
                if !inner.is_empty() {
                    return extract_json(inner);
                }
            }
        }
        return Ok(direct);
    }

    if let Some(body) = FENCE_RE.captures(trimmed).and_then(|c| c.get(1)) {
        if let Ok(v) = serde_json::from_str(body.as_str().trim()) {
            return Ok(v);
        }
    }

    if let Some(span) = BRACES_RE.find(trimmed) {
        if let Ok(v) = serde_json::from_str(span.as_str()) {
            return Ok(v);
        }
    }

    let preview: String = trimmed.chars().take(RAW_PREVIEW_CHARS).collect();
    Err(Error::MalformedPlan(format!(
        "Could not extract valid JSON from model response. Raw output: {}",
        preview
    )))
}

/// Validate and clean a parsed plan
pub fn normalize_plan(value: &Value) -> Result<Plan> {
    let Some(raw_steps) = value.get("steps").and_then(Value::as_array) else {
        return Err(Error::MalformedPlan(
            "Planner returned invalid JSON (missing steps).".into(),
        ));
    };

    let steps: Vec<ExecutionStep> = raw_steps
        .iter()
        .filter_map(|step| {
            let expr = step.get("expr").and_then(Value::as_str)?.trim();
            if expr.is_empty() {
                return None;
            }
            Some((step, expr.to_string()))
        })
        .enumerate()
        .map(|(i, (step, expr))| ExecutionStep {
            label: step
                .get("label")
                .and_then(Value::as_str)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .unwrap_or_else(|| format!("Step {}", i + 1)),
            expr,
            explain: step
                .get("explain")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        })
        .collect();

    if steps.is_empty() {
        return Err(Error::MalformedPlan(
            "Planner did not provide any executable steps.".into(),
        ));
    }

    Ok(Plan {
        steps,
        final_text: value
            .get("final")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    })
}

/// Parse raw model text all the way to a normalized plan
pub fn parse_plan(output: &str) -> Result<Plan> {
    normalize_plan(&extract_json(output)?)
}

/// Composes the prompt, calls the model, parses the answer. No retries.
pub struct Planner {
    docs: DocCatalog,
    limit: usize,
}

impl Planner {
    pub fn new(docs: DocCatalog, limit: usize) -> Self {
        Self { docs, limit }
    }

    pub async fn generate_plan(
        &self,
        model: &dyn PlanModel,
        question: &str,
        model_id: &str,
    ) -> Result<Plan> {
        let prompt = build_model_prompt(question, &self.docs, self.limit);
        tracing::debug!(model = %model_id, prompt_len = prompt.len(), "requesting plan");
        let output = model.complete(&prompt, model_id).await?;
        let plan = parse_plan(&output)?;
        tracing::info!(model = %model_id, steps = plan.steps.len(), "plan ready");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs;

    struct CannedModel(Result<String>);

    #[async_trait]
    impl PlanModel for CannedModel {
        async fn complete(&self, _prompt: &str, _model: &str) -> Result<String> {
            match &self.0 {
                Ok(s) => Ok(s.clone()),
                Err(Error::AuthRequired) => Err(Error::AuthRequired),
                Err(e) => Err(Error::Transport(e.to_string())),
            }
        }
    }

    #[test]
    fn test_extract_direct_json() {
        let v = extract_json(r#" {"steps": [], "final": "x"} "#).unwrap();
        assert_eq!(v["final"], "x");
    }

    #[test]
    fn test_extract_unwraps_result_string() {
        let inner = r#"{"steps":[{"expr":"1"}],"final":""}"#;
        let outer = json!({ "response": json!({ "result": inner }).to_string() }).to_string();
        let v = extract_json(&outer).unwrap();
        assert_eq!(v["steps"][0]["expr"], "1");
    }

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here is the plan:\n```json\n{\"steps\":[{\"label\":\"\",\"expr\":\"divisors(360)\",\"explain\":\"\"}],\"final\":\"\"}\n```\nEnjoy.";
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].expr, "divisors(360)");
        assert_eq!(plan.steps[0].label, "Step 1");
    }

    #[test]
    fn test_extract_brace_span() {
        let text = "sure! {\"steps\":[{\"expr\":\"2+2\"}],\"final\":\"four\"} hope that helps";
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.final_text, "four");
    }

    #[test]
    fn test_extract_failure_truncates_raw() {
        let text = "no json here ".repeat(100);
        let err = extract_json(&text).unwrap_err().to_string();
        assert!(err.starts_with("Could not extract valid JSON"));
        assert!(err.len() < 600);
    }

    #[test]
    fn test_normalize_drops_bad_steps_and_numbers_kept() {
        let v = json!({
            "steps": [
                {"expr": 42},
                {"expr": "   "},
                {"expr": " a = 1 ", "explain": "bind"},
                {"label": "Show", "expr": "a"},
                {"expr": "a + 1"}
            ]
        });
        let plan = normalize_plan(&v).unwrap();
        let labels: Vec<_> = plan.steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["Step 1", "Show", "Step 3"]);
        assert_eq!(plan.steps[0].expr, "a = 1");
        assert_eq!(plan.steps[1].explain, "");
        assert_eq!(plan.final_text, "");
    }

    #[test]
    fn test_normalize_rejects_empty_plans() {
        assert!(normalize_plan(&json!({"steps": [{"expr": ""}]})).is_err());
        assert!(normalize_plan(&json!({"final": "hi"})).is_err());
    }

    #[test]
    fn test_prompt_contents() {
        let prompt = build_model_prompt("Divisors of 360", &docs::builtin(), 8);
        assert!(prompt.contains("User request: Divisors of 360"));
        assert!(prompt.contains("- nt.divisors(n: int)"));
        assert!(prompt.contains("Allowed NumThy names: is_prime"));
        assert!(prompt.contains("\"additionalProperties\":false"));
    }

    #[tokio::test]
    async fn test_generate_plan_keeps_auth_sentinel() {
        let planner = Planner::new(docs::builtin(), 8);
        let model = CannedModel(Err(Error::AuthRequired));
        let err = planner.generate_plan(&model, "primes", "m").await.unwrap_err();
        assert!(err.is_auth_required());

        let model = CannedModel(Ok(r#"{"steps":[{"label":"L","expr":"primes(10)","explain":""}],"final":""}"#.into()));
        let plan = planner.generate_plan(&model, "primes", "m").await.unwrap();
        assert_eq!(plan.steps[0].label, "L");
    }
}
