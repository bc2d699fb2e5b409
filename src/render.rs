//! Block rendering and the paced render queue
//!
//! Blocks become styled `Fragment`s synchronously. The queue drains them into
//! a `RenderSink` one at a time, at least `interval` apart, in arrival order.

use once_cell::sync::Lazy;
use ratatui::prelude::*;
use ratatui::widgets::{Paragraph, Wrap};
use ratatui::{TerminalOptions, Viewport};
use regex::Regex;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::block::{DisplayBlock, StepBlock, Table};

// ═══════════════════════════════════════════════════════════════
// FRAGMENTS
// ═══════════════════════════════════════════════════════════════

/// A rendered block: a title plus styled text
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub title: String,
    pub body: Text<'static>,
}

impl Fragment {
    /// Title line followed by the unstyled body
    pub fn plain(&self) -> String {
        let mut out = self.title.clone();
        for line in &self.body.lines {
            out.push('\n');
            out.push_str(&line_text(line));
        }
        out
    }
}

fn line_text(line: &Line<'_>) -> String {
    line.spans.iter().map(|s| s.content.as_ref()).collect()
}

/// Optional typesetter for LaTeX blocks; `None` means show the raw markup
pub trait MathRenderer: Send + Sync {
    fn render(&self, latex: &str) -> Option<String>;
}

/// Always falls back to raw markup
pub struct RawMath;

impl MathRenderer for RawMath {
    fn render(&self, _latex: &str) -> Option<String> {
        None
    }
}

/// Rewrites common commands to Unicode; gives up on anything it doesn't know
pub struct UnicodeMath;

static COMMAND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\([A-Za-z]+|,)").expect("static regex"));

const MATH_SYMBOLS: [(&str, &str); 22] = [
    ("cdot", "·"),
    ("times", "×"),
    ("le", "≤"),
    ("ge", "≥"),
    ("ne", "≠"),
    ("equiv", "≡"),
    ("pmod", "mod"),
    ("bmod", "mod"),
    ("mid", "∣"),
    ("phi", "φ"),
    ("varphi", "φ"),
    ("sigma", "σ"),
    ("pi", "π"),
    ("sum", "Σ"),
    ("prod", "Π"),
    ("infty", "∞"),
    ("to", "→"),
    ("in", "∈"),
    ("ldots", "…"),
    ("dots", "…"),
    ("quad", "  "),
    (",", " "),
];

fn superscript(c: char) -> Option<char> {
    Some(match c {
        '0' => '⁰',
        '1' => '¹',
        '2' => '²',
        '3' => '³',
        '4' => '⁴',
        '5' => '⁵',
        '6' => '⁶',
        '7' => '⁷',
        '8' => '⁸',
        '9' => '⁹',
        '+' => '⁺',
        '-' => '⁻',
        'n' => 'ⁿ',
        _ => return None,
    })
}

impl MathRenderer for UnicodeMath {
    fn render(&self, latex: &str) -> Option<String> {
        let src = latex.trim().trim_matches('$');
        let mut s = String::with_capacity(src.len());
        let mut last = 0;
        for cap in COMMAND_RE.captures_iter(src) {
            let whole = cap.get(0)?;
            let (_, sym) = MATH_SYMBOLS.iter().find(|(cmd, _)| *cmd == &cap[1])?;
            s.push_str(&src[last..whole.start()]);
            s.push_str(sym);
            last = whole.end();
        }
        s.push_str(&src[last..]);

        let chars: Vec<char> = s.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '^' => {
                    let (exp, next) = match chars.get(i + 1) {
                        Some('{') => {
                            let end = chars[i + 2..].iter().position(|c| *c == '}')? + i + 2;
                            (chars[i + 2..end].to_vec(), end + 1)
                        }
                        Some(c) => (vec![*c], i + 2),
                        None => return None,
                    };
                    for c in exp {
                        out.push(superscript(c)?);
                    }
                    i = next;
                }
                '{' | '}' => i += 1,
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        Some(out)
    }
}

fn styled(text: impl Into<String>, style: Style) -> Line<'static> {
    Line::from(Span::styled(text.into(), style))
}

fn text_lines(content: &str, style: Style) -> Vec<Line<'static>> {
    content.lines().map(|l| styled(l, style)).collect()
}

fn table_lines(table: &Table) -> Vec<Line<'static>> {
    let ncols = table
        .rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(table.headers.len()))
        .max()
        .unwrap_or(0);
    if ncols == 0 {
        return vec![styled("(empty table)", Style::default().fg(Color::DarkGray))];
    }

    let cell = |row: &[String], i: usize| row.get(i).cloned().unwrap_or_default();
    let mut widths = vec![0usize; ncols];
    for row in std::iter::once(&table.headers).chain(&table.rows) {
        for (i, w) in widths.iter_mut().enumerate() {
            *w = (*w).max(cell(row, i).chars().count());
        }
    }

    let format_row = |row: &[String]| {
        (0..ncols)
            .map(|i| format!("{:<width$}", cell(row, i), width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = Vec::with_capacity(table.rows.len() + 2);
    if !table.headers.is_empty() {
        lines.push(styled(format_row(&table.headers), Style::default().add_modifier(Modifier::BOLD)));
        let rule = widths.iter().map(|w| "─".repeat(*w)).collect::<Vec<_>>().join("  ");
        lines.push(styled(rule, Style::default().fg(Color::DarkGray)));
    }
    lines.extend(table.rows.iter().map(|r| Line::from(format_row(r))));
    lines
}

fn step_lines(step: &StepBlock, math: &dyn MathRenderer) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    if let Some(explain) = &step.explain {
        lines.extend(text_lines(explain, Style::default().add_modifier(Modifier::ITALIC)));
    }
    if let Some(expr) = &step.expr {
        for (i, l) in expr.lines().enumerate() {
            let prompt = if i == 0 { ">>> " } else { "... " };
            lines.push(Line::from(vec![
                Span::styled(prompt, Style::default().fg(Color::DarkGray)),
                Span::styled(l.to_string(), Style::default().fg(Color::Cyan)),
            ]));
        }
    }
    for child in &step.result {
        let fragment = render_block(child, math);
        for line in fragment.body.lines {
            let mut spans = vec![Span::raw("  ")];
            spans.extend(line.spans);
            lines.push(Line::from(spans));
        }
    }
    if let Some(error) = &step.error {
        lines.push(styled(format!("Error: {}", error), Style::default().fg(Color::Red)));
    }
    lines
}

/// Fixed block-type to fragment mapping
pub fn render_block(block: &DisplayBlock, math: &dyn MathRenderer) -> Fragment {
    let (title, lines) = match block {
        DisplayBlock::Step(step) => (
            step.title.clone().unwrap_or_else(|| "Step".into()),
            step_lines(step, math),
        ),
        DisplayBlock::Error { content } => ("Error".into(), text_lines(content, Style::default().fg(Color::Red))),
        DisplayBlock::Text { content } => ("Output".into(), text_lines(content, Style::default())),
        DisplayBlock::Latex { content } => {
            let shown = math.render(content).unwrap_or_else(|| content.clone());
            ("Math".into(), text_lines(&shown, Style::default().fg(Color::Magenta)))
        }
        DisplayBlock::Table(table) => ("Table".into(), table_lines(table)),
        DisplayBlock::Unknown { kind, raw } => {
            let dump = serde_json::to_string_pretty(raw).unwrap_or_else(|_| raw.to_string());
            (kind.clone(), text_lines(&dump, Style::default().fg(Color::DarkGray)))
        }
    };
    Fragment {
        title,
        body: Text::from(lines),
    }
}

// ═══════════════════════════════════════════════════════════════
// SINKS
// ═══════════════════════════════════════════════════════════════

/// Where rendered fragments end up
pub trait RenderSink: Send {
    fn render(&mut self, fragment: &Fragment) -> io::Result<()>;

    /// Status indicator text; sinks without one ignore it
    fn status(&mut self, _text: &str) -> io::Result<()> {
        Ok(())
    }
}

/// Records fragments and when they were rendered
#[derive(Clone, Default)]
pub struct MemorySink {
    rendered: Arc<Mutex<Vec<(Instant, Fragment)>>>,
    statuses: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fragments(&self) -> Vec<Fragment> {
        lock(&self.rendered).iter().map(|(_, f)| f.clone()).collect()
    }

    pub fn render_times(&self) -> Vec<Instant> {
        lock(&self.rendered).iter().map(|(t, _)| *t).collect()
    }

    pub fn statuses(&self) -> Vec<String> {
        lock(&self.statuses).clone()
    }
}

impl RenderSink for MemorySink {
    fn render(&mut self, fragment: &Fragment) -> io::Result<()> {
        lock(&self.rendered).push((Instant::now(), fragment.clone()));
        Ok(())
    }

    fn status(&mut self, text: &str) -> io::Result<()> {
        lock(&self.statuses).push(text.to_string());
        Ok(())
    }
}

/// Unstyled output for pipes and redirected stdout; status updates are dropped
pub struct PlainSink<W> {
    out: W,
}

impl<W: io::Write + Send> PlainSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: io::Write + Send> RenderSink for PlainSink<W> {
    fn render(&mut self, fragment: &Fragment) -> io::Result<()> {
        writeln!(self.out, "{}\n", fragment.plain())?;
        self.out.flush()
    }
}

/// Inline terminal output: fragments scroll above a one-line status viewport
pub struct TerminalSink {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
}

impl TerminalSink {
    pub fn new() -> io::Result<Self> {
        let backend = CrosstermBackend::new(io::stdout());
        let terminal = Terminal::with_options(
            backend,
            TerminalOptions {
                viewport: Viewport::Inline(1),
            },
        )?;
        Ok(Self { terminal })
    }

    fn insert(&mut self, text: Text<'static>) -> io::Result<()> {
        let width = self.terminal.size()?.width.max(1) as usize;
        let height: usize = text
            .lines
            .iter()
            .map(|l| l.width().max(1).div_ceil(width))
            .sum();
        let height = u16::try_from(height).unwrap_or(u16::MAX);
        self.terminal.insert_before(height, |buf| {
            Paragraph::new(text).wrap(Wrap { trim: false }).render(buf.area, buf);
        })
    }
}

impl RenderSink for TerminalSink {
    fn render(&mut self, fragment: &Fragment) -> io::Result<()> {
        let mut lines = vec![styled(
            format!("── {}", fragment.title),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )];
        lines.extend(fragment.body.lines.iter().cloned());
        lines.push(Line::default());
        self.insert(Text::from(lines))
    }

    fn status(&mut self, text: &str) -> io::Result<()> {
        let line = styled(text.to_string(), Style::default().fg(Color::DarkGray));
        self.terminal
            .draw(|f| f.render_widget(Paragraph::new(line), f.size()))
            .map(|_| ())
    }
}

// ═══════════════════════════════════════════════════════════════
// QUEUE
// ═══════════════════════════════════════════════════════════════

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct QueueState {
    pending: VecDeque<DisplayBlock>,
    last_render: Option<Instant>,
    drain: Option<JoinHandle<()>>,
    /// Bumped by `reset`; a drain task from an older generation stops
    generation: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    sink: Mutex<Box<dyn RenderSink>>,
    math: Arc<dyn MathRenderer>,
    interval: Duration,
    /// Blocks enqueued but not yet rendered
    outstanding: watch::Sender<usize>,
}

/// FIFO of blocks drained at a minimum pace by a single task
#[derive(Clone)]
pub struct RenderQueue {
    shared: Arc<Shared>,
}

impl RenderQueue {
    pub fn new(sink: Box<dyn RenderSink>, interval: Duration, math: Arc<dyn MathRenderer>) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    last_render: None,
                    drain: None,
                    generation: 0,
                }),
                sink: Mutex::new(sink),
                math,
                interval,
                outstanding,
            }),
        }
    }

    pub fn enqueue(&self, block: DisplayBlock) {
        let mut state = lock(&self.shared.state);
        state.pending.push_back(block);
        self.shared.outstanding.send_modify(|n| *n += 1);
        if state.drain.is_none() {
            let generation = state.generation;
            state.drain = Some(tokio::spawn(drain(self.shared.clone(), generation)));
        }
    }

    /// Drop queued blocks; whatever is already on screen stays
    pub fn clear_pending(&self) {
        let mut state = lock(&self.shared.state);
        state.pending.clear();
        self.shared.outstanding.send_replace(0);
    }

    /// Clear everything and cancel the drain task, ready for a new query
    pub fn reset(&self) {
        let mut state = lock(&self.shared.state);
        state.generation += 1;
        if let Some(handle) = state.drain.take() {
            handle.abort();
        }
        state.pending.clear();
        state.last_render = None;
        self.shared.outstanding.send_replace(0);
    }

    pub fn pending(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    /// Resolves once every enqueued block has been rendered or dropped
    pub async fn flushed(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Forward status text to the sink
    pub fn show_status(&self, text: &str) {
        if let Err(e) = lock(&self.shared.sink).status(text) {
            tracing::warn!(error = %e, "failed to draw status");
        }
    }
}

async fn drain(shared: Arc<Shared>, generation: u64) {
    loop {
        let delay = {
            let mut state = lock(&shared.state);
            if state.generation != generation {
                return;
            }
            if state.pending.is_empty() {
                state.drain = None;
                return;
            }
            state
                .last_render
                .map(|t| (t + shared.interval).saturating_duration_since(Instant::now()))
                .unwrap_or_default()
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        // Rendering happens under the state lock so a concurrent reset
        // cannot interleave with it
        let mut state = lock(&shared.state);
        if state.generation != generation {
            return;
        }
        let Some(block) = state.pending.pop_front() else {
            continue;
        };
        let fragment = render_block(&block, shared.math.as_ref());
        tracing::debug!(kind = block.kind(), "render block");
        if let Err(e) = lock(&shared.sink).render(&fragment) {
            tracing::warn!(error = %e, "failed to render block");
        }
        state.last_render = Some(Instant::now());
        shared.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue(sink: &MemorySink) -> RenderQueue {
        RenderQueue::new(Box::new(sink.clone()), Duration::from_millis(500), Arc::new(RawMath))
    }

    fn offsets(sink: &MemorySink, start: Instant) -> Vec<u128> {
        sink.render_times().iter().map(|t| (*t - start).as_millis()).collect()
    }

    #[test]
    fn test_plain_sink_writes_title_and_body() {
        let mut sink = PlainSink::new(Vec::new());
        sink.render(&render_block(&DisplayBlock::text("24"), &RawMath)).unwrap();
        sink.status("Running ...").unwrap();
        assert_eq!(String::from_utf8(sink.out).unwrap(), "Output\n24\n\n");
    }

    #[test]
    fn test_table_columns_align() {
        let block = DisplayBlock::Table(Table {
            headers: vec!["key".into(), "value".into()],
            rows: vec![vec!["2".into(), "3".into()], vec!["360".into(), "24".into()]],
        });
        let fragment = render_block(&block, &RawMath);
        assert_eq!(fragment.title, "Table");
        assert_eq!(fragment.plain(), "Table\nkey  value\n───  ─────\n2    3\n360  24");
    }

    #[test]
    fn test_step_nests_results() {
        let block = DisplayBlock::Step(StepBlock {
            title: Some("Count".into()),
            explain: Some("How many divisors".into()),
            expr: Some("len(divisors(360))".into()),
            error: None,
            result: vec![DisplayBlock::text("24")],
        });
        assert_eq!(
            render_block(&block, &RawMath).plain(),
            "Count\nHow many divisors\n>>> len(divisors(360))\n  24"
        );
    }

    #[test]
    fn test_unknown_blocks_still_render() {
        let block = DisplayBlock::from_value(json!({"type": "chart", "points": [1, 2]}));
        let fragment = render_block(&block, &RawMath);
        assert_eq!(fragment.title, "chart");
        assert!(fragment.plain().contains("\"points\""));
    }

    #[test]
    fn test_math_falls_back_to_markup() {
        let block = DisplayBlock::Latex {
            content: "\\varphi(n) = n \\prod_p (1 - 1/p)".into(),
        };
        assert!(render_block(&block, &RawMath).plain().ends_with("\\varphi(n) = n \\prod_p (1 - 1/p)"));

        assert_eq!(UnicodeMath.render("2^{10} \\equiv 1 \\pmod{11}").as_deref(), Some("2¹⁰ ≡ 1 mod11"));
        assert_eq!(UnicodeMath.render("\\frac{1}{2}"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_respect_minimum_spacing() {
        let sink = MemorySink::new();
        let q = queue(&sink);
        let start = Instant::now();

        q.enqueue(DisplayBlock::text("a"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        q.enqueue(DisplayBlock::text("b"));
        tokio::time::sleep(Duration::from_millis(600)).await;
        q.enqueue(DisplayBlock::text("c"));
        q.flushed().await;

        assert_eq!(offsets(&sink, start), vec![0, 500, 1000]);
        let order: Vec<String> = sink.fragments().iter().map(Fragment::plain).collect();
        assert_eq!(order, vec!["Output\na", "Output\nb", "Output\nc"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_once_spacing_has_elapsed() {
        let sink = MemorySink::new();
        let q = queue(&sink);
        let start = Instant::now();

        q.enqueue(DisplayBlock::text("a"));
        tokio::time::sleep(Duration::from_millis(700)).await;
        q.enqueue(DisplayBlock::text("b"));
        q.flushed().await;

        assert_eq!(offsets(&sink, start), vec![0, 700]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_drops_queued_blocks() {
        let sink = MemorySink::new();
        let q = queue(&sink);

        for s in ["a", "b", "c"] {
            q.enqueue(DisplayBlock::text(s));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.reset();
        assert_eq!(q.pending(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.fragments().len(), 1);

        let start = Instant::now();
        q.enqueue(DisplayBlock::text("fresh"));
        q.flushed().await;
        assert_eq!(offsets(&sink, start).last(), Some(&0));
        assert_eq!(sink.fragments().len(), 2);
    }
}
