//! Per-tick status text and the sinks it is delivered to.

use std::fmt::Write as _;
use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::watch;
use tracing::info;

use crate::maze::Maze;
use crate::phase::Phase;
use crate::vector::Vector;

/// Receives the status blob once per tick. Delivery is the sink's business;
/// it must not block the tick loop.
pub trait StatusSink: Send + Sync {
    fn publish(&self, status: &str);
}

/// Writes each status blob to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn publish(&self, status: &str) {
        info!(target: "octamaze::status", "\n{}", status);
    }
}

/// Holds the latest status blob for readers such as the HTTP index page.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<String>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(String::from("Waiting for agents...\n"));
        Self { tx: Arc::new(tx) }
    }

    pub fn latest(&self) -> String {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for StatusBoard {
    fn publish(&self, status: &str) {
        self.tx.send_replace(status.to_string());
    }
}

/// Forwards to every inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl StatusSink for FanoutSink {
    fn publish(&self, status: &str) {
        for sink in &self.sinks {
            sink.publish(status);
        }
    }
}

/// Inputs for one status blob.
#[derive(Debug, Clone)]
pub struct TickReport<'a> {
    pub phase: Phase,
    pub step: u32,
    pub limit: u32,
    pub agents: usize,
    pub solved: &'a [String],
}

pub fn render_stats(report: &TickReport<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Phase: {}", report.phase.name());
    let _ = writeln!(out, "Step: {}/{}", report.step, report.limit);
    let _ = writeln!(out, "Octapods: {}", report.agents);
    if !report.solved.is_empty() {
        let _ = writeln!(out, "Solved: {}", report.solved.join(", "));
    }
    out
}

/// Bordered ASCII view: `*` exit, first letter of an agent id, `.` visited,
/// blank passage, `#` wall.
pub fn render_maze(maze: &Maze, agents: &[(String, Vector)]) -> String {
    let mut marks: HashMap<Vector, char> = HashMap::with_capacity(agents.len());
    for (id, pos) in agents {
        if let Some(c) = id.chars().next() {
            marks.entry(*pos).or_insert(c);
        }
    }

    let (w, h) = (maze.width() as i32, maze.height() as i32);
    let mut out = String::with_capacity(((w + 2) * 2 + 1) as usize * (h + 2) as usize);
    for y in -1..=h {
        for x in -1..=w {
            let pos = Vector::new(x, y);
            let cell = if pos == maze.exit() {
                '*'
            } else if let Some(c) = marks.get(&pos) {
                *c
            } else if !maze.is_available(pos) {
                '#'
            } else if maze.is_visited(pos) {
                '.'
            } else {
                ' '
            };
            out.push(cell);
            out.push(' ');
        }
        out.push('\n');
    }
    out
}

/// Stats followed by the maze in a fenced block, ready for chat delivery.
pub fn render_status(report: &TickReport<'_>, maze: &Maze, agents: &[(String, Vector)]) -> String {
    let mut out = render_stats(report);
    out.push_str("```\n");
    out.push_str(&render_maze(maze, agents));
    out.push_str("```");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl StatusSink for Recorder {
        fn publish(&self, status: &str) {
            self.0.lock().unwrap().push(status.to_string());
        }
    }

    #[test]
    fn stats_list_solved_agents() {
        let solved = vec!["alice".to_string(), "bob".to_string()];
        let text = render_stats(&TickReport {
            phase: Phase::Solving,
            step: 3,
            limit: 10,
            agents: 4,
            solved: &solved,
        });
        assert_eq!(text, "Phase: Solving\nStep: 3/10\nOctapods: 4\nSolved: alice, bob\n");

        let none = render_stats(&TickReport {
            phase: Phase::Exploring,
            step: 0,
            limit: 2,
            agents: 1,
            solved: &[],
        });
        assert!(!none.contains("Solved"));
    }

    #[test]
    fn maze_view_has_border_exit_and_agents() {
        let mut maze = Maze::generated(5, 5, Some(4));
        maze.visit(Vector::new(1, 0));
        let view = render_maze(&maze, &[("zed".to_string(), Vector::ZERO)]);
        let rows: Vec<&str> = view.lines().collect();
        assert_eq!(rows.len(), 7);
        assert!(rows[0].chars().all(|c| c == '#' || c == ' '));
        // Row y=0 sits under the top border: border, agent, visited cell.
        assert!(rows[1].starts_with("# z . "));
        // Exit is the last interior cell of the last interior row.
        assert!(rows[5].ends_with("* # "));
    }

    #[test]
    fn board_keeps_latest_and_fanout_reaches_all() {
        let board = StatusBoard::new();
        let recorder = Arc::new(Recorder::default());
        let fanout = FanoutSink::new()
            .with(Arc::new(board.clone()))
            .with(recorder.clone());

        fanout.publish("one");
        fanout.publish("two");

        assert_eq!(board.latest(), "two");
        assert_eq!(*recorder.0.lock().unwrap(), vec!["one", "two"]);
    }
}
