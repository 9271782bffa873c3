//! Per-session command counts behind the `stats` built-in.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

/// How many commands `stats` lists as most used.
pub const TOP_COMMANDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageStats {
    pub session: Duration,
    pub distinct: usize,
    pub total: u64,
    /// Highest count first, ties by name.
    pub most_used: Vec<(String, u64)>,
}

#[derive(Debug)]
pub struct UsageTracker {
    started: Instant,
    counts: HashMap<String, u64>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counts: HashMap::new(),
        }
    }

    pub fn record(&mut self, command: &str) {
        *self.counts.entry(command.to_string()).or_default() += 1;
    }

    pub fn stats(&self) -> UsageStats {
        let mut most_used: Vec<(String, u64)> = self
            .counts
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect();
        most_used.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_used.truncate(TOP_COMMANDS);
        UsageStats {
            session: self.started.elapsed(),
            distinct: self.counts.len(),
            total: self.counts.values().sum(),
            most_used,
        }
    }
}

impl UsageStats {
    pub fn render(&self) -> String {
        let minutes = self.session.as_secs_f64() / 60.0;
        let mut lines = vec![
            format!("session time: {minutes:.1} minutes"),
            format!("commands used: {}", self.distinct),
            format!("total commands: {}", self.total),
        ];
        if !self.most_used.is_empty() {
            lines.push("most used:".to_string());
            for (name, count) in &self.most_used {
                lines.push(format!("  {name}: {count}"));
            }
        }
        lines.join("\n")
    }
}
