//! Operator prompts on the terminal.

use std::io::BufRead;
use std::io::Write;
use std::sync::Mutex;
use std::sync::PoisonError;

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
use dockev_security::Capability;
use dockev_security::Decision;
use dockev_security::DecisionProvider;
use tracing::debug;
use tracing::warn;

const MAX_ATTEMPTS: usize = 3;

/// Read lines from `input` on a background thread. The channel disconnects
/// at end of input.
pub fn spawn_line_reader<R>(input: R) -> Receiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = unbounded();
    std::thread::spawn(move || {
        for line in input.lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
        debug!("input closed");
    });
    rx
}

/// Asks y/n on the terminal, reading the answer from the shell's input
/// channel. End of input or repeated nonsense counts as a denial.
pub struct TerminalPrompt {
    answers: Receiver<String>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl TerminalPrompt {
    pub fn new(answers: Receiver<String>, out: Box<dyn Write + Send>) -> Self {
        Self {
            answers,
            out: Mutex::new(out),
        }
    }

    pub fn stdout(answers: Receiver<String>) -> Self {
        Self::new(answers, Box::new(std::io::stdout()))
    }
}

fn parse_answer(answer: &str) -> Option<Decision> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(Decision::Granted),
        "n" | "no" | "" => Some(Decision::Denied),
        _ => None,
    }
}

impl DecisionProvider for TerminalPrompt {
    fn decide(&self, plugin: &str, capability: Capability, reason: &str) -> Decision {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(
            out,
            "plugin '{plugin}' requests '{capability}' ({})",
            capability.description()
        );
        if !reason.is_empty() {
            let _ = writeln!(out, "  reason: {reason}");
        }
        for _ in 0..MAX_ATTEMPTS {
            let _ = write!(out, "allow? [y/N] ");
            let _ = out.flush();
            let Ok(answer) = self.answers.recv() else {
                let _ = writeln!(out);
                warn!(plugin = %plugin, capability = %capability, "input closed during prompt, denying");
                return Decision::Denied;
            };
            if let Some(decision) = parse_answer(&answer) {
                return decision;
            }
            let _ = writeln!(out, "please answer y or n");
        }
        warn!(plugin = %plugin, capability = %capability, "no valid answer, denying");
        Decision::Denied
    }
}
