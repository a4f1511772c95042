// Repair decisions
// Every inconsistency found is routed through a RepairDecision source,
// which keeps the found/corrected statistics for the final summary.

use log::{error, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

/// Source of answers to "fix this?" questions
pub trait RepairDecision: Send {
    fn confirm(&mut self, question: &str) -> bool;
}

/// Answers yes to everything
pub struct AutoYes;

impl RepairDecision for AutoYes {
    fn confirm(&mut self, _question: &str) -> bool {
        true
    }
}

/// Answers no to everything
pub struct AutoNo;

impl RepairDecision for AutoNo {
    fn confirm(&mut self, _question: &str) -> bool {
        false
    }
}

/// Asks an operator on a line-oriented terminal
pub struct Prompt<R: BufRead, W: Write> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl Prompt<std::io::BufReader<std::io::Stdin>, std::io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(std::io::BufReader::new(std::io::stdin()), std::io::stderr())
    }
}

impl<R: BufRead + Send, W: Write + Send> RepairDecision for Prompt<R, W> {
    fn confirm(&mut self, question: &str) -> bool {
        loop {
            let _ = write!(self.output, "{} (y/n) ", question);
            let _ = self.output.flush();
            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }
            match line.trim() {
                "y" | "Y" | "yes" => return true,
                "n" | "N" | "no" => return false,
                other => {
                    let _ = writeln!(self.output, "Bad response '{}', please type 'y' or 'n'.", other);
                }
            }
        }
    }
}

/// Pre-recorded answers; falls back to a default once exhausted
pub struct Scripted {
    answers: VecDeque<bool>,
    default: bool,
    asked: Arc<Mutex<Vec<String>>>,
}

impl Scripted {
    pub fn new(answers: impl IntoIterator<Item = bool>, default: bool) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            default,
            asked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared log of every question asked, in order
    pub fn questions(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.asked)
    }
}

impl RepairDecision for Scripted {
    fn confirm(&mut self, question: &str) -> bool {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(question.to_string());
        }
        self.answers.pop_front().unwrap_or(self.default)
    }
}

/// Errors found and corrected during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairStats {
    pub errors_found: u64,
    pub errors_corrected: u64,
}

/// Decision source plus the statistics it feeds
pub struct DecisionPort {
    source: Box<dyn RepairDecision>,
    stats: RepairStats,
}

impl DecisionPort {
    pub fn new(source: Box<dyn RepairDecision>) -> Self {
        Self {
            source,
            stats: RepairStats::default(),
        }
    }

    /// Report an inconsistency and ask whether to repair it
    pub fn fix(&mut self, problem: &str, question: &str) -> bool {
        self.stats.errors_found += 1;
        warn!("{}", problem);
        if self.source.confirm(question) {
            self.stats.errors_corrected += 1;
            info!("{} yes", question);
            true
        } else {
            warn!("{} no", question);
            false
        }
    }

    /// Report an inconsistency without asking; used when nothing may be written
    pub fn decline(&mut self, problem: &str, question: &str) -> bool {
        self.stats.errors_found += 1;
        warn!("{}", problem);
        warn!("{} no", question);
        false
    }

    /// Report an inconsistency that cannot be repaired
    pub fn unfixable(&mut self, problem: &str) {
        self.stats.errors_found += 1;
        error!("{}", problem);
    }

    pub fn stats(&self) -> RepairStats {
        self.stats
    }
}
