//! Operator confirmation providers.
//!
//! The state machine never reads the terminal itself: every yes/no decision,
//! typed acknowledgement, and descriptor review goes through a
//! [`ConfirmationProvider`]. The interactive CLI plugs in [`StdinConfirmer`];
//! tests and headless callers plug in [`ScriptedConfirmer`].

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use snafu::ResultExt;

use crate::error::{ConfirmationReadSnafu, Result};

/// Everything a provider needs to present one guarded operation.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationRequest<'a> {
    /// Literal command text that would run.
    pub command: &'a str,
    /// Human description of what the command does.
    pub description: &'a str,
    /// Whether declining aborts the whole program.
    pub needed: bool,
    /// Whether the executor is in dry-run mode.
    pub dry_run: bool,
}

/// Source of operator decisions.
pub trait ConfirmationProvider {
    /// Present a guarded external operation and return whether to run it.
    fn confirm_operation(&mut self, request: &ConfirmationRequest<'_>) -> Result<bool>;

    /// Ask a plain yes/no question.
    fn confirm(&mut self, prompt: &str) -> Result<bool>;

    /// Require the operator to type `challenge` back exactly.
    ///
    /// Used before destructive procedures where a bare "yes" is too easy.
    fn acknowledge(&mut self, challenge: &str) -> Result<bool>;

    /// Present a rendered document for review and return whether it is
    /// accepted.
    fn review(&mut self, intro: &str, document: &str) -> Result<bool>;
}

/// Interactive provider reading answers from standard input.
///
/// Acceptance is the exact word `yes`, case-insensitive; anything else
/// declines.
#[derive(Debug, Default)]
pub struct StdinConfirmer;

impl StdinConfirmer {
    fn read_line(&self) -> Result<String> {
        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context(ConfirmationReadSnafu)?;
        Ok(answer.trim().to_string())
    }
}

impl ConfirmationProvider for StdinConfirmer {
    fn confirm_operation(&mut self, request: &ConfirmationRequest<'_>) -> Result<bool> {
        let necessity = if request.needed {
            "required"
        } else {
            "optional"
        };
        let mode = if request.dry_run { ", dry-run" } else { "" };
        println!("about to run: {}", request.command);
        println!("  {} ({necessity}{mode})", request.description);
        self.confirm("proceed?")
    }

    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        print!("{prompt} [yes/no] > ");
        io::stdout().flush().context(ConfirmationReadSnafu)?;
        Ok(self.read_line()?.eq_ignore_ascii_case("yes"))
    }

    fn acknowledge(&mut self, challenge: &str) -> Result<bool> {
        print!("Acknowledge by writing the following in caps: {challenge}\n> ");
        io::stdout().flush().context(ConfirmationReadSnafu)?;
        Ok(self.read_line()? == challenge)
    }

    fn review(&mut self, intro: &str, document: &str) -> Result<bool> {
        println!("{intro}");
        println!();
        println!("{document}");
        self.confirm("Looks good?")
    }
}

/// Programmable provider answering from a fixed queue.
///
/// When the queue runs out, `fallback` answers every further question. This
/// is the headless counterpart to [`StdinConfirmer`].
#[derive(Debug)]
pub struct ScriptedConfirmer {
    answers: VecDeque<bool>,
    fallback: bool,
}

impl ScriptedConfirmer {
    /// Answer from `answers` in order, then with `fallback`.
    pub fn new(answers: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            fallback,
        }
    }

    /// Accept everything.
    pub fn accept_all() -> Self {
        Self::new([], true)
    }

    /// Decline everything.
    pub fn reject_all() -> Self {
        Self::new([], false)
    }

    fn next_answer(&mut self) -> bool {
        self.answers.pop_front().unwrap_or(self.fallback)
    }
}

impl ConfirmationProvider for ScriptedConfirmer {
    fn confirm_operation(&mut self, _request: &ConfirmationRequest<'_>) -> Result<bool> {
        Ok(self.next_answer())
    }

    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(self.next_answer())
    }

    fn acknowledge(&mut self, _challenge: &str) -> Result<bool> {
        Ok(self.next_answer())
    }

    fn review(&mut self, _intro: &str, _document: &str) -> Result<bool> {
        Ok(self.next_answer())
    }
}
