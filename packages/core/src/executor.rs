//! Guarded execution of external commands.
//!
//! Every stateful or destructive operation against the host goes through
//! [`Executor::execute`], which enforces the confirm/dry-run/must-succeed
//! contract: a declined required step is fatal, a declined optional step is
//! skipped, and a non-zero exit code terminates the program with that same
//! code. There is no retry policy here; retries are a caller decision.

use std::process::Command;

use log::info;
use snafu::ResultExt;

use crate::confirm::{ConfirmationProvider, ConfirmationRequest};
use crate::error::{
    CommandExitSnafu, CommandSpawnSnafu, DeclinedRequiredSnafu, MissingDescriptionSnafu, Result,
};

/// One external operation with its execution policy.
#[derive(Debug, Clone, Copy)]
pub struct Operation<'a> {
    /// Shell command line, run via `sh -c`.
    pub command: &'a str,
    /// What the command does, shown when confirming and logged always.
    pub description: &'a str,
    /// Whether a decline or failure of this step may be survived.
    pub needed: bool,
    /// Whether to ask the operator before running.
    pub confirm: bool,
}

/// Runs external commands under the guarded execution contract.
pub struct Executor {
    provider: Box<dyn ConfirmationProvider>,
    confirmations_enabled: bool,
    dry_run: bool,
    history: Vec<String>,
}

impl Executor {
    /// Creates an executor with confirmations enabled and dry-run off.
    pub fn new(provider: Box<dyn ConfirmationProvider>) -> Self {
        Self::with_options(provider, true, false)
    }

    /// Creates an executor with explicit confirmation and dry-run settings.
    ///
    /// When `confirmations_enabled` is false, per-operation confirmation
    /// requests are forced off regardless of caller intent.
    pub fn with_options(
        provider: Box<dyn ConfirmationProvider>,
        confirmations_enabled: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            provider,
            confirmations_enabled,
            dry_run,
            history: Vec::new(),
        }
    }

    /// Whether this executor records commands without running them.
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Every command this executor ran, or would have run under dry-run.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// The confirmation provider, for decisions outside command execution.
    pub fn provider(&mut self) -> &mut dyn ConfirmationProvider {
        self.provider.as_mut()
    }

    /// Runs one guarded operation.
    ///
    /// Declining a `needed` operation is fatal; declining an optional one
    /// skips it. A non-zero exit code is always fatal and carries the
    /// command's own code.
    pub fn execute(&mut self, op: Operation<'_>) -> Result<()> {
        if op.confirm && op.description.is_empty() {
            return MissingDescriptionSnafu {
                command: op.command,
            }
            .fail();
        }

        if op.confirm && self.confirmations_enabled {
            let request = ConfirmationRequest {
                command: op.command,
                description: op.description,
                needed: op.needed,
                dry_run: self.dry_run,
            };
            if !self.provider.confirm_operation(&request)? {
                if op.needed {
                    return DeclinedRequiredSnafu {
                        description: op.description,
                    }
                    .fail();
                }
                info!("skipped by user command: {}", op.description);
                return Ok(());
            }
        }

        info!("executing: {} # {}", op.command, op.description);
        self.history.push(op.command.to_string());

        if self.dry_run {
            return Ok(());
        }

        let status = Command::new("sh")
            .arg("-c")
            .arg(op.command)
            .status()
            .context(CommandSpawnSnafu {
                command: op.command,
            })?;

        if !status.success() {
            return CommandExitSnafu {
                command: op.command,
                code: status.code().unwrap_or(-1),
            }
            .fail();
        }

        Ok(())
    }
}
