//! External command execution behind a swappable seam.

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::process::Command;

/// Captured result of one external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Everything that shells out goes through this trait, so probes and the
/// executor can be driven by a scripted transcript in tests.
pub trait CommandRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Production runner on top of `std::process::Command`.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {}", cmd))?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !stderr.is_empty() {
            eprint!("{}", stderr);
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            status: output.status.code().unwrap_or(-1),
        })
    }
}

/// Replays canned outputs keyed by the full command line. Used by tests in
/// place of [`SystemRunner`]; every call is recorded for later assertions.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: RefCell<HashMap<String, VecDeque<CommandOutput>>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for the exact command line.
    pub fn on(&self, cmdline: &str, stdout: &str) -> &Self {
        self.on_output(
            cmdline,
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                status: 0,
            },
        )
    }

    pub fn on_failure(&self, cmdline: &str, stderr: &str, status: i32) -> &Self {
        self.on_output(
            cmdline,
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                status,
            },
        )
    }

    pub fn on_output(&self, cmdline: &str, output: CommandOutput) -> &Self {
        self.responses
            .borrow_mut()
            .entry(cmdline.to_string())
            .or_default()
            .push_back(output);
        self
    }

    /// All command lines issued so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self, cmdline: &str) -> usize {
        self.calls.borrow().iter().filter(|c| *c == cmdline).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut cmdline = cmd.to_string();
        for arg in args {
            cmdline.push(' ');
            cmdline.push_str(arg);
        }
        self.calls.borrow_mut().push(cmdline.clone());

        let mut responses = self.responses.borrow_mut();
        match responses.get_mut(&cmdline) {
            // Keep replaying the last queued response for repeated calls.
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
            Some(queue) if queue.len() == 1 => Ok(queue.front().unwrap().clone()),
            _ => Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("no scripted response for: {}", cmdline),
                status: 1,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_runner_replays_in_order() {
        let runner = ScriptedRunner::new();
        runner.on("pvs --units B /dev/sda1", "first");
        runner.on("pvs --units B /dev/sda1", "second");

        let out = runner.run("pvs", &["--units", "B", "/dev/sda1"]).unwrap();
        assert_eq!(out.stdout, "first");
        let out = runner.run("pvs", &["--units", "B", "/dev/sda1"]).unwrap();
        assert_eq!(out.stdout, "second");
        // Last response sticks.
        let out = runner.run("pvs", &["--units", "B", "/dev/sda1"]).unwrap();
        assert_eq!(out.stdout, "second");
    }

    #[test]
    fn scripted_runner_fails_unknown_commands() {
        let runner = ScriptedRunner::new();
        let out = runner.run("partprobe", &["/dev/sda"]).unwrap();
        assert!(!out.success());
        assert_eq!(runner.calls(), vec!["partprobe /dev/sda".to_string()]);
    }
}
