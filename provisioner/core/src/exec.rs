use crate::{Error, Result};
use std::{ffi::OsString, fmt, process::Stdio};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// An external command line invocation.
#[derive(Clone, Debug)]
pub struct Exec {
    program: OsString,
    args: Vec<String>,
    stdin: Option<String>,
}

/// The captured result of an [`Exec`] that ran to completion.
#[derive(Clone, Debug)]
pub struct Output {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

// === impl Exec ===

impl Exec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Runs the command to completion, regardless of its exit status.
    pub async fn output(&self) -> Result<Output> {
        debug!(command = %self, "running");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::provisioning(self.to_string(), e))?;

        if let (Some(input), Some(mut stdin)) = (self.stdin.as_ref(), child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| Error::provisioning(self.to_string(), e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::provisioning(self.to_string(), e))?;
        Ok(Output {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Runs the command and returns its stdout, failing on a non-zero exit status.
    pub async fn run(&self) -> Result<String> {
        let output = self.output().await?;
        if !output.success {
            return Err(Error::provisioning(
                self.to_string(),
                output.stderr.trim().to_string(),
            ));
        }
        Ok(output.stdout)
    }
}

/// Renders the program and the leading subcommand words, which is enough to identify the
/// operation in errors and logs.
impl fmt::Display for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in self.args.iter().take_while(|a| !a.starts_with('-')).take(3) {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
