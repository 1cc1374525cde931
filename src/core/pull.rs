//! Pre-check gating the pull of capture-PC data onto the workstation.
//!
//! The capture software sometimes leaves required files behind in the wrong
//! directory. Rather than failing outright, the gate asks an operator to move
//! them and checks again, up to a fixed number of attempts.

use std::path::Path;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::core::transcoder::{FOV_FILENAME, MOTION_ESTIMATOR_FILENAME, ZSTACK_FILENAME};
use crate::core::workers;
use crate::error::{Error, Result};

/// Files that must be present in a capture cache before it can be pulled.
pub const REQUIRED_FILES: [&str; 3] = [MOTION_ESTIMATOR_FILENAME, FOV_FILENAME, ZSTACK_FILENAME];

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Names from [`REQUIRED_FILES`] not present in `directory`.
pub fn missing_required_files(directory: &Path) -> Vec<String> {
    REQUIRED_FILES
        .iter()
        .filter(|name| !directory.join(name).is_file())
        .map(|name| name.to_string())
        .collect()
}

/// Someone who can fix the capture directory between checks and who signs
/// off on destructive operations.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Called after a failed check. Returning means "check again".
    async fn intervene(
        &self,
        session: &str,
        directory: &Path,
        missing: &[String],
        attempt: u32,
        max_attempts: u32,
    ) -> Result<()>;

    /// Asked before removing a session that may hold valid data.
    async fn confirm_purge(&self, session: &str) -> Result<bool>;
}

/// Prompts on the terminal and waits for Enter.
pub struct ConsoleOperator;

#[async_trait]
impl Operator for ConsoleOperator {
    async fn intervene(
        &self,
        session: &str,
        directory: &Path,
        missing: &[String],
        attempt: u32,
        max_attempts: u32,
    ) -> Result<()> {
        let message = format!(
            "Session {session}: missing {} in {}.\n\
             Move the files there, then press Enter to check again ({attempt}/{max_attempts}). ",
            missing.join(", "),
            directory.display()
        );

        workers::run_blocking("pull", move || {
            use std::io::{Write, stdin, stdout};

            print!("{message}");
            stdout().flush().map_err(|e| Error::io("<stdout>", e))?;
            let mut input = String::new();
            stdin()
                .read_line(&mut input)
                .map_err(|e| Error::io("<stdin>", e))?;
            Ok(())
        })
        .await
    }

    async fn confirm_purge(&self, session: &str) -> Result<bool> {
        let session = session.to_string();
        workers::run_blocking("purge", move || {
            use std::io::{Write, stdin, stdout};

            println!(
                "Removing ALL data of session {session} from every storage tier. \
                 This cannot be undone."
            );
            loop {
                print!("Enter 'yes' to proceed or 'no' to abort: ");
                stdout().flush().map_err(|e| Error::io("<stdout>", e))?;
                let mut input = String::new();
                let read = stdin()
                    .read_line(&mut input)
                    .map_err(|e| Error::io("<stdin>", e))?;
                if read == 0 {
                    return Ok(false);
                }
                match input.trim().to_lowercase().as_str() {
                    "yes" => return Ok(true),
                    "no" => return Ok(false),
                    _ => continue,
                }
            }
        })
        .await
    }
}

/// Logs the problem and checks again immediately. For unattended runs,
/// where the gate then exhausts its attempts and fails.
pub struct LogOperator;

#[async_trait]
impl Operator for LogOperator {
    async fn intervene(
        &self,
        session: &str,
        directory: &Path,
        missing: &[String],
        attempt: u32,
        max_attempts: u32,
    ) -> Result<()> {
        warn!(
            session,
            directory = %directory.display(),
            missing = %missing.join(", "),
            attempt,
            max_attempts,
            "Required capture files missing, no operator attached"
        );
        Ok(())
    }

    /// Unattended runs never remove data that may be valid.
    async fn confirm_purge(&self, session: &str) -> Result<bool> {
        warn!(session, "Session may hold valid data, refusing to purge without an operator");
        Ok(false)
    }
}

/// State of the required-file pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullGate {
    Checking { attempt: u32 },
    AwaitingOperator { attempt: u32, missing: Vec<String> },
    Ready,
    Exhausted { attempts: u32, missing: Vec<String> },
}

impl PullGate {
    pub fn new() -> Self {
        Self::Checking { attempt: 1 }
    }

    /// Record the outcome of a check. Only meaningful while `Checking`.
    pub fn observe(self, missing: Vec<String>, max_attempts: u32) -> Self {
        match self {
            Self::Checking { .. } if missing.is_empty() => Self::Ready,
            Self::Checking { attempt } if attempt >= max_attempts => Self::Exhausted {
                attempts: attempt,
                missing,
            },
            Self::Checking { attempt } => Self::AwaitingOperator { attempt, missing },
            other => other,
        }
    }

    /// The operator finished; go check again.
    pub fn resume(self) -> Self {
        match self {
            Self::AwaitingOperator { attempt, .. } => Self::Checking {
                attempt: attempt + 1,
            },
            other => other,
        }
    }
}

impl Default for PullGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the gate until the required files are present or attempts run out.
pub async fn await_required_files(
    session: &str,
    directory: &Path,
    operator: &dyn Operator,
    max_attempts: u32,
) -> Result<()> {
    let max_attempts = max_attempts.max(1);
    let mut gate = PullGate::new();

    loop {
        gate = match gate {
            PullGate::Checking { attempt } => {
                let missing = missing_required_files(directory);
                if !missing.is_empty() {
                    error!(
                        session,
                        directory = %directory.display(),
                        missing = %missing.join(", "),
                        attempt,
                        "Required capture files missing"
                    );
                }
                PullGate::Checking { attempt }.observe(missing, max_attempts)
            }
            PullGate::AwaitingOperator { attempt, missing } => {
                operator
                    .intervene(session, directory, &missing, attempt, max_attempts)
                    .await?;
                PullGate::AwaitingOperator { attempt, missing }.resume()
            }
            PullGate::Ready => {
                info!(session, directory = %directory.display(), "Capture files present");
                return Ok(());
            }
            PullGate::Exhausted { attempts, missing } => {
                return Err(Error::RemoteFilesMissing {
                    session: session.to_string(),
                    directory: directory.to_path_buf(),
                    attempts,
                    missing,
                });
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct CountingOperator {
        calls: AtomicU32,
        /// Create the missing files on this call.
        fix_on: Option<(u32, PathBuf)>,
    }

    #[async_trait]
    impl Operator for CountingOperator {
        async fn intervene(
            &self,
            _session: &str,
            _directory: &Path,
            _missing: &[String],
            _attempt: u32,
            _max_attempts: u32,
        ) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((on, dir)) = &self.fix_on
                && *on == call
            {
                for name in REQUIRED_FILES {
                    fs::write(dir.join(name), b"x").unwrap();
                }
            }
            Ok(())
        }

        async fn confirm_purge(&self, _session: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn gate_transitions() {
        let gate = PullGate::new().observe(vec!["fov.roi".into()], 2);
        assert_eq!(
            gate,
            PullGate::AwaitingOperator {
                attempt: 1,
                missing: vec!["fov.roi".into()]
            }
        );
        let gate = gate.resume();
        assert_eq!(gate, PullGate::Checking { attempt: 2 });
        let gate = gate.observe(vec!["fov.roi".into()], 2);
        assert!(matches!(gate, PullGate::Exhausted { attempts: 2, .. }));

        assert_eq!(PullGate::new().observe(Vec::new(), 5), PullGate::Ready);
    }

    #[tokio::test]
    async fn exhausts_after_max_checks() {
        let temp = tempdir().unwrap();
        let operator = CountingOperator {
            calls: AtomicU32::new(0),
            fix_on: None,
        };

        let err = await_required_files("s1", temp.path(), &operator, DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap_err();

        // Five checks, one prompt between each pair.
        assert_eq!(operator.calls.load(Ordering::SeqCst), 4);
        match err {
            Error::RemoteFilesMissing {
                attempts, missing, ..
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(missing.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn recovers_when_operator_fixes_directory() {
        let temp = tempdir().unwrap();
        let operator = CountingOperator {
            calls: AtomicU32::new(0),
            fix_on: Some((2, temp.path().to_path_buf())),
        };

        await_required_files("s1", temp.path(), &operator, DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();
        assert_eq!(operator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn present_files_need_no_operator() {
        let temp = tempdir().unwrap();
        for name in REQUIRED_FILES {
            fs::write(temp.path().join(name), b"x").unwrap();
        }
        await_required_files("s1", temp.path(), &LogOperator, 5)
            .await
            .unwrap();
        assert!(missing_required_files(temp.path()).is_empty());
    }
}
