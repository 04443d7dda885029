//! Test doubles for the session helper and private delivery.
//!
//! [`ScriptedRunner`] replays canned helper output instead of starting a
//! container; [`RecordingDelivery`] keeps every private message in memory.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use vps_session::{DeliveryError, HelperProcess, MessageDelivery, ProcessRunner};
use vps_store::UserId;

// ─── Helper runner ────────────────────────────────────────────────────────────

/// What the next spawned helper does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Print these lines, then close stdout and exit 0.
    Lines(Vec<String>),
    /// Refuse to start.
    LaunchFailure,
    /// Start and never print anything.
    Hang,
}

/// What happened to the helpers a [`ScriptedRunner`] started.
#[derive(Debug, Default)]
pub struct HelperLog {
    pub spawned: Vec<(String, Vec<String>)>,
    pub killed: usize,
    pub detached: usize,
}

pub struct ScriptedRunner {
    script: Script,
    log: Arc<Mutex<HelperLog>>,
}

impl ScriptedRunner {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            log: Arc::new(Mutex::new(HelperLog::default())),
        }
    }

    pub fn lines(lines: &[&str]) -> Self {
        Self::new(Script::Lines(lines.iter().map(|l| l.to_string()).collect()))
    }

    pub fn spawned(&self) -> Vec<(String, Vec<String>)> {
        self.log.lock().spawned.clone()
    }

    pub fn killed(&self) -> usize {
        self.log.lock().killed
    }

    pub fn detached(&self) -> usize {
        self.log.lock().detached
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> std::io::Result<Box<dyn HelperProcess>> {
        self.log
            .lock()
            .spawned
            .push((program.to_string(), args.to_vec()));

        let (lines, hang) = match &self.script {
            Script::LaunchFailure => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{program}: not found"),
                ));
            }
            Script::Lines(lines) => (lines.iter().cloned().collect(), false),
            Script::Hang => (VecDeque::new(), true),
        };

        Ok(Box::new(ScriptedHelper {
            lines,
            hang,
            log: self.log.clone(),
        }))
    }
}

struct ScriptedHelper {
    lines: VecDeque<String>,
    hang: bool,
    log: Arc<Mutex<HelperLog>>,
}

#[async_trait]
impl HelperProcess for ScriptedHelper {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self.lines.pop_front())
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(Some(0))
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.log.lock().killed += 1;
        Ok(())
    }

    fn detach(self: Box<Self>) {
        self.log.lock().detached += 1;
    }
}

// ─── Delivery ─────────────────────────────────────────────────────────────────

/// Keeps delivered messages; optionally rejects every delivery.
#[derive(Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<(UserId, String)>>,
    fail_with: Option<String>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_with: Some(reason.to_string()),
        }
    }

    pub fn sent(&self) -> Vec<(UserId, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MessageDelivery for RecordingDelivery {
    async fn deliver(&self, recipient: UserId, content: &str) -> Result<(), DeliveryError> {
        if let Some(reason) = &self.fail_with {
            return Err(DeliveryError {
                recipient,
                reason: reason.clone(),
            });
        }
        self.sent.lock().push((recipient, content.to_string()));
        Ok(())
    }
}
