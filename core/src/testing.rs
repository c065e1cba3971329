//! Scripted transport for unit tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{CommandOutput, Session, Transport, TransportError};
use crate::Host;

/// One scripted reaction, consumed in order per host
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Fail the next connect
    Connect(TransportError),
    /// Result of the next exec
    Exec(Result<CommandOutput, TransportError>),
    /// Next exec never returns
    Hang,
    /// Next exec returns after a delay
    Delay(Duration, CommandOutput),
    /// Result of the next upload
    Upload(Result<(), TransportError>),
}

impl Step {
    pub(crate) fn ok(stdout: &str) -> Self {
        Step::Exec(Ok(CommandOutput {
            stdout: stdout.to_string(),
            ..CommandOutput::default()
        }))
    }
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    commands: Mutex<Vec<(String, String)>>,
    uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
    connects: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl Inner {
    fn pop(&self, host: &str, accept: impl Fn(&Step) -> bool) -> Option<Step> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.get_mut(host)?;
        if queue.front().map(&accept).unwrap_or(false) {
            queue.pop_front()
        } else {
            None
        }
    }
}

/// Unscripted execs succeed with empty output; unscripted uploads succeed.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    inner: Arc<Inner>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(&self, host: &str, steps: Vec<Step>) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert(host.to_string(), steps.into());
    }

    pub(crate) fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Sessions opened but not yet closed
    pub(crate) fn open_sessions(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst) - self.inner.closed.load(Ordering::SeqCst)
    }

    /// Highest number of execs in flight at once
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.inner.peak_running.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self, host: &str) -> Vec<String> {
        self.inner
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub(crate) fn uploads(&self, host: &str) -> Vec<(String, Vec<u8>)> {
        self.inner
            .uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _, _)| h == host)
            .map(|(_, p, d)| (p.clone(), d.clone()))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(Step::Connect(err)) = self
            .inner
            .pop(host.id(), |s| matches!(s, Step::Connect(_)))
        {
            return Err(err);
        }
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            inner: self.inner.clone(),
            host: host.id().to_string(),
            closed: false,
        }))
    }
}

struct ScriptedSession {
    inner: Arc<Inner>,
    host: String,
    closed: bool,
}

struct RunningGuard<'a>(&'a Inner);

impl<'a> RunningGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.running.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_running.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        self.inner
            .commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));

        let step = self.inner.pop(&self.host, |s| {
            matches!(s, Step::Exec(_) | Step::Hang | Step::Delay(..))
        });

        let _running = RunningGuard::enter(&self.inner);
        match step {
            Some(Step::Exec(result)) => result,
            Some(Step::Hang) => std::future::pending().await,
            Some(Step::Delay(delay, output)) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
            _ => Ok(CommandOutput::default()),
        }
    }

    async fn upload(&mut self, payload: &[u8], remote_path: &str) -> Result<(), TransportError> {
        if let Some(Step::Upload(result)) =
            self.inner.pop(&self.host, |s| matches!(s, Step::Upload(_)))
        {
            result?;
        }
        self.inner.uploads.lock().unwrap().push((
            self.host.clone(),
            remote_path.to_string(),
            payload.to_vec(),
        ));
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
