use crate::fm::capture::{spawn_capture, CaptureEnd, StopSignal};
use crate::fm::config::NodeConfig;
use crate::fm::launch::{describe_launch_error, launch, node_argv};
use crate::fm::logbuf::BoundedLog;
use crate::fm::reclaim::reclaim_port;
use crate::fm::rpc::{EventEntry, RunConfig, StartOutcome, Status};
use chrono::{Local, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Bounded wait for the child to be reaped after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);
/// Bounded wait for the capture task to return once stop has been signaled.
const CAPTURE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything that exists only while a node is tracked. Guarded as one unit so config and
/// process handle can never be observed out of step.
struct ActiveRun {
    child: tokio::process::Child,
    pid: u32,
    /// Process group id; equals `pid` because the child is a session leader.
    pgid: i32,
    config: RunConfig,
    stop: Arc<StopSignal>,
    capture: JoinHandle<CaptureEnd>,
}

impl ActiveRun {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for ActiveRun {
    // Reached with the leader unreaped only when teardown never ran to completion (runtime
    // shutdown mid-stop); the group must not outlive the supervisor.
    fn drop(&mut self) {
        self.stop.set();
        if self.is_alive() {
            let _ = killpg(Pid::from_raw(self.pgid), Signal::SIGKILL);
        }
    }
}

/// Owns the lifecycle of the single node bound to `NodeConfig::port`.
///
/// `start`/`stop` run entirely under the control lock, on a task of their own: a caller that
/// stops waiting (client disconnect, timeout) never leaves a run half torn down. The log buffer
/// has its own lock so the capture task never waits behind a start or stop in progress.
pub struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    node: NodeConfig,
    control: Mutex<Option<ActiveRun>>,
    logs: Arc<BoundedLog<String>>,
    events: BoundedLog<EventEntry>,
}

impl Supervisor {
    pub fn new(node: NodeConfig) -> Self {
        let logs = Arc::new(BoundedLog::new(node.log_capacity));
        let events = BoundedLog::new(node.event_capacity);
        Self {
            shared: Arc::new(Shared {
                node,
                control: Mutex::new(None),
                logs,
                events,
            }),
        }
    }

    pub fn port(&self) -> u16 {
        self.shared.node.port
    }

    /// Tear down any tracked run, reclaim the port, and launch a fresh node.
    pub async fn start(&self, fork_url: &str, chain_id: Option<u64>) -> StartOutcome {
        let fork_url = fork_url.trim();
        if fork_url.is_empty() {
            return StartOutcome::failed("fork_url is required");
        }
        let shared = Arc::clone(&self.shared);
        let fork_url = fork_url.to_string();
        tokio::spawn(async move { shared.start(&fork_url, chain_id).await })
            .await
            .unwrap_or_else(|e| StartOutcome::failed(format!("start task failed: {e}")))
    }

    /// Stop the tracked node. Returns false if nothing was tracked.
    pub async fn stop(&self) -> bool {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut slot = shared.control.lock().await;
            shared.stop_locked(&mut slot).await
        })
        .await
        .unwrap_or(false)
    }

    /// True iff a node is tracked and the OS still reports it alive.
    pub async fn is_running(&self) -> bool {
        let mut slot = self.shared.control.lock().await;
        slot.as_mut().is_some_and(ActiveRun::is_alive)
    }

    pub async fn status(&self) -> Status {
        let mut slot = self.shared.control.lock().await;
        if let Some(run) = slot.as_mut()
            && run.is_alive()
        {
            return Status {
                running: true,
                pid: Some(run.pid),
                config: Some(run.config.clone()),
            };
        }
        Status::stopped()
    }

    /// Snapshot of captured node output, most recent last.
    pub fn logs(&self) -> Vec<String> {
        self.shared.logs.snapshot()
    }

    /// Recent lifecycle events, most recent last.
    pub fn events(&self) -> Vec<EventEntry> {
        self.shared.events.snapshot()
    }
}

impl Shared {
    async fn start(&self, fork_url: &str, chain_id: Option<u64>) -> StartOutcome {
        let chain_id = chain_id.filter(|id| *id != 0);

        let mut slot = self.control.lock().await;
        self.stop_locked(&mut slot).await;

        let killed = reclaim_port(self.node.port, Duration::from_millis(self.node.port_settle_ms)).await;
        if !killed.is_empty() {
            self.event("reclaim", format!("port={} killed_pids={killed:?}", self.node.port));
        }

        let argv = node_argv(&self.node.command, self.node.port, fork_url, chain_id);
        self.event("start", format!("attempt=start argv={:?}", argv));
        let launched = match launch(&argv) {
            Ok(l) => l,
            Err(e) => {
                let msg = describe_launch_error(&argv[0], &e);
                self.event("start", format!("outcome=launch_failed kind={:?} err={e}", e.kind()));
                return StartOutcome::failed(msg);
            }
        };
        let mut child = launched.child;
        let pid = launched.pid;

        let generation = self.logs.reset();
        let stop = Arc::new(StopSignal::new());
        let capture = match spawn_capture(launched.output, Arc::clone(&self.logs), generation, Arc::clone(&stop)) {
            Ok(h) => h,
            Err(e) => {
                // Without a reader the child would block on a full pipe; do not leave it behind.
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                let _ = tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait()).await;
                self.event("start", format!("outcome=capture_failed pid={pid} err={e}"));
                return StartOutcome::failed(format!("failed to capture node output: {e}"));
            }
        };

        let config = RunConfig {
            fork_url: fork_url.to_string(),
            chain_id,
            port: self.node.port,
            start_time: Utc::now(),
        };
        *slot = Some(ActiveRun {
            child,
            pid,
            pgid: pid as i32,
            config,
            stop,
            capture,
        });
        self.event(
            "start",
            format!("outcome=started pid={pid} url=http://0.0.0.0:{}", self.node.port),
        );
        StartOutcome::ok("Anvil started successfully")
    }

    /// Two-stage group shutdown: SIGTERM, bounded wait, then SIGKILL. Signaling failures mean
    /// the group is already gone and count as stopped. The slot is always left empty.
    ///
    /// Once the leader has exited, one SIGKILL sweeps any helpers left in the group.
    async fn stop_locked(&self, slot: &mut Option<ActiveRun>) -> bool {
        let Some(mut run) = slot.take() else {
            return false;
        };
        run.stop.set();

        let grace = Duration::from_millis(self.node.stop_grace_period_ms);
        let pgid = Pid::from_raw(run.pgid);
        if !run.is_alive() {
            // Leader already reaped. The group id cannot be reissued while members remain, so
            // only signal if the group still answers.
            if killpg(pgid, None).is_ok() {
                self.event("stop", format!("attempt=sweep pid={} reason=leader_exited", run.pid));
                let _ = killpg(pgid, Signal::SIGKILL);
            } else {
                self.event("stop", format!("outcome=already_exited pid={}", run.pid));
            }
        } else {
            self.event("stop", format!("attempt=signal pid={} sig=SIGTERM target=group", run.pid));
            match killpg(pgid, Signal::SIGTERM) {
                Ok(()) => {
                    let t0 = Instant::now();
                    match tokio::time::timeout(grace, run.child.wait()).await {
                        Ok(_) => {
                            self.event(
                                "stop",
                                format!("outcome=grace_exit elapsed_ms={}", t0.elapsed().as_millis()),
                            );
                            let _ = killpg(pgid, Signal::SIGKILL);
                        }
                        Err(_) => {
                            self.event(
                                "stop",
                                format!("outcome=grace_expired grace_ms={} decision=kill", grace.as_millis()),
                            );
                            self.kill_group(&mut run).await;
                        }
                    }
                }
                Err(e) => {
                    self.event("stop", format!("outcome=signal_failed err={e} decision=kill"));
                    self.kill_group(&mut run).await;
                }
            }
        }

        if tokio::time::timeout(CAPTURE_JOIN_TIMEOUT, &mut run.capture).await.is_err() {
            run.capture.abort();
        }
        self.event("stop", format!("outcome=stopped pid={}", run.pid));
        true
    }

    async fn kill_group(&self, run: &mut ActiveRun) {
        if let Err(e) = killpg(Pid::from_raw(run.pgid), Signal::SIGKILL) {
            self.event("stop", format!("attempt=kill outcome=already_gone err={e}"));
        }
        let _ = tokio::time::timeout(KILL_REAP_TIMEOUT, run.child.wait()).await;
    }

    fn event(&self, component: &str, msg: impl AsRef<str>) {
        tracing::info!(component, "{}", msg.as_ref());
        self.events.push(EventEntry {
            ts: Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string(),
            component: component.to_string(),
            message: msg.as_ref().to_string(),
        });
    }
}
