use forkmaster::fm::config::NodeConfig;
use forkmaster::fm::supervisor::Supervisor;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::os::fd::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const FAKE_ANVIL: &str = r#"
echo "fake-anvil args: $*"
echo "fake-anvil stderr line" 1>&2
echo "Listening on 0.0.0.0"
exec sleep 30
"#;

const STUBBORN_ANVIL: &str = r#"
trap '' TERM
echo "ignoring SIGTERM"
while true; do sleep 1; done
"#;

const CHATTY_ANVIL: &str = r#"
i=1
while [ $i -le 120 ]; do
  echo "line $i"
  i=$((i+1))
done
exec sleep 30
"#;

const HELPER_ANVIL: &str = r#"
sleep 300 &
echo "helper=$!"
exec sleep 30
"#;

const TERM_IGNORING_HELPER_ANVIL: &str = r#"
sh -c "trap '' TERM; while true; do sleep 1; done" &
echo "helper=$!"
exec sleep 30
"#;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Run the node through `/bin/sh <script>` so the script never needs the exec bit.
fn node_with_script(dir: &Path, body: &str, port: u16) -> NodeConfig {
    let script = dir.join("fake_anvil.sh");
    std::fs::write(&script, body).unwrap();
    NodeConfig {
        command: vec!["/bin/sh".to_string(), script.to_string_lossy().to_string()],
        port,
        stop_grace_period_ms: 500,
        port_settle_ms: 50,
        log_capacity: 50,
        event_capacity: 200,
    }
}

fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Exited means gone or an unreaped zombie; helpers are reparented away from us.
fn process_exited(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|s| s.rsplit_once(')').map(|(_, rest)| rest.trim_start().starts_with('Z')))
        .unwrap_or(false)
}

async fn wait_exited(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if process_exited(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    process_exited(pid)
}

fn helper_pid(logs: &[String]) -> Option<u32> {
    logs.iter().find_map(|l| l.strip_prefix("helper=")?.parse().ok())
}

async fn wait_for_logs(sup: &Supervisor, pred: impl Fn(&[String]) -> bool) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let logs = sup.logs();
        if pred(&logs) || Instant::now() >= deadline {
            return logs;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn start_status_logs_stop_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let sup = Supervisor::new(node_with_script(dir.path(), FAKE_ANVIL, port));

    let out = sup.start("https://fork.example", Some(31337)).await;
    assert!(out.ok, "{}", out.message);
    assert!(sup.is_running().await);

    let st = sup.status().await;
    assert!(st.running);
    let pid = st.pid.unwrap();
    assert!(pid > 0);
    let cfg = st.config.unwrap();
    assert_eq!(cfg.chain_id, Some(31337));
    assert_eq!(cfg.fork_url, "https://fork.example");
    assert_eq!(cfg.port, port);

    let logs = wait_for_logs(&sup, |l| l.iter().any(|x| x.starts_with("Listening"))).await;
    let expected =
        format!("fake-anvil args: --port {port} --fork-url https://fork.example --chain-id 31337 --host 0.0.0.0");
    assert!(logs.contains(&expected), "logs={logs:?}");
    assert!(logs.contains(&"fake-anvil stderr line".to_string()), "logs={logs:?}");

    assert!(sup.stop().await);
    assert!(!sup.is_running().await);
    assert!(!pid_alive(pid));
    let st = sup.status().await;
    assert!(!st.running);
    assert_eq!(st.pid, None);
    assert_eq!(st.config, None);

    // Already stopped: nothing to do, state unchanged.
    assert!(!sup.stop().await);
    assert_eq!(sup.status().await.config, None);
}

#[tokio::test]
async fn start_without_chain_id_omits_flag() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let sup = Supervisor::new(node_with_script(dir.path(), FAKE_ANVIL, port));
    assert!(sup.start("http://upstream.example:8545", None).await.ok);
    let logs = wait_for_logs(&sup, |l| l.iter().any(|x| x.starts_with("fake-anvil args"))).await;
    let expected = format!("fake-anvil args: --port {port} --fork-url http://upstream.example:8545 --host 0.0.0.0");
    assert!(logs.contains(&expected), "logs={logs:?}");
    assert_eq!(sup.status().await.config.unwrap().chain_id, None);
    assert!(sup.stop().await);
}

#[tokio::test]
async fn second_start_replaces_first_process_and_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(node_with_script(dir.path(), FAKE_ANVIL, free_port()));

    assert!(sup.start("https://first.example", Some(1)).await.ok);
    let first_pid = sup.status().await.pid.unwrap();
    wait_for_logs(&sup, |l| l.iter().any(|x| x.contains("first.example"))).await;

    assert!(sup.start("https://second.example", Some(2)).await.ok);
    let st = sup.status().await;
    let second_pid = st.pid.unwrap();
    assert_ne!(first_pid, second_pid);
    assert!(!pid_alive(first_pid), "first node must be torn down before the second launches");
    assert!(pid_alive(second_pid));
    assert_eq!(st.config.unwrap().chain_id, Some(2));

    assert!(sup.logs().iter().all(|l| !l.contains("first.example")));
    let logs = wait_for_logs(&sup, |l| l.iter().any(|x| x.contains("second.example"))).await;
    assert!(logs.iter().all(|l| !l.contains("first.example")), "logs={logs:?}");

    assert!(sup.stop().await);
    assert!(!pid_alive(second_pid));
}

#[tokio::test]
async fn stubborn_node_is_killed_after_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(node_with_script(dir.path(), STUBBORN_ANVIL, free_port()));
    assert!(sup.start("https://fork.example", None).await.ok);
    let pid = sup.status().await.pid.unwrap();
    wait_for_logs(&sup, |l| l.iter().any(|x| x == "ignoring SIGTERM")).await;

    let t0 = Instant::now();
    assert!(sup.stop().await);
    let elapsed = t0.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "elapsed={elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "elapsed={elapsed:?}");
    assert!(!pid_alive(pid));
    assert!(!sup.is_running().await);

    let events = sup.events();
    assert!(events.iter().any(|e| e.message.contains("outcome=grace_expired")));
}

#[tokio::test]
async fn abandoned_stop_still_tears_the_node_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = node_with_script(dir.path(), STUBBORN_ANVIL, free_port());
    node.stop_grace_period_ms = 2000;
    let sup = Supervisor::new(node);
    assert!(sup.start("https://fork.example", None).await.ok);
    let pid = sup.status().await.pid.unwrap();
    wait_for_logs(&sup, |l| l.iter().any(|x| x == "ignoring SIGTERM")).await;

    // Caller gives up while the node is still inside its grace period.
    assert!(tokio::time::timeout(Duration::from_millis(100), sup.stop()).await.is_err());

    // Teardown keeps going without the caller; the next stop waits for it behind the lock.
    assert!(!sup.stop().await);
    assert!(!pid_alive(pid));
    assert!(!sup.is_running().await);
    assert!(sup.events().iter().any(|e| e.message.contains("outcome=stopped")));
}

#[tokio::test]
async fn stop_reaches_helpers_in_the_node_group() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(node_with_script(dir.path(), HELPER_ANVIL, free_port()));
    assert!(sup.start("https://fork.example", None).await.ok);
    let logs = wait_for_logs(&sup, |l| helper_pid(l).is_some()).await;
    let helper = helper_pid(&logs).expect("helper pid logged");
    assert!(!process_exited(helper));

    assert!(sup.stop().await);
    assert!(wait_exited(helper).await, "helper {helper} survived stop");
}

#[tokio::test]
async fn helper_ignoring_sigterm_is_swept_after_leader_exits() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = node_with_script(dir.path(), TERM_IGNORING_HELPER_ANVIL, free_port());
    node.stop_grace_period_ms = 3000;
    let sup = Supervisor::new(node);
    assert!(sup.start("https://fork.example", None).await.ok);
    let logs = wait_for_logs(&sup, |l| helper_pid(l).is_some()).await;
    let helper = helper_pid(&logs).expect("helper pid logged");

    let t0 = Instant::now();
    assert!(sup.stop().await);
    // Leader honored SIGTERM, so no grace expiry was needed to get rid of the helper.
    assert!(t0.elapsed() < Duration::from_secs(3));
    assert!(sup.events().iter().any(|e| e.message.contains("outcome=grace_exit")));
    assert!(wait_exited(helper).await, "helper {helper} survived stop");
}

#[tokio::test]
async fn log_buffer_keeps_most_recent_capacity_lines() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(node_with_script(dir.path(), CHATTY_ANVIL, free_port()));
    assert!(sup.start("https://fork.example", None).await.ok);
    let logs = wait_for_logs(&sup, |l| l.last().is_some_and(|x| x == "line 120")).await;
    assert_eq!(logs.len(), 50);
    assert_eq!(logs.first().map(String::as_str), Some("line 71"));
    assert_eq!(logs.last().map(String::as_str), Some("line 120"));
    assert!(sup.stop().await);
}

#[tokio::test]
async fn start_reclaims_port_from_foreign_listener() {
    let dir = tempfile::tempdir().unwrap();

    // A process this supervisor did not start, holding a LISTEN socket on the node port.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let fd = listener.as_raw_fd();
    let mut cmd = std::process::Command::new("sleep");
    cmd.arg("30");
    unsafe {
        cmd.pre_exec(move || {
            // dup2 onto a fresh slot clears FD_CLOEXEC so the socket survives exec.
            if libc::dup2(fd, 10) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut foreign = cmd.spawn().unwrap();
    drop(listener);

    let sup = Supervisor::new(node_with_script(dir.path(), FAKE_ANVIL, port));
    let out = sup.start("https://fork.example", Some(31337)).await;
    assert!(out.ok, "{}", out.message);

    let status = foreign.wait().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGKILL));
    assert!(sup.status().await.running);
    assert!(sup.events().iter().any(|e| e.component == "reclaim"));
    assert!(sup.stop().await);
}

#[tokio::test]
async fn missing_executable_leaves_supervisor_stopped() {
    let mut node = node_with_script(tempfile::tempdir().unwrap().path(), FAKE_ANVIL, free_port());
    node.command = vec!["/nonexistent/forkmaster-test/anvil".to_string()];
    let sup = Supervisor::new(node);
    let out = sup.start("https://fork.example", Some(31337)).await;
    assert!(!out.ok);
    assert!(out.message.contains("not found"));
    assert!(!sup.status().await.running);
    assert!(!sup.stop().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_never_see_torn_config() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Arc::new(Supervisor::new(node_with_script(dir.path(), FAKE_ANVIL, free_port())));
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let sup = Arc::clone(&sup);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut seen = 0usize;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    let st = sup.status().await;
                    if st.running {
                        assert!(st.pid.is_some());
                        let cfg = st.config.expect("running status carries config");
                        let id = cfg.chain_id.expect("every run sets a chain id");
                        assert_eq!(cfg.fork_url, format!("https://fork-{id}.example"));
                        seen += 1;
                    } else {
                        assert_eq!(st.pid, None);
                        assert_eq!(st.config, None);
                    }
                    let _ = sup.logs();
                    tokio::task::yield_now().await;
                }
                seen
            })
        })
        .collect();

    for id in 1..=3u64 {
        let out = sup.start(&format!("https://fork-{id}.example"), Some(id)).await;
        assert!(out.ok, "{}", out.message);
        assert!(sup.is_running().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(sup.stop().await);
    assert!(!sup.is_running().await);
    done.store(true, std::sync::atomic::Ordering::SeqCst);

    let mut total = 0;
    for r in readers {
        total += r.await.unwrap();
    }
    assert!(total > 0);
}
