use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;

/// Kill every process listening on `port`, whoever started it, then give the OS `settle` to
/// release the socket. Best-effort: enumeration and kill failures are ignored.
///
/// Foreign processes are killed by pid (their process group is unknown). The calling process
/// is never targeted.
pub async fn reclaim_port(port: u16, settle: Duration) -> Vec<i32> {
    let pids = tokio::task::spawn_blocking(move || listening_pids(port))
        .await
        .unwrap_or_default();
    let me = std::process::id() as i32;
    let mut killed = Vec::new();
    for pid in pids {
        if pid == me || pid <= 1 {
            continue;
        }
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => {
                tracing::warn!(component = "reclaim", "port={port} pid={pid} outcome=killed sig=SIGKILL");
                killed.push(pid);
            }
            Err(e) => {
                tracing::debug!(component = "reclaim", "port={port} pid={pid} outcome=kill_failed err={e}");
            }
        }
    }
    if !killed.is_empty() {
        tokio::time::sleep(settle).await;
    }
    killed
}

/// Pids of processes holding a listening socket on `port`. Returns an empty list when the
/// listener table cannot be read.
pub fn listening_pids(port: u16) -> Vec<i32> {
    let Ok(all) = listeners::get_all() else {
        return Vec::new();
    };
    let mut pids: Vec<i32> = all
        .into_iter()
        .filter(|l| l.socket.port() == port)
        .filter_map(|l| i32::try_from(l.process.pid).ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
