use crate::fm::config::NODE_HOST;
use nix::unistd::setsid;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// Node command line: `<command...> --port <port> --fork-url <url> [--chain-id <id>] --host 0.0.0.0`.
///
/// A chain id of 0 is treated as absent.
pub fn node_argv(command: &[String], port: u16, fork_url: &str, chain_id: Option<u64>) -> Vec<String> {
    let mut argv: Vec<String> = command.to_vec();
    argv.extend(["--port".to_string(), port.to_string()]);
    argv.extend(["--fork-url".to_string(), fork_url.to_string()]);
    if let Some(id) = chain_id.filter(|id| *id != 0) {
        argv.extend(["--chain-id".to_string(), id.to_string()]);
    }
    argv.extend(["--host".to_string(), NODE_HOST.to_string()]);
    argv
}

pub struct Launched {
    pub child: tokio::process::Child,
    pub pid: u32,
    /// Read end of the pipe carrying the child's merged stdout+stderr.
    pub output: OwnedFd,
}

/// Spawn `argv` as the leader of a new session (and process group), with stdout and stderr
/// both writing into one pipe so output order is preserved across the two streams.
///
/// The parent's copies of the write end are dropped before returning, so the read end reports
/// EOF once every process in the group has exited.
pub fn launch(argv: &[String]) -> std::io::Result<Launched> {
    let program = argv
        .first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"))?;

    let (read_end, write_end) = cloexec_pipe()?;
    let stderr_end = write_end.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(write_end));
    cmd.stderr(Stdio::from(stderr_end));
    // New session => new process group with pgid == pid, so the whole tree can be signaled
    // with one killpg.
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut tcmd = tokio::process::Command::from(cmd);
    tcmd.kill_on_drop(false);
    let child = tcmd.spawn()?;
    // `tcmd` still owns the Stdio write ends; release them now.
    drop(tcmd);

    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("child exited before its pid could be captured"))?;
    Ok(Launched { child, pid, output: read_end })
}

/// Pipe with both ends close-on-exec, so concurrently spawned processes never inherit the
/// write end and hold the stream open.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn cloexec_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(std::io::Error::from)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn cloexec_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::os::fd::AsRawFd;
    let (r, w) = nix::unistd::pipe().map_err(std::io::Error::from)?;
    for fd in [&r, &w] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(std::io::Error::from)?;
    }
    Ok((r, w))
}

/// Human-readable reason for a failed launch. A missing executable gets an install hint.
pub fn describe_launch_error(program: &str, e: &std::io::Error) -> String {
    if e.kind() == std::io::ErrorKind::NotFound {
        let name = program.rsplit('/').next().unwrap_or(program);
        return format!("{name} executable not found. Please install Foundry.");
    }
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> Vec<String> {
        vec!["anvil".to_string()]
    }

    #[test]
    fn argv_with_chain_id() {
        assert_eq!(
            node_argv(&cmd(), 8545, "https://fork.example", Some(31337)),
            vec![
                "anvil", "--port", "8545", "--fork-url", "https://fork.example", "--chain-id", "31337",
                "--host", "0.0.0.0"
            ]
        );
    }

    #[test]
    fn argv_without_chain_id() {
        let expected = vec!["anvil", "--port", "8545", "--fork-url", "https://fork.example", "--host", "0.0.0.0"];
        assert_eq!(node_argv(&cmd(), 8545, "https://fork.example", None), expected);
        assert_eq!(node_argv(&cmd(), 8545, "https://fork.example", Some(0)), expected);
    }

    #[test]
    fn argv_keeps_command_prefix() {
        let prefix = vec!["/bin/sh".to_string(), "fake_anvil.sh".to_string()];
        let argv = node_argv(&prefix, 18545, "http://x", None);
        assert_eq!(&argv[..3], &["/bin/sh", "fake_anvil.sh", "--port"]);
    }

    #[test]
    fn missing_executable_message() {
        let e = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(
            describe_launch_error("/usr/local/bin/anvil", &e),
            "anvil executable not found. Please install Foundry."
        );
        let e = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(!describe_launch_error("anvil", &e).contains("not found"));
    }

    #[tokio::test]
    async fn launch_puts_child_in_its_own_process_group() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "echo out; echo err 1>&2".to_string()];
        let mut l = launch(&argv).unwrap();
        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(l.pid as i32)));
        // The child may already be gone; only check when we caught it alive.
        if let Ok(pgid) = pgid {
            assert_eq!(pgid.as_raw(), l.pid as i32);
        }
        let status = l.child.wait().await.unwrap();
        assert!(status.success());

        let mut out = String::new();
        let mut f = std::fs::File::from(l.output);
        std::io::Read::read_to_string(&mut f, &mut out).unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn launch_missing_program_is_not_found() {
        let argv = vec!["/nonexistent/forkmaster-test/anvil".to_string()];
        let e = launch(&argv).err().unwrap();
        assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
    }
}
