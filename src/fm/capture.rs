use crate::fm::logbuf::BoundedLog;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// One-shot cooperative stop flag for a run's capture task.
///
/// The flag is checked between reads; `set` also wakes a reader that is parked waiting for data
/// that may never arrive. `Notify::notify_one` stores a permit, so a wake issued before the
/// reader starts waiting is not lost.
#[derive(Debug, Default)]
pub struct StopSignal {
    flag: AtomicBool,
    wake: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if self.is_set() {
            return;
        }
        self.wake.notified().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    Eof,
    Stopped,
    ReadError,
}

/// Spawn the capture task for one run: drain `pipe` line by line into `logs` under `generation`
/// until EOF, a read failure, or `stop`. The pipe is closed when the task returns.
pub fn spawn_capture(
    pipe: OwnedFd,
    logs: Arc<BoundedLog<String>>,
    generation: u64,
    stop: Arc<StopSignal>,
) -> anyhow::Result<JoinHandle<CaptureEnd>> {
    set_nonblocking_fd(pipe.as_raw_fd())?;
    let afd = AsyncFd::new(pipe)?;
    Ok(tokio::spawn(async move {
        let end = capture_loop(&afd, &logs, generation, &stop).await;
        tracing::debug!(component = "capture", "generation={generation} outcome={end:?}");
        end
    }))
}

async fn capture_loop(
    afd: &AsyncFd<OwnedFd>,
    logs: &BoundedLog<String>,
    generation: u64,
    stop: &StopSignal,
) -> CaptureEnd {
    let mut buf = vec![0u8; 16 * 1024];
    let mut splitter = LineSplitter::default();
    loop {
        if stop.is_set() {
            return CaptureEnd::Stopped;
        }
        let n = tokio::select! {
            biased;
            _ = stop.wait() => return CaptureEnd::Stopped,
            r = read_from_asyncfd(afd, &mut buf) => match r {
                Ok(n) => n,
                Err(_) => return CaptureEnd::ReadError,
            },
        };
        if n == 0 {
            if let Some(line) = splitter.finish() {
                if !stop.is_set() {
                    logs.push_for(generation, line);
                }
            }
            return CaptureEnd::Eof;
        }
        for line in splitter.feed(&buf[..n]) {
            if stop.is_set() {
                return CaptureEnd::Stopped;
            }
            logs.push_for(generation, line);
        }
    }
}

fn set_nonblocking_fd(fd: i32) -> anyhow::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

async fn read_from_asyncfd(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        let r = guard.try_io(|inner| {
            // SAFETY: fd is a valid pipe fd; buf is valid for buf.len() bytes.
            let n = unsafe {
                libc::read(
                    inner.get_ref().as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(n as usize)
        });
        match r {
            Ok(Ok(n)) => return Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
}

/// Splits a byte stream into decoded lines. Invalid UTF-8 is replaced, trailing whitespace
/// (including `\r`) is stripped and blank lines are dropped.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            if let Some(line) = decode_line(&self.pending) {
                out.push(line);
            }
            self.pending.clear();
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        out
    }

    /// Remaining partial line at end of stream.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let line = decode_line(&self.pending);
        self.pending.clear();
        line
    }
}

fn decode_line(bytes: &[u8]) -> Option<String> {
    let s = String::from_utf8_lossy(bytes);
    let t = s.trim_end();
    if t.is_empty() { None } else { Some(t.to_string()) }
}
