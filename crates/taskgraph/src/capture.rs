//! Process-wide stdout/stderr redirection for a running task body.
//!
//! Not grounded on any teacher file — the teacher never runs
//! arbitrary caller-supplied bodies whose stdio needs capturing — but
//! added because SPEC_FULL.md §4.4/§10.4's stream-capture scenario
//! (S6) requires a body's real writes to the process's stdout/stderr
//! file descriptors to land in `stdout.log`/`stderr.log`, not just
//! whatever the body happens to pass through an in-memory writer.
//! `libc`'s `dup`/`dup2` is the standard way to do this on Unix; since
//! the redirected file descriptors are process-global, every
//! `StreamRedirect` is installed under the same critical section as
//! the `cwd` swap in `task.rs` (see `PROCESS_EXEC_MUTEX`).

use std::{
    fs::File,
    io::{self, Read, Write},
    os::fd::{AsRawFd, FromRawFd},
    path::Path,
    thread::JoinHandle,
};

use crate::task::StreamPolicy;

/// Per-stream bookkeeping, one of which exists for each of
/// stdout/stderr that was actually touched by `install`.
enum StreamState {
    /// `fd` was pointed straight at a single destination (the log
    /// file, or `/dev/null`) — used whenever the original stream
    /// doesn't also need to keep receiving bytes, i.e. whenever
    /// `suppress` applies (capture-and-suppress writes only to the
    /// log; suppress-only writes only to `/dev/null`).
    Direct { saved: i32 },
    /// `fd` was rerouted into a pipe whose read end a background
    /// thread drains into both the log file and a preserved copy of
    /// the original destination — genuine tee, used for
    /// capture-without-suppress.
    Teed { saved: i32, handle: Option<JoinHandle<()>> },
}

/// An installed stdio redirection; restores the original file
/// descriptors (joining any tee thread) on drop.
pub struct StreamRedirect {
    stdout: Option<StreamState>,
    stderr: Option<StreamState>,
}

impl StreamRedirect {
    /// Install redirection for the given capture/suppress policies.
    /// `capture` routes a stream's bytes into its log file; `suppress`
    /// keeps a stream from reaching the original terminal/pipe. The
    /// two are orthogonal: capture-without-suppress tees (both
    /// destinations see every byte), suppress-without-capture discards
    /// (routes to `/dev/null`), and capture-and-suppress writes only
    /// to the log.
    pub fn install(
        capture: StreamPolicy,
        suppress: StreamPolicy,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> io::Result<Self> {
        let stdout = Self::redirect(
            libc::STDOUT_FILENO,
            capture.applies_to_stdout(),
            suppress.applies_to_stdout(),
            stdout_path,
        )?;
        let stderr = Self::redirect(
            libc::STDERR_FILENO,
            capture.applies_to_stderr(),
            suppress.applies_to_stderr(),
            stderr_path,
        )?;
        Ok(Self { stdout, stderr })
    }

    fn redirect(fd: i32, capture: bool, suppress: bool, log_path: &Path) -> io::Result<Option<StreamState>> {
        if !capture && !suppress {
            return Ok(None);
        }

        if suppress {
            let target = if capture {
                File::create(log_path)?
            } else {
                File::create("/dev/null")?
            };
            let saved = dup(fd)?;
            if let Err(err) = dup2(target.as_raw_fd(), fd) {
                unsafe { libc::close(saved) };
                return Err(err);
            }
            return Ok(Some(StreamState::Direct { saved }));
        }

        // capture && !suppress: genuine tee. `fd` is rerouted into a
        // pipe; a background thread drains the read end into both the
        // log file and a preserved duplicate of the original
        // destination, so the body's writes still reach the real
        // terminal/pipe as well as the log.
        let log_file = File::create(log_path)?;
        let saved = dup(fd)?;
        let forward = match dup(fd) {
            Ok(fd) => fd,
            Err(err) => {
                unsafe { libc::close(saved) };
                return Err(err);
            }
        };
        let (read_end, write_end) = match pipe() {
            Ok(ends) => ends,
            Err(err) => {
                unsafe {
                    libc::close(saved);
                    libc::close(forward);
                }
                return Err(err);
            }
        };
        if let Err(err) = dup2(write_end, fd) {
            unsafe {
                libc::close(saved);
                libc::close(forward);
                libc::close(read_end);
                libc::close(write_end);
            }
            return Err(err);
        }
        unsafe { libc::close(write_end) };

        // SAFETY: `read_end`/`forward` are freshly duplicated, unshared
        // fds handed off to this thread alone; it owns and closes them
        // via `File`'s `Drop`.
        let handle = std::thread::spawn(move || {
            let mut read_file = unsafe { File::from_raw_fd(read_end) };
            let mut forward_file = unsafe { File::from_raw_fd(forward) };
            let mut log_file = log_file;
            let mut buf = [0u8; 8192];
            loop {
                match read_file.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = log_file.write_all(&buf[..n]);
                        let _ = forward_file.write_all(&buf[..n]);
                    }
                }
            }
        });

        Ok(Some(StreamState::Teed { saved, handle: Some(handle) }))
    }

    fn restore(fd: i32, state: Option<StreamState>) {
        match state {
            None => {}
            Some(StreamState::Direct { saved }) => unsafe {
                libc::dup2(saved, fd);
                libc::close(saved);
            },
            Some(StreamState::Teed { saved, handle }) => {
                // Repointing `fd` away from the pipe's write end drops
                // its last writer (the standalone duplicate was
                // already closed in `redirect`), so the tee thread
                // observes EOF and exits on its own.
                unsafe {
                    libc::dup2(saved, fd);
                    libc::close(saved);
                }
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
        }
    }
}

fn dup(fd: i32) -> io::Result<i32> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(dup)
}

fn dup2(src: i32, dst: i32) -> io::Result<()> {
    let rc = unsafe { libc::dup2(src, dst) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn pipe() -> io::Result<(i32, i32)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

impl Drop for StreamRedirect {
    fn drop(&mut self) {
        Self::restore(libc::STDOUT_FILENO, self.stdout.take());
        Self::restore(libc::STDERR_FILENO, self.stderr.take());
    }
}
