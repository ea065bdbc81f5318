//! Child-process plumbing for the external encryption tool.
//!
//! A [`Subprocess`] wires the child's stdin and stdout either to descriptors
//! supplied by the caller or to pipes owned by the parent, and drives both
//! pipe directions under a single poll loop. Everything except descriptors
//! 0, 1 and 2 is close-on-exec, so the child never sees the backing store or
//! the FUSE channel.

use std::ffi::OsStr;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;

use log::warn;
use nix::errno::Errno;

/// Largest slice handed to a single pipe write.
const WRITE_CHUNK: usize = 1 << 20;

/// How one of the child's standard descriptors is wired.
#[derive(Debug)]
pub enum Wire {
    /// Create a pipe whose parent-side end is owned by the [`Subprocess`].
    Pipe,
    /// Give the child this descriptor.
    Fd(OwnedFd),
}

/// A spawned child with optional parent-owned pipe endpoints.
#[derive(Debug)]
pub struct Subprocess {
    child: Child,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    status: Option<i32>,
}

impl Subprocess {
    /// Spawns `program` with `args`, stdin/stdout wired per the [`Wire`]s,
    /// and stderr inherited.
    pub fn spawn<S: AsRef<OsStr>>(
        program: &OsStr,
        args: &[S],
        stdin: Wire,
        stdout: Wire,
    ) -> io::Result<Subprocess> {
        let mut command = Command::new(program);
        command.args(args);
        command.stdin(match stdin {
            Wire::Pipe => Stdio::piped(),
            Wire::Fd(fd) => Stdio::from(fd),
        });
        command.stdout(match stdout {
            Wire::Pipe => Stdio::piped(),
            Wire::Fd(fd) => Stdio::from(fd),
        });
        let mut child = command.spawn()?;
        let stdin = child.stdin.take().map(OwnedFd::from);
        let stdout = child.stdout.take().map(OwnedFd::from);
        Ok(Subprocess {
            child,
            stdin,
            stdout,
            status: None,
        })
    }

    /// The parent-side write end of the child's stdin, when owned.
    pub fn stdin_fd(&self) -> Option<BorrowedFd<'_>> {
        self.stdin.as_ref().map(AsFd::as_fd)
    }

    /// Closes the owned write end so the child sees EOF on stdin.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Feeds `input` to the child's stdin in bounded slices while draining
    /// its stdout into `sink`, both under one poll loop. The owned write end
    /// is closed as soon as the input is exhausted; the read side is drained
    /// until the child closes its stdout. Returns the number of bytes
    /// delivered to `sink`.
    ///
    /// Supplying `input` when stdin is externally wired is `EINVAL`.
    pub fn communicate<F>(&mut self, input: Option<&[u8]>, mut sink: F) -> Result<u64, Errno>
    where
        F: FnMut(&[u8]) -> Result<(), Errno>,
    {
        if input.is_some() && self.stdin.is_none() {
            return Err(Errno::EINVAL);
        }
        let mut pending = input.unwrap_or_default();
        if pending.is_empty() {
            // Nothing to send; let the child see EOF right away.
            self.stdin = None;
        }
        if let Some(fd) = &self.stdin {
            set_nonblocking(fd.as_raw_fd())?;
        }
        if let Some(fd) = &self.stdout {
            set_nonblocking(fd.as_raw_fd())?;
        }

        let mut received = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let stdin_fd = self.stdin.as_ref().map(|fd| fd.as_raw_fd());
            let stdout_fd = self.stdout.as_ref().map(|fd| fd.as_raw_fd());
            let mut fds: Vec<libc::pollfd> = Vec::with_capacity(2);
            if let Some(fd) = stdin_fd {
                fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                });
            }
            if let Some(fd) = stdout_fd {
                fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
            if fds.is_empty() {
                break;
            }
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = Errno::last();
                if err == Errno::EINTR {
                    continue;
                }
                return Err(err);
            }
            for pfd in &fds {
                if pfd.revents == 0 {
                    continue;
                }
                if Some(pfd.fd) == stdin_fd {
                    let n = unsafe {
                        libc::write(
                            pfd.fd,
                            pending.as_ptr().cast(),
                            pending.len().min(WRITE_CHUNK),
                        )
                    };
                    if n < 0 {
                        match Errno::last() {
                            Errno::EAGAIN | Errno::EINTR => {}
                            Errno::EPIPE => {
                                // The child stopped reading; the exit status
                                // from wait() tells the caller why.
                                self.stdin = None;
                            }
                            err => return Err(err),
                        }
                    } else {
                        pending = &pending[n as usize..];
                        if pending.is_empty() {
                            self.stdin = None;
                        }
                    }
                } else if Some(pfd.fd) == stdout_fd {
                    let n = unsafe { libc::read(pfd.fd, buf.as_mut_ptr().cast(), buf.len()) };
                    if n < 0 {
                        match Errno::last() {
                            Errno::EAGAIN | Errno::EINTR => {}
                            err => return Err(err),
                        }
                    } else if n == 0 {
                        self.stdout = None;
                    } else {
                        sink(&buf[..n as usize])?;
                        received += n as u64;
                    }
                }
            }
        }
        Ok(received)
    }

    /// Blocks until the child exits and returns its exit code, or -1 for
    /// abnormal termination. Idempotent: later calls return the same value.
    pub fn wait(&mut self) -> i32 {
        if let Some(status) = self.status {
            return status;
        }
        // Drop our end of stdin first or a child still reading never exits.
        self.stdin = None;
        let status = match self.child.wait() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                warn!("wait on child failed: {err}");
                -1
            }
        };
        self.status = Some(status);
        status
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        if self.status.is_none() {
            self.wait();
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Errno::last());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::fs::File;
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;

    use super::*;

    fn cat(stdin: Wire, stdout: Wire) -> Subprocess {
        Subprocess::spawn::<OsString>(OsStr::new("cat"), &[], stdin, stdout).unwrap()
    }

    fn sh(script: &str) -> Subprocess {
        Subprocess::spawn(OsStr::new("sh"), &["-c", script], Wire::Pipe, Wire::Pipe).unwrap()
    }

    #[test]
    fn communicate_round_trips() {
        let mut child = cat(Wire::Pipe, Wire::Pipe);
        let mut echoed = Vec::new();
        let n = child
            .communicate(Some(b"hello subprocess"), |chunk| {
                echoed.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 16);
        assert_eq!(echoed, b"hello subprocess");
        assert_eq!(child.wait(), 0);
    }

    #[test]
    fn communicate_interleaves_past_pipe_capacity() {
        let payload: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let mut child = cat(Wire::Pipe, Wire::Pipe);
        let mut echoed = Vec::new();
        child
            .communicate(Some(&payload), |chunk| {
                echoed.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(child.wait(), 0);
        assert_eq!(echoed, payload);
    }

    #[test]
    fn communicate_rejects_input_on_external_stdin() {
        let devnull = File::open("/dev/null").unwrap();
        let mut child = cat(Wire::Fd(devnull.into()), Wire::Pipe);
        let result = child.communicate(Some(b"data"), |_| Ok(()));
        assert_eq!(result, Err(Errno::EINVAL));
        assert_eq!(child.wait(), 0);
    }

    #[test]
    fn external_stdout_receives_the_payload() {
        let mut sink_file = tempfile::tempfile().unwrap();
        let mut child = cat(
            Wire::Pipe,
            Wire::Fd(sink_file.try_clone().unwrap().into()),
        );
        let drained = child
            .communicate(Some(b"written through"), |_| Ok(()))
            .unwrap();
        assert_eq!(drained, 0);
        assert_eq!(child.wait(), 0);

        sink_file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = Vec::new();
        sink_file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"written through");
    }

    #[test]
    fn drain_only_with_external_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        std::fs::write(&source, b"fed straight from a descriptor").unwrap();

        let mut child = cat(Wire::Fd(File::open(&source).unwrap().into()), Wire::Pipe);
        let mut drained = Vec::new();
        let n = child
            .communicate(None, |chunk| {
                drained.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(child.wait(), 0);
        assert_eq!(n as usize, drained.len());
        assert_eq!(drained, b"fed straight from a descriptor");
    }

    #[test]
    fn wait_reports_the_exit_code_idempotently() {
        let mut child = sh("exit 3");
        assert_eq!(child.wait(), 3);
        assert_eq!(child.wait(), 3);
    }

    #[test]
    fn wait_reports_abnormal_termination() {
        let mut child = sh("kill -9 $$");
        assert_eq!(child.wait(), -1);
    }
}
