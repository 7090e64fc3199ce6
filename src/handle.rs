/*
 * handle.rs
 *
 * One OS I/O resource, owned or borrowed. Either a bare descriptor or a
 * std File - callers never care which, read/write/close go through the
 * same methods.
 *
 * Move-only. No Clone, no Copy: a moved-from Handle doesn't exist, so
 * there's nothing to double-close. self_closing decides whether Drop
 * releases the resource; borrowed handles (stdio aliases, the null
 * device, merge targets) never close anything.
 */

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::OnceLock;

use crate::error::{Error, Result};

/* receive_to_end grows its buffer in these steps */
const RECEIVE_CHUNK: usize = 4096;

/* process-wide null device, opened on first use and never closed */
static NULL_DEVICE: OnceLock<OwnedFd> = OnceLock::new();

/* representation is fixed at construction */
#[derive(Debug)]
enum Kind {
    Descriptor(RawFd),
    /* ManuallyDrop so a borrowed stream doesn't close on drop */
    Stream(ManuallyDrop<File>),
}

/// Owned-or-borrowed reference to one OS I/O resource.
#[derive(Debug)]
pub struct Handle {
    kind: Kind,
    self_closing: bool,
}

impl Handle {
    /// Wrap a raw descriptor.
    ///
    /// # Safety
    /// `fd` must be open. If `self_closing` the caller hands over
    /// ownership; otherwise the descriptor must stay open for as long as
    /// this Handle is used.
    #[must_use]
    pub unsafe fn from_raw(fd: RawFd, self_closing: bool) -> Self {
        Self {
            kind: Kind::Descriptor(fd),
            self_closing,
        }
    }

    /// Parent's standard input, borrowed.
    #[must_use]
    pub fn stdin() -> Self {
        Self::stdio(libc::STDIN_FILENO)
    }

    /// Parent's standard output, borrowed.
    #[must_use]
    pub fn stdout() -> Self {
        Self::stdio(libc::STDOUT_FILENO)
    }

    /// Parent's standard error, borrowed.
    #[must_use]
    pub fn stderr() -> Self {
        Self::stdio(libc::STDERR_FILENO)
    }

    /* 0/1/2 live as long as the process; borrowing them is always fine */
    fn stdio(fd: RawFd) -> Self {
        Self {
            kind: Kind::Descriptor(fd),
            self_closing: false,
        }
    }

    /// Borrow a file without taking ownership. The file must outlive
    /// every use of the returned Handle.
    #[must_use]
    pub fn borrow_file(file: &File) -> Self {
        Self {
            kind: Kind::Descriptor(file.as_raw_fd()),
            self_closing: false,
        }
    }

    /// Raw descriptor number.
    #[must_use]
    pub fn id(&self) -> RawFd {
        match &self.kind {
            Kind::Descriptor(fd) => *fd,
            Kind::Stream(file) => file.as_raw_fd(),
        }
    }

    #[must_use]
    pub fn is_self_closing(&self) -> bool {
        self.self_closing
    }

    /// Borrowed alias of the same resource. Used for stderr-into-stdout
    /// merges where both child slots point at one descriptor.
    #[must_use]
    pub fn alias(&self) -> Self {
        Self::stdio(self.id())
    }

    /// Toggle FD_CLOEXEC.
    pub fn set_close_on_exec(&self, on: bool) -> Result<()> {
        let fd = self.id();
        // SAFETY: F_GETFD takes no pointer arguments, any fd value is accepted
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(Error::last_os("fcntl"));
        }
        let wanted = if on {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if wanted == flags {
            return Ok(());
        }
        // SAFETY: F_SETFD takes an int argument, no pointers involved
        if unsafe { libc::fcntl(fd, libc::F_SETFD, wanted) } < 0 {
            return Err(Error::last_os("fcntl"));
        }
        Ok(())
    }

    /* one read(2), EINTR retried */
    pub(crate) fn read_once(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let ret = match &self.kind {
                Kind::Stream(file) => (&**file).read(buf),
                Kind::Descriptor(fd) => {
                    // SAFETY: buf is a valid writable region of buf.len() bytes
                    let n = unsafe { libc::read(*fd, buf.as_mut_ptr().cast(), buf.len()) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }
            };
            match ret {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /* one write(2), EINTR retried */
    pub(crate) fn write_once(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let ret = match &self.kind {
                Kind::Stream(file) => (&**file).write(buf),
                Kind::Descriptor(fd) => {
                    // SAFETY: buf is a valid readable region of buf.len() bytes
                    let n = unsafe { libc::write(*fd, buf.as_ptr().cast(), buf.len()) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }
            };
            match ret {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Read until `buf` is full or the other end reports end-of-stream.
    /// Returns bytes read; less than `buf.len()` means end-of-stream.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .read_once(&mut buf[done..])
                .map_err(|e| Error::os("read", e))?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Drain to end-of-stream.
    pub fn receive_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.receive_into(&mut out)?;
        Ok(out)
    }

    /* append until end-of-stream */
    pub(crate) fn receive_into(&self, out: &mut Vec<u8>) -> Result<()> {
        loop {
            let len = out.len();
            out.resize(len + RECEIVE_CHUNK, 0);
            let n = self.receive(&mut out[len..]);
            match n {
                Ok(n) => {
                    out.truncate(len + n);
                    if n < RECEIVE_CHUNK {
                        return Ok(());
                    }
                }
                Err(e) => {
                    out.truncate(len);
                    return Err(e);
                }
            }
        }
    }

    /// Write all of `buf`, stopping early only if a write makes no
    /// progress. Returns bytes written.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .write_once(&buf[done..])
                .map_err(|e| Error::os("write", e))?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Release the resource now and report what close(2) said. Borrowed
    /// handles just go away.
    pub fn close(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        if !this.self_closing {
            return Ok(());
        }
        /* File inside a Stream is forgotten with `this`, only its fd matters */
        // SAFETY: self_closing means we own the descriptor, and Drop won't run
        if unsafe { libc::close(this.id()) } < 0 {
            return Err(Error::last_os("close"));
        }
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.self_closing {
            return;
        }
        match &mut self.kind {
            Kind::Descriptor(fd) => {
                // SAFETY: owned descriptor, closed exactly once here
                unsafe {
                    libc::close(*fd);
                }
            }
            Kind::Stream(file) => {
                // SAFETY: the File is never touched again after this drop
                unsafe {
                    ManuallyDrop::drop(file);
                }
            }
        }
    }
}

impl From<OwnedFd> for Handle {
    fn from(fd: OwnedFd) -> Self {
        Self {
            kind: Kind::Descriptor(fd.into_raw_fd()),
            self_closing: true,
        }
    }
}

impl From<File> for Handle {
    fn from(file: File) -> Self {
        Self {
            kind: Kind::Stream(ManuallyDrop::new(file)),
            self_closing: true,
        }
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.id()
    }
}

impl Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_once(buf)
    }
}

impl Write for Handle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_once(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Borrowed handle on /dev/null, opened read-write once per process and
/// cached for good. Safe to hand to any number of children at once.
pub fn null_device() -> Result<Handle> {
    if let Some(fd) = NULL_DEVICE.get() {
        return Ok(Handle::stdio(fd.as_raw_fd()));
    }
    /* std opens with O_CLOEXEC */
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| Error::os("open", e))?;
    /* a racing opener's file is simply dropped */
    let fd = NULL_DEVICE.get_or_init(|| OwnedFd::from(file));
    Ok(Handle::stdio(fd.as_raw_fd()))
}
