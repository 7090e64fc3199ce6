/*
 * pipe.rs
 *
 * Both ends close-on-exec from birth. The child only ever sees an end
 * through an explicit dup2 onto 0/1/2, which clears the flag on the copy.
 * Anything else stays out of exec'd programs, including pipes belonging
 * to other children spawned concurrently from other threads.
 *
 * Linux has pipe2(O_CLOEXEC) so there's no window. Elsewhere pipe+fcntl.
 */

use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::handle::Handle;

/// Connected pair: (receiver, sender). Both self-closing.
pub fn pipe() -> Result<(Handle, Handle)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    create(&mut fds)?;
    // SAFETY: both descriptors were just created and are owned by nobody else
    let receiver = unsafe { Handle::from_raw(fds[0], true) };
    // SAFETY: as above
    let sender = unsafe { Handle::from_raw(fds[1], true) };
    Ok((receiver, sender))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn create(fds: &mut [RawFd; 2]) -> Result<()> {
    // SAFETY: fds points at two writable ints
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(Error::last_os("pipe2"));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn create(fds: &mut [RawFd; 2]) -> Result<()> {
    // SAFETY: fds points at two writable ints
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(Error::last_os("pipe"));
    }
    for &fd in fds.iter() {
        // SAFETY: fd was just returned by pipe(), F_SETFD takes an int
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            let err = Error::last_os("fcntl");
            for &fd in fds.iter() {
                // SAFETY: still ours, never handed out
                unsafe {
                    libc::close(fd);
                }
            }
            return Err(err);
        }
    }
    Ok(())
}
