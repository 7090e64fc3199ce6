/*
 * spawn.rs
 *
 * One child setup plan, two ways to run it.
 *
 * No directory change: posix_spawnp with file actions. glibc uses
 * CLONE_VFORK under the hood and reports exec failure as the return
 * value, so errors come back for free.
 *
 * Directory change: fork, then in the child dup2/close/signals/chdir/
 * execvp. Everything the child touches is allocated before fork - after
 * fork only async-signal-safe calls. A close-on-exec relay pipe carries
 * (step, errno) back if the child fails before exec; a successful exec
 * closes it and the parent reads EOF.
 *
 * posix_spawnattr_t and posix_spawn_file_actions_t are opaque structs on
 * Linux and pointers on macOS. Both get boxed RAII wrappers so the
 * initialized storage never moves.
 */

use std::ffi::{CString, c_char};
use std::fs;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::pipe::pipe;

unsafe extern "C" {
    /* environ is a global variable pointing to the environment */
    static mut environ: *const *const c_char;
}

/* what the child exits with when it can't get to exec */
const CHILD_FAILURE_STATUS: i32 = 0x7F;

/* relay steps, index into STEP_NAMES */
const STEP_DUP2: i32 = 0;
const STEP_FCNTL: i32 = 1;
const STEP_CHDIR: i32 = 2;
const STEP_EXEC: i32 = 3;
const STEP_NAMES: [&str; 4] = ["dup2", "fcntl", "chdir", "execvp"];

/* signals Rust (and most runtimes) set to SIG_IGN that children expect default */
const RESTORED_SIGNALS: [i32; 2] = [libc::SIGPIPE, libc::SIGXFSZ];

#[cfg(any(target_os = "linux", target_os = "android"))]
const FD_DIR: &str = "/proc/self/fd";
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const FD_DIR: &str = "/dev/fd";

/*
 * RAII wrapper for posix_spawnattr_t.
 *
 * Boxed so the storage init wrote into is the storage destroy sees.
 */
struct SpawnAttr {
    inner: Box<MaybeUninit<libc::posix_spawnattr_t>>,
}

impl SpawnAttr {
    /* create and initialize spawn attributes */
    fn new() -> Result<Self> {
        let mut inner = Box::new(MaybeUninit::uninit());
        // SAFETY: inner is valid, writable storage for a posix_spawnattr_t
        let ret = unsafe { libc::posix_spawnattr_init(inner.as_mut_ptr()) };
        if ret != 0 {
            return Err(Error::from_errno("posix_spawnattr_init", ret));
        }
        Ok(Self { inner })
    }

    /* set flags on the spawn attributes */
    fn set_flags(&mut self, flags: libc::c_short) -> Result<()> {
        // SAFETY: self.inner was initialized in new()
        let ret = unsafe { libc::posix_spawnattr_setflags(self.inner.as_mut_ptr(), flags) };
        if ret != 0 {
            return Err(Error::from_errno("posix_spawnattr_setflags", ret));
        }
        Ok(())
    }

    /* signals reset to SIG_DFL in the child (needs POSIX_SPAWN_SETSIGDEF) */
    fn set_sigdefault(&mut self, set: &libc::sigset_t) -> Result<()> {
        // SAFETY: self.inner was initialized in new(), set is a valid sigset
        let ret = unsafe { libc::posix_spawnattr_setsigdefault(self.inner.as_mut_ptr(), set) };
        if ret != 0 {
            return Err(Error::from_errno("posix_spawnattr_setsigdefault", ret));
        }
        Ok(())
    }

    fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
        self.inner.as_ptr()
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        // SAFETY: self.inner was initialized in new() and hasn't been destroyed yet
        unsafe {
            libc::posix_spawnattr_destroy(self.inner.as_mut_ptr());
        }
    }
}

/*
 * RAII wrapper for posix_spawn_file_actions_t.
 *
 * Same pattern as SpawnAttr.
 */
struct SpawnFileActions {
    inner: Box<MaybeUninit<libc::posix_spawn_file_actions_t>>,
}

impl SpawnFileActions {
    fn new() -> Result<Self> {
        let mut inner = Box::new(MaybeUninit::uninit());
        // SAFETY: inner is valid, writable storage for the file actions
        let ret = unsafe { libc::posix_spawn_file_actions_init(inner.as_mut_ptr()) };
        if ret != 0 {
            return Err(Error::from_errno("posix_spawn_file_actions_init", ret));
        }
        Ok(Self { inner })
    }

    fn add_dup2(&mut self, fd: RawFd, target: RawFd) -> Result<()> {
        // SAFETY: self.inner was initialized in new()
        let ret =
            unsafe { libc::posix_spawn_file_actions_adddup2(self.inner.as_mut_ptr(), fd, target) };
        if ret != 0 {
            return Err(Error::from_errno("posix_spawn_file_actions_adddup2", ret));
        }
        Ok(())
    }

    fn add_close(&mut self, fd: RawFd) -> Result<()> {
        // SAFETY: self.inner was initialized in new()
        let ret = unsafe { libc::posix_spawn_file_actions_addclose(self.inner.as_mut_ptr(), fd) };
        if ret != 0 {
            return Err(Error::from_errno("posix_spawn_file_actions_addclose", ret));
        }
        Ok(())
    }

    fn as_ptr(&self) -> *const libc::posix_spawn_file_actions_t {
        self.inner.as_ptr()
    }
}

impl Drop for SpawnFileActions {
    fn drop(&mut self) {
        // SAFETY: self.inner was initialized in new() and hasn't been destroyed yet
        unsafe {
            libc::posix_spawn_file_actions_destroy(self.inner.as_mut_ptr());
        }
    }
}

/* NUL-free C string or an argument error naming what was wrong */
fn c_string(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| Error::InvalidArgument(format!("{what} contains a NUL byte")))
}

/* null-terminated pointer array over owned strings */
fn pointer_array(strings: &[CString]) -> Vec<*const c_char> {
    let mut ptrs: Vec<*const c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(ptr::null());
    ptrs
}

/// Inherited, non-close-on-exec descriptors above 2. Close-on-exec ones
/// go away on their own.
fn inherited_fds() -> Vec<RawFd> {
    let entries = match fs::read_dir(FD_DIR) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot list {FD_DIR}, leaving descriptors open: {e}");
            return Vec::new();
        }
    };
    let mut fds: Vec<RawFd> = entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .filter(|&fd| fd > libc::STDERR_FILENO)
        .collect();
    /* the directory's own fd is closed by now, F_GETFD fails on it */
    fds.retain(|&fd| {
        // SAFETY: F_GETFD takes no pointers, stale fds just return -1
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags >= 0 && flags & libc::FD_CLOEXEC == 0
    });
    fds
}

/* sigset of RESTORED_SIGNALS */
fn restored_sigset() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset initializes the whole set
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
    }
    for sig in RESTORED_SIGNALS {
        // SAFETY: set was initialized by sigemptyset, sig is a valid signal
        unsafe {
            libc::sigaddset(set.as_mut_ptr(), sig);
        }
    }
    // SAFETY: initialized above
    unsafe { set.assume_init() }
}

/// Which execution strategy ran the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    PosixSpawn,
    ForkExec,
}

/// Everything the child needs, converted to C form up front.
#[derive(Debug)]
pub(crate) struct SpawnPlan {
    argv: Vec<CString>,
    envp: Option<Vec<CString>>,
    cwd: Option<CString>,
    /* child-facing descriptor per slot, None = inherit */
    stdio: [Option<RawFd>; 3],
    close_fds: bool,
    restore_signals: bool,
}

impl SpawnPlan {
    pub(crate) fn new(
        args: &[String],
        env: &[String],
        cwd: Option<&Path>,
        stdio: [Option<RawFd>; 3],
        close_fds: bool,
        restore_signals: bool,
    ) -> Result<Self> {
        let argv = args
            .iter()
            .map(|a| c_string(a.as_bytes(), "argument"))
            .collect::<Result<Vec<_>>>()?;
        let envp = if env.is_empty() {
            None
        } else {
            Some(
                env.iter()
                    .map(|e| c_string(e.as_bytes(), "environment entry"))
                    .collect::<Result<Vec<_>>>()?,
            )
        };
        let cwd = cwd
            .map(|dir| c_string(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;
        Ok(Self {
            argv,
            envp,
            cwd,
            stdio,
            close_fds,
            restore_signals,
        })
    }

    #[must_use]
    pub(crate) fn strategy(&self) -> Strategy {
        if self.cwd.is_some() {
            Strategy::ForkExec
        } else {
            Strategy::PosixSpawn
        }
    }

    /// Start the child, returning its pid.
    pub(crate) fn spawn(&self) -> Result<libc::pid_t> {
        let argv = pointer_array(&self.argv);
        let envp = self.envp.as_deref().map(pointer_array);
        let pid = match self.strategy() {
            Strategy::PosixSpawn => self.spawn_posix(&argv, envp.as_deref())?,
            Strategy::ForkExec => self.spawn_forked(&argv, envp.as_deref())?,
        };
        debug!(
            "spawned pid {pid} via {:?}: {:?}",
            self.strategy(),
            self.argv
        );
        Ok(pid)
    }

    fn spawn_posix(&self, argv: &[*const c_char], envp: Option<&[*const c_char]>) -> Result<libc::pid_t> {
        let mut attr = SpawnAttr::new()?;
        if self.restore_signals {
            attr.set_sigdefault(&restored_sigset())?;
            #[allow(clippy::cast_possible_truncation)]
            attr.set_flags(libc::POSIX_SPAWN_SETSIGDEF as libc::c_short)?;
        }

        let mut actions = SpawnFileActions::new()?;
        for (target, source) in (0..).zip(self.stdio) {
            let Some(fd) = source else { continue };
            if fd == target {
                /* dup2 onto itself keeps FD_CLOEXEC on some libcs */
                clear_cloexec(fd)?;
            } else {
                actions.add_dup2(fd, target)?;
            }
        }
        if self.close_fds {
            for fd in inherited_fds() {
                actions.add_close(fd)?;
            }
        }

        // SAFETY: reading the pointer value of environ, not dereferencing it
        let env_ptr = envp.map_or(unsafe { environ }, <[_]>::as_ptr);

        let mut pid: libc::pid_t = 0;
        // SAFETY: argv/envp are null-terminated arrays over CStrings that
        // outlive the call; attr and actions are initialized RAII wrappers.
        let ret = unsafe {
            libc::posix_spawnp(
                &mut pid,
                self.argv[0].as_ptr(),
                actions.as_ptr(),
                attr.as_ptr(),
                argv.as_ptr() as *const *mut c_char,
                env_ptr as *const *mut c_char,
            )
        };
        if ret != 0 {
            return Err(Error::from_errno("posix_spawnp", ret));
        }
        Ok(pid)
    }

    fn spawn_forked(&self, argv: &[*const c_char], envp: Option<&[*const c_char]>) -> Result<libc::pid_t> {
        let (relay_rx, relay_tx) = pipe()?;
        /* after the relay pipe, so its (close-on-exec) ends are filtered out */
        let close_list = if self.close_fds {
            inherited_fds()
        } else {
            Vec::new()
        };

        // SAFETY: the child only runs async-signal-safe calls on memory
        // prepared above before exec or _exit
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Error::last_os("fork"));
        }
        if pid == 0 {
            self.exec_child(argv, envp, &close_list, relay_tx.id());
        }

        drop(relay_tx);
        let mut report = [0u8; 8];
        let n = relay_rx.receive(&mut report)?;
        if n == 0 {
            return Ok(pid);
        }

        /* child is on its way to _exit, collect it */
        reap_blocking(pid);
        if n < report.len() {
            return Err(Error::from_errno("fork", libc::EIO));
        }
        let step = i32::from_ne_bytes([report[0], report[1], report[2], report[3]]);
        let errno = i32::from_ne_bytes([report[4], report[5], report[6], report[7]]);
        let call = usize::try_from(step)
            .ok()
            .and_then(|i| STEP_NAMES.get(i))
            .copied()
            .unwrap_or("exec");
        Err(Error::from_errno(call, errno))
    }

    /*
     * Runs in the forked child. Never returns. No allocation, no locks,
     * no unwinding past this point.
     */
    fn exec_child(
        &self,
        argv: &[*const c_char],
        envp: Option<&[*const c_char]>,
        close_list: &[RawFd],
        relay: RawFd,
    ) -> ! {
        for (target, source) in (0..).zip(self.stdio) {
            let Some(fd) = source else { continue };
            if fd == target {
                if clear_cloexec(fd).is_err() {
                    child_fail(relay, STEP_FCNTL);
                }
                continue;
            }
            // SAFETY: plain descriptor numbers, no pointers
            if unsafe { libc::dup2(fd, target) } < 0 {
                child_fail(relay, STEP_DUP2);
            }
        }

        for &fd in close_list {
            // SAFETY: closing an inherited descriptor in our own address space
            unsafe {
                libc::close(fd);
            }
        }

        if self.restore_signals {
            for sig in RESTORED_SIGNALS {
                // SAFETY: installing SIG_DFL is async-signal-safe
                unsafe {
                    libc::signal(sig, libc::SIG_DFL);
                }
            }
        }

        if let Some(cwd) = &self.cwd {
            // SAFETY: cwd is a NUL-terminated string allocated before fork
            if unsafe { libc::chdir(cwd.as_ptr()) } < 0 {
                child_fail(relay, STEP_CHDIR);
            }
        }

        if let Some(envp) = envp {
            // SAFETY: single-threaded after fork; envp outlives exec
            unsafe {
                environ = envp.as_ptr();
            }
        }

        // SAFETY: argv is a null-terminated array of CStrings allocated before fork
        unsafe {
            libc::execvp(self.argv[0].as_ptr(), argv.as_ptr());
        }
        child_fail(relay, STEP_EXEC)
    }
}

/* dup2(fd, fd) is a no-op, so the inheritable bit has to be cleared by hand */
fn clear_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: F_GETFD takes no pointers
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::last_os("fcntl"));
    }
    // SAFETY: F_SETFD takes an int
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(Error::last_os("fcntl"));
    }
    Ok(())
}

/* report (step, errno) through the relay, then _exit. child side only. */
fn child_fail(relay: RawFd, step: i32) -> ! {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let mut report = [0u8; 8];
    report[..4].copy_from_slice(&step.to_ne_bytes());
    report[4..].copy_from_slice(&errno.to_ne_bytes());
    // SAFETY: report is 8 readable bytes; a short or failed write just
    // means the parent sees an early exit
    unsafe {
        libc::write(relay, report.as_ptr().cast(), report.len());
    }
    // SAFETY: _exit skips atexit handlers and destructors, which belong to the parent
    unsafe { libc::_exit(CHILD_FAILURE_STATUS) }
}

/* used only for a child that already told us it's dying */
fn reap_blocking(pid: libc::pid_t) {
    let mut status = 0;
    loop {
        // SAFETY: status is a valid out-pointer
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret >= 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
    }
}

/*
 * These tests spawn real processes. They reap with waitpid directly so the
 * plan is tested without the reaper on top.
 */
#[cfg(test)]
#[cfg(not(miri))]
mod tests {
    use super::*;
    use crate::handle::Handle;

    fn plan(args: &[&str], cwd: Option<&Path>, stdio: [Option<RawFd>; 3]) -> Result<SpawnPlan> {
        let args: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
        SpawnPlan::new(&args, &[], cwd, stdio, true, true)
    }

    fn exit_code(pid: libc::pid_t) -> i32 {
        let mut status = 0;
        // SAFETY: status is a valid out-pointer
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(ret, pid);
        assert!(libc::WIFEXITED(status));
        libc::WEXITSTATUS(status)
    }

    #[test]
    fn test_strategy_follows_cwd() {
        assert_eq!(plan(&["true"], None, [None; 3]).unwrap().strategy(), Strategy::PosixSpawn);
        assert_eq!(
            plan(&["true"], Some(Path::new("/")), [None; 3]).unwrap().strategy(),
            Strategy::ForkExec
        );
    }

    #[test]
    fn test_posix_spawn_exit_code() {
        let pid = plan(&["sh", "-c", "exit 7"], None, [None; 3]).unwrap().spawn().unwrap();
        assert_eq!(exit_code(pid), 7);
    }

    #[test]
    fn test_fork_exec_exit_code() {
        let pid = plan(&["sh", "-c", "exit 5"], Some(Path::new("/")), [None; 3])
            .unwrap()
            .spawn()
            .unwrap();
        assert_eq!(exit_code(pid), 5);
    }

    #[test]
    fn test_posix_spawn_not_found() {
        let err = plan(&["nonexistent_command_12345"], None, [None; 3])
            .unwrap()
            .spawn()
            .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::exit_codes::NOT_FOUND);
    }

    #[test]
    fn test_fork_exec_not_found_is_relayed() {
        let err = plan(&["nonexistent_command_12345"], Some(Path::new("/")), [None; 3])
            .unwrap()
            .spawn()
            .unwrap_err();
        match err {
            Error::Os { call, source } => {
                assert_eq!(call, "execvp");
                assert_eq!(source.raw_os_error(), Some(libc::ENOENT));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fork_exec_bad_cwd_is_relayed() {
        let err = plan(&["true"], Some(Path::new("/nonexistent/dir/12345")), [None; 3])
            .unwrap()
            .spawn()
            .unwrap_err();
        assert!(matches!(err, Error::Os { call: "chdir", .. }), "got {err}");
    }

    #[test]
    fn test_nul_byte_rejected() {
        let err = plan(&["echo", "a\0b"], None, [None; 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_stdout_dup2_both_strategies() {
        for cwd in [None, Some(Path::new("/"))] {
            let (rx, tx) = pipe().unwrap();
            let pid = plan(&["echo", "dup"], cwd, [None, Some(tx.id()), None])
                .unwrap()
                .spawn()
                .unwrap();
            drop(tx);
            assert_eq!(rx.receive_to_end().unwrap(), b"dup\n");
            assert_eq!(exit_code(pid), 0);
        }
    }

    #[test]
    fn test_env_override() {
        let (rx, tx) = pipe().unwrap();
        let args = vec!["sh".to_owned(), "-c".to_owned(), "echo $ONLY".to_owned()];
        let env = vec!["ONLY=set".to_owned(), "PATH=/bin:/usr/bin".to_owned()];
        let pid = SpawnPlan::new(&args, &env, None, [None, Some(tx.id()), None], true, true)
            .unwrap()
            .spawn()
            .unwrap();
        drop(tx);
        assert_eq!(rx.receive_to_end().unwrap(), b"set\n");
        assert_eq!(exit_code(pid), 0);
    }

    #[test]
    fn test_close_fds_hides_inheritable_descriptor() {
        let file = tempfile::tempfile().unwrap();
        let leaked = Handle::from(file);
        leaked.set_close_on_exec(false).unwrap();
        let probe = format!("test -e /dev/fd/{} && echo open || echo closed", leaked.id());

        for close_fds in [true, false] {
            let (rx, tx) = pipe().unwrap();
            let args = vec!["sh".to_owned(), "-c".to_owned(), probe.clone()];
            let pid = SpawnPlan::new(&args, &[], None, [None, Some(tx.id()), None], close_fds, true)
                .unwrap()
                .spawn()
                .unwrap();
            drop(tx);
            let out = rx.receive_to_end().unwrap();
            let expected: &[u8] = if close_fds { b"closed\n" } else { b"open\n" };
            assert_eq!(out, expected);
            assert_eq!(exit_code(pid), 0);
        }
    }
}
