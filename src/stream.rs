/*
 * stream.rs
 *
 * What happens to each of the child's stdin/stdout/stderr. Resolved once
 * at start into the handle the child gets and the handle the parent keeps.
 *
 *   Inherit  -> nothing, child uses ours
 *   Handle   -> child gets it, parent keeps nothing
 *   Pipe     -> child gets one end, parent keeps the other
 *   Null     -> child gets the shared /dev/null
 *   Merge    -> stderr only: child's 2 becomes whatever its 1 is
 */

use std::fmt;
use std::fs::File;

use crate::error::{Error, Result};
use crate::handle::{Handle, null_device};
use crate::pipe::pipe;

/// Redirection policy for one standard stream.
#[derive(Debug, Default)]
pub enum Redirect {
    #[default]
    Inherit,
    Handle(Handle),
    Pipe,
    Null,
    /// stderr only.
    Merge,
}

impl From<Handle> for Redirect {
    fn from(handle: Handle) -> Self {
        Self::Handle(handle)
    }
}

impl From<File> for Redirect {
    fn from(file: File) -> Self {
        Self::Handle(Handle::from(file))
    }
}

/// Which standard stream a redirect applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/* resolved redirect: child half is consumed by spawn */
#[derive(Debug, Default)]
pub(crate) struct Endpoint {
    pub child: Option<Handle>,
    pub parent: Option<Handle>,
}

impl Endpoint {
    #[cfg(test)]
    pub(crate) fn is_piped(&self) -> bool {
        self.parent.is_some()
    }
}

/* Merge is handled by resolve_all, it needs stdout's result */
fn resolve(redirect: Redirect, slot: Slot) -> Result<Endpoint> {
    let endpoint = match redirect {
        Redirect::Inherit => Endpoint::default(),
        Redirect::Handle(handle) => {
            /* a child-facing fd above 2 only reaches the child via dup2 */
            if handle.id() > libc::STDERR_FILENO {
                handle.set_close_on_exec(true)?;
            }
            Endpoint {
                child: Some(handle),
                parent: None,
            }
        }
        Redirect::Pipe => {
            let (receiver, sender) = pipe()?;
            let (child, parent) = if slot == Slot::Stdin {
                (receiver, sender)
            } else {
                (sender, receiver)
            };
            Endpoint {
                child: Some(child),
                parent: Some(parent),
            }
        }
        Redirect::Null => Endpoint {
            child: Some(null_device()?),
            parent: None,
        },
        Redirect::Merge => {
            return Err(Error::InvalidArgument(format!(
                "{slot} cannot be merged, only stderr can"
            )));
        }
    };
    Ok(endpoint)
}

/// Resolve all three streams, stdout before stderr so a merge can see it.
/// If anything fails, pipes created so far are dropped (and closed).
pub(crate) fn resolve_all(
    stdin: Redirect,
    stdout: Redirect,
    stderr: Redirect,
) -> Result<[Endpoint; 3]> {
    let input = resolve(stdin, Slot::Stdin)?;
    let output = resolve(stdout, Slot::Stdout)?;
    let error = match stderr {
        Redirect::Merge => Endpoint {
            child: Some(match &output.child {
                Some(handle) => handle.alias(),
                None => Handle::stdout(),
            }),
            parent: None,
        },
        other => resolve(other, Slot::Stderr)?,
    };
    Ok([input, output, error])
}
