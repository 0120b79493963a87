//! # Check-and-Report
//!
//! Every failure detected by the memory core goes through [`report`] before
//! it is handed back to the caller as an `Err`.
//!
//! ## Pipeline
//!
//! 1. The failure is logged with `tracing::error!` (file, line, message).
//! 2. The thread's report hook, if any, sees the [`Failure`].
//! 3. The thread's [`FailurePolicy`] decides: `Abort` panics on the spot,
//!    `Log` lets the error travel back to the caller.
//!
//! The policy and hook are thread-local. Arenas are single-threaded, so the
//! thread that owns an arena is the one that observes its failures.
//!
//! ## Example
//!
//! ```rust,ignore
//! let capture = report::capture();
//! assert!(area.add_sub_area(usize::MAX, "Huge").is_err());
//! assert_eq!(capture.count(), 1);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// What happens after a failure was logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt immediately with the diagnostic.
    Abort,
    /// Log and return the error to the caller.
    Log,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Abort
        } else {
            Self::Log
        }
    }
}

/// A reported failure together with the call site that triggered it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    /// What went wrong.
    pub error: MemoryError,
    /// Source file of the call site.
    pub file: &'static str,
    /// Line of the call site.
    pub line: u32,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.error)
    }
}

type Hook = Rc<dyn Fn(&Failure)>;

struct Reporter {
    policy: FailurePolicy,
    hook: Option<Hook>,
}

thread_local! {
    static REPORTER: RefCell<Reporter> = RefCell::new(Reporter {
        policy: FailurePolicy::default(),
        hook: None,
    });
}

/// Logs `error`, forwards it to the hook, applies the policy and hands the
/// error back so the caller can return it.
///
/// # Panics
///
/// Panics when the thread's policy is [`FailurePolicy::Abort`].
#[track_caller]
pub fn report(error: MemoryError) -> MemoryError {
    let location = Location::caller();
    let failure = Failure {
        error,
        file: location.file(),
        line: location.line(),
    };

    tracing::error!("memory failure at {}:{}: {}", failure.file, failure.line, failure.error);

    let (policy, hook) = REPORTER.with(|reporter| {
        let reporter = reporter.borrow();
        (reporter.policy, reporter.hook.clone())
    });

    if let Some(hook) = hook {
        hook(&failure);
    }

    if policy == FailurePolicy::Abort {
        panic!("memory failure at {failure}");
    }

    failure.error
}

/// Returns the failure policy active on this thread.
#[must_use]
pub fn failure_policy() -> FailurePolicy {
    REPORTER.with(|reporter| reporter.borrow().policy)
}

/// Sets the failure policy for the rest of this thread's life.
pub fn set_thread_policy(policy: FailurePolicy) {
    REPORTER.with(|reporter| reporter.borrow_mut().policy = policy);
}

/// Restores the previous policy when dropped.
#[must_use = "the policy is restored as soon as the guard drops"]
pub struct PolicyGuard {
    previous: FailurePolicy,
}

impl Drop for PolicyGuard {
    fn drop(&mut self) {
        set_thread_policy(self.previous);
    }
}

/// Switches this thread to `policy` until the guard drops.
pub fn scoped_policy(policy: FailurePolicy) -> PolicyGuard {
    let previous = failure_policy();
    set_thread_policy(policy);
    PolicyGuard { previous }
}

/// Restores the previous hook when dropped.
#[must_use = "the hook is removed as soon as the guard drops"]
pub struct HookGuard {
    previous: Option<Hook>,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        REPORTER.with(|reporter| reporter.borrow_mut().hook = previous);
    }
}

/// Installs a hook that sees every failure reported on this thread until
/// the guard drops.
pub fn set_report_hook(hook: impl Fn(&Failure) + 'static) -> HookGuard {
    let hook: Hook = Rc::new(hook);
    let previous = REPORTER.with(|reporter| reporter.borrow_mut().hook.replace(hook));
    HookGuard { previous }
}

/// Records failures instead of aborting, for the lifetime of the capture.
///
/// Switches the thread to [`FailurePolicy::Log`] and installs a recording
/// hook. Both are restored on drop.
#[must_use = "failures are only captured while the value is alive"]
pub struct FailureCapture {
    failures: Rc<RefCell<Vec<Failure>>>,
    _hook: HookGuard,
    _policy: PolicyGuard,
}

impl FailureCapture {
    /// Number of failures seen so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.failures.borrow().len()
    }

    /// Copy of every failure seen so far.
    #[must_use]
    pub fn failures(&self) -> Vec<Failure> {
        self.failures.borrow().clone()
    }

    /// The most recent failure's error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<MemoryError> {
        self.failures.borrow().last().map(|failure| failure.error.clone())
    }

    /// Drains the recorded failures.
    pub fn take(&self) -> Vec<Failure> {
        std::mem::take(&mut *self.failures.borrow_mut())
    }
}

/// Starts capturing failures on this thread.
pub fn capture() -> FailureCapture {
    let failures = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&failures);
    let policy = scoped_policy(FailurePolicy::Log);
    let hook = set_report_hook(move |failure| sink.borrow_mut().push(failure.clone()));
    FailureCapture {
        failures,
        _hook: hook,
        _policy: policy,
    }
}
