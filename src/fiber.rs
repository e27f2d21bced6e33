//! Сooperative multitasking module.
//!
//! A fiber is an independent stack of execution multiplexed, together with
//! every other fiber of the same thread, onto that one OS thread. Fibers
//! write straight-line blocking-style code; the blocking points of
//! [`coio`](crate::coio) and [`sleep`] suspend the calling fiber and hand
//! control back to the scheduler, which resumes it when the awaited event
//! arrives.
//!
//! With this module you can:
//! - spawn fibers with [`spawn`] or the configurable [`Builder`],
//! - give up the processor for a while with [`sleep`],
//! - track context switches with [`csw`] and [`check_yield`].
//!
//! Scheduling is strictly cooperative: a fiber runs until its next blocking
//! call, and any code between two blocking calls is atomic with respect to
//! the other fibers of the thread.

use std::fmt;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::time::Duration;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::error::{Error, Result};
use crate::sched;

/// Default stack size for a new fiber.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack the [`Builder`] accepts.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Fiber handle, unique within the process lifetime.
///
/// Ids are allocated from a monotonic counter and never reused, so a stale
/// handle can never alias a younger fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(crate) u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Suspension protocol
////////////////////////////////////////////////////////////////////////////////

/// Why a suspended fiber is suspended.
///
/// Yielded to the scheduler at every blocking point.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wait {
    /// Parked until `fd` is ready in `dir`, or until `timeout` elapses.
    Io {
        fd: RawFd,
        dir: crate::coio::Direction,
        timeout: Option<Duration>,
    },
    /// Parked until the monotonic clock reaches `deadline` (nanoseconds).
    Sleep { deadline: u64 },
}

/// The scheduler's verdict passed back into a resuming fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The awaited event arrived.
    Ready,
    /// The wait's timeout expired first.
    Timeout,
}

pub(crate) type FiberYielder = Yielder<Wake, Wait>;

/// Lifecycle states of a fiber. At most one fiber is `Running` per
/// scheduler; `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberState {
    Runnable,
    Running,
    IoWait,
    Sleeping,
    Done,
}

/// What came out of resuming a fiber.
pub(crate) enum RunOutcome {
    /// The work function returned this code.
    Finished(i32),
    /// The fiber suspended itself at a blocking point.
    Suspended(Wait),
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A fiber owned by the scheduler: its stackful coroutine plus the
/// bookkeeping the queues need.
pub(crate) struct Fiber {
    pub(crate) id: FiberId,
    pub(crate) name: String,
    pub(crate) state: FiberState,
    /// Verdict to deliver on the next resume.
    pub(crate) wake: Wake,
    /// Suspension entry point, captured when the fiber first runs. Valid
    /// for as long as the coroutine exists; only dereferenced while this
    /// fiber is the running one.
    pub(crate) yielder: Option<NonNull<FiberYielder>>,
    co: Coroutine<Wake, Wait, i32>,
}

impl Fiber {
    pub(crate) fn new(id: FiberId, name: String, co: Coroutine<Wake, Wait, i32>) -> Self {
        Fiber {
            id,
            name,
            state: FiberState::Runnable,
            wake: Wake::Ready,
            yielder: None,
            co,
        }
    }

    /// Switch into the fiber. Returns once it suspends or finishes.
    pub(crate) fn resume(&mut self, wake: Wake) -> RunOutcome {
        match self.co.resume(wake) {
            CoroutineResult::Yield(wait) => RunOutcome::Suspended(wait),
            CoroutineResult::Return(code) => RunOutcome::Finished(code),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.co.done()
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Suspend the calling fiber with the given reason and return the
/// scheduler's verdict once it is resumed.
///
/// Must be called from inside a fiber; from the main context there is
/// nothing to yield to.
pub(crate) fn suspend(wait: Wait) -> Result<Wake> {
    let yielder = sched::running_yielder().ok_or(Error::OutsideFiber)?;
    // The pointer was captured from a `&Yielder` living on the coroutine
    // stack of the fiber that is running right now, on this thread.
    Ok(unsafe { yielder.as_ref() }.suspend(wait))
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it. The currently
/// supported configurations are:
///
/// * `name`:       an associated name for the fiber (used in logs)
/// * `stack_size`: the stack size for the fiber
///
/// The [`spawn`](Builder::spawn) method takes ownership of the builder and
/// enqueues the new fiber on the runnable queue. The [`spawn`](spawn()) free
/// function uses a `Builder` with the default configuration.
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    stack_size: usize,
}

impl Builder {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Builder {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber.
    ///
    /// Fails with `InvalidInput` if `stack_size` is smaller than
    /// [`MIN_STACK_SIZE`].
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("stack size must be at least {} bytes", MIN_STACK_SIZE),
            )));
        }
        self.stack_size = stack_size;
        Ok(self)
    }

    /// Spawns a new fiber by taking ownership of the `Builder`.
    ///
    /// The fiber is put at the tail of the runnable queue; it first runs
    /// when the scheduler reaches it, not inside this call. `f` returning
    /// `0` denotes success, any other value a caller-defined failure; both
    /// terminate the fiber.
    pub fn spawn<F>(self, f: F) -> Result<FiberId>
    where
        F: FnOnce() -> i32 + 'static,
    {
        let Builder { name, stack_size } = self;
        let stack = DefaultStack::new(stack_size).map_err(Error::Io)?;
        let co = Coroutine::with_stack(stack, move |yielder: &FiberYielder, _first: Wake| {
            // Publish the suspension entry point before any user code gets
            // a chance to block.
            sched::note_running_yielder(NonNull::from(yielder));
            f()
        });
        sched::add_fiber(name, co)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a new fiber with the default configuration and puts it at the
/// tail of the runnable queue.
///
/// Returns an error if the current thread has no initialized runtime.
pub fn spawn<F>(f: F) -> Result<FiberId>
where
    F: FnOnce() -> i32 + 'static,
{
    Builder::new().spawn(f)
}

////////////////////////////////////////////////////////////////////////////////
// Sleep
////////////////////////////////////////////////////////////////////////////////

/// Put the calling fiber to sleep for at least `dur`.
///
/// The wake deadline is computed from the scheduler's per-iteration
/// timestamp rather than a fresh clock reading: every fiber sleeping within
/// one loop iteration measures from the same instant, at the cost of up to
/// one iteration of extra latency. `sleep(Duration::ZERO)` yields exactly
/// once and resumes without a real delay.
///
/// Outside of a fiber this falls back to blocking the whole thread.
pub fn sleep(dur: Duration) {
    let deadline = match sched::sleep_deadline(dur) {
        Ok(deadline) => deadline,
        Err(_) => {
            std::thread::sleep(dur);
            return;
        }
    };
    if suspend(Wait::Sleep { deadline }).is_err() {
        std::thread::sleep(dur);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Context switch tracking
////////////////////////////////////////////////////////////////////////////////

/// Returns the number of context switches into fibers performed by the
/// current thread's scheduler so far.
///
/// Mostly used for testing.
pub fn csw() -> u64 {
    sched::stats().switches
}

/// Calls a function and checks whether the scheduler switched fibers while
/// it ran.
///
/// It's mostly useful in tests.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use fibrio::fiber::{check_yield, YieldResult};
///
/// assert_eq!(
///     check_yield(|| fibrio::fiber::sleep(Duration::ZERO)),
///     YieldResult::Yielded(())
/// );
/// ```
pub fn check_yield<F, T>(f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let csw_before = csw();
    let res = f();
    if csw() == csw_before {
        YieldResult::DidntYield(res)
    } else {
        YieldResult::Yielded(res)
    }
}

/// Possible [`check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The function didn't yield.
    DidntYield(T),
    /// The function did yield.
    Yielded(T),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn with_runtime(f: impl FnOnce()) {
        sched::init().unwrap();
        f();
        sched::fini().unwrap();
    }

    #[test]
    fn spawn_requires_runtime() {
        assert!(matches!(spawn(|| 0), Err(Error::Uninitialized)));
    }

    #[test]
    fn fibers_run_in_fifo_order() {
        with_runtime(|| {
            let order = Rc::new(RefCell::new(Vec::new()));
            for tag in 0..3 {
                let order = order.clone();
                spawn(move || {
                    order.borrow_mut().push(tag);
                    0
                })
                .unwrap();
            }
            sched::schedule().unwrap();
            assert_eq!(*order.borrow(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn fiber_ids_are_never_reused() {
        with_runtime(|| {
            let a = spawn(|| 0).unwrap();
            sched::schedule().unwrap();
            let b = spawn(|| 0).unwrap();
            sched::schedule().unwrap();
            assert!(b > a);
        });
    }

    #[test]
    fn sleep_zero_yields_exactly_once() {
        with_runtime(|| {
            let seen = Rc::new(RefCell::new(None));
            let seen_in_fiber = seen.clone();
            spawn(move || {
                let before = csw();
                sleep(Duration::ZERO);
                *seen_in_fiber.borrow_mut() = Some(csw() - before);
                0
            })
            .unwrap();
            sched::schedule().unwrap();
            // One suspension, one switch back in.
            assert_eq!(*seen.borrow(), Some(1));
        });
    }

    #[test]
    fn check_yield_detects_sleep() {
        with_runtime(|| {
            let result = Rc::new(RefCell::new(None));
            let result_in_fiber = result.clone();
            spawn(move || {
                let verdicts = (
                    check_yield(|| ()),
                    check_yield(|| sleep(Duration::ZERO)),
                );
                *result_in_fiber.borrow_mut() = Some(verdicts);
                0
            })
            .unwrap();
            sched::schedule().unwrap();
            assert_eq!(
                result.borrow().as_ref().unwrap().0,
                YieldResult::DidntYield(())
            );
            assert_eq!(
                result.borrow().as_ref().unwrap().1,
                YieldResult::Yielded(())
            );
        });
    }

    #[test]
    fn sleep_ordering_follows_deadlines() {
        with_runtime(|| {
            let order = Rc::new(RefCell::new(Vec::new()));

            let o = order.clone();
            spawn(move || {
                sleep(Duration::from_millis(100));
                o.borrow_mut().push(("f1", crate::clock::monotonic64()));
                0
            })
            .unwrap();

            let o = order.clone();
            spawn(move || {
                sleep(Duration::from_millis(50));
                o.borrow_mut().push(("f2", crate::clock::monotonic64()));
                0
            })
            .unwrap();

            sched::schedule().unwrap();

            let order = order.borrow();
            assert_eq!(order.len(), 2);
            assert_eq!(order[0].0, "f2");
            assert_eq!(order[1].0, "f1");
            assert!(order[0].1 < order[1].1);
        });
    }

    #[test]
    fn panicking_fiber_does_not_take_down_the_rest(){
        with_runtime(|| {
            let survived = Rc::new(RefCell::new(false));
            spawn(|| panic!("boom")).unwrap();
            let s = survived.clone();
            spawn(move || {
                *s.borrow_mut() = true;
                0
            })
            .unwrap();
            sched::schedule().unwrap();
            assert!(*survived.borrow());
        });
    }
}
