//! The detached-coroutine scheduler: a single-threaded cooperative layer
//! that parks suspended tasks on file descriptors or deadlines and
//! multiplexes their readiness through one `poll(2)` call per tick.
//!
//! The coroutine itself lives in the VM; its seam here is the `Detached`
//! trait, whose `resume` returns the task's next suspension. All state is
//! owned by the host thread — nothing here is shared or locked.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("poll failed: {0}")]
    Poll(#[from] io::Error),
}

/// Readiness a task waits for on its descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
}

/// What a resumed task does next.
pub enum Yield {
    /// Park until `fd` satisfies `interest`.
    Io { fd: RawFd, interest: Interest },
    /// Park until the deadline passes.
    Sleep { deadline: Instant },
    /// The task yielded a plain value instead of a scheduler suspension;
    /// it leaves the scheduler.
    Yielded,
    Done,
    Error(String),
}

/// Why a task is being resumed.
#[derive(Debug, Copy, Clone)]
pub enum Wake {
    /// First resume, at detach time.
    Start,
    /// The awaited descriptor is ready.
    Io { readable: bool, writable: bool },
    /// The sleep deadline passed.
    Timer,
}

/// The task seam. An implementation wraps a VM coroutine plus whatever
/// continuation context its current I/O primitive keeps (for example the
/// byte offset of a partially transmitted buffer), so a resume picks up
/// exactly where the last suspension left off.
pub trait Detached {
    fn resume(&mut self, wake: Wake) -> Yield;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// Status of a task as observed by `detach` / `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Pending,
    Completed,
    Yielded,
    Error(String),
}

impl Status {
    /// Numeric code exposed to scripts.
    pub fn code(&self) -> u8 {
        match self {
            Status::Pending => 1,
            Status::Completed => 2,
            Status::Yielded => 3,
            Status::Error(_) => 4,
        }
    }
}

enum Wait {
    Io { fd: RawFd, interest: Interest },
    Sleep { deadline: Instant },
}

struct Entry<T> {
    id: TaskId,
    task: T,
    wait: Wait,
}

/// Poll timeout: `NonBlocking` returns immediately, `Forever` blocks until
/// something is ready, `Within` bounds the wait.
#[derive(Debug, Copy, Clone)]
pub enum Timeout {
    NonBlocking,
    Forever,
    Within(Duration),
}

/// The outcome of one poll tick.
#[derive(Debug, Default)]
pub struct Tick {
    /// Tasks resumed this tick (each at most once).
    pub resumed: usize,
    /// Tasks that ran to completion during this tick.
    pub completed: Vec<TaskId>,
    /// Tasks that failed during this tick, with their errors.
    pub errors: Vec<(TaskId, String)>,
}

pub struct Scheduler<T: Detached> {
    entries: VecDeque<Entry<T>>,
    next_id: u64,
}

impl<T: Detached> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Detached> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Count of parked tasks.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Start `task` and, if it suspends on a scheduler reason, park it.
    pub fn detach(&mut self, mut task: T) -> (TaskId, Status) {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        match task.resume(Wake::Start) {
            Yield::Io { fd, interest } => {
                self.entries.push_back(Entry {
                    id,
                    task,
                    wait: Wait::Io { fd, interest },
                });
                (id, Status::Pending)
            }
            Yield::Sleep { deadline } => {
                self.entries.push_back(Entry {
                    id,
                    task,
                    wait: Wait::Sleep { deadline },
                });
                (id, Status::Pending)
            }
            Yield::Yielded => (id, Status::Yielded),
            Yield::Done => (id, Status::Completed),
            Yield::Error(message) => (id, Status::Error(message)),
        }
    }

    /// Drop a parked task, discarding its pending fd or timer entry.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        before != self.entries.len()
    }

    /// One tick: wait for readiness (bounded by `timeout` and the earliest
    /// sleep deadline), then resume every ready task exactly once — expired
    /// sleeps first, then ready descriptors, each set in registration
    /// order. Errors never propagate out of the tick; they are reported on
    /// the returned `Tick`.
    pub fn poll(&mut self, timeout: Timeout) -> Result<Tick, Error> {
        let mut tick = Tick::default();
        if self.entries.is_empty() {
            return Ok(tick);
        }

        let now = Instant::now();
        let earliest = self
            .entries
            .iter()
            .filter_map(|e| match e.wait {
                Wait::Sleep { deadline } => Some(deadline),
                Wait::Io { .. } => None,
            })
            .min();

        let wait_millis = effective_wait(timeout, earliest, now);

        // One pollfd per parked descriptor, in registration order.
        let io_index: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e.wait, Wait::Io { .. }).then_some(i))
            .collect();
        let mut pollfds: Vec<libc::pollfd> = io_index
            .iter()
            .map(|&i| {
                let Wait::Io { fd, interest } = self.entries[i].wait else {
                    unreachable!("io_index holds io entries");
                };
                let mut events = 0;
                if interest.read {
                    events |= libc::POLLIN;
                }
                if interest.write {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                wait_millis,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err.into());
            }
            // Interrupted: fall through with no descriptor readiness;
            // expired sleeps still run.
            for fd in &mut pollfds {
                fd.revents = 0;
            }
        }

        let now = Instant::now();

        // Collect the ready set before resuming anything, so a task that
        // re-suspends cannot run twice in this tick. Sleeps go first to
        // keep a busy descriptor from starving timers.
        let mut ready: Vec<(usize, Wake)> = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if let Wait::Sleep { deadline } = entry.wait {
                if deadline <= now {
                    ready.push((i, Wake::Timer));
                }
            }
        }
        for (slot, &i) in io_index.iter().enumerate() {
            let revents = pollfds[slot].revents;
            let readable =
                revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
            let writable = revents & (libc::POLLOUT | libc::POLLERR) != 0;
            let Wait::Io { interest, .. } = self.entries[i].wait else {
                unreachable!("io_index holds io entries");
            };
            if (interest.read && readable) || (interest.write && writable) {
                ready.push((i, Wake::Io { readable, writable }));
            }
        }

        // Detach the ready entries, highest index first so positions stay
        // valid, then restore registration order.
        let mut resuming: Vec<(Entry<T>, Wake)> = Vec::with_capacity(ready.len());
        let mut indices: Vec<usize> = ready.iter().map(|&(i, _)| i).collect();
        indices.sort_unstable();
        for &i in indices.iter().rev() {
            let wake = ready
                .iter()
                .find(|&&(ri, _)| ri == i)
                .map(|&(_, w)| w)
                .expect("index came from ready");
            let entry = self.entries.remove(i).expect("index in bounds");
            resuming.push((entry, wake));
        }
        resuming.reverse();
        // Timers still resume before descriptors.
        resuming.sort_by_key(|(_, wake)| match wake {
            Wake::Timer => 0u8,
            _ => 1,
        });

        for (mut entry, wake) in resuming {
            tick.resumed += 1;
            match entry.task.resume(wake) {
                Yield::Io { fd, interest } => {
                    entry.wait = Wait::Io { fd, interest };
                    self.entries.push_back(entry);
                }
                Yield::Sleep { deadline } => {
                    entry.wait = Wait::Sleep { deadline };
                    self.entries.push_back(entry);
                }
                Yield::Yielded => {
                    tick.errors.push((
                        entry.id,
                        "detached coroutine yielded a non-scheduler value".to_owned(),
                    ));
                }
                Yield::Done => tick.completed.push(entry.id),
                Yield::Error(message) => {
                    tracing::debug!(task = entry.id.0, error = %message, "detached task failed");
                    tick.errors.push((entry.id, message));
                }
            }
        }
        Ok(tick)
    }
}

fn effective_wait(timeout: Timeout, earliest: Option<Instant>, now: Instant) -> libc::c_int {
    let until_deadline = earliest.map(|deadline| {
        if deadline <= now {
            0i64
        } else {
            let nanos = (deadline - now).as_nanos();
            ((nanos + 999_999) / 1_000_000).min(i64::MAX as u128) as i64
        }
    });
    let requested = match timeout {
        Timeout::NonBlocking => Some(0i64),
        Timeout::Forever => None,
        Timeout::Within(d) => Some(d.as_millis().min(i32::MAX as u128) as i64),
    };
    let millis = match (requested, until_deadline) {
        (Some(r), Some(d)) => r.min(d),
        (Some(r), None) => r,
        (None, Some(d)) => d,
        (None, None) => -1,
    };
    millis.clamp(-1, i32::MAX as i64) as libc::c_int
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    /// A scripted task: each resume records its name and pops the next
    /// suspension.
    struct Step {
        name: &'static str,
        script: VecDeque<Yield>,
        log: Log,
    }

    impl Step {
        fn new(name: &'static str, script: Vec<Yield>, log: &Log) -> Self {
            Self {
                name,
                script: script.into(),
                log: log.clone(),
            }
        }
    }

    impl Detached for Step {
        fn resume(&mut self, _wake: Wake) -> Yield {
            self.log.borrow_mut().push(self.name);
            self.script.pop_front().unwrap_or(Yield::Done)
        }
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn write_byte(fd: RawFd) {
        assert_eq!(unsafe { libc::write(fd, [7u8].as_ptr().cast(), 1) }, 1);
    }

    fn sleep_yield(millis: u64) -> Yield {
        Yield::Sleep {
            deadline: Instant::now() + Duration::from_millis(millis),
        }
    }

    #[test]
    fn detach_reports_immediate_completion() {
        let log = Log::default();
        let mut sched = Scheduler::new();
        let (_, status) = sched.detach(Step::new("done", vec![Yield::Done], &log));
        assert_eq!(status, Status::Completed);
        assert_eq!(status.code(), 2);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn sleeps_expire_in_registration_order() {
        let log = Log::default();
        let mut sched = Scheduler::new();
        let deadline = Instant::now();
        for name in ["a", "b", "c"] {
            sched.detach(Step::new(name, vec![Yield::Sleep { deadline }], &log));
        }
        log.borrow_mut().clear(); // drop the Start resumes

        let tick = sched.poll(Timeout::Forever).unwrap();
        assert_eq!(tick.resumed, 3);
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn fd_readiness_resumes_the_waiter() {
        let log = Log::default();
        let (rfd, wfd) = pipe();
        let mut sched = Scheduler::new();
        sched.detach(Step::new(
            "reader",
            vec![Yield::Io {
                fd: rfd,
                interest: Interest::READ,
            }],
            &log,
        ));
        log.borrow_mut().clear();

        // Nothing to read yet.
        let tick = sched.poll(Timeout::NonBlocking).unwrap();
        assert_eq!(tick.resumed, 0);
        assert_eq!(sched.pending(), 1);

        write_byte(wfd);
        let tick = sched.poll(Timeout::Within(Duration::from_secs(1))).unwrap();
        assert_eq!(tick.resumed, 1);
        assert_eq!(tick.completed.len(), 1);
        assert_eq!(*log.borrow(), vec!["reader"]);
    }

    #[test]
    fn expired_sleeps_run_before_ready_fds() {
        let log = Log::default();
        let (rfd, wfd) = pipe();
        write_byte(wfd); // readable before the tick begins

        let mut sched = Scheduler::new();
        sched.detach(Step::new(
            "io",
            vec![Yield::Io {
                fd: rfd,
                interest: Interest::READ,
            }],
            &log,
        ));
        sched.detach(Step::new(
            "timer",
            vec![Yield::Sleep {
                deadline: Instant::now(),
            }],
            &log,
        ));
        log.borrow_mut().clear();

        sched.poll(Timeout::Forever).unwrap();
        assert_eq!(*log.borrow(), vec!["timer", "io"]);
    }

    #[test]
    fn a_resumed_task_reparks_and_does_not_run_twice_per_tick() {
        let log = Log::default();
        let (rfd, wfd) = pipe();
        write_byte(wfd);
        write_byte(wfd);

        let mut sched = Scheduler::new();
        sched.detach(Step::new(
            "r",
            vec![
                Yield::Io {
                    fd: rfd,
                    interest: Interest::READ,
                },
                // Re-park on the same still-readable descriptor.
                Yield::Io {
                    fd: rfd,
                    interest: Interest::READ,
                },
            ],
            &log,
        ));
        log.borrow_mut().clear();

        let tick = sched.poll(Timeout::Forever).unwrap();
        assert_eq!(tick.resumed, 1, "one resume per tick");
        assert_eq!(sched.pending(), 1);

        let tick = sched.poll(Timeout::Forever).unwrap();
        assert_eq!(tick.resumed, 1);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn unmet_readiness_does_not_resume() {
        let log = Log::default();
        let (rfd, _wfd) = pipe();
        let mut sched = Scheduler::new();
        sched.detach(Step::new(
            "r",
            vec![Yield::Io {
                fd: rfd,
                interest: Interest::READ,
            }],
            &log,
        ));
        sched.detach(Step::new("s", vec![sleep_yield(60_000)], &log));
        log.borrow_mut().clear();

        let tick = sched.poll(Timeout::NonBlocking).unwrap();
        assert_eq!(tick.resumed, 0);
        assert!(log.borrow().is_empty());
        assert_eq!(sched.pending(), 2);
    }

    #[test]
    fn cancel_discards_pending_entries() {
        let log = Log::default();
        let mut sched = Scheduler::new();
        let (id, status) = sched.detach(Step::new("s", vec![sleep_yield(60_000)], &log));
        assert_eq!(status, Status::Pending);
        assert_eq!(sched.pending(), 1);
        assert!(sched.cancel(id));
        assert!(!sched.cancel(id));
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn task_errors_surface_on_the_tick() {
        let log = Log::default();
        let mut sched = Scheduler::new();
        sched.detach(Step::new(
            "fails",
            vec![
                sleep_yield(0),
                Yield::Error("broken pipe".to_owned()),
            ],
            &log,
        ));

        let tick = sched.poll(Timeout::Forever).unwrap();
        assert_eq!(tick.errors.len(), 1);
        assert_eq!(tick.errors[0].1, "broken pipe");
        assert_eq!(sched.pending(), 0);
    }
}
