//! The M:N worker pool: any number of logical workers multiplexed onto a
//! fixed set of OS threads, each worker a fresh VM state behind the
//! `ScriptHost` seam, exchanging values with the parent exclusively
//! through the typed wire format carried in ownership-transferable arenas.
//!
//! Locking contract: a worker's mutex guards its status, both queues, and
//! the receive-context slot. No code path holds two worker mutexes at
//! once; to signal a receive context, producers snapshot the context Arc
//! under the worker mutex, release it, and only then lock the context.

use arena::TransferBuf;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use wire::Value;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error(transparent)]
    Wire(#[from] wire::Error),

    #[error("every worker has terminated and no messages are pending")]
    Drained,

    #[error("worker pool is shut down")]
    ShutDown,
}

/// The seam to the external VM: executes one worker script to completion
/// inside a fresh state. The implementation is expected to replicate the
/// parent's library bindings into the new state, load the script at
/// `path`, and call it with `args`; `ctx` is the script's channel back to
/// the pool (`worker.message` / `worker.peek`).
pub trait ScriptHost: Send + Sync + 'static {
    fn run(&self, ctx: &WorkerCtx, path: &str, args: Vec<Value>) -> Result<(), String>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Blocked,
    Dead,
    Error,
}

struct WorkerState {
    status: WorkerStatus,
    error: Option<String>,
    inbox: VecDeque<TransferBuf>,
    outbox: VecDeque<TransferBuf>,
    recv_ctx: Option<Arc<ReceiveContext>>,
}

/// One logical worker. Reference-counted between the pool's run queue and
/// any user-side handles.
pub struct Worker {
    state: Mutex<WorkerState>,
    /// Waited on only by the worker's own thread (in `peek`).
    inbox_cond: Condvar,
    /// Waited on only by parent threads.
    outbox_cond: Condvar,
    path: String,
    init_args: usize,
}

/// Rendezvous for a selective receive over several workers. The `ready`
/// flag is set by producers before signalling and cleared by the receiver
/// under the mutex before re-waiting, which closes the lost-wakeup window.
struct ReceiveContext {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl Worker {
    fn new(path: &str, init_args: usize) -> Self {
        Self {
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Running,
                error: None,
                inbox: VecDeque::new(),
                outbox: VecDeque::new(),
                recv_ctx: None,
            }),
            inbox_cond: Condvar::new(),
            outbox_cond: Condvar::new(),
            path: path.to_owned(),
            init_args,
        }
    }

    /// Host-side status: "running", "dead", or "error".
    pub fn status(&self) -> &'static str {
        match self.state.lock().expect("worker mutex").status {
            WorkerStatus::Running | WorkerStatus::Blocked => "running",
            WorkerStatus::Dead => "dead",
            WorkerStatus::Error => "error",
        }
    }

    /// Queue a value into this worker's inbox.
    pub fn send(&self, value: &Value) -> Result<(), Error> {
        let buf = wire::serialize(value)?;
        {
            let mut state = self.state.lock().expect("worker mutex");
            state.inbox.push_back(buf);
        }
        self.inbox_cond.notify_one();
        Ok(())
    }

    /// Push onto the outbox and wake anyone waiting on it, including a
    /// registered selective receive.
    fn post(&self, buf: TransferBuf) {
        let ctx = {
            let mut state = self.state.lock().expect("worker mutex");
            state.outbox.push_back(buf);
            state.recv_ctx.clone()
        };
        self.outbox_cond.notify_all();
        if let Some(ctx) = ctx {
            ctx.signal();
        }
    }

    fn finish(&self, result: Result<(), String>) {
        let ctx = {
            let mut state = self.state.lock().expect("worker mutex");
            match result {
                Ok(()) => state.status = WorkerStatus::Dead,
                Err(message) => {
                    state.status = WorkerStatus::Error;
                    state.error = Some(message);
                }
            }
            state.recv_ctx.clone()
        };
        self.inbox_cond.notify_all();
        self.outbox_cond.notify_all();
        if let Some(ctx) = ctx {
            ctx.signal();
        }
    }
}

impl ReceiveContext {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn signal(&self) {
        let mut ready = self.ready.lock().expect("context mutex");
        *ready = true;
        self.cond.notify_all();
    }

    fn wait_ready(&self) {
        let mut ready = self.ready.lock().expect("context mutex");
        while !*ready {
            ready = self.cond.wait(ready).expect("context mutex");
        }
        // Cleared before the next scan so a wakeup is never consumed twice.
        *ready = false;
    }
}

/// The script's view of its own worker.
pub struct WorkerCtx {
    worker: Arc<Worker>,
}

impl WorkerCtx {
    /// `worker.message(v)`: serialize `v` into a fresh transfer arena and
    /// post it to the outbox.
    pub fn message(&self, value: &Value) -> Result<(), Error> {
        let buf = wire::serialize(value)?;
        self.worker.post(buf);
        Ok(())
    }

    /// `worker.peek()`: block until the inbox has a message, then pop and
    /// decode it. The message's arena is freed here, on the consuming
    /// thread.
    pub fn peek(&self) -> Result<Value, Error> {
        let buf = {
            let mut state = self.worker.state.lock().expect("worker mutex");
            loop {
                if let Some(buf) = state.inbox.pop_front() {
                    state.status = WorkerStatus::Running;
                    break buf;
                }
                state.status = WorkerStatus::Blocked;
                state = self
                    .worker
                    .inbox_cond
                    .wait(state)
                    .expect("worker mutex");
            }
        };
        Ok(wire::deserialize(buf.as_slice())?)
    }

    pub fn path(&self) -> &str {
        &self.worker.path
    }
}

struct RunQueue {
    runnable: VecDeque<Arc<Worker>>,
    shutdown: bool,
}

struct PoolInner {
    queue: Mutex<RunQueue>,
    queue_cond: Condvar,
    host: Arc<dyn ScriptHost>,
}

/// The process-wide pool of OS threads servicing runnable workers.
pub struct Pool {
    inner: Arc<PoolInner>,
    threads: Vec<JoinHandle<()>>,
}

/// Default thread count: the CPU count, clamped to [1, 32].
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 32)
}

impl Pool {
    pub fn new(host: Arc<dyn ScriptHost>) -> Self {
        Self::with_threads(host, default_threads())
    }

    pub fn with_threads(host: Arc<dyn ScriptHost>, threads: usize) -> Self {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(RunQueue {
                runnable: VecDeque::new(),
                shutdown: false,
            }),
            queue_cond: Condvar::new(),
            host,
        });
        let count = threads.max(1);
        let threads = (0..count)
            .map(|i| {
                let inner = inner.clone();
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || service_loop(inner))
                    .expect("spawn pool thread")
            })
            .collect();
        tracing::debug!(threads = count, "worker pool started");
        Self { inner, threads }
    }

    /// Create a worker for the script at `path`, pre-queuing `args` into
    /// its inbox, and link it into the runnable queue.
    pub fn create(&self, path: &str, args: &[Value]) -> Result<Arc<Worker>, Error> {
        let worker = Arc::new(Worker::new(path, args.len()));
        for arg in args {
            let buf = wire::serialize(arg)?;
            worker
                .state
                .lock()
                .expect("worker mutex")
                .inbox
                .push_back(buf);
        }
        {
            let mut queue = self.inner.queue.lock().expect("queue mutex");
            if queue.shutdown {
                return Err(Error::ShutDown);
            }
            queue.runnable.push_back(worker.clone());
        }
        self.inner.queue_cond.notify_one();
        Ok(worker)
    }

    /// Stop accepting work and join every pool thread. Workers still
    /// running are allowed to finish first.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.inner.queue.lock().expect("queue mutex");
            queue.shutdown = true;
        }
        self.inner.queue_cond.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn service_loop(inner: Arc<PoolInner>) {
    loop {
        let worker = {
            let mut queue = inner.queue.lock().expect("queue mutex");
            loop {
                if let Some(worker) = queue.runnable.pop_front() {
                    break worker;
                }
                if queue.shutdown {
                    return;
                }
                queue = inner.queue_cond.wait(queue).expect("queue mutex");
            }
        };
        run_worker(&inner, worker);
    }
}

fn run_worker(inner: &Arc<PoolInner>, worker: Arc<Worker>) {
    // Decode the pre-queued initial arguments.
    let mut args = Vec::with_capacity(worker.init_args);
    for _ in 0..worker.init_args {
        let buf = worker
            .state
            .lock()
            .expect("worker mutex")
            .inbox
            .pop_front()
            .expect("initial arguments are pre-queued");
        match wire::deserialize(buf.as_slice()) {
            Ok(value) => args.push(value),
            Err(err) => {
                worker.finish(Err(format!("bad initial argument: {err}")));
                return;
            }
        }
    }

    let ctx = WorkerCtx {
        worker: worker.clone(),
    };
    let path = worker.path.clone();
    tracing::debug!(script = %path, "worker starting");
    let result = inner.host.run(&ctx, &path, args);
    if let Err(message) = &result {
        tracing::debug!(script = %path, error = %message, "worker failed");
    }
    worker.finish(result);
}

/// `worker.receive(w1, …, wk)`: wait for the first available outbox
/// message among `workers`, returning it in its slot with `Nil` in every
/// other position. A worker observed in the error state re-raises its
/// stored error here.
pub fn receive(workers: &[Arc<Worker>]) -> Result<Vec<Value>, Error> {
    assert!(!workers.is_empty(), "receive needs at least one worker");
    let ctx = ReceiveContext::new();

    // Register the shared context on every worker so any post wakes us.
    for worker in workers {
        let mut state = worker.state.lock().expect("worker mutex");
        state.recv_ctx = Some(ctx.clone());
    }

    let result = loop {
        let mut all_done = true;
        let mut found = None;
        for (slot, worker) in workers.iter().enumerate() {
            let mut state = worker.state.lock().expect("worker mutex");
            if let Some(buf) = state.outbox.pop_front() {
                found = Some((slot, buf));
                break;
            }
            match state.status {
                WorkerStatus::Error => {
                    let message = state
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown worker error".to_owned());
                    drop(state);
                    deregister(workers);
                    return Err(Error::WorkerFailed(message));
                }
                WorkerStatus::Dead => {}
                WorkerStatus::Running | WorkerStatus::Blocked => all_done = false,
            }
        }
        if let Some((slot, buf)) = found {
            break match wire::deserialize(buf.as_slice()) {
                Ok(value) => {
                    let mut out = vec![Value::Nil; workers.len()];
                    out[slot] = value;
                    Ok(out)
                }
                Err(err) => Err(err.into()),
            };
        }
        if all_done {
            break Err(Error::Drained);
        }
        ctx.wait_ready();
    };

    deregister(workers);
    result
}

fn deregister(workers: &[Arc<Worker>]) {
    for worker in workers {
        let mut state = worker.state.lock().expect("worker mutex");
        state.recv_ctx = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    /// A host whose "scripts" are behaviors keyed by path.
    struct TestHost;

    impl ScriptHost for TestHost {
        fn run(&self, ctx: &WorkerCtx, path: &str, args: Vec<Value>) -> Result<(), String> {
            match path {
                "send-after-10ms" => {
                    std::thread::sleep(Duration::from_millis(10));
                    ctx.message(&Value::from("a")).unwrap();
                    Ok(())
                }
                "send-after-5ms" => {
                    std::thread::sleep(Duration::from_millis(5));
                    ctx.message(&Value::from("b")).unwrap();
                    Ok(())
                }
                "echo-args" => {
                    ctx.message(&Value::Table(
                        args.into_iter()
                            .enumerate()
                            .map(|(i, v)| (Value::Int(i as i64 + 1), v))
                            .collect(),
                    ))
                    .unwrap();
                    Ok(())
                }
                "echo-inbox" => {
                    let v = ctx.peek().map_err(|e| e.to_string())?;
                    ctx.message(&v).unwrap();
                    Ok(())
                }
                "count-to-three" => {
                    for i in 1..=3 {
                        ctx.message(&Value::Int(i)).unwrap();
                    }
                    Ok(())
                }
                "fail" => Err("script exploded".to_owned()),
                other => Err(format!("unknown script {other}")),
            }
        }
    }

    fn pool() -> Pool {
        Pool::with_threads(Arc::new(TestHost), 4)
    }

    #[test]
    fn select_returns_first_sender_with_nils_elsewhere() {
        let pool = pool();
        let w1 = pool.create("send-after-10ms", &[]).unwrap();
        let w2 = pool.create("send-after-5ms", &[]).unwrap();

        let first = receive(&[w1.clone(), w2.clone()]).unwrap();
        assert_eq!(first, vec![Value::Nil, Value::from("b")]);

        let second = receive(&[w1, w2]).unwrap();
        assert_eq!(second, vec![Value::from("a"), Value::Nil]);
    }

    #[test]
    fn initial_arguments_reach_the_script() {
        let pool = pool();
        let w = pool
            .create("echo-args", &[Value::Int(7), Value::from("hi")])
            .unwrap();
        let got = receive(&[w]).unwrap();
        assert_eq!(
            got[0],
            Value::Table(vec![
                (Value::Int(1), Value::Int(7)),
                (Value::Int(2), Value::from("hi")),
            ])
        );
    }

    #[test]
    fn peek_blocks_until_the_parent_sends() {
        let pool = pool();
        let w = pool.create("echo-inbox", &[]).unwrap();
        // The worker is blocked in peek; send releases it.
        w.send(&Value::Int(42)).unwrap();
        let got = receive(&[w]).unwrap();
        assert_eq!(got[0], Value::Int(42));
    }

    #[test]
    fn messages_from_one_worker_arrive_in_fifo_order() {
        let pool = pool();
        let w = pool.create("count-to-three", &[]).unwrap();
        for expect in 1..=3i64 {
            let got = receive(&[w.clone()]).unwrap();
            assert_eq!(got[0], Value::Int(expect));
        }
    }

    #[test]
    fn worker_errors_reraise_on_receive() {
        let pool = pool();
        let w = pool.create("fail", &[]).unwrap();
        let err = match receive(&[w.clone()]) {
            Err(Error::WorkerFailed(message)) => message,
            other => panic!("expected the stored worker error, got {other:?}"),
        };
        assert_eq!(err, "script exploded");
        assert_eq!(w.status(), "error");
    }

    #[test]
    fn drained_workers_report_instead_of_blocking() {
        let pool = pool();
        let w = pool.create("count-to-three", &[]).unwrap();
        for _ in 0..3 {
            receive(&[w.clone()]).unwrap();
        }
        assert!(matches!(receive(&[w.clone()]), Err(Error::Drained)));
        assert_eq!(w.status(), "dead");
    }

    #[test]
    fn many_workers_multiplex_over_few_threads() {
        let pool = Pool::with_threads(Arc::new(TestHost), 1);
        let workers: Vec<_> = (0..8)
            .map(|_| pool.create("count-to-three", &[]).unwrap())
            .collect();
        for w in &workers {
            let got = receive(std::slice::from_ref(w)).unwrap();
            assert_eq!(got[0], Value::Int(1));
        }
    }

    #[test]
    fn shutdown_joins_and_rejects_new_work() {
        let mut pool = pool();
        pool.shutdown();
        assert!(matches!(pool.create("fail", &[]), Err(Error::ShutDown)));
        // Idempotent.
        pool.shutdown();
    }
}
