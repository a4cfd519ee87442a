use anyhow::Result;
use downcast_rs::impl_downcast;
use downcast_rs::Downcast;
use mio::Events;
use mio::Poll;
use mio::Token;
use mio::Waker;
use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;
use std::any::type_name;
use std::borrow::Cow;
use std::cell::Cell;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Wrapper type for resource identification within the event-loop itself
/// (distinct from `crate::resources::Rid`, which identifies JS-visible
/// resources in the op layer).
pub type Index = u32;

/// Anything the event-loop tracks across ticks implements `Resource`.
pub trait Resource: Downcast + 'static {
    fn name(&self) -> Cow<str> {
        type_name::<Self>().into()
    }
    fn close(&mut self) {}
}

impl_downcast!(Resource);

/// Describes a task running on the thread-pool.
struct TaskWrap {
    inner: Option<TaskOnFinish>,
}

impl Resource for TaskWrap {}

type Task = Box<dyn FnOnce() -> TaskResult + Send>;
type TaskOnFinish = Box<dyn FnOnce(LoopHandle, TaskResult) + 'static>;
pub type TaskResult = Option<Result<Vec<u8>>>;

type OnCheck = Box<dyn FnOnce(LoopHandle) + 'static>;

/// A callback scheduled to run once, after the current poll phase, without
/// going through the thread pool. Used sparingly, for bindings that need to
/// yield to the event loop once before continuing (`setImmediate`-style).
struct CheckWrap {
    cb: Option<OnCheck>,
}

impl Resource for CheckWrap {}

enum Action {
    SpawnReq(Index, Task, TaskWrap),
    CheckReq(Index, CheckWrap),
    CheckRemoveReq(Index),
}

enum Event {
    ThreadPool(Index, TaskResult),
}

/// The runtime's I/O driver: a thread-pool for offloading blocking work
/// (module/file loads today; anything ops choose to dispatch this way in
/// the future) plus a `mio` waker so `JsRuntime::run_event_loop` can be
/// interrupted from another thread (an unhandled promise rejection, a
/// signal handler). Deliberately does not know anything about V8 — timers
/// and op futures live in `JsRuntimeState`/`runtime.rs`, which poll this
/// loop's one phase (`tick`) alongside their own isolate-bound work.
pub struct EventLoop {
    index: Rc<Cell<Index>>,
    resources: HashMap<Index, Box<dyn Resource>>,
    action_queue: mpsc::Receiver<Action>,
    action_queue_empty: Rc<Cell<bool>>,
    action_dispatcher: Rc<mpsc::Sender<Action>>,
    check_queue: Vec<Index>,
    thread_pool: ThreadPool,
    thread_pool_tasks: usize,
    event_dispatcher: Arc<Mutex<mpsc::Sender<Event>>>,
    event_queue: mpsc::Receiver<Event>,
    poll: Poll,
    waker: Arc<Waker>,
}

impl EventLoop {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0);

        let (action_dispatcher, action_queue) = mpsc::channel();
        let (event_dispatcher, event_queue) = mpsc::channel();

        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();

        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), Token(0)).unwrap();

        EventLoop {
            index: Rc::new(Cell::new(1)),
            resources: HashMap::new(),
            action_queue,
            action_queue_empty: Rc::new(Cell::new(true)),
            action_dispatcher: Rc::new(action_dispatcher),
            check_queue: Vec::new(),
            thread_pool,
            thread_pool_tasks: 0,
            event_dispatcher: Arc::new(Mutex::new(event_dispatcher)),
            event_queue,
            poll,
            waker: Arc::new(waker),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            index: self.index.clone(),
            actions: self.action_dispatcher.clone(),
            actions_queue_empty: self.action_queue_empty.clone(),
        }
    }

    pub fn interrupt_handle(&self) -> LoopInterruptHandle {
        LoopInterruptHandle {
            waker: self.waker.clone(),
        }
    }

    pub fn has_pending_events(&self) -> bool {
        !(self.resources.is_empty() && self.action_queue_empty.get() && self.thread_pool_tasks == 0)
    }

    /// One phase: drain actions requested since the last tick, block on
    /// `mio::Poll` (woken by a finished thread-pool task, an interrupt, or
    /// the timeout the caller in `runtime.rs` chose), then run due checks.
    pub fn tick(&mut self, timeout: Option<Duration>) {
        self.prepare();
        self.run_poll(timeout);
        self.run_check();
    }

    fn prepare(&mut self) {
        while let Ok(action) = self.action_queue.try_recv() {
            match action {
                Action::SpawnReq(index, task, t_wrap) => self.spawn_req(index, task, t_wrap),
                Action::CheckReq(index, cb) => self.check_req(index, cb),
                Action::CheckRemoveReq(index) => self.check_remove_req(index),
            };
        }
        self.action_queue_empty.set(true);
    }

    fn run_poll(&mut self, timeout: Option<Duration>) {
        let mut events = Events::with_capacity(128);
        self.poll.poll(&mut events, timeout).unwrap();

        while let Ok(event) = self.event_queue.try_recv() {
            match event {
                Event::ThreadPool(index, result) => self.task_complete(index, result),
            }
            self.prepare();
        }
    }

    fn run_check(&mut self) {
        let handle = self.handle();

        for rid in self.check_queue.drain(..) {
            let Some(mut resource) = self.resources.remove(&rid) else {
                continue;
            };

            if let Some(cb) = resource
                .downcast_mut::<CheckWrap>()
                .and_then(|wrap| wrap.cb.take())
            {
                (cb)(handle.clone());
            }
        }
        self.prepare();
    }

    fn task_complete(&mut self, index: Index, result: TaskResult) {
        if let Some(mut resource) = self.resources.remove(&index) {
            let task_wrap = resource.downcast_mut::<TaskWrap>().unwrap();
            if let Some(callback) = task_wrap.inner.take() {
                (callback)(self.handle(), result);
            }
        }
        self.thread_pool_tasks -= 1;
    }

    fn spawn_req(&mut self, index: Index, task: Task, task_wrap: TaskWrap) {
        let notifier = self.event_dispatcher.clone();

        if task_wrap.inner.is_some() {
            self.resources.insert(index, Box::new(task_wrap));
        }

        let waker = self.waker.clone();
        self.thread_pool.spawn(move || {
            let result = (task)();
            let notifier = notifier.lock().unwrap();
            notifier.send(Event::ThreadPool(index, result)).unwrap();
            waker.wake().unwrap();
        });

        self.thread_pool_tasks += 1;
    }

    fn check_req(&mut self, index: Index, check_wrap: CheckWrap) {
        self.resources.insert(index, Box::new(check_wrap));
        self.check_queue.push(index);
    }

    fn check_remove_req(&mut self, index: Index) {
        self.resources.remove(&index);
        self.check_queue.retain(|v| *v != index);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        let default_pool_size = NonZeroUsize::new(4).unwrap();
        let num_cores = thread::available_parallelism().unwrap_or(default_pool_size);
        Self::new(num_cores.into())
    }
}

#[derive(Clone)]
pub struct LoopHandle {
    index: Rc<Cell<Index>>,
    actions: Rc<mpsc::Sender<Action>>,
    actions_queue_empty: Rc<Cell<bool>>,
}

impl LoopHandle {
    pub fn index(&self) -> Index {
        let index = self.index.get();
        self.index.set(index + 1);
        index
    }

    /// Runs `task` on the thread-pool without blocking the isolate thread;
    /// `task_cb`, if given, runs back on the isolate thread once it
    /// completes (queued as a `JsFuture` by the caller, not invoked here).
    pub fn spawn<F, U>(&self, task: F, task_cb: Option<U>) -> Index
    where
        F: FnOnce() -> TaskResult + Send + 'static,
        U: FnOnce(LoopHandle, TaskResult) + 'static,
    {
        let index = self.index();

        let task_cb: Option<Box<dyn FnOnce(LoopHandle, TaskResult)>> = match task_cb {
            Some(cb) => Some(Box::new(cb)),
            None => None,
        };

        let task_wrap = TaskWrap { inner: task_cb };

        self.actions
            .send(Action::SpawnReq(index, Box::new(task), task_wrap))
            .unwrap();

        self.actions_queue_empty.set(false);
        index
    }

    pub fn check<F>(&self, on_check: F) -> Index
    where
        F: FnOnce(LoopHandle) + 'static,
    {
        let index = self.index();
        self.actions
            .send(Action::CheckReq(index, CheckWrap { cb: Some(Box::new(on_check)) }))
            .unwrap();
        self.actions_queue_empty.set(false);
        index
    }

    pub fn remove_check(&self, index: &Index) {
        self.actions.send(Action::CheckRemoveReq(*index)).unwrap();
        self.actions_queue_empty.set(false);
    }
}

#[derive(Clone)]
pub struct LoopInterruptHandle {
    waker: Arc<Waker>,
}

impl LoopInterruptHandle {
    pub fn interrupt(&self) {
        self.waker.wake().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn spawned_task_reports_back_on_the_next_tick() {
        let mut event_loop = EventLoop::new(1);
        let handle = event_loop.handle();
        let (tx, rx) = std_mpsc::channel();

        handle.spawn(
            || Some(Ok(b"done".to_vec())),
            Some(move |_: LoopHandle, result: TaskResult| {
                tx.send(result).unwrap();
            }),
        );

        assert!(event_loop.has_pending_events());

        // Poll until the thread-pool task reports back.
        for _ in 0..100 {
            event_loop.tick(Some(Duration::from_millis(50)));
            if rx.try_recv().is_ok() {
                return;
            }
        }
        panic!("spawned task never completed");
    }
}
