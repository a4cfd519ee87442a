use crate::event_loop::LoopInterruptHandle;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Lets a signal handler ask the event loop to stop without touching V8
/// from off the isolate thread: set the flag, then interrupt `mio::Poll` so
/// a blocked `tick_event_loop` notices on its very next wakeup instead of
/// waiting out whatever timeout it chose.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    interrupt: LoopInterruptHandle,
}

impl ShutdownHandle {
    pub fn new(flag: Arc<AtomicBool>, interrupt: LoopInterruptHandle) -> Self {
        ShutdownHandle { flag, interrupt }
    }

    fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.interrupt.interrupt();
    }
}

/// Installs Ctrl-C (and, on unix, `SIGTERM`) handling for `handle`'s runtime.
/// Shutdown still drains through `JsRuntime::run_event_loop`'s normal loop
/// exit rather than `process::exit`, so the isolate tears down cleanly.
#[cfg(unix)]
pub fn install(handle: ShutdownHandle) {
    use signal_hook::consts::SIGINT;
    use signal_hook::consts::SIGTERM;
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(_) => return,
    };

    std::thread::spawn(move || {
        for _ in signals.forever() {
            handle.request();
        }
    });
}

#[cfg(windows)]
pub fn install(handle: ShutdownHandle) {
    let _ = ctrlc::set_handler(move || handle.request());
}
