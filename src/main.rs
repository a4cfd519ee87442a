mod bindings;
mod cli;
mod errors;
mod event_loop;
mod hooks;
mod loaders;
mod modules;
mod ops;
mod resources;
mod runtime;
mod signals;
mod timers;

use crate::cli::process_cli_arguments;
use std::env;

/// Custom hook on panics, so a crash still reports the platform and args
/// needed to reproduce it instead of a bare Rust backtrace.
fn setup_panic_hook() {
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        eprintln!("\n============================================================");
        eprintln!("The runtime panicked. This is a bug, not a script error.");
        eprintln!("If you can reliably reproduce this, include the reproduction");
        eprintln!("steps and re-run with the RUST_BACKTRACE=1 env var set.");
        eprintln!();
        eprintln!("Platform: {} {}", env::consts::OS, env::consts::ARCH);
        eprintln!("Version: {}", env!("CARGO_PKG_VERSION"));
        eprintln!("Args: {:?}", env::args().collect::<Vec<_>>());
        eprintln!();
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

fn main() {
    // Set custom panic hook on release builds.
    if !cfg!(debug_assertions) {
        setup_panic_hook();
    }

    #[cfg(target_family = "windows")]
    {
        // Windows consoles don't interpret ANSI escapes out of the box.
        let _ = enable_ansi_support::enable_ansi_support();
    }

    process_cli_arguments();
}
