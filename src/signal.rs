use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use log::info;
use signal_hook::consts::{SIGINT, SIGPIPE, SIGTERM};
use signal_hook::iterator::Signals;

/// Cooperative cancellation flag polled between records and at every ring
/// wait. Cloned into every thread of a pipeline.
#[derive(Debug, Default, Clone)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Routes SIGINT/SIGPIPE/SIGTERM into the token from a dedicated thread;
/// termination stays cooperative, never abortive.
pub fn install(token: ShutdownToken) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGPIPE, SIGTERM])?;
    thread::Builder::new().name("signals".into()).spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("Caught signal {}, exiting", sig);
            token.terminate();
        }
    })?;
    Ok(())
}
