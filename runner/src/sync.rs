use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use std::{
    os::raw::c_int,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Run level cancellation, observed by schedulers at poll tick boundaries
///
/// Cancelling never touches already launched processes.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

static SIGNAL_TOKEN: OnceCell<CancelToken> = OnceCell::new();

extern "C" fn on_signal(_signal: c_int) {
    // only an atomic store, safe inside a signal handler
    if let Some(token) = SIGNAL_TOKEN.get() {
        token.cancel();
    }
}

/// cancel `token` on the first SIGINT/ SIGTERM, a second one falls back to the default action
pub fn install_signal_handlers(token: &CancelToken) -> nix::Result<()> {
    // a token from an earlier call stays in place, handlers are process wide anyway
    let _ = SIGNAL_TOKEN.set(token.clone());

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESETHAND | SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action) }?;
    }

    Ok(())
}
