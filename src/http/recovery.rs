//! Panic guard.
//!
//! A panic anywhere below the guard is caught and turned into a
//! [`Failure::Panic`] outcome, which the dispatcher renders as a 500 with a
//! correlation code. The serving task and the process keep running.
//!
//! A process-wide panic hook records the message, location and backtrace
//! of panics raised while a guarded future is being polled. Panics outside
//! a guard go to the previously installed hook unchanged.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use futures_util::FutureExt;

use crate::http::response::{Failure, Outcome, PanicReport};

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install the recording panic hook (idempotent).
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !GUARDED.with(Cell::get) {
                previous(info);
                return;
            }
            let report = PanicReport {
                message: payload_message(info.payload()),
                location: info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
                backtrace: Some(Backtrace::force_capture().to_string()),
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(report));
        }));
    });
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Marks the current thread as guarded while alive.
struct GuardScope {
    previous: bool,
}

impl GuardScope {
    fn enter() -> Self {
        Self { previous: GUARDED.with(|g| g.replace(true)) }
    }
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        GUARDED.with(|g| g.set(self.previous));
    }
}

/// Future that is polled with the guard flag set.
struct Guarded<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Guarded<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _scope = GuardScope::enter();
        self.inner.as_mut().poll(cx)
    }
}

/// Run `fut`, converting a panic into a [`PanicReport`].
pub async fn guard<F: Future>(fut: F) -> Result<F::Output, PanicReport> {
    install_panic_hook();
    let guarded = Guarded { inner: Box::pin(fut) };
    match AssertUnwindSafe(guarded).catch_unwind().await {
        Ok(output) => Ok(output),
        Err(payload) => {
            let recorded = LAST_PANIC.with(|slot| slot.borrow_mut().take());
            Err(recorded.unwrap_or_else(|| PanicReport {
                message: payload_message(payload.as_ref()),
                ..PanicReport::default()
            }))
        }
    }
}

/// Middleware catching panics raised by the routes below it.
pub async fn catch_panic(request: Request, next: Next) -> Response {
    match guard(next.run(request)).await {
        Ok(response) => response,
        Err(report) => Outcome::Failure(Failure::Panic(report)).into_pending_response(),
    }
}
