use std::cell::Cell;

thread_local! {
    static WORKER_ID: Cell<u64> = Cell::new(0);
}

#[inline]
pub fn set_worker_id(id: u64) {
    WORKER_ID.with(|r| r.set(id));
}

#[inline]
pub fn worker_id() -> u64 {
    WORKER_ID.with(|r| r.get())
}

#[macro_export]
macro_rules! worker_debug {
    ($t: tt) => (
        log::debug!(std::concat!("worker-{}: ", $t), $crate::worker_log::worker_id())
    );
    ($t: tt, $($arg:tt)*) => (
        log::debug!(std::concat!("worker-{}: ", $t), $crate::worker_log::worker_id(), $($arg)*)
    );
}

#[macro_export]
macro_rules! worker_info {
    ($t: tt) => (
        log::info!(std::concat!("worker-{}: ", $t), $crate::worker_log::worker_id())
    );
    ($t: tt, $($arg:tt)*) => (
        log::info!(std::concat!("worker-{}: ", $t), $crate::worker_log::worker_id(), $($arg)*)
    );
}

#[macro_export]
macro_rules! worker_warn {
    ($t: tt) => (
        log::warn!(std::concat!("worker-{}: ", $t), $crate::worker_log::worker_id())
    );
    ($t: tt, $($arg:tt)*) => (
        log::warn!(std::concat!("worker-{}: ", $t), $crate::worker_log::worker_id(), $($arg)*)
    );
}
