use std::ffi::c_void;
use std::panic::catch_unwind;
use std::sync::mpsc::{channel, Sender};

use core_foundation::base::{kCFAllocatorDefault, TCFType};
use core_foundation::runloop::{
    kCFRunLoopBeforeWaiting, kCFRunLoopDefaultMode, CFRunLoop, CFRunLoopActivity,
    CFRunLoopObserver, CFRunLoopObserverContext, CFRunLoopObserverCreate, CFRunLoopObserverRef,
};

use super::ffi::{impl_release_callback, CFRunLoopExt};

struct ObserverContextInfo {
    tx: Sender<()>,
}

impl_release_callback!(release_observer_ctx, const ObserverContextInfo);

extern "C" fn observer_callback(
    _observer: CFRunLoopObserverRef,
    _activity: CFRunLoopActivity,
    info: *mut c_void,
) {
    drop(catch_unwind(move || {
        let ctx: &ObserverContextInfo = unsafe { &*(info.cast()) };
        let _ = ctx.tx.send(());
    }));
}

/// Block until `runloop` is parked waiting for input, so that stopping it can't race an
/// in-flight `FSEvents` callback.
pub fn wait_until_idle(runloop: &CFRunLoop) {
    let (tx, rx) = channel();
    let mut ctx = CFRunLoopObserverContext {
        version: 0,
        info: Box::into_raw(Box::new(ObserverContextInfo { tx })).cast(),
        retain: None,
        release: Some(release_observer_ctx),
        copyDescription: None,
    };
    // The context struct is copied by `CFRunLoopObserverCreate`; `info` is released with the
    // observer.
    let observer = unsafe {
        CFRunLoopObserver::wrap_under_create_rule(CFRunLoopObserverCreate(
            kCFAllocatorDefault,
            kCFRunLoopBeforeWaiting,
            0,
            0,
            observer_callback,
            &mut ctx,
        ))
    };
    runloop.add_observer(&observer, unsafe { kCFRunLoopDefaultMode });

    if !runloop.is_waiting() {
        // Wait the RunLoop to enter Waiting state.
        let _ = rx.recv();
    }

    runloop.remove_observer(&observer, unsafe { kCFRunLoopDefaultMode });
}
