//! The per-context background thread.
//!
//! One thread per context, started at construction and joined exactly once
//! at delete. Each iteration drains the control channel, then blocks inside
//! the backend event pump for at most [`POLL_INTERVAL`], then dispatches
//! whatever the pump produced. The bounded pump keeps cancellation latency
//! bounded as well: an `Exit` command is observed within one interval.

use crate::context::Shared;
use flume::{Receiver, Sender, TryRecvError};
use log::{debug, trace};
use std::{sync::Arc, thread, time::Duration};

/// Upper bound on one blocking backend pump call.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub(crate) enum MonitorCommand {
    /// Stop the loop; the ack is sent just before the thread returns.
    Exit(Sender<()>),
}

pub(crate) fn monitor_loop(shared: Arc<Shared>, receiver: Receiver<MonitorCommand>) {
    trace!("monitor thread started");
    loop {
        match receiver.try_recv() {
            Ok(MonitorCommand::Exit(ack)) => {
                trace!("monitor thread exiting");
                if let Err(e) = ack.send(()) {
                    debug!("monitor exit: failed to ack: {}", e);
                }
                return;
            }
            Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }

        // The pump is the only place this thread blocks. Lock order is
        // state lock then backend mutex; the pump takes only the latter.
        let events = {
            let _guard = shared.backend_guard();
            shared.backend().poll(POLL_INTERVAL)
        };

        match events {
            Ok(events) => {
                for event in events {
                    shared.dispatch_event(event);
                }
            }
            Err(e) => {
                // Transient backend hiccups do not stop the loop, and this
                // layer never reconnects on its own.
                debug!("backend event pump failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}
