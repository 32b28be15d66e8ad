//! Readiness multiplexer over [`mio::Poll`].
//!
//! The event buffer starts at 64 slots. Whenever a poll comes back with the
//! buffer full, capacity doubles before the next wait; it never shrinks —
//! selector cost is independent of capacity and keeping the memory avoids
//! oscillations under fluctuating load.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};

pub use mio::Interest;

pub const INITIAL_EVENT_CAPACITY: usize = 64;

/// Readiness of one descriptor as reported by the selector.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    capacity: usize,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(INITIAL_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        let capacity = capacity.max(1);
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            capacity,
        })
    }

    /// Number of event slots available without reallocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Build a wakeup handle tied to this loop. Polls return with `token`
    /// when the handle is woken from any thread.
    pub fn waker(&self, token: usize) -> io::Result<Arc<mio::Waker>> {
        Ok(Arc::new(mio::Waker::new(self.poll.registry(), Token(token))?))
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    pub fn remove(&self, fd: RawFd) {
        // Deregistration failure only happens when the fd is already gone;
        // nothing actionable for the caller.
        if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            tracing::trace!(fd, "event loop deregister failed: {err}");
        }
    }

    /// Wait up to `timeout` and invoke `cb` for every ready token.
    ///
    /// Returns the number of ready descriptors; signal interruptions are
    /// reported as zero ready.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        mut cb: impl FnMut(usize, Ready),
    ) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            cb(
                event.token().0,
                Ready {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    error: event.is_error(),
                    hangup: event.is_read_closed() || event.is_write_closed(),
                },
            );
        }

        if count == self.capacity {
            self.capacity *= 2;
            self.events = Events::with_capacity(self.capacity);
        }

        Ok(count)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn poll_times_out_with_zero_ready() {
        let mut event_loop = EventLoop::new().unwrap();
        let n = event_loop
            .poll(Some(Duration::from_millis(10)), |_, _| {})
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn readable_pipe_reports_event() {
        let mut event_loop = EventLoop::new().unwrap();
        let (rx, mut tx) = std::io::pipe().unwrap();
        event_loop.add(rx.as_raw_fd(), Interest::READABLE).unwrap();
        tx.write_all(b"x").unwrap();

        let mut seen = None;
        let n = event_loop
            .poll(Some(Duration::from_millis(500)), |token, ready| {
                seen = Some((token, ready.readable));
            })
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(seen, Some((rx.as_raw_fd() as usize, true)));

        event_loop.remove(rx.as_raw_fd());
    }

    #[test]
    fn waker_breaks_poll() {
        let mut event_loop = EventLoop::new().unwrap();
        let waker = event_loop.waker(usize::MAX).unwrap();
        let thread_waker = Arc::clone(&waker);
        let handle = std::thread::spawn(move || {
            thread_waker.wake().unwrap();
        });

        let mut woken = false;
        event_loop
            .poll(Some(Duration::from_secs(5)), |token, _| {
                woken = token == usize::MAX;
            })
            .unwrap();
        assert!(woken);
        handle.join().unwrap();
    }

    #[test]
    fn capacity_doubles_when_saturated() {
        let mut event_loop = EventLoop::with_capacity(1).unwrap();
        let (rx, mut tx) = std::io::pipe().unwrap();
        event_loop.add(rx.as_raw_fd(), Interest::READABLE).unwrap();
        tx.write_all(b"x").unwrap();
        let n = event_loop
            .poll(Some(Duration::from_millis(500)), |_, _| {})
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(event_loop.capacity(), 2);
    }
}
