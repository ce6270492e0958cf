//! Readiness multiplexer backed by `epoll(2)`: an amortized-O(1) variant
//! that scales to large descriptor sets.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::channel::Channel;
use crate::poller::ChannelMap;
use crate::sys::syscall;
use crate::timestamp::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

const STATE_NEW: i32 = -1;
const STATE_ADDED: i32 = 1;
const STATE_DELETED: i32 = 2;

pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    pub(crate) channels: ChannelMap,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![unsafe { mem::zeroed() }; INIT_EVENT_LIST_SIZE],
            channels: ChannelMap::new(),
        })
    }

    pub(crate) fn poll(
        &mut self,
        timeout_ms: i32,
        active_channels: &mut Vec<Arc<Channel>>,
    ) -> io::Result<Timestamp> {
        let num_events = match syscall!(epoll_wait(
            self.epoll_fd.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.len() as libc::c_int,
            timeout_ms,
        )) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => {
                log::error!("EpollPoller::poll: {e}");
                0
            }
        };

        let now = Timestamp::now();
        if num_events > 0 {
            log::trace!("{num_events} events happened");
            self.fill_active_channels(num_events as usize, active_channels);
            if num_events as usize == self.events.len() {
                self.events.resize(self.events.len() * 2, unsafe { mem::zeroed() });
            }
        }
        Ok(now)
    }

    fn fill_active_channels(&self, num_events: usize, active_channels: &mut Vec<Arc<Channel>>) {
        for ev in &self.events[..num_events] {
            // epoll_data carries the raw fd rather than a raw channel
            // pointer: it keeps this backend free of unsafe lifetime
            // bookkeeping and the lookup is a single hashmap hit.
            let fd = unsafe { ev.u64 as RawFd };
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(ev.events as i32);
                active_channels.push(Arc::clone(channel));
            }
        }
    }

    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        log::trace!(
            "fd = {} events = {} index = {}",
            channel.fd(),
            channel.events(),
            index
        );

        if index == STATE_NEW || index == STATE_DELETED {
            if index == STATE_NEW {
                debug_assert!(!self.channels.contains_key(&channel.fd()));
                self.channels.insert(channel.fd(), Arc::clone(channel));
            } else {
                debug_assert!(self.channels.contains_key(&channel.fd()));
            }
            channel.set_index(STATE_ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else {
            debug_assert!(self.channels.contains_key(&channel.fd()));
            debug_assert_eq!(index, STATE_ADDED);
            if channel.is_none_event() {
                self.update(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(STATE_DELETED);
            } else {
                self.update(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        debug_assert!(self.channels.contains_key(&channel.fd()));
        debug_assert!(channel.is_none_event());
        let index = channel.index();
        debug_assert!(index == STATE_ADDED || index == STATE_DELETED);

        self.channels.remove(&channel.fd());

        if index == STATE_ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(STATE_NEW);
    }

    fn update(&self, operation: libc::c_int, channel: &Arc<Channel>) {
        let mut event: libc::epoll_event = unsafe { mem::zeroed() };
        event.events = channel.events() as u32;
        event.u64 = channel.fd() as u64;

        let fd = channel.fd();
        if let Err(e) = syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), operation, fd, &mut event)) {
            if operation == libc::EPOLL_CTL_DEL {
                log::error!("epoll_ctl DEL fd={fd}: {e}");
            } else {
                log::error!("epoll_ctl op={operation} fd={fd}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::Weak;

    fn channel_for(fd: RawFd) -> Arc<Channel> {
        Channel::new(Weak::new(), fd)
    }

    #[test]
    fn detects_readable_socket() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut poller = EpollPoller::new().unwrap();
        let channel = channel_for(a.as_raw_fd());
        channel.enable_reading();
        poller.update_channel(&channel);

        b.write_all(b"x").unwrap();

        let mut active = Vec::new();
        poller.poll(100, &mut active).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].revents() & libc::POLLIN as i32 != 0);
    }

    #[test]
    fn new_to_added_to_deleted_lifecycle() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut poller = EpollPoller::new().unwrap();
        let channel = channel_for(a.as_raw_fd());

        assert_eq!(channel.index(), STATE_NEW);
        channel.enable_reading();
        poller.update_channel(&channel);
        assert_eq!(channel.index(), STATE_ADDED);

        channel.disable_all();
        poller.update_channel(&channel);
        assert_eq!(channel.index(), STATE_DELETED);

        poller.remove_channel(&channel);
        assert_eq!(channel.index(), STATE_NEW);
        assert!(!poller.channels.contains_key(&a.as_raw_fd()));
    }

    #[test]
    fn event_list_doubles_when_exhausted() {
        let mut poller = EpollPoller::new().unwrap();
        assert_eq!(poller.events.len(), INIT_EVENT_LIST_SIZE);

        let mut pairs = Vec::new();
        for _ in 0..INIT_EVENT_LIST_SIZE {
            let (a, mut b) = UnixStream::pair().unwrap();
            let channel = channel_for(a.as_raw_fd());
            channel.enable_reading();
            poller.update_channel(&channel);
            b.write_all(b"x").unwrap();
            pairs.push((a, b, channel));
        }

        let mut active = Vec::new();
        poller.poll(100, &mut active).unwrap();
        assert_eq!(active.len(), INIT_EVENT_LIST_SIZE);
        assert_eq!(poller.events.len(), INIT_EVENT_LIST_SIZE * 2);
    }
}
