//! Compact level-triggered multiplexer backed by `poll(2)`: a single dense
//! array of `pollfd`, good for small descriptor sets.

use std::io;
use std::sync::Arc;

use crate::channel::Channel;
use crate::poller::ChannelMap;
use crate::sys::syscall;
use crate::timestamp::Timestamp;

pub(crate) struct PollPoller {
    pub(crate) channels: ChannelMap,
    pollfds: Vec<libc::pollfd>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            channels: ChannelMap::new(),
            pollfds: Vec::new(),
        }
    }

    pub(crate) fn poll(
        &mut self,
        timeout_ms: i32,
        active_channels: &mut Vec<Arc<Channel>>,
    ) -> io::Result<Timestamp> {
        let num_events = match syscall!(poll(
            self.pollfds.as_mut_ptr(),
            self.pollfds.len() as libc::nfds_t,
            timeout_ms,
        )) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => {
                log::error!("PollPoller::poll: {e}");
                0
            }
        };

        let now = Timestamp::now();
        if num_events > 0 {
            log::trace!("{num_events} events happened");
            self.fill_active_channels(active_channels);
        }
        Ok(now)
    }

    fn fill_active_channels(&self, active_channels: &mut Vec<Arc<Channel>>) {
        for pfd in &self.pollfds {
            if pfd.revents > 0 {
                let fd = if pfd.fd < 0 { -pfd.fd - 1 } else { pfd.fd };
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(pfd.revents as i32);
                    active_channels.push(Arc::clone(channel));
                }
            }
        }
    }

    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        if channel.index() < 0 {
            debug_assert!(!self.channels.contains_key(&channel.fd()));
            let pfd = libc::pollfd {
                fd: channel.fd(),
                events: channel.events() as i16,
                revents: 0,
            };
            self.pollfds.push(pfd);
            let idx = self.pollfds.len() as i32 - 1;
            channel.set_index(idx);
            self.channels.insert(channel.fd(), Arc::clone(channel));
        } else {
            debug_assert!(self.channels.contains_key(&channel.fd()));
            let idx = channel.index() as usize;
            debug_assert!(idx < self.pollfds.len());
            let pfd = &mut self.pollfds[idx];
            pfd.fd = channel.fd();
            pfd.events = channel.events() as i16;
            pfd.revents = 0;
            if channel.is_none_event() {
                // Skip this slot without resizing the array: a channel fd
                // is never zero-or-positive-meaning-interested here, so
                // encoding "-(fd+1)" lets fill_active_channels recover the
                // real fd while `poll(2)` ignores negative fds outright.
                pfd.fd = -channel.fd() - 1;
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        debug_assert!(self.channels.contains_key(&channel.fd()));
        debug_assert!(channel.is_none_event());
        let idx = channel.index() as usize;
        debug_assert!(idx < self.pollfds.len());

        self.channels.remove(&channel.fd());

        if idx == self.pollfds.len() - 1 {
            self.pollfds.pop();
        } else {
            let last_idx = self.pollfds.len() - 1;
            self.pollfds.swap(idx, last_idx);
            let mut moved_fd = self.pollfds[idx].fd;
            if moved_fd < 0 {
                moved_fd = -moved_fd - 1;
            }
            if let Some(moved) = self.channels.get(&moved_fd) {
                moved.set_index(idx as i32);
            }
            self.pollfds.pop();
        }
        channel.set_index(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Weak;

    fn channel_for(fd: std::os::fd::RawFd) -> Arc<Channel> {
        Channel::new(Weak::new(), fd)
    }

    #[test]
    fn detects_readable_socket() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut poller = PollPoller::new();
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
    fn remove_channel_clears_fd_from_map() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut poller = PollPoller::new();
        let channel = channel_for(a.as_raw_fd());
        channel.enable_reading();
        poller.update_channel(&channel);
        assert!(poller.channels.contains_key(&a.as_raw_fd()));

        channel.disable_all();
        poller.update_channel(&channel);
        poller.remove_channel(&channel);
        assert!(!poller.channels.contains_key(&a.as_raw_fd()));
    }

    #[test]
    fn swap_remove_keeps_remaining_channel_indexed() {
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (c, _c_peer) = UnixStream::pair().unwrap();
        let mut poller = PollPoller::new();

        let chan_a = channel_for(a.as_raw_fd());
        chan_a.enable_reading();
        poller.update_channel(&chan_a);

        let chan_c = channel_for(c.as_raw_fd());
        chan_c.enable_reading();
        poller.update_channel(&chan_c);

        chan_a.disable_all();
        poller.update_channel(&chan_a);
        poller.remove_channel(&chan_a);

        assert_eq!(chan_c.index(), 0);
        assert!(poller.channels.contains_key(&c.as_raw_fd()));
    }
}
