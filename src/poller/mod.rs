//! The readiness multiplexer behind a reactor: two interchangeable
//! level-triggered implementations behind one contract.

mod epoll_poller;
mod poll_poller;

use std::collections::HashMap;
use std::env;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::channel::Channel;
use crate::timestamp::Timestamp;

pub(crate) use epoll_poller::EpollPoller;
pub(crate) use poll_poller::PollPoller;

/// Name of the environment variable selecting the poller backend
/// (`"poll"` or `"epoll"`); anything else, including unset, uses epoll.
pub const POLLER_ENV_VAR: &str = "LOOPNET_POLLER";

pub(crate) trait PollerBackend {
    /// Blocks up to `timeout_ms`, appending every channel whose received
    /// mask was set to `active_channels`. Returns the time of return.
    fn poll(
        &mut self,
        timeout_ms: i32,
        active_channels: &mut Vec<Arc<Channel>>,
    ) -> io::Result<Timestamp>;

    fn update_channel(&mut self, channel: &Arc<Channel>);
    fn remove_channel(&mut self, channel: &Arc<Channel>);
}

pub(crate) enum Poller {
    Poll(PollPoller),
    Epoll(EpollPoller),
}

impl Poller {
    /// Builds the default-selected poller, honoring `LOOPNET_POLLER` (and,
    /// for tests, the `loopnet_force_poll_poller` cfg).
    pub(crate) fn new_default() -> io::Result<Poller> {
        if cfg!(loopnet_force_poll_poller) {
            return Ok(Poller::Poll(PollPoller::new()));
        }
        match env::var(POLLER_ENV_VAR).as_deref() {
            Ok("poll") => Ok(Poller::Poll(PollPoller::new())),
            _ => Ok(Poller::Epoll(EpollPoller::new()?)),
        }
    }

    pub(crate) fn poll(
        &mut self,
        timeout_ms: i32,
        active_channels: &mut Vec<Arc<Channel>>,
    ) -> io::Result<Timestamp> {
        match self {
            Poller::Poll(p) => p.poll(timeout_ms, active_channels),
            Poller::Epoll(p) => p.poll(timeout_ms, active_channels),
        }
    }

    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        match self {
            Poller::Poll(p) => p.update_channel(channel),
            Poller::Epoll(p) => p.update_channel(channel),
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        match self {
            Poller::Poll(p) => p.remove_channel(channel),
            Poller::Epoll(p) => p.remove_channel(channel),
        }
    }

    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        let map = match self {
            Poller::Poll(p) => &p.channels,
            Poller::Epoll(p) => &p.channels,
        };
        map.get(&channel.fd())
            .map(|c| Arc::ptr_eq(c, channel))
            .unwrap_or(false)
    }
}

pub(crate) type ChannelMap = HashMap<RawFd, Arc<Channel>>;
