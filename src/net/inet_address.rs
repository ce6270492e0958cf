//! A thin wrapper over `sockaddr_in`/`sockaddr_in6`.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy)]
pub struct InetAddress {
    addr: SocketAddr,
}

impl InetAddress {
    /// A wildcard (or loopback-only) address on `port`, used for listeners.
    pub fn new(port: u16, loopback_only: bool, ipv6: bool) -> InetAddress {
        let addr = if ipv6 {
            let ip = if loopback_only {
                Ipv6Addr::LOCALHOST
            } else {
                Ipv6Addr::UNSPECIFIED
            };
            SocketAddr::new(IpAddr::V6(ip), port)
        } else {
            let ip = if loopback_only {
                Ipv4Addr::LOCALHOST
            } else {
                Ipv4Addr::UNSPECIFIED
            };
            SocketAddr::new(IpAddr::V4(ip), port)
        };
        InetAddress { addr }
    }

    pub fn from_ip_port(ip: &str, port: u16) -> std::io::Result<InetAddress> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad ip"))?;
        Ok(InetAddress {
            addr: SocketAddr::new(ip, port),
        })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> InetAddress {
        InetAddress { addr }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn ip(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn ip_port(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Converts to the raw `sockaddr_storage` needed by `bind`/`connect`.
    pub(crate) fn to_raw(self) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match self.addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }

    /// Builds an `InetAddress` back from a `sockaddr_storage` as returned by
    /// `accept`/`getsockname`/`getpeername`.
    pub(crate) fn from_raw(storage: &libc::sockaddr_storage) -> InetAddress {
        let addr = match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
                SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port))
            }
            family => panic!("unsupported address family {family}"),
        };
        InetAddress { addr }
    }
}

impl std::fmt::Display for InetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ip_port())
    }
}
