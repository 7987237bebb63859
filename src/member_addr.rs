use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a member of the current view: its network address plus an incarnation number.
///
/// A member that leaves and rejoins from the same address gets a new incarnation, so it is a
///  *different* member and its windows and credits start from scratch.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemberAddr {
    pub socket_addr: SocketAddr,
    pub incarnation: u32,
}

impl MemberAddr {
    pub fn new(socket_addr: SocketAddr, incarnation: u32) -> MemberAddr {
        MemberAddr { socket_addr, incarnation }
    }
}

impl Display for MemberAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.socket_addr, self.incarnation)
    }
}

impl Debug for MemberAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// uses the seconds since epoch as incarnation
impl From<SocketAddr> for MemberAddr {
    fn from(addr: SocketAddr) -> Self {
        let incarnation = SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        MemberAddr::new(addr, incarnation)
    }
}
