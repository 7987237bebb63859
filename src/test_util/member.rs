use std::net::{Ipv4Addr, SocketAddrV4};
use crate::member_addr::MemberAddr;

/// convenience method for unit test code: create a [MemberAddr] based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_member_addr_from_number(number: u16) -> MemberAddr {
    MemberAddr::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into(), number.into())
}
