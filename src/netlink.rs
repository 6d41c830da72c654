//! The kernel notification channel and the raw message decoder.
//!
//! A `NetlinkChannel` wraps an async NETLINK_ROUTE socket, either subscribed
//! to the address multicast groups (listening) or unsubscribed (the startup
//! dump). `decode` turns one RTM_NEWADDR/RTM_DELADDR payload, an ifaddrmsg
//! header followed by a netlink attribute stream, into an `AddressEvent`.

use bytes::BytesMut;
use netlink_packet_core::{NetlinkBuffer, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_utils::nla::NlasIterator;
use netlink_sys::protocols::NETLINK_ROUTE;
use netlink_sys::{AsyncSocket, AsyncSocketExt, SocketAddr, TokioSocket};

use crate::types::{AddressEvent, Result, WatchError};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// struct ifaddrmsg: family, prefixlen, flags, scope (one byte each), index (u32).
const IFADDRMSG_LEN: usize = 8;
const NLMSG_HDRLEN: usize = 16;

// Attribute types within an address message.
const IFA_ADDRESS: u16 = 1;
const IFA_LABEL: u16 = 3;
const IFA_CACHEINFO: u16 = 6;

// struct ifa_cacheinfo: prefered, valid, cstamp, tstamp (u32 each, timestamps
// in hundredths of seconds since boot).
const IFA_CACHEINFO_LEN: usize = 16;
const CACHEINFO_TSTAMP_OFFSET: usize = 12;

const RECV_BUFFER_SIZE: usize = 64 * 1024;

pub const GROUP_IPV4_IFADDR: u32 = libc::RTMGRP_IPV4_IFADDR as u32;
pub const GROUP_IPV6_IFADDR: u32 = libc::RTMGRP_IPV6_IFADDR as u32;

/// One address message pulled off the wire: its direction plus the payload
/// after the netlink header (ifaddrmsg + attributes).
#[derive(Debug, Clone)]
pub struct RawAddrMessage {
    pub is_deletion: bool,
    pub payload: Vec<u8>,
}

pub struct NetlinkChannel {
    socket: TokioSocket,
    seq: u32,
}

impl NetlinkChannel {
    /// Opens a NETLINK_ROUTE socket bound to the given multicast group mask
    /// (0 for a dump-only channel). Failure here is fatal to the watcher.
    pub fn dial(groups: u32) -> Result<Self> {
        let mut socket = TokioSocket::new(NETLINK_ROUTE)?;
        socket.socket_mut().bind(&SocketAddr::new(0, groups))?;
        Ok(Self { socket, seq: 0 })
    }

    /// Blocks until the kernel delivers a batch of messages, returning the
    /// address messages it contained (other message types are skipped).
    pub async fn recv(&mut self) -> Result<Vec<RawAddrMessage>> {
        let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
        self.socket.recv(&mut buf).await?;
        let (messages, _done) = parse_batch(&buf)?;
        Ok(messages)
    }

    /// Issues a synchronous RTM_GETADDR dump for every address on every
    /// interface and collects the full response.
    pub async fn execute_dump(&mut self) -> Result<Vec<RawAddrMessage>> {
        self.seq = self.seq.wrapping_add(1);

        let mut request = vec![0u8; NLMSG_HDRLEN + IFADDRMSG_LEN];
        {
            let mut header = NetlinkBuffer::new(&mut request);
            header.set_length((NLMSG_HDRLEN + IFADDRMSG_LEN) as u32);
            header.set_message_type(libc::RTM_GETADDR);
            header.set_flags(NLM_F_REQUEST | NLM_F_DUMP);
            header.set_sequence_number(self.seq);
            header.set_port_number(0);
        }
        // Payload stays zeroed: an ifaddrmsg with AF_UNSPEC enumerates both
        // address families.
        self.socket.send(&request).await?;

        let mut all = Vec::new();
        loop {
            let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
            self.socket.recv(&mut buf).await?;
            let (mut messages, done) = parse_batch(&buf)?;
            all.append(&mut messages);
            if done {
                return Ok(all);
            }
        }
    }
}

/// Splits one receive buffer into address messages. Returns the messages and
/// whether an NLMSG_DONE terminator was seen (ends a dump).
fn parse_batch(data: &[u8]) -> Result<(Vec<RawAddrMessage>, bool)> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let header = match NetlinkBuffer::new_checked(&data[offset..]) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!("stopping batch scan on bad netlink framing: {}", e);
                break;
            }
        };
        let length = header.length() as usize;
        if length < NLMSG_HDRLEN {
            break;
        }

        let message_type = header.message_type();
        if message_type == libc::NLMSG_DONE as u16 {
            return Ok((messages, true));
        }
        if message_type == libc::NLMSG_ERROR as u16 {
            let payload = header.payload();
            let errno = if payload.len() >= 4 {
                i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]])
            } else {
                0
            };
            if errno != 0 {
                return Err(WatchError::Channel(std::io::Error::from_raw_os_error(-errno)));
            }
            // errno 0 is an ack, not an error.
        } else if message_type == libc::RTM_NEWADDR || message_type == libc::RTM_DELADDR {
            messages.push(RawAddrMessage {
                is_deletion: message_type == libc::RTM_DELADDR,
                payload: header.payload().to_vec(),
            });
        }

        offset += nlmsg_align(length);
    }

    Ok((messages, false))
}

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Decodes one address message payload. `boottime_secs` is the current
/// CLOCK_BOOTTIME reading, used to turn the kernel's cache-info timestamp
/// into an age.
///
/// A payload shorter than the fixed ifaddrmsg header is malformed. An
/// address attribute whose length is neither 4 nor 16 is discarded without
/// aborting the rest of the message. A message with no usable address
/// attribute decodes to `None`.
pub fn decode(msg: &RawAddrMessage, boottime_secs: u64) -> Result<Option<AddressEvent>> {
    let payload = &msg.payload;
    if payload.len() < IFADDRMSG_LEN {
        return Err(WatchError::MalformedMessage(format!(
            "address message payload too short: {} bytes",
            payload.len()
        )));
    }

    let prefix_len = payload[1];
    let if_index = u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);

    let mut address = None;
    let mut label = None;
    let mut age_secs = None;

    for nla in NlasIterator::new(&payload[IFADDRMSG_LEN..]) {
        let nla = match nla {
            Ok(nla) => nla,
            Err(e) => {
                tracing::debug!("stopping attribute scan: {}", e);
                break;
            }
        };
        let value = nla.value();
        match nla.kind() {
            IFA_ADDRESS => match value.len() {
                4 => {
                    let octets: [u8; 4] = [value[0], value[1], value[2], value[3]];
                    address = Some(IpAddr::V4(Ipv4Addr::from(octets)));
                }
                16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(value);
                    address = Some(IpAddr::V6(Ipv6Addr::from(octets)));
                }
                n => {
                    tracing::debug!("discarding address attribute of length {}", n);
                }
            },
            IFA_LABEL => {
                let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
                label = Some(String::from_utf8_lossy(&value[..end]).into_owned());
            }
            IFA_CACHEINFO => {
                if value.len() >= IFA_CACHEINFO_LEN {
                    let o = CACHEINFO_TSTAMP_OFFSET;
                    let tstamp =
                        u32::from_ne_bytes([value[o], value[o + 1], value[o + 2], value[o + 3]]);
                    let updated_at = u64::from(tstamp / 100);
                    age_secs = Some(boottime_secs.saturating_sub(updated_at));
                }
            }
            _ => {}
        }
    }

    Ok(address.map(|address| AddressEvent {
        if_index,
        address,
        prefix_len,
        is_deletion: msg.is_deletion,
        label,
        age_secs,
    }))
}

/// Current CLOCK_BOOTTIME reading in whole seconds. The same clock the
/// kernel stamps ifa_cacheinfo with.
pub fn boottime_secs() -> u64 {
    nix::time::clock_gettime(nix::time::ClockId::CLOCK_BOOTTIME)
        .map(|ts| ts.tv_sec().max(0) as u64)
        .unwrap_or(0)
}

/// Resolves an interface index back to its name, for display and for hook
/// environments when no label was present.
pub fn if_indextoname(index: u32) -> Option<String> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr().cast()) };
    if ret.is_null() {
        return None;
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encodes one netlink attribute (length, type, padded value).
    fn nla(kind: u16, value: &[u8]) -> Vec<u8> {
        let length = 4 + value.len();
        let mut out = Vec::with_capacity(nlmsg_align(length));
        out.extend_from_slice(&(length as u16).to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(value);
        while out.len() < nlmsg_align(length) {
            out.push(0);
        }
        out
    }

    fn ifaddrmsg(family: u8, prefix_len: u8, index: u32) -> Vec<u8> {
        let mut out = vec![family, prefix_len, 0, 0];
        out.extend_from_slice(&index.to_ne_bytes());
        out
    }

    fn cacheinfo(tstamp_hundredths: u32) -> Vec<u8> {
        let mut out = vec![0u8; IFA_CACHEINFO_LEN];
        out[CACHEINFO_TSTAMP_OFFSET..].copy_from_slice(&tstamp_hundredths.to_ne_bytes());
        out
    }

    fn new_addr(payload: Vec<u8>) -> RawAddrMessage {
        RawAddrMessage {
            is_deletion: false,
            payload,
        }
    }

    #[test]
    fn undersized_payload_is_malformed() {
        let msg = new_addr(vec![0u8; IFADDRMSG_LEN - 1]);
        let err = decode(&msg, 1000).unwrap_err();
        assert!(matches!(err, WatchError::MalformedMessage(_)));
    }

    #[test]
    fn decodes_ipv4_addition_with_label_and_age() {
        let mut payload = ifaddrmsg(libc::AF_INET as u8, 24, 3);
        payload.extend(nla(IFA_ADDRESS, &[192, 0, 2, 7]));
        payload.extend(nla(IFA_LABEL, b"eth0\0"));
        // Updated 10 seconds before a boottime of 1000s.
        payload.extend(nla(IFA_CACHEINFO, &cacheinfo(990 * 100)));

        let event = decode(&new_addr(payload), 1000).unwrap().unwrap();
        assert_eq!(event.if_index, 3);
        assert_eq!(event.prefix_len, 24);
        assert_eq!(event.address, "192.0.2.7".parse::<IpAddr>().unwrap());
        assert_eq!(event.label.as_deref(), Some("eth0"));
        assert_eq!(event.age_secs, Some(10));
        assert!(!event.is_deletion);
    }

    #[test]
    fn decodes_ipv6_address() {
        let mut payload = ifaddrmsg(libc::AF_INET6 as u8, 64, 2);
        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        payload.extend(nla(IFA_ADDRESS, &ip.octets()));

        let event = decode(&new_addr(payload), 0).unwrap().unwrap();
        assert_eq!(event.address, IpAddr::V6(ip));
        assert_eq!(event.age_secs, None);
    }

    #[test]
    fn wrong_length_address_discarded_but_other_attributes_kept() {
        let mut payload = ifaddrmsg(libc::AF_INET as u8, 24, 5);
        // A 5-byte address payload yields no event for this attribute...
        payload.extend(nla(IFA_ADDRESS, &[1, 2, 3, 4, 5]));
        // ...but later attributes in the same message are still processed.
        payload.extend(nla(IFA_LABEL, b"wan0\0"));
        payload.extend(nla(IFA_ADDRESS, &[203, 0, 113, 9]));

        let event = decode(&new_addr(payload), 0).unwrap().unwrap();
        assert_eq!(event.address, "203.0.113.9".parse::<IpAddr>().unwrap());
        assert_eq!(event.label.as_deref(), Some("wan0"));
    }

    #[test]
    fn message_without_address_yields_no_event() {
        let mut payload = ifaddrmsg(libc::AF_INET as u8, 24, 5);
        payload.extend(nla(IFA_LABEL, b"eth1\0"));
        assert_eq!(decode(&new_addr(payload), 0).unwrap(), None);

        let only_bad_addr = {
            let mut p = ifaddrmsg(libc::AF_INET as u8, 24, 5);
            p.extend(nla(IFA_ADDRESS, &[1, 2, 3, 4, 5]));
            p
        };
        assert_eq!(decode(&new_addr(only_bad_addr), 0).unwrap(), None);
    }

    #[test]
    fn unknown_attributes_skipped() {
        let mut payload = ifaddrmsg(libc::AF_INET as u8, 24, 1);
        payload.extend(nla(200, &[0xde, 0xad]));
        payload.extend(nla(IFA_ADDRESS, &[10, 0, 0, 1]));

        let event = decode(&new_addr(payload), 0).unwrap().unwrap();
        assert_eq!(event.address, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn deletion_flag_carried_through() {
        let mut payload = ifaddrmsg(libc::AF_INET as u8, 24, 1);
        payload.extend(nla(IFA_ADDRESS, &[10, 0, 0, 1]));
        let msg = RawAddrMessage {
            is_deletion: true,
            payload,
        };
        assert!(decode(&msg, 0).unwrap().unwrap().is_deletion);
    }

    #[test]
    fn batch_parsing_splits_and_flags_done() {
        // One RTM_NEWADDR message followed by NLMSG_DONE.
        let mut addr_payload = ifaddrmsg(libc::AF_INET as u8, 24, 2);
        addr_payload.extend(nla(IFA_ADDRESS, &[192, 0, 2, 1]));

        let mut batch = Vec::new();
        let msg_len = NLMSG_HDRLEN + addr_payload.len();
        batch.extend_from_slice(&(msg_len as u32).to_ne_bytes());
        batch.extend_from_slice(&libc::RTM_NEWADDR.to_ne_bytes());
        batch.extend_from_slice(&[0u8; 10]); // flags, seq, pid
        batch.extend_from_slice(&addr_payload);
        while batch.len() % 4 != 0 {
            batch.push(0);
        }
        let done_len = NLMSG_HDRLEN + 4;
        batch.extend_from_slice(&(done_len as u32).to_ne_bytes());
        batch.extend_from_slice(&(libc::NLMSG_DONE as u16).to_ne_bytes());
        batch.extend_from_slice(&[0u8; 10]);
        batch.extend_from_slice(&0u32.to_ne_bytes());

        let (messages, done) = parse_batch(&batch).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].is_deletion);
        assert!(done);
    }

    #[test]
    fn batch_error_message_surfaces_errno() {
        let mut batch = Vec::new();
        let len = NLMSG_HDRLEN + 4;
        batch.extend_from_slice(&(len as u32).to_ne_bytes());
        batch.extend_from_slice(&(libc::NLMSG_ERROR as u16).to_ne_bytes());
        batch.extend_from_slice(&[0u8; 10]);
        batch.extend_from_slice(&(-libc::EPERM).to_ne_bytes());

        let err = parse_batch(&batch).unwrap_err();
        assert!(matches!(err, WatchError::Channel(_)));
    }
}
