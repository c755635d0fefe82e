//! Variable-length primitives: var_int, var_str, var_int_list, net_addr.
//!
//! Decoders take a byte slice and return the unconsumed tail together with
//! the decoded value, so calls chain without copying.

use bytes::BufMut;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ProtocolError;

/// 10 zero bytes and two 0xff: the IPv4-mapped IPv6 prefix.
const IPV4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// Encoded size of a net_addr without the time/stream prefix.
pub const NET_ADDR_SIZE: usize = 26;

/// Encoded size of the optional time (u64) + stream (u32) prefix.
pub const NET_ADDR_TIME_STREAM_SIZE: usize = 12;

/// Timestamp and stream carried by the long net_addr form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrTime {
    pub time: u64,
    pub stream: u32,
}

/// A network address as it appears on the wire. IPv4 only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    /// Present only in the long form (addr lists); the handshake omits it.
    pub timed: Option<AddrTime>,
    pub services: u64,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl NetAddr {
    /// Short form, as used in the `version` payload.
    pub fn new(ip: Ipv4Addr, port: u16, services: u64) -> Self {
        Self {
            timed: None,
            services,
            ip,
            port,
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

pub fn put_var_int<B: BufMut>(dst: &mut B, n: u64) {
    if n < 0xfd {
        dst.put_u8(n as u8);
    } else if n <= 0xffff {
        dst.put_u8(0xfd);
        dst.put_u16(n as u16);
    } else if n <= 0xffff_ffff {
        dst.put_u8(0xfe);
        dst.put_u32(n as u32);
    } else {
        dst.put_u8(0xff);
        dst.put_u64(n);
    }
}

pub fn encode_var_int(n: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    put_var_int(&mut out, n);
    out
}

pub fn put_var_str<B: BufMut>(dst: &mut B, s: &[u8]) {
    put_var_int(dst, s.len() as u64);
    dst.put_slice(s);
}

pub fn encode_var_str(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 9);
    put_var_str(&mut out, s);
    out
}

pub fn put_var_int_list<B: BufMut>(dst: &mut B, list: &[u64]) {
    put_var_int(dst, list.len() as u64);
    for &n in list {
        put_var_int(dst, n);
    }
}

pub fn encode_var_int_list(list: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    put_var_int_list(&mut out, list);
    out
}

pub fn put_net_addr<B: BufMut>(dst: &mut B, addr: &NetAddr) {
    if let Some(t) = addr.timed {
        dst.put_u64(t.time);
        dst.put_u32(t.stream);
    }
    dst.put_u64(addr.services);
    dst.put_slice(&IPV4_MAPPED_PREFIX);
    dst.put_slice(&addr.ip.octets());
    dst.put_u16(addr.port);
}

/// Encode a net_addr. `Some(stream)` selects the long form, stamped with
/// the current time. Non-IPv4 addresses are rejected.
pub fn encode_net_addr(
    stream: Option<u32>,
    ip: IpAddr,
    port: u16,
    services: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let addr = NetAddr {
        timed: stream.map(|stream| AddrTime {
            time: unix_now(),
            stream,
        }),
        services,
        ip: to_ipv4(ip)?,
        port,
    };
    let mut out = Vec::with_capacity(NET_ADDR_SIZE + NET_ADDR_TIME_STREAM_SIZE);
    put_net_addr(&mut out, &addr);
    Ok(out)
}

/// Accepts plain IPv4 and IPv4-mapped IPv6.
pub fn to_ipv4(ip: IpAddr) -> Result<Ipv4Addr, ProtocolError> {
    match ip {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .ok_or_else(|| ProtocolError::InvalidAddress(v6.to_string())),
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// Decoding
// ============================================================================

/// Split `n` bytes off the front of `buf`.
pub fn take(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), ProtocolError> {
    if buf.len() < n {
        return Err(ProtocolError::TruncatedInput {
            needed: n,
            available: buf.len(),
        });
    }
    Ok(buf.split_at(n))
}

pub fn read_u16(buf: &[u8]) -> Result<(&[u8], u16), ProtocolError> {
    let (head, rest) = take(buf, 2)?;
    Ok((rest, u16::from_be_bytes([head[0], head[1]])))
}

pub fn read_u32(buf: &[u8]) -> Result<(&[u8], u32), ProtocolError> {
    let (head, rest) = take(buf, 4)?;
    Ok((rest, u32::from_be_bytes([head[0], head[1], head[2], head[3]])))
}

pub fn read_u64(buf: &[u8]) -> Result<(&[u8], u64), ProtocolError> {
    let (head, rest) = take(buf, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(head);
    Ok((rest, u64::from_be_bytes(raw)))
}

pub fn read_i64(buf: &[u8]) -> Result<(&[u8], i64), ProtocolError> {
    let (rest, n) = read_u64(buf)?;
    Ok((rest, n as i64))
}

pub fn decode_var_int(buf: &[u8]) -> Result<(&[u8], u64), ProtocolError> {
    let (tag, rest) = take(buf, 1)?;
    match tag[0] {
        0xfd => read_u16(rest).map(|(r, n)| (r, n as u64)),
        0xfe => read_u32(rest).map(|(r, n)| (r, n as u64)),
        0xff => read_u64(rest),
        n => Ok((rest, n as u64)),
    }
}

pub fn decode_var_str(buf: &[u8]) -> Result<(&[u8], &[u8]), ProtocolError> {
    let (rest, len) = decode_var_int(buf)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::TruncatedInput {
        needed: usize::MAX,
        available: rest.len(),
    })?;
    let (s, rest) = take(rest, len)?;
    Ok((rest, s))
}

pub fn decode_var_int_list(buf: &[u8]) -> Result<(&[u8], Vec<u64>), ProtocolError> {
    let (mut rest, count) = decode_var_int(buf)?;
    // Every entry is at least one byte; never pre-allocate past the input.
    let mut out = Vec::with_capacity((count as usize).min(rest.len()));
    for _ in 0..count {
        let (r, n) = decode_var_int(rest)?;
        out.push(n);
        rest = r;
    }
    Ok((rest, out))
}

pub fn decode_net_addr(
    buf: &[u8],
    with_time_and_stream: bool,
) -> Result<(&[u8], NetAddr), ProtocolError> {
    let mut rest = buf;
    let timed = if with_time_and_stream {
        let (r, time) = read_u64(rest)?;
        let (r, stream) = read_u32(r)?;
        rest = r;
        Some(AddrTime { time, stream })
    } else {
        None
    };
    let (rest, services) = read_u64(rest)?;
    let (ip_bytes, rest) = take(rest, 16)?;
    // Peers may send unspecified or native IPv6 addresses; only the low
    // four bytes are kept.
    if ip_bytes[..12] != IPV4_MAPPED_PREFIX {
        tracing::debug!(addr = %hex::encode(ip_bytes), "net_addr is not IPv4-mapped");
    }
    let ip = Ipv4Addr::new(ip_bytes[12], ip_bytes[13], ip_bytes[14], ip_bytes[15]);
    let (rest, port) = read_u16(rest)?;
    Ok((
        rest,
        NetAddr {
            timed,
            services,
            ip,
            port,
        },
    ))
}
