use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fmt::Formatter;
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone)]
pub struct CustomError {
    pub message: String,
}

impl CustomError {
    pub fn new(msg: &str) -> CustomError {
        CustomError { message: msg.to_string() }
    }
}

impl fmt::Display for CustomError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for CustomError {}

pub type QueryMap = HashMap<String, Vec<Vec<u8>>>;

/// Splits a raw query string into key/value pairs, percent-decoding values
/// into raw bytes. Values are collected per key so repeated parameters
/// (scrape `info_hash`) are preserved in order.
pub fn parse_query(query: Option<String>) -> Result<QueryMap, CustomError> {
    let mut queries: QueryMap = HashMap::with_capacity(12);
    if let Some(result) = query {
        for query_item in result.split('&') {
            if query_item.is_empty() {
                continue;
            }
            if let Some(equal_pos) = query_item.find('=') {
                let (key_part, value_part) = query_item.split_at(equal_pos);
                if key_part.is_empty() {
                    continue;
                }
                let value_data = percent_encoding::percent_decode_str(&value_part[1..]).collect::<Vec<u8>>();
                queries.entry(key_part.to_string()).or_default().push(value_data);
            } else {
                queries.entry(query_item.to_string()).or_default().push(Vec::new());
            }
        }
    }
    Ok(queries)
}

pub fn bencode_int(value: i64) -> String {
    format!("i{}e", value)
}

pub fn bencode_str(data: &str) -> String {
    format!("{}:{}", data.len(), data)
}

pub fn bencode_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(data);
    out
}

/// Failure body layout used by every tracker error, byte-for-byte the shape
/// the companion site and clients already parse.
pub fn bencode_failure(reason: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(reason.len() + 56);
    body.extend_from_slice(b"d14:failure reason");
    body.extend_from_slice(bencode_bytes(reason.as_bytes()).as_slice());
    body.extend_from_slice(b"12:min intervali5400e8:intervali5400ee");
    body
}

/// Quotes a text value as a MySQL string literal.
pub fn quote_str(data: &str) -> String {
    let mut out = String::with_capacity(data.len() + 2);
    out.push('\'');
    for c in data.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Quotes raw bytes as a MySQL hex literal. Peer ids and binary IP fields
/// are not valid UTF-8, so they travel as X'..' instead of escaped strings.
pub fn quote_bin(data: &[u8]) -> String {
    if data.is_empty() {
        return String::from("''");
    }
    format!("X'{}'", hex::encode(data))
}

#[cfg(not(debug_assertions))]
pub fn ipv4_is_public(addr: Ipv4Addr) -> bool {
    ipv4_is_public_strict(addr)
}

#[cfg(not(debug_assertions))]
pub fn ipv6_is_public(addr: Ipv6Addr) -> bool {
    ipv6_is_public_strict(addr)
}

// Debug builds accept any address, local traffic included, so the tracker
// can be exercised from the loopback interface.
#[cfg(debug_assertions)]
pub fn ipv4_is_public(_addr: Ipv4Addr) -> bool {
    true
}

#[cfg(debug_assertions)]
pub fn ipv6_is_public(_addr: Ipv6Addr) -> bool {
    true
}

pub fn ipv4_is_public_strict(addr: Ipv4Addr) -> bool {
    let ip = u32::from(addr);
    if (ip & 0xff000000) == 0x0a000000 { return false; } // 10.0.0.0/8
    if (ip & 0xfff00000) == 0xac100000 { return false; } // 172.16.0.0/12
    if (ip & 0xffff0000) == 0xc0a80000 { return false; } // 192.168.0.0/16
    if (ip & 0xffff0000) == 0xa9fe0000 { return false; } // 169.254.0.0/16
    if (ip & 0xffc00000) == 0x64400000 { return false; } // 100.64.0.0/10
    if (ip & 0xff000000) == 0x7f000000 { return false; } // 127.0.0.0/8
    true
}

pub fn ipv6_is_public_strict(addr: Ipv6Addr) -> bool {
    let octets = addr.octets();
    let head32 = u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]);
    let head16 = u16::from_be_bytes([octets[0], octets[1]]);
    if head32 == 0x00000000 { return false; } // loopback / v4-compat
    if head16 == 0xfe80 { return false; } // link local
    if head16 == 0xfc00 { return false; } // unique local
    if head16 == 0xfec0 { return false; } // site local [deprecated]
    if head16 == 0x3ffe { return false; } // 6bone [deprecated]
    if head32 == 0x20010db8 { return false; } // documentation examples
    if head32 == 0x20010000 { return false; } // Teredo
    if head16 == 0x2002 { return false; } // 6to4
    true
}
