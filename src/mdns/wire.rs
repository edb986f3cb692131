//! DNS message encoding and decoding for the multicast responder.
//!
//! Only the record types DNS-SD needs are understood (PTR, SRV, TXT, A,
//! AAAA); anything else is skipped on decode. Names are normalised to
//! lowercase without a trailing dot, and name compression is accepted on
//! decode but never produced.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::utils::{BridgeError, BridgeResult};

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_ANY: u16 = 255;

pub const CLASS_IN: u16 = 1;

/// Bit 15 of a question class: the querier asks for a unicast reply.
const UNICAST_REPLY_BIT: u16 = 0x8000;
/// Bit 15 of a record class: cache-flush marker on unique record sets.
const CACHE_FLUSH_BIT: u16 = 0x8000;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;

/// mDNS messages larger than this are never produced.
pub const MAX_PACKET_BYTES: usize = 9_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    /// Whether the (cleared) unicast-reply bit was set on the wire.
    pub unicast_reply: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<(String, String)>),
}

impl RecordData {
    pub fn rr_type(&self) -> u16 {
        match self {
            RecordData::A(_) => TYPE_A,
            RecordData::Aaaa(_) => TYPE_AAAA,
            RecordData::Ptr(_) => TYPE_PTR,
            RecordData::Srv { .. } => TYPE_SRV,
            RecordData::Txt(_) => TYPE_TXT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    pub cache_flush: bool,
    pub data: RecordData,
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: u16,
    pub is_response: bool,
    pub authoritative: bool,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// A query for a single question, multicast-reply semantics.
    pub fn query(name: &str, qtype: u16) -> Self {
        Message {
            questions: vec![Question {
                name: normalize_name(name),
                qtype,
                unicast_reply: false,
            }],
            ..Message::default()
        }
    }

    /// An authoritative response carrying `answers`, as the responder sends
    /// it: id zero, no questions echoed.
    pub fn response(answers: Vec<Record>) -> Self {
        Message {
            id: 0,
            is_response: true,
            authoritative: true,
            answers,
            ..Message::default()
        }
    }

    pub fn decode(packet: &[u8]) -> BridgeResult<Message> {
        if packet.len() < HEADER_LEN {
            return Err(BridgeError::Dns("packet shorter than header".into()));
        }
        let id = read_u16(packet, 0)?;
        let flags = read_u16(packet, 2)?;
        let qdcount = read_u16(packet, 4)? as usize;
        let ancount = read_u16(packet, 6)? as usize;
        let nscount = read_u16(packet, 8)? as usize;
        let arcount = read_u16(packet, 10)? as usize;

        let mut offset = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount);
        for _ in 0..qdcount {
            let (name, next) = decode_name(packet, offset)?;
            offset = next;
            let qtype = read_u16(packet, offset)?;
            let qclass = read_u16(packet, offset + 2)?;
            offset += 4;
            questions.push(Question {
                name,
                qtype,
                unicast_reply: qclass & UNICAST_REPLY_BIT != 0,
            });
        }

        let mut sections = [
            Vec::with_capacity(ancount),
            Vec::with_capacity(nscount),
            Vec::with_capacity(arcount),
        ];
        for (section, count) in sections.iter_mut().zip([ancount, nscount, arcount]) {
            for _ in 0..count {
                let (record, next) = decode_record(packet, offset)?;
                offset = next;
                if let Some(record) = record {
                    section.push(record);
                }
            }
        }
        let [answers, authority, additionals] = sections;

        Ok(Message {
            id,
            is_response: flags & FLAG_RESPONSE != 0,
            authoritative: flags & FLAG_AUTHORITATIVE != 0,
            questions,
            answers,
            authority,
            additionals,
        })
    }

    pub fn encode(&self) -> BridgeResult<Vec<u8>> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.id.to_be_bytes());
        let mut flags = 0u16;
        if self.is_response {
            flags |= FLAG_RESPONSE;
        }
        if self.authoritative {
            flags |= FLAG_AUTHORITATIVE;
        }
        out.extend_from_slice(&flags.to_be_bytes());
        for count in [
            self.questions.len(),
            self.answers.len(),
            self.authority.len(),
            self.additionals.len(),
        ] {
            out.extend_from_slice(&(count as u16).to_be_bytes());
        }

        for question in &self.questions {
            encode_name(&question.name, &mut out)?;
            out.extend_from_slice(&question.qtype.to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additionals)
        {
            encode_record(record, &mut out)?;
        }

        if out.len() > MAX_PACKET_BYTES {
            return Err(BridgeError::Dns(format!(
                "message of {} bytes exceeds the {MAX_PACKET_BYTES} byte cap",
                out.len()
            )));
        }
        Ok(out)
    }
}

fn encode_record(record: &Record, out: &mut Vec<u8>) -> BridgeResult<()> {
    encode_name(&record.name, out)?;
    out.extend_from_slice(&record.data.rr_type().to_be_bytes());
    let class = if record.cache_flush {
        CLASS_IN | CACHE_FLUSH_BIT
    } else {
        CLASS_IN
    };
    out.extend_from_slice(&class.to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let mut rdata = Vec::new();
    match &record.data {
        RecordData::A(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Aaaa(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Ptr(target) => encode_name(target, &mut rdata)?,
        RecordData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            rdata.extend_from_slice(&priority.to_be_bytes());
            rdata.extend_from_slice(&weight.to_be_bytes());
            rdata.extend_from_slice(&port.to_be_bytes());
            encode_name(target, &mut rdata)?;
        }
        RecordData::Txt(pairs) => {
            for (key, value) in pairs {
                let text = if value.is_empty() {
                    key.clone()
                } else {
                    format!("{key}={value}")
                };
                if text.len() > 255 {
                    return Err(BridgeError::Dns(format!(
                        "txt entry {key:?} exceeds 255 bytes"
                    )));
                }
                rdata.push(text.len() as u8);
                rdata.extend_from_slice(text.as_bytes());
            }
            if pairs.is_empty() {
                rdata.push(0);
            }
        }
    }
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);
    Ok(())
}

/// Decode one resource record; unknown types yield `None` with the cursor
/// still advanced past them.
fn decode_record(packet: &[u8], offset: usize) -> BridgeResult<(Option<Record>, usize)> {
    let (name, next) = decode_name(packet, offset)?;
    let mut offset = next;
    if offset + 10 > packet.len() {
        return Err(BridgeError::Dns("record header is truncated".into()));
    }
    let rr_type = read_u16(packet, offset)?;
    let class = read_u16(packet, offset + 2)?;
    let ttl = read_u32(packet, offset + 4)?;
    let rdlen = read_u16(packet, offset + 8)? as usize;
    offset += 10;
    if offset + rdlen > packet.len() {
        return Err(BridgeError::Dns("record payload is truncated".into()));
    }
    let rdata_start = offset;
    let rdata_end = offset + rdlen;

    let data = match rr_type {
        TYPE_A if rdlen == 4 => Some(RecordData::A(Ipv4Addr::new(
            packet[rdata_start],
            packet[rdata_start + 1],
            packet[rdata_start + 2],
            packet[rdata_start + 3],
        ))),
        TYPE_AAAA if rdlen == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[rdata_start..rdata_end]);
            Some(RecordData::Aaaa(Ipv6Addr::from(octets)))
        }
        TYPE_PTR => {
            let (target, _) = decode_name(packet, rdata_start)?;
            Some(RecordData::Ptr(target))
        }
        TYPE_SRV if rdlen >= 6 => {
            let priority = read_u16(packet, rdata_start)?;
            let weight = read_u16(packet, rdata_start + 2)?;
            let port = read_u16(packet, rdata_start + 4)?;
            let (target, _) = decode_name(packet, rdata_start + 6)?;
            Some(RecordData::Srv {
                priority,
                weight,
                port,
                target,
            })
        }
        TYPE_TXT => Some(RecordData::Txt(decode_txt(
            &packet[rdata_start..rdata_end],
        ))),
        _ => None,
    };

    let record = data.map(|data| Record {
        name,
        ttl,
        cache_flush: class & CACHE_FLUSH_BIT != 0,
        data,
    });
    Ok((record, rdata_end))
}

fn decode_txt(payload: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut cursor = 0usize;
    while cursor < payload.len() {
        let len = payload[cursor] as usize;
        cursor += 1;
        if len == 0 || cursor + len > payload.len() {
            break;
        }
        if let Ok(text) = std::str::from_utf8(&payload[cursor..cursor + len]) {
            match text.split_once('=') {
                Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
                None => pairs.push((text.to_string(), String::new())),
            }
        }
        cursor += len;
    }
    pairs
}

/// Canonical form used throughout the responder: lowercase, no trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_matches('.').to_ascii_lowercase()
}

fn encode_name(name: &str, out: &mut Vec<u8>) -> BridgeResult<()> {
    let trimmed = name.trim_matches('.');
    if trimmed.is_empty() {
        return Err(BridgeError::Dns("empty name".into()));
    }
    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(BridgeError::Dns(format!(
                "name {name:?} contains an empty label"
            )));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(BridgeError::Dns(format!(
                "label {label:?} exceeds {MAX_LABEL_LEN} bytes"
            )));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

fn decode_name(packet: &[u8], offset: usize) -> BridgeResult<(String, usize)> {
    if offset >= packet.len() {
        return Err(BridgeError::Dns("name offset past end of packet".into()));
    }

    let mut cursor = offset;
    let mut next_offset = offset;
    let mut jumped = false;
    // Every step either consumes a label or follows a pointer; bounding the
    // total number of steps by the packet length breaks pointer loops.
    let mut budget = packet.len();
    let mut labels: Vec<String> = Vec::new();

    loop {
        if cursor >= packet.len() {
            return Err(BridgeError::Dns("name ran past end of packet".into()));
        }
        if budget == 0 {
            return Err(BridgeError::Dns("compression pointer loop".into()));
        }
        budget -= 1;

        let len = packet[cursor];
        if len == 0 {
            if !jumped {
                next_offset = cursor + 1;
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            if cursor + 1 >= packet.len() {
                return Err(BridgeError::Dns("truncated compression pointer".into()));
            }
            let pointer = ((len as usize & 0x3F) << 8) | packet[cursor + 1] as usize;
            if pointer >= packet.len() {
                return Err(BridgeError::Dns("compression pointer past packet".into()));
            }
            if !jumped {
                next_offset = cursor + 2;
                jumped = true;
            }
            cursor = pointer;
            continue;
        }
        if len & 0xC0 != 0 {
            return Err(BridgeError::Dns("unsupported label encoding".into()));
        }

        cursor += 1;
        let label_len = len as usize;
        if cursor + label_len > packet.len() {
            return Err(BridgeError::Dns("truncated label".into()));
        }
        let label = std::str::from_utf8(&packet[cursor..cursor + label_len])
            .map_err(|_| BridgeError::Dns("label is not valid UTF-8".into()))?;
        labels.push(label.to_ascii_lowercase());
        cursor += label_len;
        if !jumped {
            next_offset = cursor;
        }
    }

    Ok((labels.join("."), next_offset))
}

fn read_u16(packet: &[u8], offset: usize) -> BridgeResult<u16> {
    if offset + 2 > packet.len() {
        return Err(BridgeError::Dns("u16 read out of bounds".into()));
    }
    Ok(u16::from_be_bytes([packet[offset], packet[offset + 1]]))
}

fn read_u32(packet: &[u8], offset: usize) -> BridgeResult<u32> {
    if offset + 4 > packet.len() {
        return Err(BridgeError::Dns("u32 read out of bounds".into()));
    }
    Ok(u32::from_be_bytes([
        packet[offset],
        packet[offset + 1],
        packet[offset + 2],
        packet[offset + 3],
    ]))
}
