//! BLE-MIDI packet framing. A notification payload is a header byte (bit 7
//! set, low six bits the high part of a 13-bit millisecond timestamp)
//! followed by timestamped MIDI events; each event is a timestamp byte
//! (bit 7 set, low seven bits) and then status + data. Consecutive channel
//! voice events with the same status may omit it (running status); the
//! decoder always expands it before delivery. Sysex spans packets and is
//! delivered only once the 0xF7 terminator is seen.

use std::time::Instant;
use log::warn;

use crate::error::CodecError;
use crate::midi::message::{
    self, class_of_status, MessageClass, SYSEX_END, SYSEX_START,
};

/// Timestamps are 13-bit milliseconds and wrap; they are not required to be
/// monotonic across packets.
pub const TIMESTAMP_RANGE: u16 = 0x2000;

const HEADER_FLAG: u8 = 0x80;
const HEADER_RESERVED: u8 = 0x40;
const TIMESTAMP_FLAG: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    /// A complete MIDI message, status byte always present.
    Message { timestamp: u16, bytes: Vec<u8> },
    /// An open sysex assembly was discarded by an interrupting status byte.
    SysexInterrupted { discarded: usize },
}

/**
 * Accumulator for system-exclusive bytes spanning packets. Open between
 * 0xF0 and 0xF7; content is only handed out once the terminator arrives.
 */
#[derive(Debug, Default)]
pub struct SysexAssemblyBuffer {
    bytes: Vec<u8>,
}

impl SysexAssemblyBuffer {
    pub fn is_open(&self) -> bool {
        !self.bytes.is_empty()
    }

    fn begin(&mut self) {
        self.bytes.clear();
        self.bytes.push(SYSEX_START);
    }

    fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    fn finish(&mut self) -> Vec<u8> {
        self.bytes.push(SYSEX_END);
        std::mem::take(&mut self.bytes)
    }

    fn discard(&mut self) -> usize {
        let discarded = self.bytes.len();
        self.bytes.clear();
        discarded
    }
}

/**
 * Stateful decoder for one input device. Running status and partial sysex
 * persist across packets; reset on disconnect.
 */
#[derive(Debug, Default)]
pub struct PacketDecoder {
    running_status: Option<u8>,
    sysex: SysexAssemblyBuffer,
}

impl PacketDecoder {
    pub fn new() -> Self {
        PacketDecoder::default()
    }

    /// Drops running status and any partial sysex. Call on disconnect.
    pub fn reset(&mut self) {
        self.running_status = None;
        self.sysex.discard();
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<DecodedEvent>, CodecError> {
        if payload.len() < 2 {
            return Err(CodecError::ShortPacket);
        }

        let header = payload[0];
        if header & HEADER_FLAG == 0 {
            return Err(CodecError::BadHeader(header));
        }
        let high = u16::from(header & 0x3F) << 7;

        let mut events = Vec::new();
        let mut timestamp = high;
        let mut i = 1;

        while i < payload.len() {
            let byte = payload[i];

            if self.sysex.is_open() {
                if byte & 0x80 == 0 {
                    self.sysex.push(byte);
                    i += 1;
                    continue;
                }

                if byte == SYSEX_END {
                    // terminator with its timestamp byte omitted
                    events.push(DecodedEvent::Message {
                        timestamp,
                        bytes: self.sysex.finish(),
                    });
                    i += 1;
                    continue;
                }

                if i + 1 < payload.len() && payload[i + 1] == SYSEX_END {
                    timestamp = high | u16::from(byte & 0x7F);
                    events.push(DecodedEvent::Message {
                        timestamp,
                        bytes: self.sysex.finish(),
                    });
                    i += 2;
                    continue;
                }

                // Interrupting status: discard, report, then parse the byte
                // as the start of a normal event.
                events.push(DecodedEvent::SysexInterrupted {
                    discarded: self.sysex.discard(),
                });
                self.running_status = None;
            }

            if byte & TIMESTAMP_FLAG != 0 {
                timestamp = high | u16::from(byte & 0x7F);
                i += 1;
                if i >= payload.len() {
                    break; // trailing timestamp byte, nothing follows
                }

                let next = payload[i];
                if next & 0x80 != 0 {
                    i = self.decode_status(next, payload, i + 1, timestamp, &mut events)?;
                } else {
                    let status = self.running_status.ok_or(CodecError::OrphanedData)?;
                    i = self.decode_data(status, payload, i, timestamp, &mut events)?;
                }
            } else {
                // data without a fresh timestamp byte: running status
                let status = self.running_status.ok_or(CodecError::OrphanedData)?;
                i = self.decode_data(status, payload, i, timestamp, &mut events)?;
            }
        }

        Ok(events)
    }

    fn decode_status(
        &mut self,
        status: u8,
        payload: &[u8],
        i: usize,
        timestamp: u16,
        events: &mut Vec<DecodedEvent>,
    ) -> Result<usize, CodecError> {
        match class_of_status(status) {
            MessageClass::SystemExclusive => {
                self.running_status = None;
                self.sysex.begin();
                Ok(i)
            }
            MessageClass::SystemRealtime => {
                events.push(DecodedEvent::Message {
                    timestamp,
                    bytes: vec![status],
                });
                Ok(i)
            }
            MessageClass::ChannelVoice => {
                self.running_status = Some(status);
                self.decode_data(status, payload, i, timestamp, events)
            }
            MessageClass::SystemCommon => {
                self.running_status = None;
                if status == SYSEX_END {
                    // terminator without an open sysex
                    warn!("Dropping stray sysex terminator");
                    return Ok(i);
                }
                self.decode_data(status, payload, i, timestamp, events)
            }
            MessageClass::Unsupported => unreachable!("status byte has bit 7 set"),
        }
    }

    fn decode_data(
        &mut self,
        status: u8,
        payload: &[u8],
        i: usize,
        timestamp: u16,
        events: &mut Vec<DecodedEvent>,
    ) -> Result<usize, CodecError> {
        let wanted = message::data_len(status);
        let end = i + wanted;
        if end > payload.len() {
            return Err(CodecError::TruncatedEvent);
        }

        let mut bytes = Vec::with_capacity(1 + wanted);
        bytes.push(status);
        for &data in &payload[i..end] {
            if data & 0x80 != 0 {
                return Err(CodecError::TruncatedEvent);
            }
            bytes.push(data);
        }

        events.push(DecodedEvent::Message { timestamp, bytes });
        Ok(end)
    }
}

/**
 * Frames outbound MIDI messages. Timestamps come from a millisecond clock
 * started at construction, wrapping at the 13-bit range.
 */
#[derive(Debug)]
pub struct PacketEncoder {
    origin: Instant,
}

impl Default for PacketEncoder {
    fn default() -> Self {
        PacketEncoder::new()
    }
}

impl PacketEncoder {
    pub fn new() -> Self {
        PacketEncoder {
            origin: Instant::now(),
        }
    }

    fn now(&self) -> u16 {
        (self.origin.elapsed().as_millis() % u128::from(TIMESTAMP_RANGE)) as u16
    }

    /// Frames one short (non-fragmented) message as a single packet.
    pub fn encode_event(&self, message: &[u8]) -> Result<Vec<u8>, CodecError> {
        encode_event_at(self.now(), message)
    }

    /// Frames a batch of short messages into one packet, compressing
    /// consecutive same-status channel voice events via running status.
    pub fn encode_events(&self, messages: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
        encode_events_at(self.now(), messages)
    }

    /// Frames a complete sysex message into one or more packets, each at
    /// most `limit` bytes.
    pub fn encode_sysex(&self, message: &[u8], limit: usize) -> Result<Vec<Vec<u8>>, CodecError> {
        encode_sysex_at(self.now(), message, limit)
    }
}

fn header_byte(timestamp: u16) -> u8 {
    HEADER_FLAG | HEADER_RESERVED | ((timestamp >> 7) & 0x3F) as u8
}

fn timestamp_byte(timestamp: u16) -> u8 {
    TIMESTAMP_FLAG | (timestamp & 0x7F) as u8
}

pub fn encode_event_at(timestamp: u16, message: &[u8]) -> Result<Vec<u8>, CodecError> {
    let timestamp = timestamp % TIMESTAMP_RANGE;
    match message::classify(message) {
        MessageClass::Unsupported => Err(CodecError::MissingStatus),
        MessageClass::SystemExclusive => {
            // a sysex small enough for one packet may be framed inline
            if message.last() != Some(&SYSEX_END) {
                return Err(CodecError::UnterminatedSysex);
            }
            let mut packet = Vec::with_capacity(message.len() + 3);
            packet.push(header_byte(timestamp));
            packet.push(timestamp_byte(timestamp));
            packet.extend_from_slice(&message[..message.len() - 1]);
            packet.push(timestamp_byte(timestamp));
            packet.push(SYSEX_END);
            Ok(packet)
        }
        _ => {
            let mut packet = Vec::with_capacity(message.len() + 2);
            packet.push(header_byte(timestamp));
            packet.push(timestamp_byte(timestamp));
            packet.extend_from_slice(message);
            Ok(packet)
        }
    }
}

pub fn encode_events_at(timestamp: u16, messages: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
    let timestamp = timestamp % TIMESTAMP_RANGE;
    let mut packet = vec![header_byte(timestamp)];
    let mut running_status: Option<u8> = None;

    for message in messages {
        let status = match message.first() {
            Some(&status) if message::is_status(status) => status,
            _ => return Err(CodecError::MissingStatus),
        };
        if class_of_status(status) == MessageClass::SystemExclusive {
            return Err(CodecError::UnterminatedSysex);
        }

        packet.push(timestamp_byte(timestamp));
        if message::supports_running_status(status) && running_status == Some(status) {
            packet.extend_from_slice(&message[1..]);
        } else {
            packet.extend_from_slice(message);
        }

        running_status = if message::supports_running_status(status) {
            Some(status)
        } else {
            None
        };
    }

    Ok(packet)
}

pub fn encode_sysex_at(
    timestamp: u16,
    message: &[u8],
    limit: usize,
) -> Result<Vec<Vec<u8>>, CodecError> {
    let timestamp = timestamp % TIMESTAMP_RANGE;
    if message.first() != Some(&SYSEX_START) {
        return Err(CodecError::MissingStatus);
    }
    if message.last() != Some(&SYSEX_END) || message.len() < 2 {
        return Err(CodecError::UnterminatedSysex);
    }
    // room for header + timestamp + at least one payload byte, and for the
    // timestamped terminator on the final packet
    if limit < 5 {
        return Err(CodecError::LimitTooSmall(limit));
    }

    let header = header_byte(timestamp);
    let tsb = timestamp_byte(timestamp);
    let body = &message[..message.len() - 1]; // keeps 0xF0, drops 0xF7

    let mut packets = Vec::new();
    let mut packet = vec![header, tsb];
    for &byte in body {
        if packet.len() == limit {
            packets.push(packet);
            packet = vec![header];
        }
        packet.push(byte);
    }

    if packet.len() + 2 > limit {
        packets.push(packet);
        packet = vec![header];
    }
    packet.push(tsb);
    packet.push(SYSEX_END);
    packets.push(packet);

    Ok(packets)
}
