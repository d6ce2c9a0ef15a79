//! Typed V2 messages
//!
//! Connection setup, channel management, job delivery, and share
//! submission. Field layouts follow the wire primitives in [`super::wire`]:
//! little-endian integers, STR0_255 strings, length-prefixed byte fields.

use bytes::{BufMut, BytesMut};

use super::wire::{put_b0_255, put_str0_255, WireReader};
use crate::ProtocolError;

/// Opens a V2 connection; always the first message from a client
#[derive(Debug, Clone, PartialEq)]
pub struct SetupConnection {
    /// Sub-protocol the client wants (0 = mining)
    pub protocol: u8,
    /// Oldest protocol version the client accepts
    pub min_version: u16,
    /// Newest protocol version the client accepts
    pub max_version: u16,
    /// Capability flags
    pub flags: u32,
    /// Host the client believes it dialed
    pub endpoint_host: String,
    /// Port the client believes it dialed
    pub endpoint_port: u16,
    /// Device vendor
    pub vendor: String,
    /// Hardware revision
    pub hardware_version: String,
    /// Firmware identifier
    pub firmware: String,
    /// Device serial or identifier
    pub device_id: String,
}

impl SetupConnection {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.protocol);
        dst.put_u16_le(self.min_version);
        dst.put_u16_le(self.max_version);
        dst.put_u32_le(self.flags);
        put_str0_255(dst, &self.endpoint_host);
        dst.put_u16_le(self.endpoint_port);
        put_str0_255(dst, &self.vendor);
        put_str0_255(dst, &self.hardware_version);
        put_str0_255(dst, &self.firmware);
        put_str0_255(dst, &self.device_id);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(SetupConnection {
            protocol: reader.read_u8()?,
            min_version: reader.read_u16()?,
            max_version: reader.read_u16()?,
            flags: reader.read_u32()?,
            endpoint_host: reader.read_str0_255()?,
            endpoint_port: reader.read_u16()?,
            vendor: reader.read_str0_255()?,
            hardware_version: reader.read_str0_255()?,
            firmware: reader.read_str0_255()?,
            device_id: reader.read_str0_255()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupConnectionSuccess {
    /// Version the connection will speak
    pub used_version: u16,
    /// Flags the server honors
    pub flags: u32,
}

impl SetupConnectionSuccess {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.used_version);
        dst.put_u32_le(self.flags);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(SetupConnectionSuccess {
            used_version: reader.read_u16()?,
            flags: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetupConnectionError {
    pub flags: u32,
    pub error_code: String,
}

impl SetupConnectionError {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.flags);
        put_str0_255(dst, &self.error_code);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(SetupConnectionError {
            flags: reader.read_u32()?,
            error_code: reader.read_str0_255()?,
        })
    }
}

/// Requests a standard mining channel on an established connection
#[derive(Debug, Clone, PartialEq)]
pub struct OpenStandardMiningChannel {
    /// Client-chosen id echoed in the reply
    pub request_id: u32,
    /// Worker identity (account.worker form)
    pub user_identity: String,
    /// Device's self-reported hashrate in H/s
    pub nominal_hashrate: f32,
    /// Loosest target the device can work with (little-endian)
    pub max_target: [u8; 32],
}

impl OpenStandardMiningChannel {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.request_id);
        put_str0_255(dst, &self.user_identity);
        dst.put_u32_le(self.nominal_hashrate.to_bits());
        dst.put_slice(&self.max_target);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(OpenStandardMiningChannel {
            request_id: reader.read_u32()?,
            user_identity: reader.read_str0_255()?,
            nominal_hashrate: reader.read_f32()?,
            max_target: reader.read_u256()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenStandardMiningChannelSuccess {
    pub request_id: u32,
    /// Server-assigned channel id, unique per connection
    pub channel_id: u32,
    /// Initial share target (little-endian)
    pub target: [u8; 32],
    /// Extranonce bytes fixed for this channel
    pub extranonce_prefix: Vec<u8>,
    /// Group the channel was attached to
    pub group_channel_id: u32,
}

impl OpenStandardMiningChannelSuccess {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.request_id);
        dst.put_u32_le(self.channel_id);
        dst.put_slice(&self.target);
        put_b0_255(dst, &self.extranonce_prefix);
        dst.put_u32_le(self.group_channel_id);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(OpenStandardMiningChannelSuccess {
            request_id: reader.read_u32()?,
            channel_id: reader.read_u32()?,
            target: reader.read_u256()?,
            extranonce_prefix: reader.read_b0_255()?,
            group_channel_id: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenMiningChannelError {
    pub request_id: u32,
    pub error_code: String,
}

impl OpenMiningChannelError {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.request_id);
        put_str0_255(dst, &self.error_code);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(OpenMiningChannelError {
            request_id: reader.read_u32()?,
            error_code: reader.read_str0_255()?,
        })
    }
}

/// Client update of channel characteristics
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateChannel {
    pub channel_id: u32,
    pub nominal_hashrate: f32,
    pub maximum_target: [u8; 32],
}

impl UpdateChannel {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
        dst.put_u32_le(self.nominal_hashrate.to_bits());
        dst.put_slice(&self.maximum_target);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(UpdateChannel {
            channel_id: reader.read_u32()?,
            nominal_hashrate: reader.read_f32()?,
            maximum_target: reader.read_u256()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseChannel {
    pub channel_id: u32,
    pub reason_code: String,
}

impl CloseChannel {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
        put_str0_255(dst, &self.reason_code);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(CloseChannel {
            channel_id: reader.read_u32()?,
            reason_code: reader.read_str0_255()?,
        })
    }
}

/// Rotates the extranonce prefix assigned to a channel
#[derive(Debug, Clone, PartialEq)]
pub struct SetExtranoncePrefix {
    pub channel_id: u32,
    pub extranonce_prefix: Vec<u8>,
}

impl SetExtranoncePrefix {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
        put_b0_255(dst, &self.extranonce_prefix);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(SetExtranoncePrefix {
            channel_id: reader.read_u32()?,
            extranonce_prefix: reader.read_b0_255()?,
        })
    }
}

/// One proof submission on a standard channel.
///
/// Standard channels fix the whole extranonce server-side, so the proof is
/// identified by nonce, ntime, and version alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitSharesStandard {
    pub channel_id: u32,
    /// Client-side monotonic sequence number
    pub sequence_number: u32,
    pub job_id: u64,
    pub nonce: u32,
    pub ntime: u32,
    pub version: u32,
}

impl SubmitSharesStandard {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
        dst.put_u32_le(self.sequence_number);
        dst.put_u64_le(self.job_id);
        dst.put_u32_le(self.nonce);
        dst.put_u32_le(self.ntime);
        dst.put_u32_le(self.version);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(SubmitSharesStandard {
            channel_id: reader.read_u32()?,
            sequence_number: reader.read_u32()?,
            job_id: reader.read_u64()?,
            nonce: reader.read_u32()?,
            ntime: reader.read_u32()?,
            version: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitSharesSuccess {
    pub channel_id: u32,
    pub last_sequence_number: u32,
    pub new_submits_accepted_count: u32,
    /// Sum of credited difficulty in the acknowledged batch
    pub new_shares_sum: u64,
}

impl SubmitSharesSuccess {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
        dst.put_u32_le(self.last_sequence_number);
        dst.put_u32_le(self.new_submits_accepted_count);
        dst.put_u64_le(self.new_shares_sum);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(SubmitSharesSuccess {
            channel_id: reader.read_u32()?,
            last_sequence_number: reader.read_u32()?,
            new_submits_accepted_count: reader.read_u32()?,
            new_shares_sum: reader.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitSharesError {
    pub channel_id: u32,
    pub sequence_number: u32,
    pub error_code: String,
}

impl SubmitSharesError {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
        dst.put_u32_le(self.sequence_number);
        put_str0_255(dst, &self.error_code);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(SubmitSharesError {
            channel_id: reader.read_u32()?,
            sequence_number: reader.read_u32()?,
            error_code: reader.read_str0_255()?,
        })
    }
}

/// A new job for a channel. The merkle root is final: standard channels fix
/// the extranonce server-side, so the server folds the coinbase itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewMiningJob {
    pub channel_id: u32,
    pub job_id: u64,
    pub version: u32,
    pub merkle_root: [u8; 32],
    /// True when the job waits for the next SetNewPrevHash before activation
    pub future_job: bool,
}

impl NewMiningJob {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
        dst.put_u64_le(self.job_id);
        dst.put_u32_le(self.version);
        dst.put_slice(&self.merkle_root);
        dst.put_u8(self.future_job as u8);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(NewMiningJob {
            channel_id: reader.read_u32()?,
            job_id: reader.read_u64()?,
            version: reader.read_u32()?,
            merkle_root: reader.read_u256()?,
            future_job: reader.read_bool()?,
        })
    }
}

/// Announces the chain tip a job generation builds on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetNewPrevHash {
    pub channel_id: u32,
    pub job_id: u64,
    pub prev_hash: [u8; 32],
    pub min_ntime: u32,
    pub nbits: u32,
}

impl SetNewPrevHash {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
        dst.put_u64_le(self.job_id);
        dst.put_slice(&self.prev_hash);
        dst.put_u32_le(self.min_ntime);
        dst.put_u32_le(self.nbits);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(SetNewPrevHash {
            channel_id: reader.read_u32()?,
            job_id: reader.read_u64()?,
            prev_hash: reader.read_u256()?,
            min_ntime: reader.read_u32()?,
            nbits: reader.read_u32()?,
        })
    }
}

/// Retargets a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetTarget {
    pub channel_id: u32,
    /// New share threshold (little-endian)
    pub maximum_target: [u8; 32],
}

impl SetTarget {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel_id);
        dst.put_slice(&self.maximum_target);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(SetTarget {
            channel_id: reader.read_u32()?,
            maximum_target: reader.read_u256()?,
        })
    }
}

/// Asks clients to reconnect elsewhere, sent during graceful shutdown
#[derive(Debug, Clone, PartialEq)]
pub struct Reconnect {
    pub new_host: String,
    pub new_port: u16,
}

impl Reconnect {
    pub fn encode(&self, dst: &mut BytesMut) {
        put_str0_255(dst, &self.new_host);
        dst.put_u16_le(self.new_port);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Reconnect {
            new_host: reader.read_str0_255()?,
            new_port: reader.read_u16()?,
        })
    }
}
