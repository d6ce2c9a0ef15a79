//! Stratum V2: length-prefixed binary frames and typed messages

pub mod frame;
pub mod messages;
pub mod wire;

pub use frame::{Frame, FrameCodec, FrameHeader};
pub use messages::*;

use crate::ProtocolError;
use bytes::BytesMut;

/// Message type discriminants carried in the frame header
pub mod message_type {
    pub const SETUP_CONNECTION: u8 = 0x00;
    pub const SETUP_CONNECTION_SUCCESS: u8 = 0x01;
    pub const SETUP_CONNECTION_ERROR: u8 = 0x02;
    pub const OPEN_STANDARD_MINING_CHANNEL: u8 = 0x10;
    pub const OPEN_STANDARD_MINING_CHANNEL_SUCCESS: u8 = 0x11;
    pub const OPEN_MINING_CHANNEL_ERROR: u8 = 0x12;
    pub const UPDATE_CHANNEL: u8 = 0x13;
    pub const CLOSE_CHANNEL: u8 = 0x18;
    pub const SET_EXTRANONCE_PREFIX: u8 = 0x19;
    pub const SUBMIT_SHARES_STANDARD: u8 = 0x1a;
    pub const SUBMIT_SHARES_SUCCESS: u8 = 0x1c;
    pub const SUBMIT_SHARES_ERROR: u8 = 0x1d;
    pub const NEW_MINING_JOB: u8 = 0x1e;
    pub const SET_NEW_PREV_HASH: u8 = 0x20;
    pub const SET_TARGET: u8 = 0x21;
    pub const RECONNECT: u8 = 0x25;
}

/// Every message the server sends or recognizes
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SetupConnection(SetupConnection),
    SetupConnectionSuccess(SetupConnectionSuccess),
    SetupConnectionError(SetupConnectionError),
    OpenStandardMiningChannel(OpenStandardMiningChannel),
    OpenStandardMiningChannelSuccess(OpenStandardMiningChannelSuccess),
    OpenMiningChannelError(OpenMiningChannelError),
    UpdateChannel(UpdateChannel),
    CloseChannel(CloseChannel),
    SetExtranoncePrefix(SetExtranoncePrefix),
    SubmitSharesStandard(SubmitSharesStandard),
    SubmitSharesSuccess(SubmitSharesSuccess),
    SubmitSharesError(SubmitSharesError),
    NewMiningJob(NewMiningJob),
    SetNewPrevHash(SetNewPrevHash),
    SetTarget(SetTarget),
    Reconnect(Reconnect),
}

impl Message {
    /// The frame-header discriminant for this message
    pub fn message_type(&self) -> u8 {
        use message_type::*;
        match self {
            Message::SetupConnection(_) => SETUP_CONNECTION,
            Message::SetupConnectionSuccess(_) => SETUP_CONNECTION_SUCCESS,
            Message::SetupConnectionError(_) => SETUP_CONNECTION_ERROR,
            Message::OpenStandardMiningChannel(_) => OPEN_STANDARD_MINING_CHANNEL,
            Message::OpenStandardMiningChannelSuccess(_) => OPEN_STANDARD_MINING_CHANNEL_SUCCESS,
            Message::OpenMiningChannelError(_) => OPEN_MINING_CHANNEL_ERROR,
            Message::UpdateChannel(_) => UPDATE_CHANNEL,
            Message::CloseChannel(_) => CLOSE_CHANNEL,
            Message::SetExtranoncePrefix(_) => SET_EXTRANONCE_PREFIX,
            Message::SubmitSharesStandard(_) => SUBMIT_SHARES_STANDARD,
            Message::SubmitSharesSuccess(_) => SUBMIT_SHARES_SUCCESS,
            Message::SubmitSharesError(_) => SUBMIT_SHARES_ERROR,
            Message::NewMiningJob(_) => NEW_MINING_JOB,
            Message::SetNewPrevHash(_) => SET_NEW_PREV_HASH,
            Message::SetTarget(_) => SET_TARGET,
            Message::Reconnect(_) => RECONNECT,
        }
    }

    /// Encode the payload (header excluded)
    pub fn encode_payload(&self) -> BytesMut {
        let mut dst = BytesMut::new();
        match self {
            Message::SetupConnection(m) => m.encode(&mut dst),
            Message::SetupConnectionSuccess(m) => m.encode(&mut dst),
            Message::SetupConnectionError(m) => m.encode(&mut dst),
            Message::OpenStandardMiningChannel(m) => m.encode(&mut dst),
            Message::OpenStandardMiningChannelSuccess(m) => m.encode(&mut dst),
            Message::OpenMiningChannelError(m) => m.encode(&mut dst),
            Message::UpdateChannel(m) => m.encode(&mut dst),
            Message::CloseChannel(m) => m.encode(&mut dst),
            Message::SetExtranoncePrefix(m) => m.encode(&mut dst),
            Message::SubmitSharesStandard(m) => m.encode(&mut dst),
            Message::SubmitSharesSuccess(m) => m.encode(&mut dst),
            Message::SubmitSharesError(m) => m.encode(&mut dst),
            Message::NewMiningJob(m) => m.encode(&mut dst),
            Message::SetNewPrevHash(m) => m.encode(&mut dst),
            Message::SetTarget(m) => m.encode(&mut dst),
            Message::Reconnect(m) => m.encode(&mut dst),
        }
        dst
    }

    /// Decode a payload for the given frame-header discriminant
    pub fn decode_payload(msg_type: u8, payload: &[u8]) -> Result<Message, ProtocolError> {
        use message_type::*;
        let mut reader = wire::WireReader::new(payload);
        let message = match msg_type {
            SETUP_CONNECTION => Message::SetupConnection(SetupConnection::decode(&mut reader)?),
            SETUP_CONNECTION_SUCCESS => {
                Message::SetupConnectionSuccess(SetupConnectionSuccess::decode(&mut reader)?)
            }
            SETUP_CONNECTION_ERROR => {
                Message::SetupConnectionError(SetupConnectionError::decode(&mut reader)?)
            }
            OPEN_STANDARD_MINING_CHANNEL => {
                Message::OpenStandardMiningChannel(OpenStandardMiningChannel::decode(&mut reader)?)
            }
            OPEN_STANDARD_MINING_CHANNEL_SUCCESS => Message::OpenStandardMiningChannelSuccess(
                OpenStandardMiningChannelSuccess::decode(&mut reader)?,
            ),
            OPEN_MINING_CHANNEL_ERROR => {
                Message::OpenMiningChannelError(OpenMiningChannelError::decode(&mut reader)?)
            }
            UPDATE_CHANNEL => Message::UpdateChannel(UpdateChannel::decode(&mut reader)?),
            CLOSE_CHANNEL => Message::CloseChannel(CloseChannel::decode(&mut reader)?),
            SET_EXTRANONCE_PREFIX => {
                Message::SetExtranoncePrefix(SetExtranoncePrefix::decode(&mut reader)?)
            }
            SUBMIT_SHARES_STANDARD => {
                Message::SubmitSharesStandard(SubmitSharesStandard::decode(&mut reader)?)
            }
            SUBMIT_SHARES_SUCCESS => {
                Message::SubmitSharesSuccess(SubmitSharesSuccess::decode(&mut reader)?)
            }
            SUBMIT_SHARES_ERROR => {
                Message::SubmitSharesError(SubmitSharesError::decode(&mut reader)?)
            }
            NEW_MINING_JOB => Message::NewMiningJob(NewMiningJob::decode(&mut reader)?),
            SET_NEW_PREV_HASH => Message::SetNewPrevHash(SetNewPrevHash::decode(&mut reader)?),
            SET_TARGET => Message::SetTarget(SetTarget::decode(&mut reader)?),
            RECONNECT => Message::Reconnect(Reconnect::decode(&mut reader)?),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        reader.finish()?;
        Ok(message)
    }

    /// Wrap this message in a frame ready for the wire
    pub fn to_frame(&self) -> Frame {
        Frame::new(self.message_type(), self.encode_payload().freeze())
    }
}
