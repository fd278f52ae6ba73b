/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use num_enum::TryFromPrimitive;

/// BSL command codes sent to the boot ROM / FDL.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BslCommand {
    Connect = 0x0000,
    StartData = 0x0001,
    MidstData = 0x0002,
    EndData = 0x0003,
    ExecData = 0x0004,
    ChangeBaud = 0x0009,
}

/// BSL reply codes. Everything except [`BslReply::Ack`] is a diagnostic.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum BslReply {
    Ack = 0x0080,
    Ver = 0x0081,
    InvalidCmd = 0x0082,
    UnknownCmd = 0x0083,
    OperationFailed = 0x0084,
    NotSupportBaudrate = 0x0085,
    DownNotStart = 0x0086,
    DownMultiStart = 0x0087,
    DownEarlyEnd = 0x0088,
    DownDestError = 0x0089,
    DownSizeError = 0x008A,
    VerifyError = 0x008B,
    NotVerify = 0x008C,
}

/// Builds a BSL command packet: 2-byte big-endian code, 2-byte big-endian
/// parameter length, then the parameters themselves.
pub fn command_packet(cmd: BslCommand, params: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.extend_from_slice(&(cmd as u16).to_be_bytes());
    packet.extend_from_slice(&(params.len() as u16).to_be_bytes());
    packet.extend_from_slice(params);
    packet
}

/// Splits a response payload into (code, body). The body is whatever follows
/// the 4-byte header; its declared length field is ignored on purpose, as
/// some FDL builds lie about it.
pub fn split_response(payload: &[u8]) -> Option<(u16, &[u8])> {
    if payload.len() < 4 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    Some((code, &payload[4..]))
}
