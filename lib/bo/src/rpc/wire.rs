// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire serialization for organizer RPC payloads.
//!
//! Little-endian throughout. Ids travel as their packed `u64`, enums as
//! 32-bit signed integers, strings as a `u64` byte length followed by UTF-8
//! bytes, and compound records field-by-field in declaration order. The
//! layout is part of the cross-node contract; changing it is a protocol
//! break.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::types::{
    BlobId, BoOperation, BoPriority, BoTask, BucketId, BufferId, BufferInfo, MapType,
    PlacementContext, PlacementPolicy, PrefetchContext, PrefetchHint, SwapBlob, TargetId,
    ThresholdViolation, ViolationInfo, VBucketId,
};

/// Decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of payload")]
    UnexpectedEof,

    #[error("invalid enum discriminant {0}")]
    InvalidEnum(i32),

    #[error("payload string is not valid UTF-8")]
    InvalidUtf8,
}

fn need(buf: &impl Buf, bytes: usize) -> Result<(), WireError> {
    if buf.remaining() < bytes {
        return Err(WireError::UnexpectedEof);
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8, WireError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u32(buf: &mut impl Buf) -> Result<u32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn get_i32(buf: &mut impl Buf) -> Result<i32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn get_u64(buf: &mut impl Buf) -> Result<u64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn get_f32(buf: &mut impl Buf) -> Result<f32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_f32_le())
}

pub fn get_f64(buf: &mut impl Buf) -> Result<f64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_f64_le())
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

pub fn get_bool(buf: &mut impl Buf) -> Result<bool, WireError> {
    Ok(get_u8(buf)? != 0)
}

pub fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u64_le(value.len() as u64);
    buf.put_slice(value.as_bytes());
}

pub fn get_str(buf: &mut impl Buf) -> Result<String, WireError> {
    let len = get_u64(buf)? as usize;
    need(buf, len)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

/// Types that can serialize themselves onto a payload.
pub trait WireEncode {
    fn encode(&self, buf: &mut BytesMut);

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Types that can deserialize themselves from a payload.
pub trait WireDecode: Sized {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError>;
}

macro_rules! wire_id {
    ($name:ident) => {
        impl WireEncode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                buf.put_u64_le(self.as_u64());
            }
        }

        impl WireDecode for $name {
            fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
                Ok($name::from_u64(get_u64(buf)?))
            }
        }
    };
}

wire_id!(BufferId);
wire_id!(BlobId);
wire_id!(BucketId);
wire_id!(VBucketId);
wire_id!(TargetId);

macro_rules! wire_enum {
    ($name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl WireEncode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                buf.put_i32_le(*self as i32);
            }
        }

        impl WireDecode for $name {
            fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
                match get_i32(buf)? {
                    $($value => Ok($name::$variant),)+
                    other => Err(WireError::InvalidEnum(other)),
                }
            }
        }
    };
}

wire_enum!(BoPriority { Low = 0, High = 1 });
wire_enum!(BoOperation { Move = 0, Copy = 1, Delete = 2 });
wire_enum!(ThresholdViolation { Min = 0, Max = 1 });
wire_enum!(MapType { BucketId = 0, VBucketId = 1, BlobId = 2 });
wire_enum!(PlacementPolicy { Random = 0, RoundRobin = 1, MinimizeIoTime = 2 });
wire_enum!(PrefetchHint {
    None = 0,
    FileSequential = 1,
    Apriori = 2,
    FileStrided = 3,
    MachineLearning = 4,
});

impl WireEncode for BufferInfo {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        buf.put_f32_le(self.bandwidth_mbps);
        buf.put_u64_le(self.size);
    }
}

impl WireDecode for BufferInfo {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            id: BufferId::decode(buf)?,
            bandwidth_mbps: get_f32(buf)?,
            size: get_u64(buf)?,
        })
    }
}

impl WireEncode for SwapBlob {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.node_id);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
        self.bucket_id.encode(buf);
    }
}

impl WireDecode for SwapBlob {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            node_id: get_u32(buf)?,
            offset: get_u64(buf)?,
            size: get_u64(buf)?,
            bucket_id: BucketId::decode(buf)?,
        })
    }
}

impl WireEncode for ViolationInfo {
    fn encode(&self, buf: &mut BytesMut) {
        self.target_id.encode(buf);
        self.violation.encode(buf);
        buf.put_u64_le(self.violation_size);
    }
}

impl WireDecode for ViolationInfo {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            target_id: TargetId::decode(buf)?,
            violation: ThresholdViolation::decode(buf)?,
            violation_size: get_u64(buf)?,
        })
    }
}

impl WireEncode for PlacementContext {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.buffer_organizer_retries);
        self.policy.encode(buf);
    }
}

impl WireDecode for PlacementContext {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            buffer_organizer_retries: get_u8(buf)?,
            policy: PlacementPolicy::decode(buf)?,
        })
    }
}

impl WireEncode for PrefetchContext {
    fn encode(&self, buf: &mut BytesMut) {
        self.hint.encode(buf);
        buf.put_i32_le(self.read_ahead);
    }
}

impl WireDecode for PrefetchContext {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            hint: PrefetchHint::decode(buf)?,
            read_ahead: get_i32(buf)?,
        })
    }
}

pub(crate) fn put_buffer_ids(buf: &mut BytesMut, ids: &[BufferId]) {
    buf.put_u64_le(ids.len() as u64);
    for id in ids {
        id.encode(buf);
    }
}

pub(crate) fn get_buffer_ids(buf: &mut impl Buf) -> Result<Vec<BufferId>, WireError> {
    let len = get_u64(buf)? as usize;
    // Guard against truncated payloads declaring absurd lengths.
    need(buf, len.saturating_mul(8))?;
    let mut ids = Vec::with_capacity(len);
    for _ in 0..len {
        ids.push(BufferId::decode(buf)?);
    }
    Ok(ids)
}

impl WireEncode for BoTask {
    fn encode(&self, buf: &mut BytesMut) {
        self.op().encode(buf);
        match self {
            BoTask::Move {
                src,
                destinations,
                blob_id,
            } => {
                src.encode(buf);
                put_buffer_ids(buf, destinations);
                blob_id.encode(buf);
            }
            BoTask::Copy { src, dest } => {
                src.encode(buf);
                dest.encode(buf);
            }
            BoTask::Delete { src } => {
                src.encode(buf);
            }
        }
    }
}

impl WireDecode for BoTask {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        match BoOperation::decode(buf)? {
            BoOperation::Move => Ok(BoTask::Move {
                src: BufferId::decode(buf)?,
                destinations: get_buffer_ids(buf)?,
                blob_id: BlobId::decode(buf)?,
            }),
            BoOperation::Copy => Ok(BoTask::Copy {
                src: BufferId::decode(buf)?,
                dest: TargetId::decode(buf)?,
            }),
            BoOperation::Delete => Ok(BoTask::Delete {
                src: BufferId::decode(buf)?,
            }),
        }
    }
}
