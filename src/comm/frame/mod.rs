// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements encoder/decoder for the inter-server wire envelope.
//!
//! Layout, little-endian, preceded by a 4-byte body length:
//!
//! ```text
//! [1 msg-id-len][n msg-id UTF-8]
//! [2 msg-seq]
//! [8 stage-id]
//! [2 service-id]
//! [2 error-code]
//! [2 from-len][n from]
//! [2 to-len][n to]
//! [2 account-id-len][n account-id]
//! [1 flags]
//! [8 sid]
//! [payload]
//! ```

pub(crate) mod decoder;
pub(crate) mod encoder;

pub use decoder::decode;
pub use encoder::encode;

/// Byte length of the frame length prefix.
pub const FRAME_PREFIX_LEN: usize = 4;
/// Maximum total body length, prefix excluded.
pub const MAX_BODY_LEN: usize = 2 * 1024 * 1024;

/// Flag bit: framework message rather than user content.
pub(crate) const FLAG_BASE: u8 = 0b0000_0001;
/// Flag bit: reply correlated by `(from, msg_seq)`.
pub(crate) const FLAG_REPLY: u8 = 0b0000_0010;
/// Flag bit: already left its origin server once.
pub(crate) const FLAG_FORWARDED: u8 = 0b0000_0100;
