// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::fmt;
use std::io::{self, Read, Write};

use crate::Serializable;

/// Opaque verifying key identifying a peer on the overlay.
///
/// Equality and hashing are byte-exact; the canonical text form is 64 hex
/// digits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

#[derive(Debug, thiserror::Error)]
pub enum ParsePeerIdError {
    #[error("peer id must be 64 hex digits")]
    InvalidLength,
    #[error("peer id is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl PeerId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ParsePeerIdError> {
        if s.len() != 64 {
            return Err(ParsePeerIdError::InvalidLength);
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl Serializable for PeerId {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.0)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut bytes = [0u8; 32];
        r.read_exact(&mut bytes)?;
        Ok(Self(bytes))
    }
}
