// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::io::{self, Read, Write};

use sha3::{Digest, Keccak256};

use crate::peer::PeerId;
use crate::Serializable;

pub type Hash = [u8; 32];

/// Hex rendering for hashes in log fields.
pub fn to_str(hash: &Hash) -> String {
    hex::encode(hash)
}

/// A committed block body.
///
/// The catch-up path treats the payload as opaque; only `(height, hash)`
/// matter to ordering and identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    height: u64,
    hash: Hash,
    payload: Vec<u8>,
}

impl Block {
    pub fn new(height: u64, hash: Hash, payload: Vec<u8>) -> Self {
        Self {
            height,
            hash,
            payload,
        }
    }

    /// Derives the block digest from its height and payload.
    pub fn digest(height: u64, payload: &[u8]) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(height.to_le_bytes());
        hasher.update(payload);
        hasher.finalize().into()
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl Serializable for Block {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.height.to_le_bytes())?;
        w.write_all(&self.hash)?;
        Self::write_var_bytes(w, &self.payload)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let height = Self::read_u64_le(r)?;

        let mut hash = Hash::default();
        r.read_exact(&mut hash)?;

        let payload = Self::read_var_bytes(r)?;

        Ok(Self {
            height,
            hash,
            payload,
        })
    }
}

/// One entry of a block index delta: a block the requester is missing and
/// the masternodes claiming to store its full body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub height: u64,
    pub hash: Hash,
    pub owners: Vec<PeerId>,
}

impl Serializable for IndexEntry {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.height.to_le_bytes())?;
        w.write_all(&self.hash)?;

        let owners: u32 = self
            .owners
            .len()
            .try_into()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        w.write_all(&owners.to_le_bytes())?;
        for owner in &self.owners {
            owner.write(w)?;
        }

        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let height = Self::read_u64_le(r)?;

        let mut hash = Hash::default();
        r.read_exact(&mut hash)?;

        let mut count_buf = [0u8; 4];
        r.read_exact(&mut count_buf)?;

        let count = u32::from_le_bytes(count_buf);
        let mut owners = Vec::with_capacity(count as usize);
        for _ in 0..count {
            owners.push(PeerId::read(r)?);
        }

        Ok(Self {
            height,
            hash,
            owners,
        })
    }
}
