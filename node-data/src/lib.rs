// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod ledger;
pub mod message;
pub mod peer;

use std::io::{self, Read, Write};

/// Wire codec for self-delimiting records.
///
/// Integers are little-endian; variable-size fields are u32-length-prefixed.
pub trait Serializable {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()>;

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized;

    fn write_var_bytes<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<()> {
        let len: u32 = buf
            .len()
            .try_into()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        w.write_all(&len.to_le_bytes())?;
        w.write_all(buf)
    }

    fn read_var_bytes<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;

        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf[..])?;

        Ok(buf)
    }

    fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}
