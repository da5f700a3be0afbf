// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

pub mod mem;

use anyhow::Result;
use node_data::ledger::{Block, Hash, IndexEntry};
use node_data::peer::PeerId;

pub trait DB: Send + Sync + 'static {
    type P<'a>: Persist
    where
        Self: 'a;

    /// Provides a read-only transaction.
    fn view<F, T>(&self, f: F) -> T
    where
        F: for<'a> FnOnce(&Self::P<'a>) -> T;

    /// Provides a read-write transaction.
    fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&Self::P<'a>) -> Result<T>;
}

/// Full-block ledger as consumed by the catch-up path.
pub trait Ledger {
    /// Height and hash of the highest committed block; the genesis point
    /// `(0, [0u8; 32])` when nothing has been stored yet.
    fn latest(&self) -> Result<(u64, Hash)>;

    /// Translates a block hash into its height, if committed.
    fn height_by_hash(&self, hash: &Hash) -> Result<Option<u64>>;

    /// The last `n` block index entries, ascending by height.
    fn last_n_index(&self, n: u64) -> Result<Vec<IndexEntry>>;

    fn block_by_height(&self, height: u64) -> Result<Option<Block>>;

    /// Durably appends a block together with the masternodes known to own
    /// its body. Callers must not replay heights.
    fn store_block(&self, blk: &Block, owners: &[PeerId]) -> Result<()>;
}

pub trait Persist: Ledger + Send + Sync {}
