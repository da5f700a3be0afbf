// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use node_data::ledger::{Block, Hash, IndexEntry};
use node_data::peer::PeerId;

use super::{Ledger, Persist, DB};

/// In-memory ledger backend.
///
/// Exercises the [`Ledger`] contract without a storage engine; the chain is
/// append-only and rooted at the implicit genesis `(0, [0u8; 32])`.
#[derive(Default)]
pub struct MemDB {
    inner: RwLock<Chain>,
}

#[derive(Default)]
struct Chain {
    blocks: BTreeMap<u64, (Block, Vec<PeerId>)>,
    by_hash: BTreeMap<Hash, u64>,
}

impl MemDB {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemTx<'a> {
    inner: &'a RwLock<Chain>,
}

impl DB for MemDB {
    type P<'a>
        = MemTx<'a>
    where
        Self: 'a;

    fn view<F, T>(&self, f: F) -> T
    where
        F: for<'a> FnOnce(&Self::P<'a>) -> T,
    {
        f(&MemTx { inner: &self.inner })
    }

    fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&Self::P<'a>) -> Result<T>,
    {
        f(&MemTx { inner: &self.inner })
    }
}

impl Ledger for MemTx<'_> {
    fn latest(&self) -> Result<(u64, Hash)> {
        let chain = self.inner.read().map_err(|_| anyhow!("lock poisoned"))?;

        Ok(chain
            .blocks
            .last_key_value()
            .map(|(h, (blk, _))| (*h, *blk.hash()))
            .unwrap_or((0, Hash::default())))
    }

    fn height_by_hash(&self, hash: &Hash) -> Result<Option<u64>> {
        let chain = self.inner.read().map_err(|_| anyhow!("lock poisoned"))?;

        Ok(chain.by_hash.get(hash).copied().or_else(|| {
            // genesis is implicit and never stored
            (hash == &Hash::default()).then_some(0)
        }))
    }

    fn last_n_index(&self, n: u64) -> Result<Vec<IndexEntry>> {
        let chain = self.inner.read().map_err(|_| anyhow!("lock poisoned"))?;

        let mut entries: Vec<_> = chain
            .blocks
            .iter()
            .rev()
            .take(n as usize)
            .map(|(height, (blk, owners))| IndexEntry {
                height: *height,
                hash: *blk.hash(),
                owners: owners.clone(),
            })
            .collect();

        entries.reverse();
        Ok(entries)
    }

    fn block_by_height(&self, height: u64) -> Result<Option<Block>> {
        let chain = self.inner.read().map_err(|_| anyhow!("lock poisoned"))?;

        Ok(chain.blocks.get(&height).map(|(blk, _)| blk.clone()))
    }

    fn store_block(&self, blk: &Block, owners: &[PeerId]) -> Result<()> {
        let mut chain =
            self.inner.write().map_err(|_| anyhow!("lock poisoned"))?;

        let height = blk.height();
        if chain.blocks.contains_key(&height) {
            return Err(anyhow!("block {height} already stored"));
        }

        chain.by_hash.insert(*blk.hash(), height);
        chain.blocks.insert(height, (blk.clone(), owners.to_vec()));

        Ok(())
    }
}

impl Persist for MemTx<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn blk(height: u64) -> Block {
        let payload = height.to_le_bytes().to_vec();
        Block::new(height, Block::digest(height, &payload), payload)
    }

    #[test]
    fn empty_ledger_sits_at_genesis() {
        let db = MemDB::new();

        let (height, hash) = db.view(|t| t.latest()).expect("latest");
        assert_eq!((height, hash), (0, Hash::default()));
        assert_eq!(
            db.view(|t| t.height_by_hash(&Hash::default())).expect("lookup"),
            Some(0)
        );
    }

    #[test]
    fn last_n_index_is_ascending() {
        let db = MemDB::new();
        let owner = PeerId::new([1u8; 32]);

        for height in 1..=5 {
            db.update(|t| t.store_block(&blk(height), &[owner]))
                .expect("store");
        }

        let delta = db.view(|t| t.last_n_index(3)).expect("index");
        let heights: Vec<_> = delta.iter().map(|e| e.height).collect();
        assert_eq!(heights, vec![3, 4, 5]);
        assert!(delta.iter().all(|e| e.owners == vec![owner]));
    }

    #[test]
    fn replayed_height_is_rejected() {
        let db = MemDB::new();

        db.update(|t| t.store_block(&blk(1), &[])).expect("store");
        assert!(db.update(|t| t.store_block(&blk(1), &[])).is_err());
    }
}
