// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use node_data::ledger::{Block, Hash};

/// Folds committed blocks into the key-value state store.
///
/// `apply` is idempotent over the `(height, hash)` identity; `latest` is the
/// catch-up coordinator's source of truth for the committed tip.
pub trait StateDriver: Send + Sync + 'static {
    fn apply(&self, blk: &Block) -> anyhow::Result<()>;

    /// Height and hash of the last block folded into state; the genesis
    /// point `(0, [0u8; 32])` on a fresh store.
    fn latest(&self) -> anyhow::Result<(u64, Hash)>;
}
