// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::collections::BTreeSet;

use node_data::peer::PeerId;

/// Membership book of the known overlay peers, built by the discovery
/// layer and read by the services.
#[derive(Debug, Default, Clone)]
pub struct PeerDirectory {
    masternodes: BTreeSet<PeerId>,
    delegates: BTreeSet<PeerId>,
}

impl PeerDirectory {
    pub fn new(
        masternodes: impl IntoIterator<Item = PeerId>,
        delegates: impl IntoIterator<Item = PeerId>,
    ) -> Self {
        Self {
            masternodes: masternodes.into_iter().collect(),
            delegates: delegates.into_iter().collect(),
        }
    }

    pub fn masternodes(&self) -> impl Iterator<Item = &PeerId> {
        self.masternodes.iter()
    }

    pub fn masternode_count(&self) -> usize {
        self.masternodes.len()
    }

    pub fn is_masternode(&self, key: &PeerId) -> bool {
        self.masternodes.contains(key)
    }

    pub fn is_delegate(&self, key: &PeerId) -> bool {
        self.delegates.contains(key)
    }
}
