// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::fmt::Formatter;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Discovery round length: how long we wait for a quorum of index replies
/// before re-broadcasting.
pub const DEFAULT_IDX_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cooperative tick at which the discovery deadline and quorum are checked.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Whether this node stores full blocks (masternode) and therefore
    /// serves index and block-data requests.
    #[serde(default)]
    pub store_full_blocks: bool,

    #[serde(with = "humantime_serde", default)]
    pub idx_reply_timeout: Option<Duration>,

    #[serde(with = "humantime_serde", default)]
    pub check_interval: Option<Duration>,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_max_queue_size() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}

impl Default for Params {
    fn default() -> Self {
        Self {
            store_full_blocks: false,
            idx_reply_timeout: None,
            check_interval: None,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

impl std::fmt::Display for Params {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "store_full_blocks: {}, idx_reply_timeout: {:?}, check_interval: {:?}, max_queue_size: {}",
            self.store_full_blocks,
            self.idx_reply_timeout.unwrap_or(DEFAULT_IDX_REPLY_TIMEOUT),
            self.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL),
            self.max_queue_size,
        )
    }
}
