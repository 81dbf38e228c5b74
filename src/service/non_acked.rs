// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change tracking for published non-acked counts.

use crate::bus::NonAckMessagesCount;
use crate::model::PeerId;
use std::collections::HashMap;

/// Remembers the last published count per peer.
#[derive(Debug, Default)]
pub struct NonAckedCountCache {
    last: HashMap<PeerId, i64>,
}

impl NonAckedCountCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts that differ from the last call, sorted by peer.
    ///
    /// A peer that disappears from `counts` (removed or purged) is reported
    /// once with a count of zero.
    pub fn get_updated_values(&mut self, counts: &HashMap<PeerId, i64>) -> Vec<NonAckMessagesCount> {
        let mut updated: Vec<NonAckMessagesCount> = counts
            .iter()
            .filter(|(peer_id, count)| self.last.get(*peer_id) != Some(*count))
            .map(|(peer_id, count)| NonAckMessagesCount {
                peer_id: peer_id.clone(),
                count: *count,
            })
            .collect();

        updated.extend(
            self.last
                .iter()
                .filter(|(peer_id, count)| !counts.contains_key(*peer_id) && **count != 0)
                .map(|(peer_id, _)| NonAckMessagesCount {
                    peer_id: peer_id.clone(),
                    count: 0,
                }),
        );

        self.last = counts.clone();
        updated.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        updated
    }
}
