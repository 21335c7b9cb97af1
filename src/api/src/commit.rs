// Copyright 2023-present The Strom Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::v1::*;
use crate::{Glsn, LogStreamId, INVALID_GLSN};

impl LogStreamCommitResult {
    /// The last GLSN this stream has committed up to, including zero-length
    /// rounds which carry the prior committed end as their offset.
    #[inline]
    pub fn last_committed_glsn(&self) -> Glsn {
        if self.committed_glsn_length == 0 {
            self.committed_glsn_offset
        } else {
            self.committed_glsn_offset + self.committed_glsn_length - 1
        }
    }
}

impl LogStreamCommitResults {
    /// Commit results are sorted by log stream id within a round.
    pub fn lookup_commit_result(&self, id: LogStreamId) -> Option<&LogStreamCommitResult> {
        self.commit_results
            .binary_search_by_key(&id, |cr| cr.log_stream_id)
            .ok()
            .map(|idx| &self.commit_results[idx])
    }
}

/// The commit history is ordered by high watermark and indexable both by a
/// round's own high watermark and by its predecessor's.
impl MetadataRepositoryDescriptor {
    pub fn lookup_commit_results(&self, hwm: Glsn) -> Option<&LogStreamCommitResults> {
        self.commit_history
            .binary_search_by_key(&hwm, |gls| gls.high_watermark)
            .ok()
            .map(|idx| &self.commit_history[idx])
    }

    pub fn lookup_next_commit_results(&self, prev: Glsn) -> Option<&LogStreamCommitResults> {
        self.commit_history
            .binary_search_by_key(&prev, |gls| gls.prev_high_watermark)
            .ok()
            .map(|idx| &self.commit_history[idx])
    }

    pub fn first_commit_results(&self) -> Option<&LogStreamCommitResults> {
        self.commit_history.first()
    }

    pub fn last_commit_results(&self) -> Option<&LogStreamCommitResults> {
        self.commit_history.last()
    }

    #[inline]
    pub fn high_watermark(&self) -> Glsn {
        self.last_commit_results().map(|gls| gls.high_watermark).unwrap_or(INVALID_GLSN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(prev: Glsn, hwm: Glsn, results: Vec<(LogStreamId, Glsn, u64)>) -> LogStreamCommitResults {
        LogStreamCommitResults {
            high_watermark: hwm,
            prev_high_watermark: prev,
            commit_results: results
                .into_iter()
                .map(|(id, offset, length)| LogStreamCommitResult {
                    log_stream_id: id,
                    committed_glsn_offset: offset,
                    committed_glsn_length: length,
                    committed_llsn_offset: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn lookup_by_both_watermarks() {
        let desc = MetadataRepositoryDescriptor {
            commit_history: vec![
                round(0, 2, vec![(1, 1, 1), (2, 2, 1)]),
                round(2, 4, vec![(1, 3, 1), (2, 4, 1)]),
            ],
            ..Default::default()
        };

        assert_eq!(desc.lookup_commit_results(2).unwrap().high_watermark, 2);
        assert_eq!(desc.lookup_next_commit_results(2).unwrap().high_watermark, 4);
        assert!(desc.lookup_commit_results(3).is_none());
        assert!(desc.lookup_next_commit_results(4).is_none());
        assert_eq!(desc.high_watermark(), 4);
    }

    #[test]
    fn zero_length_round_carries_prior_end() {
        let cr = LogStreamCommitResult {
            log_stream_id: 1,
            committed_glsn_offset: 7,
            committed_glsn_length: 0,
            committed_llsn_offset: 3,
        };
        assert_eq!(cr.last_committed_glsn(), 7);

        let cr = LogStreamCommitResult { committed_glsn_length: 3, ..cr };
        assert_eq!(cr.last_committed_glsn(), 9);
    }
}
