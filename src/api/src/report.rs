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
use crate::{Llsn, INVALID_LLSN};

impl LogStreamUncommitReport {
    /// Exclusive end of the reported uncommitted range.
    #[inline]
    pub fn uncommitted_llsn_end(&self) -> Llsn {
        self.uncommitted_llsn_offset + self.uncommitted_llsn_length
    }
}

impl UncommitReportReplica {
    /// Exclusive end of the stored uncommitted range.
    #[inline]
    pub fn uncommitted_llsn_end(&self) -> Llsn {
        self.uncommitted_llsn_offset + self.uncommitted_llsn_length
    }

    /// Truncate the uncommitted range at `end`. Returns the new exclusive end
    /// or `INVALID_LLSN` when `end` falls outside the range.
    pub fn seal(&mut self, end: Llsn) -> Llsn {
        if end < self.uncommitted_llsn_offset || end > self.uncommitted_llsn_end() {
            return INVALID_LLSN;
        }
        self.uncommitted_llsn_length = end - self.uncommitted_llsn_offset;
        self.uncommitted_llsn_end()
    }
}

impl StorageNodeUncommitReport {
    #[inline]
    pub fn len(&self) -> usize {
        self.uncommit_reports.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.uncommit_reports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MIN_LLSN;

    #[test]
    fn seal_truncates_within_range() {
        struct Test {
            offset: Llsn,
            length: u64,
            end: Llsn,
            expect: Llsn,
        }
        let tests = vec![
            Test { offset: MIN_LLSN, length: 10, end: 5, expect: 5 },
            Test { offset: MIN_LLSN, length: 10, end: 11, expect: 11 },
            Test { offset: MIN_LLSN, length: 10, end: 1, expect: 1 },
            // end before offset
            Test { offset: 5, length: 10, end: 4, expect: INVALID_LLSN },
            // end beyond the uncommitted range
            Test { offset: MIN_LLSN, length: 10, end: 12, expect: INVALID_LLSN },
        ];
        for Test { offset, length, end, expect } in tests {
            let mut replica = UncommitReportReplica {
                uncommitted_llsn_offset: offset,
                uncommitted_llsn_length: length,
                known_high_watermark: 0,
            };
            assert_eq!(replica.seal(end), expect, "seal at {end}");
            if expect != INVALID_LLSN {
                assert_eq!(replica.uncommitted_llsn_end(), end);
            }
        }
    }
}
