//! Locally cached range of reserved IDs.

use crate::server::IncrCurrentIdReply;

/// A contiguous range `[range_start, range_end)` reserved from the master for
/// the source it is cached under. IDs are handed out in increasing order;
/// once `cursor` reaches `range_end` the bucket is exhausted.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Bucket {
    range_start: i64,
    range_end: i64,
    cursor: i64,
}

impl Bucket {
    /// Creates a bucket over `[range_start, range_end)`. An empty or inverted
    /// range yields an already exhausted bucket.
    pub fn new(range_start: i64, range_end: i64) -> Self {
        Bucket {
            range_start,
            range_end: range_end.max(range_start),
            cursor: range_start,
        }
    }

    /// Bucket founded by a reservation reply.
    pub fn from_reply(reply: &IncrCurrentIdReply) -> Self {
        Self::new(reply.result_current_id, reply.new_db_current_id)
    }

    pub fn range(&self) -> (i64, i64) {
        (self.range_start, self.range_end)
    }

    /// Takes the next ID, or `None` if exhausted.
    pub fn next_id(&mut self) -> Option<i64> {
        if self.is_exhausted() {
            return None;
        }
        let id = self.cursor;
        self.cursor += 1;
        Some(id)
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.range_end
    }
}

#[cfg(test)]
mod bucket_tests {
    use super::*;

    #[test]
    fn issues_whole_range() {
        let mut bucket = Bucket::from_reply(&IncrCurrentIdReply {
            result_current_id: 200,
            new_db_current_id: 205,
        });
        assert_eq!(bucket.range(), (200, 205));
        let ids: Vec<i64> = std::iter::from_fn(|| bucket.next_id()).collect();
        assert_eq!(ids, vec![200, 201, 202, 203, 204]);
        assert!(bucket.is_exhausted());
        assert_eq!(bucket.next_id(), None);
    }

    #[test]
    fn empty_range_is_exhausted() {
        let mut bucket = Bucket::new(7, 7);
        assert!(bucket.is_exhausted());
        assert_eq!(bucket.next_id(), None);
        let bucket = Bucket::new(9, 3);
        assert_eq!(bucket.range(), (9, 9));
        assert!(bucket.is_exhausted());
    }
}
