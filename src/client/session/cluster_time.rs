use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};

/// Struct modeling a cluster time reported by the server.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,
    pub(crate) signature: Document,
}

impl std::cmp::PartialEq for ClusterTime {
    fn eq(&self, other: &ClusterTime) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl std::cmp::Eq for ClusterTime {}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl ClusterTime {
    /// The timestamp component of this cluster time.
    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    fn cluster_time(time: u32, increment: u32) -> ClusterTime {
        ClusterTime {
            cluster_time: Timestamp { time, increment },
            signature: doc! {},
        }
    }

    #[test]
    fn ordering_ignores_signature() {
        let mut earlier = cluster_time(5, 1);
        earlier.signature = doc! { "keyId": 42i64 };
        let later = cluster_time(5, 2);

        assert!(earlier < later);
        assert!(cluster_time(4, 10) < cluster_time(5, 0));
        assert_eq!(cluster_time(5, 1), cluster_time(5, 1));
    }
}
