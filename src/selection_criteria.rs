//! Contains the types for read preferences.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bson::{doc, Bson, Document};
use derivative::Derivative;
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    error::{ErrorKind, Result},
    sdam::public::ServerInfo,
    serde_util,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ///
    /// See the documentation [here](https://www.mongodb.com/docs/manual/core/read-preference/) for more details.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(#[derivative(Debug = "ignore")] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    pub(crate) fn is_read_pref_primary(&self) -> bool {
        matches!(self, Self::ReadPreference(ReadPreference::Primary))
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.as_read_pref().and_then(|pref| pref.max_staleness())
    }
}

impl<'de> Deserialize<'de> for SelectionCriteria {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(SelectionCriteria::ReadPreference(
            ReadPreference::deserialize(deserializer)?,
        ))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver routes read operations to the members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to remain
/// eligible for the operation. The driver will error during server selection if a `ReadPreference`
/// with `tag_sets` or `max_staleness` is used with `Primary`.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Specifications for the server suitable to handle the operation.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    PrimaryPreferred {
        /// Specifications for the server suitable to handle the operation.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        /// Specifications for the server suitable to handle the operation.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the node with the least network latency regardless of whether it's
    /// the primary or a secondary.
    Nearest {
        /// Specifications for the server suitable to handle the operation.
        options: ReadPreferenceOptions,
    },
}

impl<'de> Deserialize<'de> for ReadPreference {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ReadPreferenceHelper {
            mode: String,

            #[serde(flatten)]
            options: ReadPreferenceOptions,
        }

        let preference = ReadPreferenceHelper::deserialize(deserializer)?;

        match preference.mode.to_lowercase().as_str() {
            "primary" => Ok(ReadPreference::Primary),
            "secondary" => Ok(ReadPreference::Secondary {
                options: preference.options,
            }),
            "primarypreferred" => Ok(ReadPreference::PrimaryPreferred {
                options: preference.options,
            }),
            "secondarypreferred" => Ok(ReadPreference::SecondaryPreferred {
                options: preference.options,
            }),
            "nearest" => Ok(ReadPreference::Nearest {
                options: preference.options,
            }),
            other => Err(serde::de::Error::custom(format!(
                "Unknown read preference mode: {}",
                other
            ))),
        }
    }
}

impl Serialize for ReadPreference {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        #[skip_serializing_none]
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ReadPreferenceHelper<'a> {
            mode: &'a str,

            #[serde(flatten)]
            options: Option<&'a ReadPreferenceOptions>,
        }

        let helper = ReadPreferenceHelper {
            mode: self.mode_str(),
            options: self.options(),
        };
        helper.serialize(serializer)
    }
}

/// Specifies read preference options for non-primary read preferences.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set will
    /// be checked in order until one or more servers is found with each tag in the set.
    #[serde(rename = "tags", alias = "tag_sets")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation. Any secondaries lagging behind more than
    /// `max_staleness` will not be considered for the operation.
    ///
    /// `max_staleness` must be at least 90 seconds. If a `max_staleness` less than 90 seconds is
    /// specified for an operation, the operation will return an error.
    #[serde(rename = "maxStalenessSeconds", default)]
    #[serde(serialize_with = "serde_util::serialize_duration_option_as_int_secs")]
    #[serde(deserialize_with = "serde_util::deserialize_duration_option_from_u64_seconds")]
    pub max_staleness: Option<Duration>,

    /// Specifies hedging behavior for reads. These options only apply to sharded clusters on
    /// servers that are at least version 4.4. Note that hedged reads are automatically enabled for
    /// read preference mode "nearest".
    ///
    /// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference-hedge-option/) for more details.
    pub hedge: Option<HedgedReadOptions>,
}

/// Specifies hedging behavior for reads.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference-hedge-option/) for more details.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct HedgedReadOptions {
    /// Whether or not to allow reads from a sharded cluster to be "hedged" across two replica
    /// set members per shard, with the results from the first response received back from either
    /// being returned.
    pub enabled: bool,
}

impl HedgedReadOptions {
    /// Creates a new `HedgedReadOptions` with the given value for `enabled`.
    pub fn with_enabled(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl ReadPreference {
    pub(crate) fn mode_str(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { options }
            | ReadPreference::PrimaryPreferred { options }
            | ReadPreference::SecondaryPreferred { options }
            | ReadPreference::Nearest { options } => Some(options),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    pub(crate) fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "read preference tags can only be specified when a non-primary mode \
                              is specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { ref mut options } => options,
            ReadPreference::PrimaryPreferred { ref mut options } => options,
            ReadPreference::SecondaryPreferred { ref mut options } => options,
            ReadPreference::Nearest { ref mut options } => options,
        };

        options.tag_sets = Some(tag_sets);

        Ok(self)
    }

    pub(crate) fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "max staleness can only be specified when a non-primary mode is \
                              specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { ref mut options } => options,
            ReadPreference::PrimaryPreferred { ref mut options } => options,
            ReadPreference::SecondaryPreferred { ref mut options } => options,
            ReadPreference::Nearest { ref mut options } => options,
        };

        options.max_staleness = Some(max_staleness);

        Ok(self)
    }

    /// The `$readPreference` document stamped into commands routed through mongos or carried by
    /// OP_MSG to replica set members.
    pub(crate) fn into_document(self) -> Document {
        let mut doc = doc! { "mode": self.mode_str() };

        if let Some(options) = self.options() {
            if let Some(ref tag_sets) = options.tag_sets {
                let tags: Vec<Bson> = tag_sets
                    .iter()
                    .map(|tag_set| {
                        Bson::Document(
                            tag_set
                                .iter()
                                .map(|(k, v)| (k.to_string(), Bson::String(v.to_string())))
                                .collect(),
                        )
                    })
                    .collect();
                doc.insert("tags", tags);
            }

            if let Some(max_staleness) = options.max_staleness {
                doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
            }

            if let Some(ref hedge) = options.hedge {
                doc.insert("hedge", doc! { "enabled": hedge.enabled });
            }
        }

        doc
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Mode: {}", self.mode_str())?;

        if let Some(options) = self.options() {
            if let Some(ref tag_sets) = options.tag_sets {
                write!(f, ", Tag Sets: {:?}", tag_sets)?;
            }
            if let Some(ref max_staleness) = options.max_staleness {
                write!(f, ", Max Staleness: {:?}", max_staleness)?;
            }
            if let Some(ref hedge) = options.hedge {
                write!(f, ", Hedge: {}", hedge.enabled)?;
            }
        }

        write!(f, " }}")
    }
}

/// A read preference tag set. See the documentation [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/) for more details.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn read_preference_with_max_staleness_serializes_seconds() {
        let read_pref = ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(120))
                .build(),
        };

        assert_eq!(
            read_pref.into_document(),
            doc! { "mode": "secondary", "maxStalenessSeconds": 120i64 }
        );
    }

    #[test]
    fn primary_rejects_tags_and_staleness() {
        assert!(ReadPreference::Primary
            .with_tags(vec![TagSet::default()])
            .is_err());
        assert!(ReadPreference::Primary
            .with_max_staleness(Duration::from_secs(100))
            .is_err());
    }

    #[test]
    fn tag_sets_preserved_in_document() {
        let mut tags = TagSet::default();
        tags.insert("dc".to_string(), "ny".to_string());

        let read_pref = ReadPreference::Nearest {
            options: ReadPreferenceOptions::builder()
                .tag_sets(vec![tags])
                .build(),
        };
        let doc = read_pref.into_document();
        assert_eq!(doc.get_str("mode").unwrap(), "nearest");
        let sets = doc.get_array("tags").unwrap();
        assert_eq!(sets.len(), 1);
    }
}
