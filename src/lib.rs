//! The connection, topology and operation-dispatch core of a MongoDB driver.
//!
//! This crate owns the wire protocol, server discovery and monitoring, server
//! selection, authentication, logical sessions, and the per-operation dispatch
//! pipeline. Higher-level surfaces (collection/database facades, GridFS, the
//! cursor iterator API) are built on top of it in separate crates.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod options;

pub use ::bson;

mod bson_util;
pub mod bulk_write;
mod client;
mod cmap;
mod compression;
mod concern;
mod cursor;
pub mod error;
pub mod event;
mod hello;
mod operation;
pub mod results;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
pub(crate) mod serde_util;
mod srv;

pub use crate::{
    client::{
        session::{ClientSession, ClusterTime},
        Client,
    },
    cursor::Cursor,
};

pub use sdam::public::*;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, ErrorKind};

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// A MongoDB namespace: the combination of a database name and a collection
/// name, e.g. `db.coll`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Namespace {
    /// The name of the database associated with this namespace.
    pub db: String,

    /// The name of the collection this namespace corresponds to.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` from the given database and collection names.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '.');

        let db = parts.next();
        let coll = parts.next();

        match (db, coll) {
            (Some(db), Some(coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(ErrorKind::InvalidArgument {
                message: "a namespace must be of the form <db>.<collection>".to_string(),
            }
            .into()),
        }
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::from_str(&s).map_err(|_| {
            serde::de::Error::custom("a namespace must be of the form <db>.<collection>")
        })
    }
}

impl Serialize for Namespace {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
