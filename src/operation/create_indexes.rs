use bson::doc;

use super::{
    append_write_concern_when_supported,
    handle_response,
    LegacyRequest,
    Operation,
    WriteConcernOnlyBody,
};
use crate::{
    bson_util,
    cmap::{conn::wire::legacy, Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
    options::IndexModel,
    results::CreateIndexesResult,
    Namespace,
};

/// The `createIndexes` command. Servers that do not recognize the command (code 59 or 13390,
/// seen at wire version 0) are handled by re-running the operation with `force_legacy`, which
/// inserts the index documents into `system.indexes` directly.
#[derive(Debug)]
pub(crate) struct CreateIndexes {
    ns: Namespace,
    indexes: Vec<IndexModel>,
    write_concern: Option<WriteConcern>,
    force_legacy: bool,
}

impl CreateIndexes {
    pub(crate) fn new(
        ns: Namespace,
        indexes: Vec<IndexModel>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            indexes,
            write_concern,
            force_legacy: false,
        }
    }

    /// The same operation, but forced onto the legacy `system.indexes` path. Used after the
    /// server rejected `createIndexes` as an unknown command.
    pub(crate) fn into_legacy(mut self) -> Self {
        self.force_legacy = true;
        self
    }

    pub(crate) fn index_names(&self) -> Vec<String> {
        self.indexes.iter().map(IndexModel::index_name).collect()
    }
}

impl Operation for CreateIndexes {
    type O = CreateIndexesResult;

    const NAME: &'static str = "createIndexes";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        let indexes: Vec<_> = self
            .indexes
            .iter()
            .map(|model| model.to_index_document(None))
            .collect();

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "indexes": bson_util::to_bson_array(&indexes),
        };

        append_write_concern_when_supported(&mut body, self.write_concern.as_ref(), description)?;

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn build_legacy(&mut self, description: &StreamDescription) -> Result<Option<LegacyRequest>> {
        if !self.force_legacy && description.max_wire_version.unwrap_or(0) > 0 {
            return Ok(None);
        }

        let documents = self
            .indexes
            .iter()
            .map(|model| model.to_index_document(Some(&self.ns)))
            .collect();

        Ok(Some(LegacyRequest::Insert(legacy::Insert {
            flags: legacy::InsertFlags::empty(),
            full_collection_name: format!("{}.system.indexes", self.ns.db),
            documents,
        })))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: WriteConcernOnlyBody = handle_response(&response)?.body;
        body.validate()?;

        Ok(CreateIndexesResult {
            index_names: self.index_names(),
        })
    }

    fn handle_legacy_response(
        &self,
        _reply: legacy::Reply,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(CreateIndexesResult {
            index_names: self.index_names(),
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::concern::Acknowledgment;

    fn op() -> CreateIndexes {
        CreateIndexes::new(
            Namespace::new("db", "coll"),
            vec![IndexModel::builder().keys(doc! { "a": 1 }).build()],
            Some(WriteConcern::builder().w(Acknowledgment::Majority).build()),
        )
    }

    #[test]
    fn modern_servers_use_the_command_with_write_concern() {
        let mut create = op();
        assert!(create
            .build_legacy(&StreamDescription::new_testing())
            .unwrap()
            .is_none());
        let command = create.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(command.body.get_str("createIndexes"), Ok("coll"));
        assert!(command.body.contains_key("writeConcern"));
    }

    #[test]
    fn wire_version_zero_inserts_into_system_indexes() {
        let mut create = op();
        let request = create
            .build_legacy(&StreamDescription::new_legacy_testing(0))
            .unwrap()
            .expect("wire version 0 must use the legacy path");

        match request {
            LegacyRequest::Insert(insert) => {
                assert_eq!(insert.full_collection_name, "db.system.indexes");
                assert_eq!(insert.documents.len(), 1);
                assert_eq!(insert.documents[0].get_str("ns"), Ok("db.coll"));
                assert_eq!(insert.documents[0].get_str("name"), Ok("a_1"));
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn forced_legacy_overrides_wire_version() {
        let mut create = op().into_legacy();
        assert!(create
            .build_legacy(&StreamDescription::new_testing())
            .unwrap()
            .is_some());
    }
}
