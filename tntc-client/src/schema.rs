//! Space and index name resolution.
//!
//! The cache loads `_vspace` and `_vindex` wholesale and answers lookups
//! from that snapshot. A snapshot is dropped when the server reports
//! `ER_WRONG_SCHEMA_VERSION`, when the schema version seen in responses
//! moves past the one it was loaded under, or when a name is missing (the
//! object may have been created since).

use crate::client::ClientShared;
use crate::error::ClientError;
use std::collections::HashMap;
use std::sync::Arc;
use tntc_protocol::consts::{PRIMARY_INDEX_ID, VINDEX_ID, VSPACE_ID};
use tntc_protocol::{IteratorType, Request, Value};
use tokio::sync::Mutex;

/// Field positions in `_vspace` tuples.
const SPACE_ID_FIELD: usize = 0;
const SPACE_NAME_FIELD: usize = 2;

/// Field positions in `_vindex` tuples.
const INDEX_SPACE_FIELD: usize = 0;
const INDEX_ID_FIELD: usize = 1;
const INDEX_NAME_FIELD: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceInfo {
    pub id: u32,
    pub name: String,
    pub indexes: HashMap<String, u32>,
}

#[derive(Debug)]
struct SchemaSnapshot {
    generation: u64,
    schema_version: u64,
    spaces: HashMap<String, SpaceInfo>,
}

impl SchemaSnapshot {
    fn build(
        generation: u64,
        schema_version: u64,
        spaces: Vec<Value>,
        indexes: Vec<Value>,
    ) -> Result<Self, ClientError> {
        let mut by_id = HashMap::new();
        for tuple in &spaces {
            let fields = tuple_fields(tuple, "_vspace")?;
            let id = field_u32(fields, SPACE_ID_FIELD, "_vspace")?;
            let name = field_str(fields, SPACE_NAME_FIELD, "_vspace")?;
            by_id.insert(
                id,
                SpaceInfo {
                    id,
                    name: name.to_string(),
                    indexes: HashMap::new(),
                },
            );
        }

        for tuple in &indexes {
            let fields = tuple_fields(tuple, "_vindex")?;
            let space_id = field_u32(fields, INDEX_SPACE_FIELD, "_vindex")?;
            let index_id = field_u32(fields, INDEX_ID_FIELD, "_vindex")?;
            let name = field_str(fields, INDEX_NAME_FIELD, "_vindex")?;
            if let Some(space) = by_id.get_mut(&space_id) {
                space.indexes.insert(name.to_string(), index_id);
            }
        }

        Ok(Self {
            generation,
            schema_version,
            spaces: by_id
                .into_values()
                .map(|space| (space.name.clone(), space))
                .collect(),
        })
    }
}

fn tuple_fields<'a>(tuple: &'a Value, space: &str) -> Result<&'a [Value], ClientError> {
    tuple
        .as_array()
        .ok_or_else(|| ClientError::UnexpectedResponse(format!("{} row is not a tuple", space)))
}

fn field_u32(fields: &[Value], index: usize, space: &str) -> Result<u32, ClientError> {
    fields.get(index).and_then(Value::as_u32).ok_or_else(|| {
        ClientError::UnexpectedResponse(format!("{} field {} is not an id", space, index))
    })
}

fn field_str<'a>(fields: &'a [Value], index: usize, space: &str) -> Result<&'a str, ClientError> {
    fields.get(index).and_then(Value::as_str).ok_or_else(|| {
        ClientError::UnexpectedResponse(format!("{} field {} is not a name", space, index))
    })
}

/// Name to id cache for spaces and indexes.
pub struct SchemaCache {
    shared: Arc<ClientShared>,
    snapshot: Mutex<Option<SchemaSnapshot>>,
}

impl SchemaCache {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        Self {
            shared,
            snapshot: Mutex::new(None),
        }
    }

    /// Resolves a space name to its id.
    pub async fn space_id(&self, space: &str) -> Result<u32, ClientError> {
        self.space(space).await.map(|info| info.id)
    }

    /// Resolves an index name within a space to its id.
    pub async fn index_id(&self, space: &str, index: &str) -> Result<u32, ClientError> {
        let mut info = self.space(space).await?;
        if !info.indexes.contains_key(index) {
            // The index may be newer than the snapshot.
            self.refresh().await?;
            info = self.space(space).await?;
        }
        info.indexes
            .get(index)
            .copied()
            .ok_or_else(|| ClientError::IndexNotFound {
                space: space.to_string(),
                index: index.to_string(),
            })
    }

    /// Returns the definition of a space, reloading once on a miss.
    pub async fn space(&self, space: &str) -> Result<SpaceInfo, ClientError> {
        let mut snapshot = self.snapshot.lock().await;
        if let Some(current) = snapshot.as_ref().filter(|s| self.is_fresh(s)) {
            if let Some(info) = current.spaces.get(space) {
                return Ok(info.clone());
            }
        }

        let loaded = self.load().await?;
        let found = loaded.spaces.get(space).cloned();
        *snapshot = Some(loaded);
        found.ok_or_else(|| ClientError::SpaceNotFound(space.to_string()))
    }

    /// Drops the cached snapshot; the next lookup reloads it.
    pub fn invalidate(&self) {
        self.shared.invalidate_schema();
    }

    /// Reloads the snapshot now.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let loaded = self.load().await?;
        *self.snapshot.lock().await = Some(loaded);
        Ok(())
    }

    fn is_fresh(&self, snapshot: &SchemaSnapshot) -> bool {
        let version = self.shared.schema_version();
        snapshot.generation == self.shared.schema_generation()
            && (version == 0 || version == snapshot.schema_version)
    }

    async fn load(&self) -> Result<SchemaSnapshot, ClientError> {
        let generation = self.shared.schema_generation();
        let spaces = self.select_all(VSPACE_ID).await?;
        let indexes = self.select_all(VINDEX_ID).await?;
        let snapshot = SchemaSnapshot::build(
            generation,
            self.shared.schema_version(),
            spaces,
            indexes,
        )?;
        tracing::debug!(
            "Loaded schema: {} spaces (schema version {})",
            snapshot.spaces.len(),
            snapshot.schema_version
        );
        Ok(snapshot)
    }

    async fn select_all(&self, space_id: u32) -> Result<Vec<Value>, ClientError> {
        let request = Request::select(
            space_id,
            PRIMARY_INDEX_ID,
            Vec::new(),
            0,
            u32::MAX,
            IteratorType::All,
        );
        self.shared.future(&request).await
    }
}
