/// Feature writers
///
/// `UpdateWriter` walks the features of a query and stages changes on the
/// current one; `write` issues an UPDATE by id for the dirty attributes and
/// `remove` a DELETE by id. `InsertWriter` buffers new features and inserts
/// them in batches; rows still buffered when it is dropped are flushed, and a
/// failure there can only be logged, so callers that need the outcome use
/// `close`.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};
use crate::core::{Feature, FeatureSchema, StagedFeature, StoreError, Value};
use crate::filter::Filter;
use crate::sql::{Query, TableSource};
use crate::transaction::Transaction;
use super::dml::DmlExecutor;
use super::events::FeatureEvent;
use super::post::FeatureStream;
use super::store::{run_statement, DataStore};

pub struct UpdateWriter<'s> {
    store: &'s DataStore,
    tx: &'s Transaction,
    source: TableSource,
    stream: FeatureStream,
    current: Option<StagedFeature>,
}

impl<'s> UpdateWriter<'s> {
    pub fn open(store: &'s DataStore, query: &Query, tx: &'s Transaction) -> Result<Self, StoreError> {
        let source = store.source(&query.type_name, tx, &query.hints.virtual_table_parameters)?;
        if source.key.is_null() {
            return Err(StoreError::Unsupported(format!(
                "'{}' has no primary key; rows cannot be modified one by one",
                query.type_name
            )));
        }
        let stream = store.features(query, tx)?;
        Ok(Self {
            store,
            tx,
            source,
            stream,
            current: None,
        })
    }

    /// Advances to the next feature. Unwritten changes on the previous one
    /// are discarded.
    pub fn next(&mut self) -> Result<Option<&mut StagedFeature>, StoreError> {
        self.current = match self.stream.next() {
            Some(feature) => Some(StagedFeature::new(feature?)),
            None => None,
        };
        Ok(self.current.as_mut())
    }

    fn current_id(&self) -> Result<String, StoreError> {
        self.current
            .as_ref()
            .map(|staged| staged.id().to_string())
            .ok_or_else(|| StoreError::IllegalState("writer has no current feature".to_string()))
    }

    /// Writes the dirty attributes of the current feature
    pub fn write(&mut self) -> Result<(), StoreError> {
        let id = self.current_id()?;
        let Some(staged) = self.current.take() else {
            return Ok(());
        };
        if !staged.is_dirty() {
            self.current = Some(staged);
            return Ok(());
        }
        let type_name = self.source.type_name().to_string();
        self.store.locks().check(&type_name, &id, self.tx)?;

        let feature = staged.feature();
        let mut attributes = Vec::new();
        let mut values = Vec::new();
        for index in staged.dirty_indices() {
            let attr = &feature.schema.attributes[index];
            if self.source.key.contains(&attr.name) {
                continue;
            }
            attributes.push(attr.clone());
            values.push(feature.values.get(index).cloned().unwrap_or(Value::Null));
        }
        let filter = Filter::Id(vec![id]);
        let statement = self.store.builder().update(&self.source, &attributes, &values, &filter)?;
        let mut lease = self.store.connector().acquire(self.tx)?;
        let result = run_statement(&mut lease, self.store.dialect().as_ref(), &statement);
        lease.release();
        result?;

        // The written state becomes the new clean baseline
        self.current = Some(StagedFeature::new(staged.into_feature()));
        self.store.events().publish(&FeatureEvent::Modified { type_name, filter });
        Ok(())
    }

    /// Deletes the current feature
    pub fn remove(&mut self) -> Result<(), StoreError> {
        let id = self.current_id()?;
        let type_name = self.source.type_name().to_string();
        self.store.locks().check(&type_name, &id, self.tx)?;
        let filter = Filter::Id(vec![id.clone()]);
        let statement = self.store.builder().delete(&self.source, &filter)?;
        let mut lease = self.store.connector().acquire(self.tx)?;
        let result = run_statement(&mut lease, self.store.dialect().as_ref(), &statement);
        lease.release();
        result?;
        self.current = None;
        self.store.locks().release(&type_name, &[id]);
        self.store.events().publish(&FeatureEvent::Removed { type_name, filter });
        Ok(())
    }

    /// Releases the underlying cursor
    pub fn close(self) {
        self.stream.close();
    }
}

impl std::fmt::Debug for UpdateWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateWriter")
            .field("type_name", &self.source.type_name())
            .field("current", &self.current.as_ref().map(StagedFeature::id))
            .finish_non_exhaustive()
    }
}

/// Buffers new features and inserts them `batch_insert_size` at a time
pub struct InsertWriter<'s> {
    store: &'s DataStore,
    tx: &'s Transaction,
    type_name: String,
    schema: Arc<FeatureSchema>,
    pending: Vec<Feature>,
    batch_size: usize,
    inserted: Vec<String>,
}

impl<'s> InsertWriter<'s> {
    pub fn open(store: &'s DataStore, type_name: &str, tx: &'s Transaction) -> Result<Self, StoreError> {
        let config = store.config();
        let schema = store.schema_for(type_name, config.expose_primary_keys, tx, &HashMap::new())?;
        Ok(Self {
            store,
            tx,
            type_name: type_name.to_string(),
            schema,
            pending: Vec::new(),
            batch_size: config.batch_insert_size.max(1),
            inserted: Vec::new(),
        })
    }

    /// Blank feature of this writer's type
    #[must_use]
    pub fn new_feature(&self) -> Feature {
        Feature::empty(Arc::clone(&self.schema))
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queues `feature`; a full buffer is flushed. Returns the ids assigned
    /// by that flush, if one happened.
    pub fn write(&mut self, feature: Feature) -> Result<Vec<String>, StoreError> {
        self.pending.push(feature);
        if self.pending.len() >= self.batch_size {
            return self.flush();
        }
        Ok(Vec::new())
    }

    /// Inserts everything buffered. An empty buffer runs no SQL.
    pub fn flush(&mut self) -> Result<Vec<String>, StoreError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = std::mem::take(&mut self.pending);
        debug!(type_name = %self.type_name, rows = batch.len(), "flushing insert buffer");
        let ids = DmlExecutor::insert(self.store, &self.type_name, &mut batch, self.tx)?;
        self.inserted.extend(ids.iter().cloned());
        Ok(ids)
    }

    /// Flushes and returns every id this writer inserted
    pub fn close(mut self) -> Result<Vec<String>, StoreError> {
        self.flush()?;
        Ok(std::mem::take(&mut self.inserted))
    }
}

impl Drop for InsertWriter<'_> {
    fn drop(&mut self) {
        let rows = self.pending.len();
        if rows == 0 {
            return;
        }
        debug!(type_name = %self.type_name, rows, "insert writer dropped with buffered rows");
        if let Err(e) = self.flush() {
            error!(type_name = %self.type_name, rows, error = %e, "buffered rows lost when insert writer was dropped");
        }
    }
}

impl std::fmt::Debug for InsertWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertWriter")
            .field("type_name", &self.type_name)
            .field("pending", &self.pending.len())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}
