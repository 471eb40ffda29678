use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::{
    stamp_new, stamp_update, BatchOp, CollectionRef, DocRef, Document, DocumentStore, Fields,
    Query, StoreError, CREATED_AT,
};

const CHANGE_CAPACITY: usize = 256;

/// In-process store. Documents keep insertion order within a collection.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    changes: broadcast::Sender<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            collections: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, collection: &str) {
        // No receivers just means nobody is watching.
        let _ = self.changes.send(collection.to_string());
    }
}

fn set_in(collections: &mut HashMap<String, Vec<Document>>, doc: &DocRef, mut fields: Fields) {
    let docs = collections.entry(doc.collection.clone()).or_default();
    match docs.iter_mut().find(|existing| existing.id == doc.id) {
        Some(existing) => {
            if let Some(created) = existing.fields.get(CREATED_AT).cloned() {
                fields.insert(CREATED_AT.to_string(), created);
            }
            stamp_new(&mut fields);
            existing.fields = fields;
        }
        None => {
            stamp_new(&mut fields);
            docs.push(Document {
                id: doc.id.clone(),
                fields,
            });
        }
    }
}

fn update_in(
    collections: &mut HashMap<String, Vec<Document>>,
    doc: &DocRef,
    mut fields: Fields,
) -> Result<(), StoreError> {
    let existing = collections
        .get_mut(&doc.collection)
        .and_then(|docs| docs.iter_mut().find(|existing| existing.id == doc.id))
        .ok_or_else(|| StoreError::NotFound {
            collection: doc.collection.clone(),
            id: doc.id.clone(),
        })?;
    stamp_update(&mut fields);
    existing.fields.extend(fields);
    Ok(())
}

fn delete_in(collections: &mut HashMap<String, Vec<Document>>, doc: &DocRef) {
    if let Some(docs) = collections.get_mut(&doc.collection) {
        docs.retain(|existing| existing.id != doc.id);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_doc(&self, doc: &DocRef) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&doc.collection)
            .and_then(|docs| docs.iter().find(|existing| existing.id == doc.id))
            .cloned())
    }

    async fn get_docs(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| query.matches(&doc.fields))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_doc(
        &self,
        collection: &CollectionRef,
        fields: Fields,
    ) -> Result<DocRef, StoreError> {
        let doc = collection.doc(Uuid::new_v4().to_string());
        {
            let mut collections = self.collections.write().await;
            set_in(&mut collections, &doc, fields);
        }
        self.notify(&collection.name);
        Ok(doc)
    }

    async fn set_doc(&self, doc: &DocRef, fields: Fields) -> Result<(), StoreError> {
        {
            let mut collections = self.collections.write().await;
            set_in(&mut collections, doc, fields);
        }
        self.notify(&doc.collection);
        Ok(())
    }

    async fn update_doc(&self, doc: &DocRef, fields: Fields) -> Result<(), StoreError> {
        {
            let mut collections = self.collections.write().await;
            update_in(&mut collections, doc, fields)?;
        }
        self.notify(&doc.collection);
        Ok(())
    }

    async fn delete_doc(&self, doc: &DocRef) -> Result<(), StoreError> {
        {
            let mut collections = self.collections.write().await;
            delete_in(&mut collections, doc);
        }
        self.notify(&doc.collection);
        Ok(())
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut touched: Vec<String> = Vec::new();
        {
            let mut collections = self.collections.write().await;

            // Ops run against a copy in order, so an update may follow a set of
            // the same document but not a delete. Nothing lands unless every op
            // succeeds.
            let mut staged = collections.clone();
            for op in ops {
                let collection = match op {
                    BatchOp::Set(doc, fields) => {
                        set_in(&mut staged, &doc, fields);
                        doc.collection
                    }
                    BatchOp::Update(doc, fields) => {
                        update_in(&mut staged, &doc, fields)?;
                        doc.collection
                    }
                    BatchOp::Delete(doc) => {
                        delete_in(&mut staged, &doc);
                        doc.collection
                    }
                };
                if !touched.contains(&collection) {
                    touched.push(collection);
                }
            }
            *collections = staged;
        }

        for collection in touched {
            self.notify(&collection);
        }
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}
