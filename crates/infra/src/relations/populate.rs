//! Read-time population: relational UIDs replaced by the records they name.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use tether_core::{Filter, Record, Uid};

use super::graph::RelationGraph;
use crate::store::{PrimaryStore, StoreError};

/// Expand `record`'s relational fields up to `depth` hops.
///
/// Missing targets stay as UIDs. A record already expanded on the current
/// path is not expanded again, so cyclic links terminate.
pub async fn populate(
    store: &dyn PrimaryStore,
    graph: &RelationGraph,
    record: &Record,
    depth: usize,
) -> Result<Value, StoreError> {
    expand(store, graph, record.clone(), depth, Vec::new()).await
}

fn expand<'a>(
    store: &'a dyn PrimaryStore,
    graph: &'a RelationGraph,
    record: Record,
    depth: usize,
    mut path: Vec<(String, Uid)>,
) -> BoxFuture<'a, Result<Value, StoreError>> {
    async move {
        let mut json = record.to_json();
        if depth == 0 {
            return Ok(json);
        }
        path.push((record.collection.clone(), record.uid.clone()));

        for edge in graph.edges(&record.collection) {
            let target = &edge.opposite.collection;
            let expanded = match record.get(&edge.field) {
                Some(Value::String(uid)) => {
                    resolve(store, graph, target, Uid::from(uid.as_str()), depth, &path).await?
                }
                Some(Value::Array(items)) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        match item.as_str() {
                            Some(uid) => out.push(resolve(store, graph, target, Uid::from(uid), depth, &path).await?),
                            None => out.push(item.clone()),
                        }
                    }
                    Value::Array(out)
                }
                _ => continue,
            };
            if let Some(obj) = json.as_object_mut() {
                obj.insert(edge.field.clone(), expanded);
            }
        }
        Ok(json)
    }
    .boxed()
}

async fn resolve(
    store: &dyn PrimaryStore,
    graph: &RelationGraph,
    collection: &str,
    uid: Uid,
    depth: usize,
    path: &[(String, Uid)],
) -> Result<Value, StoreError> {
    if path.iter().any(|(c, u)| c == collection && *u == uid) {
        return Ok(Value::String(uid.into_string()));
    }
    match store.get_one(collection, &Filter::uid(&uid)).await? {
        Some(linked) => expand(store, graph, linked, depth - 1, path.to_vec()).await,
        None => Ok(Value::String(uid.into_string())),
    }
}
