//! Two-phase cascading delete.
//!
//! The mark phase walks outward from the seed keys through every foreign key
//! pointing at a marked table (self-references included) until no new row is
//! found. Only then does the delete phase remove the marked rows, children
//! before parents.
//!
//! A foreign key into a composite primary key covers one key component, so
//! a child row is only marked once no surviving parent row carries the
//! component it references.

use super::{CascadePlan, CascadeReport, LifecycleEngine};
use crate::backend::Backend;
use crate::catalog::SchemaModel;
use crate::error::{Error, Operation};
use crate::graph::DependencyGraph;
use crate::value::{PrimaryKey, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;
use tracing::{debug, info, info_span};

impl<B: Backend + ?Sized> LifecycleEngine<'_, B> {
    /// Compute every row a cascading delete of `keys` in `table` would remove.
    ///
    /// Issues only read calls against the backend.
    pub fn plan_cascade(
        &self,
        schema: &SchemaModel,
        table: &str,
        keys: &[PrimaryKey],
    ) -> Result<CascadePlan, Error> {
        let graph = DependencyGraph::build(schema)?;
        let root = schema.table(table)?;
        if !root.has_primary_key() {
            return Err(Error::NoPrimaryKey {
                table: table.to_string(),
            });
        }
        for key in keys {
            if key.values().len() != root.primary_key.len() {
                return Err(Error::KeyArity {
                    table: table.to_string(),
                    expected: root.primary_key.len(),
                    found: key.values().len(),
                });
            }
        }

        let mut marked: BTreeMap<String, BTreeSet<PrimaryKey>> = BTreeMap::new();
        marked.insert(table.to_string(), keys.iter().cloned().collect());

        let mut queue: VecDeque<(String, Vec<PrimaryKey>)> = VecDeque::new();
        queue.push_back((table.to_string(), keys.to_vec()));

        while let Some((parent_name, new_keys)) = queue.pop_front() {
            self.checkpoint(Operation::CascadeDelete, &[])?;
            let parent = schema.table(&parent_name)?;

            for relation in schema.relations_to(&parent_name) {
                let Some(pos) = parent.key_position(&relation.to_column) else {
                    continue;
                };
                let mut values: BTreeSet<Value> = new_keys
                    .iter()
                    .filter_map(|k| k.get(pos).cloned())
                    .collect();
                if parent.primary_key.len() > 1 && !values.is_empty() {
                    // A component stays referenced while an unmarked parent row carries it.
                    let candidates: Vec<Value> = values.iter().cloned().collect();
                    let holders = self
                        .backend
                        .referencing_keys(parent, &relation.to_column, &candidates)
                        .map_err(|source| {
                            self.step_failed(Operation::CascadeDelete, &parent.name, Vec::new(), None, source)
                        })?;
                    let doomed = marked.get(&parent_name);
                    for key in &holders {
                        if !doomed.is_some_and(|d| d.contains(key)) {
                            if let Some(value) = key.get(pos) {
                                values.remove(value);
                            }
                        }
                    }
                }
                if values.is_empty() {
                    continue;
                }

                let child = schema.table(&relation.from_table)?;
                if !child.has_primary_key() {
                    return Err(Error::NoPrimaryKey {
                        table: child.name.clone(),
                    });
                }

                let values: Vec<Value> = values.into_iter().collect();
                let found = self
                    .backend
                    .referencing_keys(child, &relation.from_column, &values)
                    .map_err(|source| {
                        self.step_failed(Operation::CascadeDelete, &child.name, Vec::new(), None, source)
                    })?;

                let entry = marked.entry(child.name.clone()).or_default();
                let fresh: Vec<PrimaryKey> =
                    found.into_iter().filter(|k| entry.insert(k.clone())).collect();
                if !fresh.is_empty() {
                    debug!(
                        table = %child.name,
                        via = %relation.from_column,
                        rows = fresh.len(),
                        "rows marked"
                    );
                    queue.push_back((child.name.clone(), fresh));
                }
            }
        }

        let scope: BTreeSet<String> = marked
            .iter()
            .filter(|(name, keys)| !keys.is_empty() || name.as_str() == table)
            .map(|(name, _)| name.clone())
            .collect();
        let deletions = graph
            .reverse_order_of(&scope)
            .into_iter()
            .map(|name| {
                let keys = marked.remove(&name).unwrap_or_default().into_iter().collect();
                (name, keys)
            })
            .collect();

        Ok(CascadePlan {
            root: table.to_string(),
            deletions,
        })
    }

    /// Delete `keys` from `table` and every row that transitively references them.
    ///
    /// The full set of rows is marked before the first delete is issued.
    /// Deletes then run children first, one table at a time.
    pub fn cascade_delete(
        &self,
        schema: &SchemaModel,
        table: &str,
        keys: &[PrimaryKey],
    ) -> Result<CascadeReport, Error> {
        let span = info_span!(
            "cascade_delete",
            table = %table,
            keys = keys.len(),
            dry_run = self.config.dry_run
        );
        let _enter = span.enter();
        let start = Instant::now();

        let plan = self.plan_cascade(schema, table, keys)?;
        let mut completed = Vec::with_capacity(plan.deletions.len());

        for (name, doomed) in &plan.deletions {
            self.checkpoint(Operation::CascadeDelete, &completed)?;
            let def = schema.table(name)?;

            if !self.config.dry_run && !doomed.is_empty() {
                for chunk in doomed.chunks(self.batch_size()) {
                    if let Err(source) = self.backend.delete_rows(def, chunk) {
                        return Err(self.step_failed(
                            Operation::CascadeDelete,
                            name,
                            completed,
                            None,
                            source,
                        ));
                    }
                }
            }
            debug!(table = %name, rows = doomed.len(), "rows deleted");
            completed.push(name.clone());
        }

        info!(
            tables = completed.len(),
            rows = plan.total_rows(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "cascade delete complete"
        );

        Ok(CascadeReport {
            plan,
            completed_tables: completed,
            dry_run: self.config.dry_run,
        })
    }
}
