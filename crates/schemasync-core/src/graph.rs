//! Foreign-key dependency graph.
//!
//! Nodes are table names held in an index arena; edges run from a child
//! (the table declaring a foreign key) to its parent (the referenced table).
//! Self-references are recorded but never take part in ordering.

use crate::catalog::{SchemaModel, TableDef};
use crate::error::Error;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Read-only dependency view over a schema.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Table names, ascending. A table's index is its position here.
    names: Vec<String>,
    /// Name to index.
    index: HashMap<String, usize>,
    /// For each table, the tables it references.
    parents: Vec<Vec<usize>>,
    /// For each table, the tables referencing it.
    children: Vec<Vec<usize>>,
    /// Whether a table references itself.
    self_referencing: Vec<bool>,
    /// Topological order (parents first, ties by name).
    order: Vec<usize>,
    /// Longest parent chain above each table.
    rank: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph for a schema, re-checking acyclicity.
    pub fn build(schema: &SchemaModel) -> Result<Self, Error> {
        Self::from_tables(schema.tables())
    }

    pub(crate) fn from_tables(tables: &BTreeMap<String, TableDef>) -> Result<Self, Error> {
        let names: Vec<String> = tables.keys().cloned().collect();
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut parents = vec![BTreeSet::new(); names.len()];
        let mut children = vec![BTreeSet::new(); names.len()];
        let mut self_referencing = vec![false; names.len()];

        for (child, table) in tables.values().enumerate() {
            for relation in &table.relations {
                let Some(&parent) = index.get(&relation.to_table) else {
                    continue;
                };
                if parent == child {
                    self_referencing[child] = true;
                    continue;
                }
                parents[child].insert(parent);
                children[parent].insert(child);
            }
        }

        let parents: Vec<Vec<usize>> = parents.into_iter().map(|s| s.into_iter().collect()).collect();
        let children: Vec<Vec<usize>> =
            children.into_iter().map(|s| s.into_iter().collect()).collect();

        let mut graph = Self {
            names,
            index,
            parents,
            children,
            self_referencing,
            order: Vec::new(),
            rank: Vec::new(),
        };
        graph.sort()?;
        Ok(graph)
    }

    /// Kahn's algorithm with an ordered ready set so ties break by name.
    fn sort(&mut self) -> Result<(), Error> {
        let n = self.names.len();
        let mut pending: Vec<usize> = self.parents.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut rank = vec![0usize; n];
        let mut order = Vec::with_capacity(n);

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &child in &self.children[node] {
                rank[child] = rank[child].max(rank[node] + 1);
                pending[child] -= 1;
                if pending[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() < n {
            let remaining: BTreeSet<usize> = (0..n).filter(|&i| pending[i] > 0).collect();
            return Err(Error::CyclicSchema {
                tables: self.find_cycle(&remaining),
            });
        }

        self.order = order;
        self.rank = rank;
        Ok(())
    }

    /// Name the tables of one cycle among nodes Kahn's algorithm could not emit.
    ///
    /// Every such node still has an unemitted parent, so following parent
    /// edges inside the set must eventually revisit a node.
    fn find_cycle(&self, remaining: &BTreeSet<usize>) -> Vec<String> {
        let Some(&start) = remaining.first() else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut seen_at = HashMap::from([(start, 0usize)]);
        let mut current = start;
        loop {
            let next = self.parents[current]
                .iter()
                .copied()
                .find(|p| remaining.contains(p));
            let Some(next) = next else {
                break;
            };
            if let Some(&pos) = seen_at.get(&next) {
                path.drain(..pos);
                break;
            }
            seen_at.insert(next, path.len());
            path.push(next);
            current = next;
        }

        let mut tables: Vec<String> = path.into_iter().map(|i| self.names[i].clone()).collect();
        tables.sort();
        tables
    }

    fn idx(&self, table: &str) -> Result<usize, Error> {
        self.index
            .get(table)
            .copied()
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    fn names_of(&self, set: impl IntoIterator<Item = usize>) -> BTreeSet<String> {
        set.into_iter().map(|i| self.names[i].clone()).collect()
    }

    fn reachable(&self, start: usize, edges: &[Vec<usize>]) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &next in &edges[node] {
                if next != start && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Tables in creation/insertion order: every parent before its children.
    pub fn topological_order(&self) -> Vec<String> {
        self.order.iter().map(|&i| self.names[i].clone()).collect()
    }

    /// Exact reverse of [`topological_order`](Self::topological_order).
    pub fn reverse_order(&self) -> Vec<String> {
        self.order
            .iter()
            .rev()
            .map(|&i| self.names[i].clone())
            .collect()
    }

    /// Reverse order restricted to the given tables.
    pub fn reverse_order_of(&self, tables: &BTreeSet<String>) -> Vec<String> {
        self.order
            .iter()
            .rev()
            .map(|&i| &self.names[i])
            .filter(|name| tables.contains(*name))
            .cloned()
            .collect()
    }

    /// All tables that directly or transitively reference `table`.
    pub fn descendants(&self, table: &str) -> Result<BTreeSet<String>, Error> {
        let start = self.idx(table)?;
        Ok(self.names_of(self.reachable(start, &self.children)))
    }

    /// All tables `table` directly or transitively references.
    pub fn ancestors(&self, table: &str) -> Result<BTreeSet<String>, Error> {
        let start = self.idx(table)?;
        Ok(self.names_of(self.reachable(start, &self.parents)))
    }

    /// Tables that directly reference `table`.
    pub fn dependents(&self, table: &str) -> Result<BTreeSet<String>, Error> {
        let i = self.idx(table)?;
        Ok(self.names_of(self.children[i].iter().copied()))
    }

    /// Tables `table` directly references.
    pub fn dependencies(&self, table: &str) -> Result<BTreeSet<String>, Error> {
        let i = self.idx(table)?;
        Ok(self.names_of(self.parents[i].iter().copied()))
    }

    /// Tables grouped by depth; tables within a group are mutually independent.
    pub fn ranks(&self) -> Vec<Vec<String>> {
        let depth = self.rank.iter().copied().max().map_or(0, |m| m + 1);
        let mut ranks = vec![Vec::new(); depth];
        for &i in &self.order {
            ranks[self.rank[i]].push(self.names[i].clone());
        }
        for group in &mut ranks {
            group.sort();
        }
        ranks
    }

    /// Check if a table references itself.
    pub fn is_self_referencing(&self, table: &str) -> bool {
        self.index
            .get(table)
            .is_some_and(|&i| self.self_referencing[i])
    }

    /// Check if a table is in the graph.
    pub fn contains(&self, table: &str) -> bool {
        self.index.contains_key(table)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if the graph has no tables.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
