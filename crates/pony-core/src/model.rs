//! Desired/current state model.
//!
//! Every row carries two optional parts: the *desired* state the hub wants
//! and the *current* state the agents report. Writes are patches. A part is
//! merged into whatever is already there, `None` drops the part, and a row
//! left with neither part is deleted.
//!
//! Columns can be indexed for [`Table::list`] lookups. A table can also be
//! indexed through a join table (an n:m index): the model watches the join
//! table and keeps the index current as join rows come and go.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use pony_types::{Part, RowKey, StateEntry, StateKind};
use serde_json::Value;

use crate::error::ModelError;

/// Called with the table name and the row, before or after it changes.
pub type RowCallback = Box<dyn FnMut(&str, &Row) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct NmIndex {
    join_table: String,
    local: String,
    remote: String,
}

/// Shape of one table: key columns, indexed columns and n:m indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    pkey: Vec<String>,
    indexes: Vec<String>,
    nm_indexes: Vec<NmIndex>,
}

impl TableSchema {
    /// A table keyed by `uuid` with no indexes.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pkey: vec!["uuid".to_string()],
            indexes: Vec::new(),
            nm_indexes: Vec::new(),
        }
    }

    #[must_use]
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pkey = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn index(mut self, column: impl Into<String>) -> Self {
        self.indexes.push(column.into());
        self
    }

    /// Index rows by `remote` through `join_table`, whose `local` column
    /// holds this table's key.
    #[must_use]
    pub fn nm_index(
        mut self,
        join_table: impl Into<String>,
        local: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        self.nm_indexes.push(NmIndex {
            join_table: join_table.into(),
            local: local.into(),
            remote: remote.into(),
        });
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the row `part` belongs to, if it carries every key column.
    #[must_use]
    pub fn primary_key_of(&self, part: &Part) -> Option<RowKey> {
        self.pkey
            .iter()
            .map(|column| part.get(column).map(index_value))
            .collect::<Option<Vec<_>>>()
            .map(RowKey::new)
    }
}

fn index_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pkey: RowKey,
    desired: Option<Part>,
    current: Option<Part>,
}

impl Row {
    fn new(pkey: RowKey) -> Self {
        Self {
            pkey,
            desired: None,
            current: None,
        }
    }

    #[must_use]
    pub fn pkey(&self) -> &RowKey {
        &self.pkey
    }

    #[must_use]
    pub fn desired(&self) -> Option<&Part> {
        self.desired.as_ref()
    }

    #[must_use]
    pub fn current(&self) -> Option<&Part> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn part(&self, state: StateKind) -> Option<&Part> {
        match state {
            StateKind::Desired => self.desired.as_ref(),
            StateKind::Current => self.current.as_ref(),
        }
    }

    fn part_mut(&mut self, state: StateKind) -> &mut Option<Part> {
        match state {
            StateKind::Desired => &mut self.desired,
            StateKind::Current => &mut self.current,
        }
    }

    /// Column value, looked up in the desired state first.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.desired
            .as_ref()
            .and_then(|part| part.get(column))
            .or_else(|| self.current.as_ref().and_then(|part| part.get(column)))
    }

    fn is_empty(&self) -> bool {
        self.desired.is_none() && self.current.is_none()
    }
}

/// Column value to row keys, per state.
#[derive(Debug, Default)]
struct ValueIndex {
    by_state: HashMap<StateKind, HashMap<String, BTreeSet<RowKey>>>,
}

impl ValueIndex {
    fn insert(&mut self, state: StateKind, value: String, key: RowKey) {
        self.by_state
            .entry(state)
            .or_default()
            .entry(value)
            .or_default()
            .insert(key);
    }

    fn remove(&mut self, state: StateKind, value: &str, key: &RowKey) {
        let Some(values) = self.by_state.get_mut(&state) else {
            return;
        };
        if let Some(keys) = values.get_mut(value) {
            keys.remove(key);
            if keys.is_empty() {
                values.remove(value);
            }
        }
    }

    fn keys<'a>(&'a self, value: &'a str) -> impl Iterator<Item = &'a RowKey> + 'a {
        self.by_state
            .values()
            .filter_map(move |values| values.get(value))
            .flatten()
    }
}

#[derive(Debug)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<RowKey, Row>,
    index: HashMap<String, ValueIndex>,
    // Keyed by the remote column
    nm_index: HashMap<String, ValueIndex>,
}

impl Table {
    fn new(schema: TableSchema) -> Self {
        let index = schema
            .indexes
            .iter()
            .map(|column| (column.clone(), ValueIndex::default()))
            .collect();
        let nm_index = schema
            .nm_indexes
            .iter()
            .map(|nm| (nm.remote.clone(), ValueIndex::default()))
            .collect();
        Self {
            schema,
            rows: BTreeMap::new(),
            index,
            nm_index,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    #[must_use]
    pub fn get(&self, pkey: &RowKey) -> Option<&Row> {
        self.rows.get(pkey)
    }

    #[must_use]
    pub fn contains(&self, pkey: &RowKey) -> bool {
        self.rows.contains_key(pkey)
    }

    /// All rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows matching every `(column, value)` pair in either state, through
    /// column or n:m indexes. Pairs naming unindexed columns are ignored; if
    /// none are left, every row matches.
    #[must_use]
    pub fn list(&self, keys: &[(&str, &str)]) -> Vec<&Row> {
        let mut selection: Option<BTreeSet<RowKey>> = None;

        for &(column, value) in keys {
            let indexes: Vec<&ValueIndex> = [self.index.get(column), self.nm_index.get(column)]
                .into_iter()
                .flatten()
                .collect();
            if indexes.is_empty() {
                continue;
            }

            let matched: BTreeSet<RowKey> = indexes
                .iter()
                .flat_map(|index| index.keys(value))
                .cloned()
                .collect();
            selection = Some(match selection {
                None => matched,
                Some(previous) => previous.intersection(&matched).cloned().collect(),
            });
        }

        match selection {
            None => self.rows.values().collect(),
            Some(keys) => keys.iter().filter_map(|key| self.rows.get(key)).collect(),
        }
    }

    fn index_row(&mut self, row: &Row) {
        for state in StateKind::ALL {
            let Some(part) = row.part(state) else {
                continue;
            };
            for (column, index) in &mut self.index {
                if let Some(value) = part.get(column) {
                    index.insert(state, index_value(value), row.pkey.clone());
                }
            }
        }
    }

    fn unindex_row(&mut self, row: &Row) {
        for state in StateKind::ALL {
            let Some(part) = row.part(state) else {
                continue;
            };
            for (column, index) in &mut self.index {
                if let Some(value) = part.get(column) {
                    index.remove(state, &index_value(value), &row.pkey);
                }
            }
        }
    }

    /// Patch one state of one row. Returns the row as it now stands; a
    /// deleted row comes back with both parts empty.
    fn apply(&mut self, pkey: RowKey, state: StateKind, part: Option<Part>) -> Row {
        let mut row = match self.rows.remove(&pkey) {
            Some(row) => {
                self.unindex_row(&row);
                row
            }
            None => Row::new(pkey.clone()),
        };

        let slot = row.part_mut(state);
        match part {
            None => *slot = None,
            Some(part) => {
                if let Some(existing) = slot.as_mut() {
                    existing.extend(part);
                } else {
                    *slot = Some(part);
                }
            }
        }

        if !row.is_empty() {
            self.index_row(&row);
            self.rows.insert(pkey, row.clone());
        }
        row
    }

    fn nm_links<'a>(
        nm: &'a NmIndex,
        row: &'a Row,
    ) -> impl Iterator<Item = (StateKind, String, RowKey)> + 'a {
        StateKind::ALL.into_iter().filter_map(move |state| {
            let part = row.part(state)?;
            let local = part.get(&nm.local)?;
            let remote = part.get(&nm.remote)?;
            Some((state, index_value(remote), RowKey::new([index_value(local)])))
        })
    }

    fn nm_unindex_row(&mut self, join_table: &str, row: &Row) {
        for nm in self.schema.nm_indexes.iter().filter(|nm| nm.join_table == join_table) {
            let Some(index) = self.nm_index.get_mut(&nm.remote) else {
                continue;
            };
            for (state, remote, local) in Self::nm_links(nm, row) {
                index.remove(state, &remote, &local);
            }
        }
    }

    fn nm_index_row(&mut self, join_table: &str, row: &Row) {
        for nm in self.schema.nm_indexes.iter().filter(|nm| nm.join_table == join_table) {
            let Some(index) = self.nm_index.get_mut(&nm.remote) else {
                continue;
            };
            for (state, remote, local) in Self::nm_links(nm, row) {
                index.insert(state, remote, local);
            }
        }
    }
}

/// A set of tables with row-change notifications.
pub struct Model {
    tables: BTreeMap<String, Table>,
    // Join table name to the tables indexing through it
    watchers: HashMap<String, Vec<String>>,
    before: HashMap<String, Vec<RowCallback>>,
    after: HashMap<String, Vec<RowCallback>>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Build a model from table schemas.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::DuplicateTable` if two schemas share a name, and
    /// `ModelError::UnknownJoinTable` if an n:m index names a join table
    /// that is not among `schemas`.
    pub fn new(schemas: impl IntoIterator<Item = TableSchema>) -> Result<Self, ModelError> {
        let mut tables = BTreeMap::new();
        for schema in schemas {
            let name = schema.name.clone();
            if tables.insert(name.clone(), Table::new(schema)).is_some() {
                return Err(ModelError::DuplicateTable(name));
            }
        }

        let mut watchers: HashMap<String, Vec<String>> = HashMap::new();
        for table in tables.values() {
            for nm in &table.schema.nm_indexes {
                if !tables.contains_key(&nm.join_table) {
                    return Err(ModelError::UnknownJoinTable {
                        table: table.name().to_string(),
                        join_table: nm.join_table.clone(),
                    });
                }
                let watching = watchers.entry(nm.join_table.clone()).or_default();
                if !watching.iter().any(|name| name == table.name()) {
                    watching.push(table.name().to_string());
                }
            }
        }

        Ok(Self {
            tables,
            watchers,
            before: HashMap::new(),
            after: HashMap::new(),
        })
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Call `callback` with each row of `table` just before it changes.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::UnknownTable` if there is no such table.
    pub fn on_before_row_update(
        &mut self,
        table: &str,
        callback: impl FnMut(&str, &Row) + Send + 'static,
    ) -> Result<(), ModelError> {
        self.known(table)?;
        self.before
            .entry(table.to_string())
            .or_default()
            .push(Box::new(callback));
        Ok(())
    }

    /// Call `callback` with each row of `table` right after it changed.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::UnknownTable` if there is no such table.
    pub fn on_after_row_update(
        &mut self,
        table: &str,
        callback: impl FnMut(&str, &Row) + Send + 'static,
    ) -> Result<(), ModelError> {
        self.known(table)?;
        self.after
            .entry(table.to_string())
            .or_default()
            .push(Box::new(callback));
        Ok(())
    }

    fn known(&self, table: &str) -> Result<(), ModelError> {
        if self.tables.contains_key(table) {
            Ok(())
        } else {
            Err(ModelError::UnknownTable(table.to_string()))
        }
    }

    /// Patch `state` of the row keyed `pkey` with `part`, or drop that state
    /// when `part` is `None`. A row with neither state left is deleted.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::UnknownTable` if there is no such table.
    pub fn update_row(
        &mut self,
        table: &str,
        pkey: RowKey,
        state: StateKind,
        part: Option<Part>,
    ) -> Result<(), ModelError> {
        let Some(target) = self.tables.get_mut(table) else {
            return Err(ModelError::UnknownTable(table.to_string()));
        };

        let old = target
            .get(&pkey)
            .cloned()
            .unwrap_or_else(|| Row::new(pkey.clone()));
        for callback in self.before.get_mut(table).into_iter().flatten() {
            callback(table, &old);
        }

        let row = target.apply(pkey, state, part);

        for name in self.watchers.get(table).into_iter().flatten() {
            if let Some(watcher) = self.tables.get_mut(name) {
                watcher.nm_unindex_row(table, &old);
                watcher.nm_index_row(table, &row);
            }
        }

        for callback in self.after.get_mut(table).into_iter().flatten() {
            callback(table, &row);
        }
        Ok(())
    }

    /// Drop every row. Callbacks stay registered and are not called.
    pub fn clear(&mut self) {
        for table in self.tables.values_mut() {
            table.rows.clear();
            for index in table.index.values_mut().chain(table.nm_index.values_mut()) {
                *index = ValueIndex::default();
            }
        }
    }

    /// Every present part of the given states, table by table in key order.
    /// [`Model::load`] replays the output.
    #[must_use]
    pub fn dump(&self, states: &[StateKind]) -> Vec<StateEntry> {
        let mut entries = Vec::new();
        for (name, table) in &self.tables {
            for row in table.rows() {
                for &state in states {
                    if let Some(part) = row.part(state) {
                        entries.push(StateEntry {
                            table: name.clone(),
                            pkey: row.pkey.clone(),
                            state,
                            part: part.clone(),
                        });
                    }
                }
            }
        }
        entries
    }

    /// Apply previously dumped entries.
    ///
    /// # Errors
    ///
    /// Stops at the first entry naming an unknown table.
    pub fn load(&mut self, entries: impl IntoIterator<Item = StateEntry>) -> Result<(), ModelError> {
        for entry in entries {
            self.update_row(&entry.table, entry.pkey, entry.state, Some(entry.part))?;
        }
        Ok(())
    }
}
