//! Record store of one simulated database.
//!
//! The same structure serves as the committed state shared by the cluster and
//! as each node's replica. `seq` counts applied writes, so a replica is in sync
//! exactly when its `seq` equals the committed one.

use faultline_core::{Error, QueryResult, Record, RecordId, Result, Statement};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Records of one database plus its write sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseState {
    seq: u64,
    next_id: u64,
    records: BTreeMap<u64, Record>,
}

impl DatabaseState {
    /// Number of writes applied so far.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the database holds no record.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records of a type.
    pub fn count_of(&self, type_name: &str) -> usize {
        self.records.values().filter(|record| record.type_name == type_name).count()
    }

    fn select(&self, type_name: &str, filter: Option<&(String, Value)>) -> Vec<Record> {
        self.records
            .values()
            .filter(|record| record.type_name == type_name)
            .filter(|record| match filter {
                Some((field, value)) => record.fields.get(field) == Some(value),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Whether a statement changes state.
    pub fn is_write(statement: &Statement) -> bool {
        matches!(
            statement,
            Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. }
        )
    }

    /// Answer a read-only statement.
    pub fn read(&self, statement: &Statement) -> Result<QueryResult> {
        match statement {
            Statement::Select { type_name, filter } => {
                Ok(QueryResult::Rows(self.select(type_name, filter.as_ref())))
            },
            Statement::Count { type_name } => {
                Ok(QueryResult::Scalar(i64::try_from(self.count_of(type_name)).unwrap_or(i64::MAX)))
            },
            Statement::Command(command) => Err(Error::Unsupported(format!("command {command}"))),
            _ => Err(Error::internal("write statement routed to read path")),
        }
    }

    /// Apply a write statement. State is untouched when it fails.
    pub fn apply(&mut self, statement: &Statement) -> Result<QueryResult> {
        let result = match statement {
            Statement::Insert { type_name, fields } => {
                self.next_id += 1;
                let record = Record {
                    id: RecordId(self.next_id),
                    type_name: type_name.clone(),
                    version: 1,
                    fields: fields.clone(),
                };
                self.records.insert(self.next_id, record.clone());
                QueryResult::Created(record)
            },
            Statement::Update { id, fields, expected_version } => {
                let record = self.guarded(*id, *expected_version)?;
                for (name, value) in fields {
                    record.fields.insert(name.clone(), value.clone());
                }
                record.version += 1;
                QueryResult::Affected(1)
            },
            Statement::Delete { id, expected_version } => {
                self.guarded(*id, *expected_version)?;
                self.records.remove(&id.0);
                QueryResult::Affected(1)
            },
            other => return self.read(other),
        };
        self.seq += 1;
        Ok(result)
    }

    /// Apply every statement or none of them.
    pub fn apply_all(&mut self, statements: &[Statement]) -> Result<()> {
        let mut staged = self.clone();
        for statement in statements {
            staged.apply(statement)?;
        }
        *self = staged;
        Ok(())
    }

    fn guarded(&mut self, id: RecordId, expected_version: Option<u64>) -> Result<&mut Record> {
        let record = self
            .records
            .get_mut(&id.0)
            .ok_or_else(|| Error::RecordNotFound { record: id.to_string() })?;
        match expected_version {
            Some(expected) if expected != record.version => Err(Error::Conflict {
                record: id.to_string(),
                expected,
                actual: record.version,
            }),
            _ => Ok(record),
        }
    }
}

/// Node snapshot written on graceful shutdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Replica of every database the node held
    pub databases: BTreeMap<String, DatabaseState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_core::Fields;
    use serde_json::json;

    fn fields(key: &str, value: i64) -> Fields {
        let mut fields = Fields::new();
        fields.insert(key.to_string(), json!(value));
        fields
    }

    #[test]
    fn test_insert_update_delete() {
        let mut state = DatabaseState::default();
        let created = state.apply(&Statement::insert("Item", fields("n", 1))).unwrap();
        let QueryResult::Created(record) = created else { panic!("expected created record") };
        assert_eq!(record.version, 1);
        assert_eq!(state.count_of("Item"), 1);

        state.apply(&Statement::update(record.id, fields("n", 2), 1)).unwrap();
        let rows = state.read(&Statement::select_where("Item", "n", json!(2))).unwrap();
        assert_eq!(rows.rows().len(), 1);
        assert_eq!(rows.rows()[0].version, 2);

        state
            .apply(&Statement::Delete { id: record.id, expected_version: Some(2) })
            .unwrap();
        assert!(state.is_empty());
        assert_eq!(state.seq(), 3);
    }

    #[test]
    fn test_stale_version_conflicts_without_change() {
        let mut state = DatabaseState::default();
        state.apply(&Statement::insert("Item", fields("n", 1))).unwrap();
        state.apply(&Statement::update(RecordId(1), fields("n", 2), 1)).unwrap();

        let err = state.apply(&Statement::update(RecordId(1), fields("n", 3), 1)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(state.seq(), 2);
        let rows = state.read(&Statement::select_all("Item")).unwrap();
        assert_eq!(rows.rows()[0].int_field("n"), Some(2));
    }

    #[test]
    fn test_apply_all_is_atomic() {
        let mut state = DatabaseState::default();
        let batch = vec![
            Statement::insert("Item", fields("n", 1)),
            Statement::update(RecordId(42), fields("n", 1), 1),
        ];
        assert!(matches!(state.apply_all(&batch), Err(Error::RecordNotFound { .. })));
        assert!(state.is_empty());
        assert_eq!(state.seq(), 0);
    }

    #[test]
    fn test_count_statement() {
        let mut state = DatabaseState::default();
        for n in 0..3 {
            state.apply(&Statement::insert("Item", fields("n", n))).unwrap();
        }
        state.apply(&Statement::insert("Other", Fields::new())).unwrap();
        assert_eq!(state.read(&Statement::count("Item")).unwrap().scalar(), Some(3));
        assert!(state.read(&Statement::Command("REBUILD".into())).is_err());
    }
}
