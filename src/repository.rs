//! CRUD repositories over stored procedures.
//!
//! An entity type is described by an [`EntityMapping`] value supplied at construction,
//! not by subclassing a generic base. Each repository call is one audited gateway
//! operation tagged with the matching [`OperationKind`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::audit::{AuditTarget, OperationKind};
use crate::context::CallOptions;
use crate::error::SprocError;
use crate::gateway::ProcedureGateway;
use crate::params::ProcedureContract;
use crate::results::{NonQueryResult, ResultRow};
use crate::types::{FromRowValue, RowValues};

/// How one entity type maps to procedure parameters and result rows.
pub trait EntityMapping<E>: Send + Sync {
    fn from_row(&self, row: &ResultRow) -> Result<E, SprocError>;

    fn insert_values(&self, entity: &E) -> HashMap<String, RowValues>;

    fn update_values(&self, entity: &E) -> HashMap<String, RowValues>;

    /// Parameters identifying the entity with key `key` (get by id, delete).
    fn key_values(&self, key: &RowValues) -> HashMap<String, RowValues>;

    /// Key of an existing entity.
    fn key_of(&self, entity: &E) -> RowValues;
}

type RowFn<E> = Box<dyn Fn(&ResultRow) -> Result<E, SprocError> + Send + Sync>;
type ValuesFn<E> = Box<dyn Fn(&E) -> HashMap<String, RowValues> + Send + Sync>;
type KeyFn<E> = Box<dyn Fn(&E) -> RowValues + Send + Sync>;

/// An [`EntityMapping`] assembled from closures.
///
/// The key is passed to procedures as the single parameter `key_parameter`.
pub struct FnEntityMapping<E> {
    key_parameter: String,
    from_row: RowFn<E>,
    insert_values: ValuesFn<E>,
    update_values: ValuesFn<E>,
    key_of: KeyFn<E>,
}

impl<E> FnEntityMapping<E> {
    pub fn new(
        key_parameter: impl Into<String>,
        from_row: impl Fn(&ResultRow) -> Result<E, SprocError> + Send + Sync + 'static,
        insert_values: impl Fn(&E) -> HashMap<String, RowValues> + Send + Sync + 'static,
        update_values: impl Fn(&E) -> HashMap<String, RowValues> + Send + Sync + 'static,
        key_of: impl Fn(&E) -> RowValues + Send + Sync + 'static,
    ) -> Self {
        Self {
            key_parameter: key_parameter.into(),
            from_row: Box::new(from_row),
            insert_values: Box::new(insert_values),
            update_values: Box::new(update_values),
            key_of: Box::new(key_of),
        }
    }
}

impl<E> EntityMapping<E> for FnEntityMapping<E> {
    fn from_row(&self, row: &ResultRow) -> Result<E, SprocError> {
        (self.from_row)(row)
    }

    fn insert_values(&self, entity: &E) -> HashMap<String, RowValues> {
        (self.insert_values)(entity)
    }

    fn update_values(&self, entity: &E) -> HashMap<String, RowValues> {
        (self.update_values)(entity)
    }

    fn key_values(&self, key: &RowValues) -> HashMap<String, RowValues> {
        HashMap::from([(self.key_parameter.clone(), key.clone())])
    }

    fn key_of(&self, entity: &E) -> RowValues {
        (self.key_of)(entity)
    }
}

/// The five procedures behind a repository.
///
/// `list_page` takes `@PageNumber` (1-based) and `@PageSize` and returns the page rows as
/// its first result set and the total row count as its second, so both come from the
/// same call and the same snapshot.
#[derive(Debug, Clone)]
pub struct RepositoryProcedures {
    pub get_by_id: Arc<ProcedureContract>,
    pub list_page: Arc<ProcedureContract>,
    pub insert: Arc<ProcedureContract>,
    pub update: Arc<ProcedureContract>,
    pub delete: Arc<ProcedureContract>,
}

/// One page of entities.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<E> {
    pub items: Vec<E>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<E> Page<E> {
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            0
        } else {
            self.total_count.div_ceil(u64::from(self.page_size))
        }
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        u64::from(self.page) < self.total_pages()
    }
}

pub struct ProcedureRepository<E> {
    gateway: ProcedureGateway,
    connection_id: String,
    entity: String,
    mapping: Arc<dyn EntityMapping<E>>,
    procedures: RepositoryProcedures,
}

impl<E> ProcedureRepository<E> {
    pub fn new(
        gateway: ProcedureGateway,
        connection_id: impl Into<String>,
        entity: impl Into<String>,
        mapping: Arc<dyn EntityMapping<E>>,
        procedures: RepositoryProcedures,
    ) -> Self {
        Self {
            gateway,
            connection_id: connection_id.into(),
            entity: entity.into(),
            mapping,
            procedures,
        }
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    fn audited(&self, options: &CallOptions, target: AuditTarget) -> CallOptions {
        options.clone().audit(target)
    }

    fn target(&self, operation: OperationKind, key: Option<&RowValues>) -> AuditTarget {
        let target = AuditTarget::new(operation, self.entity.clone());
        match key {
            Some(key) if !key.is_null() => target.entity_id(key_text(key)),
            _ => target,
        }
    }

    /// # Errors
    /// As [`ProcedureGateway::execute_strict`], or a mapping failure.
    pub async fn get_by_id(
        &self,
        key: impl Into<RowValues>,
        options: &CallOptions,
    ) -> Result<Option<E>, SprocError> {
        let key = key.into();
        let options = self.audited(options, self.target(OperationKind::Read, Some(&key)));
        let result = self
            .gateway
            .execute_strict(
                &self.connection_id,
                &self.procedures.get_by_id,
                &self.mapping.key_values(&key),
                &options,
            )
            .await?;
        result
            .first_set()
            .and_then(|set| set.iter().next())
            .map(|row| self.mapping.from_row(row))
            .transpose()
    }

    /// Fetch page `page` (1-based) of `page_size` entities with the total count.
    ///
    /// # Errors
    /// `SprocError::Validation` for a zero page or page size; otherwise as
    /// [`ProcedureGateway::execute_strict`], or a mapping failure.
    pub async fn list_page(
        &self,
        page: u32,
        page_size: u32,
        options: &CallOptions,
    ) -> Result<Page<E>, SprocError> {
        if page == 0 || page_size == 0 {
            return Err(SprocError::Validation(
                "page and page size must be at least 1".into(),
            ));
        }
        let options = self.audited(options, self.target(OperationKind::Read, None));
        let values = HashMap::from([
            ("PageNumber".to_string(), RowValues::Int(i64::from(page))),
            ("PageSize".to_string(), RowValues::Int(i64::from(page_size))),
        ]);
        let result = self
            .gateway
            .execute_strict(&self.connection_id, &self.procedures.list_page, &values, &options)
            .await?;

        let items = match result.first_set() {
            Some(set) => set
                .iter()
                .map(|row| self.mapping.from_row(row))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let total = match result.result_sets().get(1).and_then(|set| set.first_value()) {
            Some(value) => i64::from_row_value(value)?.unwrap_or(0),
            None => {
                return Err(SprocError::Validation(format!(
                    "{} returned no total count result set",
                    self.procedures.list_page.name()
                )));
            }
        };

        Ok(Page {
            items,
            total_count: u64::try_from(total).unwrap_or(0),
            page,
            page_size,
        })
    }

    /// Insert `entity`; generated keys come back as output parameters.
    ///
    /// # Errors
    /// As [`ProcedureGateway::execute_non_query_with_outputs`].
    pub async fn insert(
        &self,
        entity: &E,
        options: &CallOptions,
    ) -> Result<NonQueryResult, SprocError> {
        let values = self.mapping.insert_values(entity);
        let target = self
            .target(OperationKind::Create, None)
            .after(snapshot(&values));
        let options = self.audited(options, target);
        self.gateway
            .execute_non_query_with_outputs(
                &self.connection_id,
                &self.procedures.insert,
                &values,
                &options,
            )
            .await
    }

    /// Update `entity`, returning the rows affected.
    ///
    /// # Errors
    /// As [`ProcedureGateway::execute_non_query`].
    pub async fn update(&self, entity: &E, options: &CallOptions) -> Result<u64, SprocError> {
        let values = self.mapping.update_values(entity);
        let key = self.mapping.key_of(entity);
        let target = self
            .target(OperationKind::Update, Some(&key))
            .after(snapshot(&values));
        let options = self.audited(options, target);
        self.gateway
            .execute_non_query(&self.connection_id, &self.procedures.update, &values, &options)
            .await
    }

    /// Delete the entity with `key`, returning the rows affected.
    ///
    /// # Errors
    /// As [`ProcedureGateway::execute_non_query`].
    pub async fn delete(
        &self,
        key: impl Into<RowValues>,
        options: &CallOptions,
    ) -> Result<u64, SprocError> {
        let key = key.into();
        let options = self.audited(options, self.target(OperationKind::Delete, Some(&key)));
        self.gateway
            .execute_non_query(
                &self.connection_id,
                &self.procedures.delete,
                &self.mapping.key_values(&key),
                &options,
            )
            .await
    }
}

fn key_text(key: &RowValues) -> String {
    match key {
        RowValues::Text(s) => s.clone(),
        other => other.to_json().to_string(),
    }
}

fn snapshot(values: &HashMap<String, RowValues>) -> JsonValue {
    JsonValue::Object(
        values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        let page = Page::<()> {
            items: vec![],
            total_count: 11,
            page: 2,
            page_size: 5,
        };
        assert_eq!(page.total_pages(), 3);
        assert!(page.has_next());
    }

    #[test]
    fn key_text_is_plain() {
        assert_eq!(key_text(&RowValues::Int(7)), "7");
        assert_eq!(key_text(&"abc".into()), "abc");
    }
}
