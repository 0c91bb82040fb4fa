//! Connection-scoped catalog of backend types.
//!
//! The catalog is read from `pg_type`/`pg_enum` when the connection opens and again on
//! `reload_types`. Host-type mappings registered by callers live alongside it and are
//! dropped with the connection.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio_postgres::Client;
use tokio_postgres::types::{Kind, Type};

use crate::error::SqlMiddlewareDbError;

const CATALOG_QUERY: &str = "\
SELECT t.oid, t.typname::text, n.nspname::text, t.typtype::text, t.typcategory::text, \
       t.typelem, t.typbasetype \
FROM pg_catalog.pg_type t \
JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace \
WHERE t.typtype IN ('b', 'd', 'e', 'p', 'r') \
  AND n.nspname NOT IN ('pg_toast', 'information_schema') \
ORDER BY (n.nspname = 'pg_catalog') DESC, (n.nspname = 'public') DESC, t.oid";

const ENUM_LABELS_QUERY: &str = "\
SELECT enumtypid, enumlabel::text FROM pg_catalog.pg_enum ORDER BY enumtypid, enumsortorder";

#[derive(Debug, Clone)]
struct CatalogRow {
    oid: u32,
    name: String,
    schema: String,
    typtype: String,
    category: String,
    elem: u32,
    base: u32,
}

#[derive(Debug, Default)]
struct Catalog {
    by_oid: HashMap<u32, Type>,
    by_name: HashMap<String, Type>,
}

impl Catalog {
    fn insert(&mut self, ty: Type) {
        let qualified = format!("{}.{}", ty.schema(), ty.name());
        // unqualified names keep the first entry; rows arrive pg_catalog first, then public
        self.by_name
            .entry(ty.name().to_string())
            .or_insert_with(|| ty.clone());
        self.by_name.insert(qualified, ty.clone());
        self.by_oid.insert(ty.oid(), ty);
    }

    /// Build types from catalog rows. Domains and arrays refer to other rows, so they are
    /// resolved in passes until no further progress is made.
    fn build(rows: Vec<CatalogRow>, mut enum_labels: HashMap<u32, Vec<String>>) -> Self {
        let mut catalog = Catalog::default();
        let mut deferred = Vec::new();

        for row in rows {
            if let Some(builtin) = Type::from_oid(row.oid) {
                catalog.insert(builtin);
                continue;
            }
            let kind = match row.typtype.as_str() {
                "e" => Kind::Enum(enum_labels.remove(&row.oid).unwrap_or_default()),
                "p" => Kind::Pseudo,
                "d" | "b" if row.typtype == "d" || row.category == "A" => {
                    deferred.push(row);
                    continue;
                }
                _ => Kind::Simple,
            };
            catalog.insert(Type::new(row.name, row.oid, kind, row.schema));
        }

        loop {
            let before = deferred.len();
            deferred.retain(|row| {
                let target = if row.typtype == "d" { row.base } else { row.elem };
                let Some(inner) = catalog.by_oid.get(&target).cloned() else {
                    return true;
                };
                let kind = if row.typtype == "d" {
                    Kind::Domain(inner)
                } else {
                    Kind::Array(inner)
                };
                catalog.insert(Type::new(row.name.clone(), row.oid, kind, row.schema.clone()));
                false
            });
            if deferred.is_empty() || deferred.len() == before {
                break;
            }
        }
        for row in deferred {
            tracing::debug!(oid = row.oid, name = %row.name, "type left unresolved in catalog");
        }

        catalog
    }
}

/// Per-connection type registry.
///
/// ```rust,no_run
/// # use pg_middleware::prelude::*;
/// # async fn demo(client: PgClient) -> Result<(), SqlMiddlewareDbError> {
/// struct Mood;
/// let mapper = client.type_mapper()?;
/// mapper.map::<Mood>("public.mood");
/// let mood = mapper.type_for::<Mood>()?;
/// # let _ = mood;
/// # Ok(()) }
/// ```
#[derive(Debug, Default)]
pub struct TypeMapper {
    catalog: RwLock<Catalog>,
    mappings: RwLock<HashMap<TypeId, (&'static str, String)>>,
}

impl TypeMapper {
    pub(crate) async fn load(&self, client: &Client) -> Result<(), SqlMiddlewareDbError> {
        let rows = client
            .query(CATALOG_QUERY, &[])
            .await?
            .iter()
            .map(|row| {
                Ok(CatalogRow {
                    oid: row.try_get(0)?,
                    name: row.try_get(1)?,
                    schema: row.try_get(2)?,
                    typtype: row.try_get(3)?,
                    category: row.try_get(4)?,
                    elem: row.try_get(5)?,
                    base: row.try_get(6)?,
                })
            })
            .collect::<Result<Vec<_>, tokio_postgres::Error>>()?;

        let mut enum_labels: HashMap<u32, Vec<String>> = HashMap::new();
        for row in client.query(ENUM_LABELS_QUERY, &[]).await? {
            enum_labels
                .entry(row.try_get(0)?)
                .or_default()
                .push(row.try_get(1)?);
        }

        let catalog = Catalog::build(rows, enum_labels);
        tracing::debug!(types = catalog.by_oid.len(), "type catalog loaded");
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = catalog;
        Ok(())
    }

    /// Look up a backend type by name (`mood` or `public.mood`).
    ///
    /// # Errors
    /// Returns `SqlMiddlewareDbError::UnknownType` if the catalog has no such type.
    pub fn resolve(&self, name: &str) -> Result<Type, SqlMiddlewareDbError> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| SqlMiddlewareDbError::UnknownType(name.to_string()))
    }

    #[must_use]
    pub fn by_oid(&self, oid: u32) -> Option<Type> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_oid
            .get(&oid)
            .cloned()
    }

    /// Number of types in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_oid
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map host type `T` to a backend type name. Replaces any earlier mapping for `T`.
    pub fn map<T: ?Sized + 'static>(&self, pg_name: impl Into<String>) {
        self.mappings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), (std::any::type_name::<T>(), pg_name.into()));
    }

    /// Remove the mapping for `T`; returns whether one existed.
    pub fn unmap<T: ?Sized + 'static>(&self) -> bool {
        self.mappings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&TypeId::of::<T>())
            .is_some()
    }

    /// Resolve the backend type mapped for `T`.
    ///
    /// # Errors
    /// Returns `SqlMiddlewareDbError::UnknownType` if `T` is unmapped or the mapped name is not
    /// in the catalog.
    pub fn type_for<T: ?Sized + 'static>(&self) -> Result<Type, SqlMiddlewareDbError> {
        let pg_name = self
            .mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .map(|(_, pg_name)| pg_name.clone())
            .ok_or_else(|| SqlMiddlewareDbError::UnknownType(std::any::type_name::<T>().to_string()))?;
        self.resolve(&pg_name)
    }

    /// Registered mappings as (host type name, backend type name).
    #[must_use]
    pub fn mappings(&self) -> Vec<(&'static str, String)> {
        let mut mappings: Vec<_> = self
            .mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        mappings.sort();
        mappings
    }
}
