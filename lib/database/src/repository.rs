use std::marker::PhantomData;

use serde::Serialize;
use sqlx::{
  QueryBuilder, Sqlite, SqliteConnection, sqlite::SqliteRow,
};

use crate::{
  error::DatabaseError,
  filter::{ColumnRules, FilterQuery, push_order_by, push_where},
};

/// Static description of a stored table: the entity row type, the
/// columns the filter DSL may touch directly, and (optionally) a
/// joined base query exposing remote columns.
pub trait TableSpec {
  type Entity: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin;
  /// Row type returned by the joined query variants.
  type Joined: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin;

  const TABLE: &'static str;
  const COLUMNS: &'static [&'static str];
  const REMOTE_COLUMNS: &'static [(&'static str, &'static str)] =
    &[];

  /// `SELECT … FROM … JOIN …` (no WHERE) for the joined variants.
  fn join_base() -> Option<&'static str> {
    None
  }

  /// COUNT form of [TableSpec::join_base].
  fn join_base_count() -> Option<&'static str> {
    None
  }

  /// Integer-backed columns accept names at the boundary.
  fn translate_enum(
    field: &str,
    value: &str,
  ) -> Result<Option<i64>, DatabaseError> {
    let _ = (field, value);
    Ok(None)
  }

  fn rules() -> ColumnRules {
    ColumnRules {
      table: Self::TABLE,
      columns: Self::COLUMNS,
      remote_columns: Self::REMOTE_COLUMNS,
      translate_enum: Self::translate_enum,
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
  pub page: i64,
  pub page_size: i64,
}

impl PageRequest {
  pub fn new(page: i64, page_size: i64) -> Self {
    Self { page, page_size }
  }

  /// Enforced before any DB read.
  pub fn validate(
    &self,
    max_page_size: i64,
  ) -> Result<(), DatabaseError> {
    if self.page_size > max_page_size {
      return Err(DatabaseError::PageSizeTooLarge {
        page_size: self.page_size,
        max_page_size,
      });
    }
    Ok(())
  }

  fn offset(&self) -> i64 {
    (self.page.max(1) - 1) * self.page_size
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub page: i64,
  pub page_size: i64,
  pub total: i64,
}

/// Capability set shared by every per-entity repository. Write
/// operations are entity-specific and live on the aliases in
/// [crate::repos].
pub struct TableRepository<S>(PhantomData<S>);

impl<S: TableSpec> TableRepository<S> {
  fn base_select() -> String {
    format!("SELECT {table}.* FROM {table}", table = S::TABLE)
  }

  fn join_select() -> Result<&'static str, DatabaseError> {
    S::join_base().ok_or_else(|| {
      DatabaseError::Filter(format!(
        "joined queries are not supported for {}",
        S::TABLE
      ))
    })
  }

  pub async fn filter(
    conn: &mut SqliteConnection,
    query: &FilterQuery,
  ) -> Result<Vec<S::Entity>, DatabaseError> {
    let rules = S::rules();
    let mut qb = QueryBuilder::<Sqlite>::new(Self::base_select());
    push_where(&mut qb, &query.filters, &rules, false)?;
    push_order_by(&mut qb, query.sort.as_ref(), &rules, false)?;
    Ok(
      qb.build_query_as::<S::Entity>()
        .fetch_all(&mut *conn)
        .await?,
    )
  }

  pub async fn first(
    conn: &mut SqliteConnection,
    query: &FilterQuery,
  ) -> Result<Option<S::Entity>, DatabaseError> {
    let rules = S::rules();
    let mut qb = QueryBuilder::<Sqlite>::new(Self::base_select());
    push_where(&mut qb, &query.filters, &rules, false)?;
    push_order_by(&mut qb, query.sort.as_ref(), &rules, false)?;
    qb.push(" LIMIT 1");
    Ok(
      qb.build_query_as::<S::Entity>()
        .fetch_optional(&mut *conn)
        .await?,
    )
  }

  pub async fn get_by_id(
    conn: &mut SqliteConnection,
    id: i64,
  ) -> Result<Option<S::Entity>, DatabaseError> {
    Self::first(conn, &FilterQuery::new().eq("id", id)).await
  }

  pub async fn count(
    conn: &mut SqliteConnection,
  ) -> Result<i64, DatabaseError> {
    Self::count_filter(conn, &FilterQuery::new()).await
  }

  pub async fn count_filter(
    conn: &mut SqliteConnection,
    query: &FilterQuery,
  ) -> Result<i64, DatabaseError> {
    let rules = S::rules();
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
      "SELECT COUNT(*) FROM {}",
      S::TABLE
    ));
    push_where(&mut qb, &query.filters, &rules, false)?;
    Ok(
      qb.build_query_scalar::<i64>()
        .fetch_one(&mut *conn)
        .await?,
    )
  }

  pub async fn filter_paged(
    conn: &mut SqliteConnection,
    query: &FilterQuery,
    page: PageRequest,
    max_page_size: i64,
  ) -> Result<Vec<S::Entity>, DatabaseError> {
    page.validate(max_page_size)?;
    let rules = S::rules();
    let mut qb = QueryBuilder::<Sqlite>::new(Self::base_select());
    push_where(&mut qb, &query.filters, &rules, false)?;
    push_order_by(&mut qb, query.sort.as_ref(), &rules, false)?;
    qb.push(" LIMIT ");
    qb.push_bind(page.page_size);
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());
    Ok(
      qb.build_query_as::<S::Entity>()
        .fetch_all(&mut *conn)
        .await?,
    )
  }

  pub async fn filter_paged_result(
    conn: &mut SqliteConnection,
    query: &FilterQuery,
    page: PageRequest,
    max_page_size: i64,
  ) -> Result<Page<S::Entity>, DatabaseError> {
    let items =
      Self::filter_paged(conn, query, page, max_page_size).await?;
    let total = Self::count_filter(conn, query).await?;
    Ok(Page {
      items,
      page: page.page,
      page_size: page.page_size,
      total,
    })
  }

  pub async fn filter_join(
    conn: &mut SqliteConnection,
    query: &FilterQuery,
  ) -> Result<Vec<S::Joined>, DatabaseError> {
    let rules = S::rules();
    let mut qb = QueryBuilder::<Sqlite>::new(Self::join_select()?);
    push_where(&mut qb, &query.filters, &rules, true)?;
    push_order_by(&mut qb, query.sort.as_ref(), &rules, true)?;
    Ok(
      qb.build_query_as::<S::Joined>()
        .fetch_all(&mut *conn)
        .await?,
    )
  }

  pub async fn count_filter_join(
    conn: &mut SqliteConnection,
    query: &FilterQuery,
  ) -> Result<i64, DatabaseError> {
    let base = S::join_base_count().ok_or_else(|| {
      DatabaseError::Filter(format!(
        "joined queries are not supported for {}",
        S::TABLE
      ))
    })?;
    let rules = S::rules();
    let mut qb = QueryBuilder::<Sqlite>::new(base);
    push_where(&mut qb, &query.filters, &rules, true)?;
    Ok(
      qb.build_query_scalar::<i64>()
        .fetch_one(&mut *conn)
        .await?,
    )
  }

  pub async fn filter_join_paged(
    conn: &mut SqliteConnection,
    query: &FilterQuery,
    page: PageRequest,
    max_page_size: i64,
  ) -> Result<Vec<S::Joined>, DatabaseError> {
    page.validate(max_page_size)?;
    let rules = S::rules();
    let mut qb = QueryBuilder::<Sqlite>::new(Self::join_select()?);
    push_where(&mut qb, &query.filters, &rules, true)?;
    push_order_by(&mut qb, query.sort.as_ref(), &rules, true)?;
    qb.push(" LIMIT ");
    qb.push_bind(page.page_size);
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());
    Ok(
      qb.build_query_as::<S::Joined>()
        .fetch_all(&mut *conn)
        .await?,
    )
  }

  pub async fn filter_join_paged_result(
    conn: &mut SqliteConnection,
    query: &FilterQuery,
    page: PageRequest,
    max_page_size: i64,
  ) -> Result<Page<S::Joined>, DatabaseError> {
    let items =
      Self::filter_join_paged(conn, query, page, max_page_size)
        .await?;
    let total = Self::count_filter_join(conn, query).await?;
    Ok(Page {
      items,
      page: page.page,
      page_size: page.page_size,
      total,
    })
  }

  pub async fn delete_by_id(
    conn: &mut SqliteConnection,
    id: i64,
  ) -> Result<(), DatabaseError> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
      "DELETE FROM {} WHERE id = ",
      S::TABLE
    ));
    qb.push_bind(id);
    qb.build().execute(&mut *conn).await?;
    Ok(())
  }
}
