use sqlx::{QueryBuilder, Sqlite};

use crate::error::DatabaseError;

/// Comparison operators accepted by the filter DSL. At the string
/// boundary these arrive as a `field__op` suffix; bare fields mean
/// equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
  Eq,
  Like,
  Gt,
  Ge,
  Lt,
  Le,
  In,
  Match,
}

impl FilterOp {
  fn parse(suffix: &str) -> Result<Self, DatabaseError> {
    let op = match suffix {
      "like" => FilterOp::Like,
      "gt" => FilterOp::Gt,
      "ge" => FilterOp::Ge,
      "lt" => FilterOp::Lt,
      "le" => FilterOp::Le,
      "in" => FilterOp::In,
      "match" => FilterOp::Match,
      other => {
        return Err(DatabaseError::Filter(format!(
          "unsupported query option {other}"
        )));
      }
    };
    Ok(op)
  }

  fn sql(self) -> &'static str {
    match self {
      FilterOp::Eq => "=",
      FilterOp::Like => "LIKE",
      FilterOp::Gt => ">",
      FilterOp::Ge => ">=",
      FilterOp::Lt => "<",
      FilterOp::Le => "<=",
      FilterOp::In => "IN",
      FilterOp::Match => "REGEXP",
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
  Text(String),
  Int(i64),
  List(Vec<FilterValue>),
}

impl From<&str> for FilterValue {
  fn from(value: &str) -> Self {
    FilterValue::Text(value.to_string())
  }
}

impl From<String> for FilterValue {
  fn from(value: String) -> Self {
    FilterValue::Text(value)
  }
}

impl From<i64> for FilterValue {
  fn from(value: i64) -> Self {
    FilterValue::Int(value)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
  pub field: String,
  pub op: FilterOp,
  pub value: FilterValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
  #[default]
  Asc,
  Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
  pub field: String,
  pub order: SortOrder,
}

/// Per-table rules the DSL is checked against: the table name,
/// directly filterable columns, remote (joined) columns, and
/// enum-name translation for integer-backed columns.
pub struct ColumnRules {
  pub table: &'static str,
  pub columns: &'static [&'static str],
  pub remote_columns: &'static [(&'static str, &'static str)],
  pub translate_enum:
    fn(&str, &str) -> Result<Option<i64>, DatabaseError>,
}

impl ColumnRules {
  /// Resolves a filter key to a qualified column. Remote columns are
  /// only legal when the caller is running a joined query.
  fn resolve(
    &self,
    field: &str,
    remote_allowed: bool,
  ) -> Result<String, DatabaseError> {
    if self.columns.contains(&field) {
      return Ok(format!("{}.{}", self.table, field));
    }
    if let Some((_, col)) =
      self.remote_columns.iter().find(|(key, _)| *key == field)
    {
      if !remote_allowed {
        return Err(DatabaseError::Filter(format!(
          "{field} is a remote entity column, use a joined query"
        )));
      }
      return Ok((*col).to_string());
    }
    Err(DatabaseError::Filter(format!("unknown field {field}")))
  }

  fn translate(
    &self,
    field: &str,
    value: &str,
  ) -> Result<FilterValue, DatabaseError> {
    match (self.translate_enum)(field, value)? {
      Some(int) => Ok(FilterValue::Int(int)),
      None => Ok(FilterValue::Text(value.to_string())),
    }
  }
}

/// A parsed filter set plus optional ordering directive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterQuery {
  pub filters: Vec<Filter>,
  pub sort: Option<Sort>,
}

impl FilterQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn and(
    mut self,
    field: impl Into<String>,
    op: FilterOp,
    value: impl Into<FilterValue>,
  ) -> Self {
    self.filters.push(Filter {
      field: field.into(),
      op,
      value: value.into(),
    });
    self
  }

  pub fn eq(
    self,
    field: impl Into<String>,
    value: impl Into<FilterValue>,
  ) -> Self {
    self.and(field, FilterOp::Eq, value)
  }

  pub fn order_by(
    mut self,
    field: impl Into<String>,
    order: SortOrder,
  ) -> Self {
    self.sort = Some(Sort {
      field: field.into(),
      order,
    });
    self
  }

  /// Parses boundary-form `field` / `field__op` pairs, including the
  /// `sort_by` / `order_by` directives. Enum-valued columns are
  /// translated by name to their stored integer here.
  pub fn parse(
    pairs: &[(&str, &str)],
    rules: &ColumnRules,
  ) -> Result<Self, DatabaseError> {
    let mut query = FilterQuery::new();
    let mut order = SortOrder::Asc;

    for (key, value) in pairs {
      match *key {
        "sort_by" => {
          let field = value.to_string();
          match &mut query.sort {
            Some(sort) => sort.field = field,
            None => query.sort = Some(Sort { field, order }),
          }
          continue;
        }
        "order_by" => {
          order = match *value {
            "desc" => SortOrder::Desc,
            _ => SortOrder::Asc,
          };
          if let Some(sort) = &mut query.sort {
            sort.order = order;
          }
          continue;
        }
        _ => {}
      }

      let (field, op) = match key.split_once("__") {
        Some((field, suffix)) => (field, FilterOp::parse(suffix)?),
        None => (*key, FilterOp::Eq),
      };

      // Validate the field exists at all; join legality is enforced
      // again at build time against the query being run.
      rules.resolve(field, true)?;

      let value = if op == FilterOp::In {
        FilterValue::List(
          value
            .split(',')
            .map(|part| rules.translate(field, part))
            .collect::<Result<Vec<_>, _>>()?,
        )
      } else {
        rules.translate(field, value)?
      };

      query.filters.push(Filter {
        field: field.to_string(),
        op,
        value,
      });
    }

    Ok(query)
  }
}

fn push_value(
  qb: &mut QueryBuilder<'_, Sqlite>,
  value: &FilterValue,
) {
  match value {
    FilterValue::Text(text) => {
      qb.push_bind(text.clone());
    }
    FilterValue::Int(int) => {
      qb.push_bind(*int);
    }
    // Lists are flattened by the IN arm below.
    FilterValue::List(_) => {}
  }
}

/// Appends `WHERE …` for the filter set. `remote_allowed` mirrors
/// whether the running query includes the table's join base.
pub(crate) fn push_where(
  qb: &mut QueryBuilder<'_, Sqlite>,
  filters: &[Filter],
  rules: &ColumnRules,
  remote_allowed: bool,
) -> Result<(), DatabaseError> {
  if filters.is_empty() {
    return Ok(());
  }

  qb.push(" WHERE ");
  for (i, filter) in filters.iter().enumerate() {
    if i > 0 {
      qb.push(" AND ");
    }
    let column = rules.resolve(&filter.field, remote_allowed)?;
    qb.push(column);

    match (&filter.op, &filter.value) {
      (FilterOp::In, FilterValue::List(values)) => {
        qb.push(" IN (");
        for (j, value) in values.iter().enumerate() {
          if j > 0 {
            qb.push(", ");
          }
          push_value(qb, value);
        }
        qb.push(")");
      }
      (FilterOp::In, single) => {
        qb.push(" IN (");
        push_value(qb, single);
        qb.push(")");
      }
      (op, value) => {
        qb.push(" ");
        qb.push(op.sql());
        qb.push(" ");
        push_value(qb, value);
      }
    }
  }

  Ok(())
}

pub(crate) fn push_order_by(
  qb: &mut QueryBuilder<'_, Sqlite>,
  sort: Option<&Sort>,
  rules: &ColumnRules,
  remote_allowed: bool,
) -> Result<(), DatabaseError> {
  let Some(sort) = sort else {
    return Ok(());
  };
  let column = rules.resolve(&sort.field, remote_allowed)?;
  qb.push(" ORDER BY ");
  qb.push(column);
  if sort.order == SortOrder::Desc {
    qb.push(" DESC");
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn task_rules() -> ColumnRules {
    ColumnRules {
      table: "task",
      columns: &["id", "name", "state", "task_type", "date_created"],
      remote_columns: &[("repo_name", "repo.name")],
      translate_enum: |field, value| {
        if field == "state" {
          return match value {
            "queued" => Ok(Some(1)),
            "failed" => Ok(Some(4)),
            other => Err(DatabaseError::Filter(format!(
              "unknown state {other}"
            ))),
          };
        }
        Ok(None)
      },
    }
  }

  #[test]
  fn parses_bare_key_as_equality() {
    let query =
      FilterQuery::parse(&[("name", "sync")], &task_rules())
        .unwrap();
    assert_eq!(query.filters.len(), 1);
    assert_eq!(query.filters[0].op, FilterOp::Eq);
    assert_eq!(query.filters[0].value, "sync".into());
  }

  #[test]
  fn parses_suffixed_ops_and_sort() {
    let query = FilterQuery::parse(
      &[
        ("date_created__ge", "2024-01-01"),
        ("name__like", "%sync%"),
        ("sort_by", "date_created"),
        ("order_by", "desc"),
      ],
      &task_rules(),
    )
    .unwrap();
    assert_eq!(query.filters.len(), 2);
    assert_eq!(query.filters[0].op, FilterOp::Ge);
    assert_eq!(query.filters[1].op, FilterOp::Like);
    assert_eq!(
      query.sort,
      Some(Sort {
        field: "date_created".into(),
        order: SortOrder::Desc
      })
    );
  }

  #[test]
  fn order_by_before_sort_by_still_applies() {
    let query = FilterQuery::parse(
      &[("order_by", "desc"), ("sort_by", "name")],
      &task_rules(),
    )
    .unwrap();
    assert_eq!(
      query.sort,
      Some(Sort {
        field: "name".into(),
        order: SortOrder::Desc
      })
    );
  }

  #[test]
  fn translates_enum_names_in_lists() {
    let query = FilterQuery::parse(
      &[("state__in", "queued,failed")],
      &task_rules(),
    )
    .unwrap();
    assert_eq!(
      query.filters[0].value,
      FilterValue::List(vec![
        FilterValue::Int(1),
        FilterValue::Int(4)
      ])
    );
  }

  #[test]
  fn rejects_unknown_operator() {
    let err =
      FilterQuery::parse(&[("name__regex", "x")], &task_rules())
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Filter(_)));
  }

  #[test]
  fn rejects_unknown_field() {
    let err =
      FilterQuery::parse(&[("nope", "x")], &task_rules())
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Filter(_)));
  }

  #[test]
  fn remote_column_rejected_without_join() {
    let rules = task_rules();
    let query =
      FilterQuery::parse(&[("repo_name", "rpm-1")], &rules)
        .unwrap();
    let mut qb =
      QueryBuilder::<Sqlite>::new("SELECT task.* FROM task");
    let err =
      push_where(&mut qb, &query.filters, &rules, false).unwrap_err();
    assert!(matches!(err, DatabaseError::Filter(_)));
  }

  #[test]
  fn builds_where_with_in_and_regexp() {
    let rules = task_rules();
    let query = FilterQuery::parse(
      &[("state__in", "queued,failed"), ("name__match", "^repo")],
      &rules,
    )
    .unwrap();
    let mut qb =
      QueryBuilder::<Sqlite>::new("SELECT task.* FROM task");
    push_where(&mut qb, &query.filters, &rules, false).unwrap();
    push_order_by(&mut qb, query.sort.as_ref(), &rules, false)
      .unwrap();
    assert_eq!(
      qb.sql(),
      "SELECT task.* FROM task WHERE task.state IN (?, ?) \
       AND task.name REGEXP ?"
    );
  }

  #[test]
  fn builds_order_by_desc() {
    let rules = task_rules();
    let query = FilterQuery::new()
      .eq("state", 1_i64)
      .order_by("date_created", SortOrder::Desc);
    let mut qb =
      QueryBuilder::<Sqlite>::new("SELECT task.* FROM task");
    push_where(&mut qb, &query.filters, &rules, false).unwrap();
    push_order_by(&mut qb, query.sort.as_ref(), &rules, false)
      .unwrap();
    assert_eq!(
      qb.sql(),
      "SELECT task.* FROM task WHERE task.state = ? \
       ORDER BY task.date_created DESC"
    );
  }
}
