use anyhow::Result;
use rusqlite::ToSql;
use std::fmt;
use strum::EnumString;

fn condense_whitespace(sql: &str) -> String {
  sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, PartialEq, EnumString, strum_macros::Display, Clone)]
#[strum(ascii_case_insensitive)]
pub enum LogicalOperator {
  And,
  Or,
}

const VALID_OPERATORS: [&str; 10] = [
  "=", "!=", ">", "<", ">=", "<=", "LIKE", "NOT LIKE", "IS", "IS NOT",
];

fn is_valid_operator(op: &str) -> bool {
  VALID_OPERATORS.contains(&op.to_uppercase().as_str())
}

pub struct Condition<T: ToSql + Send + Sync>(pub String, pub String, T);

pub struct ConditionGroup(
  Vec<Condition<Box<dyn ToSql + Send + Sync>>>,
  LogicalOperator,
);

/// Builds WHERE clauses over jsonb documents from a closed predicate set:
/// equality, inequality, ranges, prefix LIKE, and value-set membership
/// (expanded to an OR group).
pub struct DocumentFilter {
  condition_groups: Vec<(ConditionGroup, Option<LogicalOperator>)>,
}

impl Default for DocumentFilter {
  fn default() -> Self {
    Self::new()
  }
}

impl DocumentFilter {
  pub fn new() -> Self {
    Self {
      condition_groups: Vec::new(),
    }
  }

  pub fn from(condition_groups: Vec<(ConditionGroup, Option<LogicalOperator>)>) -> Self {
    Self { condition_groups }
  }

  pub fn condition<T: ToSql + Send + Sync + Clone + 'static>(
    &mut self,
    key: &str,
    op: &str,
    val: T,
  ) -> &mut Self {
    let key = key.to_string();
    if !is_valid_operator(op) {
      panic!("Invalid operator: {}", op);
    }
    let op = op.to_uppercase();

    if self.condition_groups.last().is_some_and(|c| c.1.is_none()) {
      self.and();
    }
    let val = Box::new(val.clone());
    self.condition_groups.push((
      ConditionGroup(vec![Condition(key, op, val)], LogicalOperator::And),
      None,
    ));
    self
  }

  /// Membership test, `key IN (v1, v2, ...)`, expressed as an OR group of
  /// equality conditions so all bindings stay positional scalars.
  pub fn any_of<T: ToSql + Send + Sync + Clone + 'static>(
    &mut self,
    key: &str,
    values: Vec<T>,
  ) -> &mut Self {
    if self.condition_groups.last().is_some_and(|c| c.1.is_none()) {
      self.and();
    }
    let conditions = values
      .into_iter()
      .map(|value| {
        Condition(
          key.to_string(),
          "=".to_string(),
          Box::new(value) as Box<dyn ToSql + Send + Sync>,
        )
      })
      .collect::<Vec<_>>();
    self
      .condition_groups
      .push((ConditionGroup(conditions, LogicalOperator::Or), None));
    self
  }

  pub fn and(&mut self) -> &mut Self {
    if let Some(c) = self.condition_groups.last_mut() {
      c.1 = Some(LogicalOperator::And);
    }
    self
  }

  pub fn or(&mut self) -> &mut Self {
    if let Some(c) = self.condition_groups.last_mut() {
      c.1 = Some(LogicalOperator::Or);
    }
    self
  }

  pub fn is_empty(&self) -> bool {
    self.condition_groups.is_empty()
  }

  pub fn columns_select_list() -> String {
    "id, collection, key, json(json), created_at, updated_at, expires_at".to_string()
  }

  pub fn build(&mut self) -> Self {
    Self::from(self.condition_groups.drain(..).collect())
  }

  pub fn to_where_clause(&mut self) -> Result<(String, Vec<(String, Box<dyn ToSql + Send + Sync>)>)> {
    let mut added_sql = String::new();
    let mut params: Vec<(String, Box<dyn ToSql + Send + Sync>)> = Vec::new();

    for (group_idx, (ConditionGroup(condition_group, condition_chain), group_chain)) in
      self.condition_groups.drain(..).enumerate()
    {
      let mut group_sql = String::new();
      let mut group_params = Vec::new();
      let condition_group_size = condition_group.len();
      for (condition_idx, Condition(key, op, val)) in condition_group.into_iter().enumerate() {
        let param_key = format!(
          ":g{}_c{}_{}",
          group_idx,
          condition_idx,
          key.replace('.', "_")
        );
        let clause = format!("jsonb_extract(json, '$.{}') {} {} ", key, op, param_key);
        if condition_idx == condition_group_size - 1 {
          group_sql.push_str(&clause);
        } else {
          group_sql.push_str(&format!(
            "{} {} ",
            clause,
            condition_chain.to_string().to_uppercase()
          ));
        }
        group_params.push((param_key, val));
      }

      added_sql.push_str(&format!(
        "({}) {} ",
        group_sql.trim_end(),
        group_chain
          .as_ref()
          .map(|c| c.to_string().to_uppercase())
          .unwrap_or_default(),
      ));
      params.extend(group_params);
    }
    added_sql = added_sql.trim().to_string();

    Ok((condense_whitespace(&added_sql), params))
  }

  pub fn to_sql(
    &mut self,
    collection: String,
  ) -> Result<(String, Vec<(String, Box<dyn ToSql + Send + Sync>)>)> {
    let mut sql = format!(
      "
      SELECT {}
      FROM document_store
      WHERE collection = :collection
      AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP)
      ",
      DocumentFilter::columns_select_list()
    );
    let mut params: Vec<(String, Box<dyn ToSql + Send + Sync>)> =
      vec![(":collection".to_string(), Box::new(collection))];

    let (added_sql, added_params) = self.to_where_clause()?;
    if !added_sql.is_empty() {
      sql.push_str(format!("AND ({})", added_sql).as_str());
    }
    params.extend(added_params);
    sql = condense_whitespace(&sql);

    Ok((sql, params))
  }
}

impl fmt::Debug for DocumentFilter {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let printable = self
      .condition_groups
      .iter()
      .map(|(group, op)| {
        let conditions = group
          .0
          .iter()
          .map(|Condition(key, op, val)| (key.to_string(), op.to_string(), val.to_sql().unwrap()))
          .collect::<Vec<_>>();
        ((conditions, group.1.clone()), op)
      })
      .collect::<Vec<_>>();
    write!(f, "{:?}", printable)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_document_filter_to_sql() {
    let mut filter = DocumentFilter::new();
    filter
      .condition("oid", "=", "o-1")
      .and()
      .condition("stats.size", ">", 1024)
      .or()
      .condition("state", "=", "running");

    let (sql, params) = filter.to_sql("crawls".to_string()).unwrap();

    let expected_sql = condense_whitespace(
      r#"
        SELECT id, collection, key, json(json), created_at, updated_at, expires_at
        FROM document_store
        WHERE collection = :collection
        AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP)
        AND ((jsonb_extract(json, '$.oid') = :g0_c0_oid) AND (jsonb_extract(json, '$.stats.size') > :g1_c0_stats_size) OR (jsonb_extract(json, '$.state') = :g2_c0_state))"#,
    );

    assert_eq!(sql, expected_sql);
    assert_eq!(params.len(), 4);
  }

  #[test]
  fn test_any_of_expands_to_or_group() {
    let mut filter = DocumentFilter::new();
    filter
      .condition("oid", "=", "o-1")
      .any_of("state", vec!["complete", "failed"]);

    let (sql, params) = filter.to_sql("crawls".to_string()).unwrap();

    assert!(sql.contains(
      "(jsonb_extract(json, '$.state') = :g1_c0_state OR jsonb_extract(json, '$.state') = :g1_c1_state)"
    ));
    assert_eq!(params.len(), 4);
  }

  #[test]
  fn test_optional_and() {
    let mut left_filter = DocumentFilter::new();
    left_filter
      .condition("oid", "=", "o-1")
      .and()
      .condition("type", "=", "crawl")
      .and()
      .condition("state", "=", "running")
      .or()
      .condition("state", "=", "starting");
    let left_output = left_filter.to_sql("crawls".to_string()).unwrap();

    let mut right_filter = DocumentFilter::new();
    right_filter
      .condition("oid", "=", "o-1")
      .condition("type", "=", "crawl")
      .condition("state", "=", "running")
      .or()
      .condition("state", "=", "starting");
    let right_output = right_filter.to_sql("crawls".to_string()).unwrap();

    assert_eq!(left_output.0, right_output.0);
  }
}
