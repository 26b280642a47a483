use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
///
/// `slot: None` means the current slot on the tenant's clock; `role: None`
/// means the login's own role.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterResource {
        id: String,
        name: Option<String>,
    },
    UnregisterResource {
        id: String,
    },
    SelectResources,
    Acquire {
        resource_id: String,
        holder: String,
        role: Option<Role>,
    },
    Release {
        resource_id: String,
        holder: String,
        slot: Option<TimeSlot>,
        reason: ReleaseReason,
    },
    ForceRelease {
        resource_id: String,
        slot: Option<TimeSlot>,
        role: Option<Role>,
        reason: ReleaseReason,
    },
    /// Release every lease of `holder`; the caller is the connection's user.
    ReleaseAll {
        holder: String,
        role: Option<Role>,
    },
    SelectLeases {
        resource_id: Option<String>,
        holder: Option<String>,
    },
    SelectStaleLeases,
    CreateEntry {
        resource_id: String,
        holder: String,
        role: Option<Role>,
        slot: Option<TimeSlot>,
        observation: Observation,
        origin: EntryOrigin,
    },
    SelectEntries {
        resource_id: String,
        slot: Option<TimeSlot>,
    },
    MarkComplete {
        resource_id: String,
        holder: String,
        role: Option<Role>,
        slot: Option<TimeSlot>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, for describing result columns before the
/// statement's parameters are bound.
pub fn result_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

/// Column order assumed when an INSERT omits its column list.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "resources" => &["id", "name"],
        "leases" => &["resource_id", "holder", "role"],
        "entries" => &[
            "resource_id",
            "holder",
            "role",
            "date",
            "hour",
            "issue_present",
            "description",
            "case_number",
            "missed_by",
            "auto_saved",
        ],
        "completions" => &["resource_id", "holder", "role", "date", "hour"],
        _ => &[],
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let row = Row::from_insert(&table, insert, &values)?;

    match table.as_str() {
        "resources" => Ok(Command::RegisterResource {
            id: row.required_string("id")?,
            name: row.optional_string("name")?,
        }),
        "leases" => Ok(Command::Acquire {
            resource_id: row.required_string("resource_id")?,
            holder: row.required_string("holder")?,
            role: row.role()?,
        }),
        "entries" => {
            let observation = Observation {
                issue_present: row.optional_bool("issue_present")?.unwrap_or(false),
                description: row.optional_string("description")?.unwrap_or_default(),
                case_number: row.optional_string("case_number")?,
                missed_by: row.optional_string("missed_by")?,
            };
            let origin = if row.optional_bool("auto_saved")?.unwrap_or(false) {
                EntryOrigin::AutoSave
            } else {
                EntryOrigin::Operator
            };
            Ok(Command::CreateEntry {
                resource_id: row.required_string("resource_id")?,
                holder: row.required_string("holder")?,
                role: row.role()?,
                slot: row.slot()?,
                observation,
                origin,
            })
        }
        "completions" => Ok(Command::MarkComplete {
            resource_id: row.required_string("resource_id")?,
            holder: row.required_string("holder")?,
            role: row.role()?,
            slot: row.slot()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Row::from_where(delete.selection.as_ref())?;

    match table.as_str() {
        "resources" => Ok(Command::UnregisterResource {
            id: filters.required_string("id")?,
        }),
        "leases" => {
            let resource_id = filters.optional_string("resource_id")?;
            let holder = filters.optional_string("holder")?;
            match (resource_id, holder) {
                (Some(resource_id), Some(holder)) => Ok(Command::Release {
                    resource_id,
                    holder,
                    slot: filters.slot()?,
                    reason: filters.reason()?.unwrap_or(ReleaseReason::Manual),
                }),
                (Some(resource_id), None) => Ok(Command::ForceRelease {
                    resource_id,
                    slot: filters.slot()?,
                    role: filters.role()?,
                    reason: filters.reason()?.unwrap_or(ReleaseReason::Administrative),
                }),
                (None, Some(holder)) => Ok(Command::ReleaseAll {
                    holder,
                    role: filters.role()?,
                }),
                (None, None) => Err(SqlError::MissingFilter("resource_id")),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Row::from_where(select.selection.as_ref())?;

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "leases" => Ok(Command::SelectLeases {
            resource_id: filters.optional_string("resource_id")?,
            holder: filters.optional_string("holder")?,
        }),
        "stale_leases" => Ok(Command::SelectStaleLeases),
        "entries" => Ok(Command::SelectEntries {
            resource_id: filters.required_string("resource_id")?,
            slot: filters.slot()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Column access ─────────────────────────────────────────────

/// Column name → value expression, from an INSERT row or `col = value`
/// conjuncts of a WHERE clause.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn from_insert(table: &str, insert: &ast::Insert, values: &'a [Expr]) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            default_columns(table).iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity("columns", columns.len(), values.len()));
        }
        Ok(Self {
            values: columns.into_iter().zip(values).collect(),
        })
    }

    fn from_where(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut values = HashMap::new();
        if let Some(expr) = selection {
            collect_eq_filters(expr, &mut values)?;
        }
        Ok(Self { values })
    }

    /// Missing and NULL both read as `None`.
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values
            .get(column)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn required_string(&self, column: &'static str) -> Result<String, SqlError> {
        self.optional_string(column)?
            .ok_or(SqlError::MissingFilter(column))
    }

    fn optional_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string_expr).transpose()
    }

    fn optional_bool(&self, column: &str) -> Result<Option<bool>, SqlError> {
        self.get(column).map(parse_bool).transpose()
    }

    fn role(&self) -> Result<Option<Role>, SqlError> {
        self.optional_string("role")?
            .map(|s| Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown role: {s}"))))
            .transpose()
    }

    fn reason(&self) -> Result<Option<ReleaseReason>, SqlError> {
        self.optional_string("reason")?
            .map(|s| {
                ReleaseReason::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown reason: {s}")))
            })
            .transpose()
    }

    /// `date` and `hour` must come together.
    fn slot(&self) -> Result<Option<TimeSlot>, SqlError> {
        let date = self.optional_string("date")?;
        let hour = self.get("hour").map(parse_i64_expr).transpose()?;
        match (date, hour) {
            (None, None) => Ok(None),
            (Some(date), Some(hour)) => TimeSlot::parse(&date, hour)
                .map(Some)
                .ok_or_else(|| SqlError::Parse(format!("bad slot: {date} hour {hour}"))),
            (None, Some(_)) => Err(SqlError::MissingFilter("date")),
            (Some(_), None) => Err(SqlError::MissingFilter("hour")),
        }
    }
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single row of an INSERT. Multi-row inserts are refused: every
/// statement is one coordinator operation.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!("{}-row INSERT", rows.len()))),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn slot(hour: u8) -> TimeSlot {
        TimeSlot::new(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(), hour).unwrap()
    }

    #[test]
    fn parse_register_resource() {
        let cmd = parse_sql("INSERT INTO resources (id, name) VALUES ('INV-07', 'Inverter 7')").unwrap();
        assert_eq!(
            cmd,
            Command::RegisterResource {
                id: "INV-07".into(),
                name: Some("Inverter 7".into()),
            }
        );
    }

    #[test]
    fn parse_register_resource_positional_without_name() {
        let cmd = parse_sql("INSERT INTO resources VALUES ('INV-07')").unwrap();
        assert_eq!(
            cmd,
            Command::RegisterResource {
                id: "INV-07".into(),
                name: None,
            }
        );
    }

    #[test]
    fn parse_unregister_and_list_resources() {
        assert_eq!(
            parse_sql("DELETE FROM resources WHERE id = 'INV-07'").unwrap(),
            Command::UnregisterResource { id: "INV-07".into() }
        );
        assert_eq!(parse_sql("SELECT * FROM resources").unwrap(), Command::SelectResources);
    }

    #[test]
    fn parse_acquire_leaves_role_to_login() {
        let cmd = parse_sql("INSERT INTO leases (resource_id, holder) VALUES ('R1', 'alice')").unwrap();
        assert_eq!(
            cmd,
            Command::Acquire {
                resource_id: "R1".into(),
                holder: "alice".into(),
                role: None,
            }
        );
    }

    #[test]
    fn parse_acquire_with_role() {
        let cmd =
            parse_sql("INSERT INTO leases (resource_id, holder, role) VALUES ('R1', 'root', 'superadmin')")
                .unwrap();
        assert!(matches!(cmd, Command::Acquire { role: Some(Role::SuperAdmin), .. }));
    }

    #[test]
    fn parse_unknown_role_errors() {
        let sql = "INSERT INTO leases (resource_id, holder, role) VALUES ('R1', 'x', 'janitor')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_release_current_slot() {
        let cmd = parse_sql("DELETE FROM leases WHERE resource_id = 'R1' AND holder = 'alice'").unwrap();
        assert_eq!(
            cmd,
            Command::Release {
                resource_id: "R1".into(),
                holder: "alice".into(),
                slot: None,
                reason: ReleaseReason::Manual,
            }
        );
    }

    #[test]
    fn parse_release_explicit_slot_and_reason() {
        let sql = r#"DELETE FROM leases WHERE resource_id = 'R1' AND holder = 'alice' AND "date" = '2026-02-10' AND "hour" = 9 AND reason = 'completed'"#;
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::Release {
                resource_id: "R1".into(),
                holder: "alice".into(),
                slot: Some(slot(9)),
                reason: ReleaseReason::Completed,
            }
        );
    }

    #[test]
    fn parse_force_release() {
        let sql = r#"DELETE FROM leases WHERE resource_id = 'R1' AND "date" = '2026-02-10' AND "hour" = 9 AND role = 'admin'"#;
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::ForceRelease {
                resource_id: "R1".into(),
                slot: Some(slot(9)),
                role: Some(Role::Admin),
                reason: ReleaseReason::Administrative,
            }
        );
    }

    #[test]
    fn parse_release_all() {
        let cmd = parse_sql("DELETE FROM leases WHERE holder = 'alice'").unwrap();
        assert_eq!(
            cmd,
            Command::ReleaseAll {
                holder: "alice".into(),
                role: None,
            }
        );
    }

    #[test]
    fn parse_delete_leases_without_filters_errors() {
        assert!(matches!(
            parse_sql("DELETE FROM leases"),
            Err(SqlError::MissingFilter("resource_id"))
        ));
    }

    #[test]
    fn parse_half_slot_errors() {
        let sql = r#"DELETE FROM leases WHERE resource_id = 'R1' AND holder = 'a' AND "hour" = 9"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("date"))));
        let sql = r#"DELETE FROM leases WHERE resource_id = 'R1' AND holder = 'a' AND "date" = '2026-02-10' AND "hour" = 24"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_select_leases_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM leases").unwrap(),
            Command::SelectLeases {
                resource_id: None,
                holder: None,
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM leases WHERE holder = 'bob'").unwrap(),
            Command::SelectLeases {
                resource_id: None,
                holder: Some("bob".into()),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM stale_leases").unwrap(),
            Command::SelectStaleLeases
        );
    }

    #[test]
    fn parse_range_filter_is_unsupported() {
        let sql = r#"SELECT * FROM entries WHERE resource_id = 'R1' AND "hour" >= 9"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_create_entry() {
        let sql = r#"INSERT INTO entries (resource_id, holder, role, "date", "hour", issue_present, description, case_number, missed_by, auto_saved)
                     VALUES ('R1', 'alice', 'operator', '2026-02-10', 9, true, 'tracker stuck', 'CASE-9', NULL, false)"#;
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::CreateEntry {
                resource_id: "R1".into(),
                holder: "alice".into(),
                role: Some(Role::Operator),
                slot: Some(slot(9)),
                observation: Observation {
                    issue_present: true,
                    description: "tracker stuck".into(),
                    case_number: Some("CASE-9".into()),
                    missed_by: None,
                },
                origin: EntryOrigin::Operator,
            }
        );
    }

    #[test]
    fn parse_create_entry_minimal_autosave() {
        let sql = "INSERT INTO entries (resource_id, holder, auto_saved) VALUES ('R1', 'alice', true)";
        match parse_sql(sql).unwrap() {
            Command::CreateEntry {
                slot,
                observation,
                origin,
                ..
            } => {
                assert_eq!(slot, None);
                assert_eq!(observation, Observation::default());
                assert_eq!(origin, EntryOrigin::AutoSave);
            }
            other => panic!("expected CreateEntry, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_entries() {
        let sql = r#"SELECT * FROM entries WHERE resource_id = 'R1' AND "date" = '2026-02-10' AND "hour" = 9"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectEntries {
                resource_id: "R1".into(),
                slot: Some(slot(9)),
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM entries"),
            Err(SqlError::MissingFilter("resource_id"))
        ));
    }

    #[test]
    fn parse_mark_complete() {
        let sql = "INSERT INTO completions (resource_id, holder) VALUES ('R1', 'alice')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::MarkComplete {
                resource_id: "R1".into(),
                holder: "alice".into(),
                role: None,
                slot: None,
            }
        );
    }

    #[test]
    fn parse_too_many_values_errors() {
        let sql = "INSERT INTO leases (resource_id, holder) VALUES ('R1', 'alice', 'admin')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity(..))));
    }

    #[test]
    fn parse_multi_row_insert_refused() {
        let sql = "INSERT INTO resources (id) VALUES ('A'), ('B')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("INSERT INTO foobar (id) VALUES ('x')"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn result_table_ignores_placeholders() {
        assert_eq!(
            result_table("SELECT * FROM leases WHERE holder = $1").as_deref(),
            Some("leases")
        );
        assert_eq!(result_table("DELETE FROM leases WHERE holder = $1"), None);
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
