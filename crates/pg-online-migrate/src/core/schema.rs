//! Catalog metadata types for columns, indexes, foreign keys and triggers.
//!
//! Index definitions are reconstructed from `pg_get_indexdef` output so that
//! an existing index can be re-created over a different column (renames,
//! bigint conversions) with its uniqueness, ordering, operator classes,
//! access method, predicate and comment intact.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::identifier::{quote_ident, quote_literal, QualifiedTable};
use crate::error::Result;

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Type as rendered by `format_type` (e.g. `character varying(255)`).
    pub data_type: String,

    /// Whether the column accepts NULL.
    pub is_nullable: bool,

    /// Raw default expression (`pg_get_expr`), if any.
    pub default_expr: Option<String>,
}

impl ColumnInfo {
    /// The default as a literal value, or `None` when the column has no
    /// literal default (no default, `NULL`, or a function such as `nextval`).
    pub fn default_value(&self) -> Option<String> {
        let expr = self.default_expr.as_deref()?.trim();
        if expr.starts_with("NULL") {
            return None;
        }
        if let Some(rest) = expr.strip_prefix('\'') {
            // 'text'::type, with '' escapes inside the literal
            let end = rest.rfind('\'')?;
            let tail = &rest[end + 1..];
            if tail.is_empty() || tail.starts_with("::") {
                return Some(rest[..end].replace("''", "'"));
            }
            return None;
        }
        let bare = expr.split("::").next().unwrap_or(expr).trim_matches(|c| c == '(' || c == ')');
        let numeric = bare.strip_prefix('-').unwrap_or(bare);
        if !numeric.is_empty() && numeric.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Some(bare.to_string());
        }
        if bare == "true" || bare == "false" {
            return Some(bare.to_string());
        }
        None
    }

    /// The default rendered for comparisons inside trigger bodies.
    pub fn quoted_default(&self) -> String {
        quote_literal(self.default_value().as_deref())
    }
}

/// Key columns of an index: plain column names or a single expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexColumns {
    Names(Vec<String>),
    Expression(String),
}

impl IndexColumns {
    /// Text used to decide whether an index references a column.
    pub fn joined(&self) -> String {
        match self {
            IndexColumns::Names(names) => names.join(" "),
            IndexColumns::Expression(expr) => expr.clone(),
        }
    }

    /// Whether `column` appears as a whole word in the index key.
    pub fn references(&self, column: &str) -> bool {
        word_regex(column).is_match(&self.joined())
    }

    /// Replace `from` with `to` wherever it appears as a whole word.
    pub fn substitute(&self, from: &str, to: &str) -> Self {
        match self {
            IndexColumns::Names(names) => IndexColumns::Names(
                names.iter().map(|n| substitute_word(n, from, to)).collect(),
            ),
            IndexColumns::Expression(expr) => {
                IndexColumns::Expression(substitute_word(expr, from, to))
            }
        }
    }
}

/// Ordering or operator class for index columns.
///
/// `Uniform` applies to every key column, `PerColumn` maps column name to its
/// setting (e.g. `{"created_at": "DESC NULLS LAST"}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerColumnOption {
    Uniform(String),
    PerColumn(BTreeMap<String, String>),
}

impl PerColumnOption {
    fn for_column(&self, column: &str) -> Option<&str> {
        match self {
            PerColumnOption::Uniform(v) => Some(v.as_str()),
            PerColumnOption::PerColumn(map) => map.get(column).map(String::as_str),
        }
    }

    /// Rename a map key; a uniform setting is unaffected.
    pub fn rename_column(&self, from: &str, to: &str) -> Self {
        match self {
            PerColumnOption::Uniform(v) => PerColumnOption::Uniform(v.clone()),
            PerColumnOption::PerColumn(map) => PerColumnOption::PerColumn(
                map.iter()
                    .map(|(k, v)| {
                        let key = if k == from { to.to_string() } else { k.clone() };
                        (key, v.clone())
                    })
                    .collect(),
            ),
        }
    }
}

/// A (re-)creatable index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Table the index belongs to.
    pub table: String,
    /// Index name.
    pub name: String,
    /// Key columns or expression.
    pub columns: IndexColumns,
    /// UNIQUE index.
    pub unique: bool,
    /// Column ordering (`DESC`, `NULLS FIRST`, ...).
    pub order: Option<PerColumnOption>,
    /// Operator classes (`varchar_pattern_ops`, ...).
    pub opclass: Option<PerColumnOption>,
    /// Partial index predicate.
    pub where_clause: Option<String>,
    /// Extra keyword placed before `INDEX`, for index kinds other than UNIQUE.
    pub index_type: Option<String>,
    /// Access method (`btree`, `gin`, ...).
    pub using: Option<String>,
    /// INCLUDE columns.
    pub include: Vec<String>,
    /// Index comment.
    pub comment: Option<String>,
}

impl IndexDefinition {
    /// Minimal btree definition over the given columns.
    pub fn new(table: &str, name: &str, columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            name: name.to_string(),
            columns: IndexColumns::Names(columns.iter().map(|c| c.to_string()).collect()),
            unique: false,
            order: None,
            opclass: None,
            where_clause: None,
            index_type: None,
            using: None,
            include: Vec::new(),
            comment: None,
        }
    }

    /// Render `CREATE INDEX` (optionally `CONCURRENTLY`) for this definition.
    pub fn create_sql(&self, table: &QualifiedTable, concurrently: bool) -> Result<String> {
        let mut sql = String::from("CREATE ");
        if self.unique {
            sql.push_str("UNIQUE ");
        } else if let Some(kind) = &self.index_type {
            sql.push_str(kind);
            sql.push(' ');
        }
        sql.push_str("INDEX ");
        if concurrently {
            sql.push_str("CONCURRENTLY ");
        }
        sql.push_str(&quote_ident(&self.name)?);
        sql.push_str(" ON ");
        sql.push_str(&table.quoted()?);
        if let Some(using) = &self.using {
            sql.push_str(" USING ");
            sql.push_str(using);
        }
        sql.push_str(" (");
        sql.push_str(&self.key_sql()?);
        sql.push(')');
        if !self.include.is_empty() {
            let include = self
                .include
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" INCLUDE ({})", include.join(", ")));
        }
        if let Some(predicate) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        Ok(sql)
    }

    /// Render `COMMENT ON INDEX`, if the index carries a comment.
    pub fn comment_sql(&self, table: &QualifiedTable) -> Result<Option<String>> {
        let Some(comment) = &self.comment else {
            return Ok(None);
        };
        let name = match &table.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema)?, quote_ident(&self.name)?),
            None => quote_ident(&self.name)?,
        };
        Ok(Some(format!(
            "COMMENT ON INDEX {} IS {}",
            name,
            quote_literal(Some(comment))
        )))
    }

    fn key_sql(&self) -> Result<String> {
        match &self.columns {
            IndexColumns::Expression(expr) => Ok(expr.clone()),
            IndexColumns::Names(names) => {
                let mut parts = Vec::with_capacity(names.len());
                for name in names {
                    let mut part = quote_ident(name)?;
                    if let Some(opclass) = self.opclass.as_ref().and_then(|o| o.for_column(name)) {
                        part.push(' ');
                        part.push_str(opclass);
                    }
                    if let Some(order) = self.order.as_ref().and_then(|o| o.for_column(name)) {
                        part.push(' ');
                        part.push_str(order);
                    }
                    parts.push(part);
                }
                Ok(parts.join(", "))
            }
        }
    }
}

/// Single-column foreign key metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub from_table: String,
    pub column: String,
    pub to_table: String,
    pub primary_key: String,
    /// `CASCADE`, `SET NULL`, `RESTRICT`, `SET DEFAULT` or `NO ACTION`.
    pub on_delete: String,
}

/// Map `pg_constraint.confdeltype` to its SQL action.
pub fn referential_action(code: &str) -> &'static str {
    match code {
        "c" => "CASCADE",
        "n" => "SET NULL",
        "r" => "RESTRICT",
        "d" => "SET DEFAULT",
        _ => "NO ACTION",
    }
}

/// A user trigger and the function it executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub name: String,
    pub function_name: String,
}

fn word_regex(word: &str) -> Regex {
    // regex::escape output is always a valid pattern
    Regex::new(&format!(r"\b{}\b", regex::escape(word))).expect("escaped word pattern")
}

/// Replace whole-word occurrences of `from` with `to`.
pub fn substitute_word(text: &str, from: &str, to: &str) -> String {
    word_regex(from)
        .replace_all(text, regex::NoExpand(to))
        .into_owned()
}

const ORDER_KEYWORDS: [&str; 4] = ["ASC", "DESC", "NULLS", "COLLATE"];

/// Parse the output of `pg_get_indexdef` into an [`IndexDefinition`].
///
/// Returns `None` when the text does not look like an index definition.
pub fn parse_index_definition(
    table: &str,
    name: &str,
    definition: &str,
    predicate: Option<&str>,
    comment: Option<&str>,
) -> Option<IndexDefinition> {
    let unique = definition.starts_with("CREATE UNIQUE INDEX");
    let using_pos = definition.find(" USING ")?;
    let after_using = &definition[using_pos + " USING ".len()..];
    let open = after_using.find('(')?;
    let using = after_using[..open].trim().to_string();
    let (key, rest) = split_balanced(&after_using[open..])?;

    let include: Vec<String> = rest
        .trim_start()
        .strip_prefix("INCLUDE ")
        .and_then(split_balanced)
        .map(|(inner, _)| split_top_level(inner).iter().map(|c| unquote(c.trim())).collect())
        .unwrap_or_default();

    let parts = split_top_level(key);
    let mut names = Vec::new();
    let mut order = BTreeMap::new();
    let mut opclass = BTreeMap::new();
    let mut expression = false;

    for part in &parts {
        match parse_key_part(part.trim()) {
            Some((column, op, ord)) => {
                if let Some(op) = op {
                    opclass.insert(column.clone(), op);
                }
                if let Some(ord) = ord {
                    order.insert(column.clone(), ord);
                }
                names.push(column);
            }
            None => {
                expression = true;
                break;
            }
        }
    }

    let (columns, order, opclass) = if expression {
        (IndexColumns::Expression(key.trim().to_string()), None, None)
    } else {
        (
            IndexColumns::Names(names),
            (!order.is_empty()).then_some(PerColumnOption::PerColumn(order)),
            (!opclass.is_empty()).then_some(PerColumnOption::PerColumn(opclass)),
        )
    };

    Some(IndexDefinition {
        table: table.to_string(),
        name: name.to_string(),
        columns,
        unique,
        order,
        opclass,
        where_clause: predicate.map(str::to_string),
        index_type: None,
        using: Some(using),
        include,
        comment: comment.map(str::to_string),
    })
}

/// `column [opclass] [ASC|DESC] [NULLS FIRST|LAST]`, or `None` for expressions.
fn parse_key_part(part: &str) -> Option<(String, Option<String>, Option<String>)> {
    let (column, rest) = if let Some(stripped) = part.strip_prefix('"') {
        let end = find_closing_quote(stripped)?;
        (stripped[..end].replace("\"\"", "\""), stripped[end + 1..].trim())
    } else {
        let end = part.find(char::is_whitespace).unwrap_or(part.len());
        let column = &part[..end];
        if !column
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return None;
        }
        (column.to_string(), part[end..].trim())
    };

    if rest.is_empty() {
        return Some((column, None, None));
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let order_start = words
        .iter()
        .position(|w| ORDER_KEYWORDS.contains(&w.to_uppercase().as_str()));
    let (op_words, order_words) = match order_start {
        Some(i) => words.split_at(i),
        None => (&words[..], &[][..]),
    };
    if op_words.len() > 1 {
        return None;
    }
    let opclass = op_words.first().map(|w| w.to_string());
    let order = (!order_words.is_empty()).then(|| order_words.join(" "));
    Some((column, opclass, order))
}

fn find_closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

fn unquote(s: &str) -> String {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .map(|s| s.replace("\"\"", "\""))
        .unwrap_or_else(|| s.to_string())
}

/// Given text starting with `(`, return the contents up to the matching `)`
/// and the remainder after it.
fn split_balanced(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let mut in_quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match in_quote {
            Some(q) if c == q => in_quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => in_quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some((&s[1..i], &s[i + 1..]));
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// Split on commas that are not nested in parentheses or quotes.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match in_quote {
            Some(q) if c == q => in_quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => in_quote = Some(c),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    parts.push(&s[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&s[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(default_expr: Option<&str>) -> ColumnInfo {
        ColumnInfo {
            name: "c".into(),
            data_type: "integer".into(),
            is_nullable: true,
            default_expr: default_expr.map(str::to_string),
        }
    }

    #[test]
    fn test_default_value_literals() {
        assert_eq!(column(Some("0")).default_value().as_deref(), Some("0"));
        assert_eq!(column(Some("'-1'::integer")).default_value().as_deref(), Some("-1"));
        assert_eq!(
            column(Some("'it''s'::character varying")).default_value().as_deref(),
            Some("it's")
        );
        assert_eq!(column(Some("false")).default_value().as_deref(), Some("false"));
        assert_eq!(column(Some("(-5)")).default_value().as_deref(), Some("-5"));
    }

    #[test]
    fn test_default_value_non_literals() {
        assert_eq!(column(None).default_value(), None);
        assert_eq!(column(Some("NULL::character varying")).default_value(), None);
        assert_eq!(
            column(Some("nextval('users_id_seq'::regclass)")).default_value(),
            None
        );
        assert_eq!(column(Some("now()")).quoted_default(), "NULL");
        assert_eq!(column(Some("0")).quoted_default(), "'0'");
    }

    #[test]
    fn test_parse_simple_index() {
        let idx = parse_index_definition(
            "events",
            "idx_on_int_col",
            "CREATE INDEX idx_on_int_col ON public.events USING btree (int_col) WHERE (int_col > 0)",
            Some("(int_col > 0)"),
            None,
        )
        .unwrap();
        assert_eq!(idx.columns, IndexColumns::Names(vec!["int_col".into()]));
        assert!(!idx.unique);
        assert_eq!(idx.using.as_deref(), Some("btree"));
        assert_eq!(idx.where_clause.as_deref(), Some("(int_col > 0)"));
        assert!(idx.order.is_none());
    }

    #[test]
    fn test_parse_index_with_order_and_opclass() {
        let idx = parse_index_definition(
            "users",
            "index_users_on_name_and_created_at",
            "CREATE UNIQUE INDEX index_users_on_name_and_created_at ON public.users USING btree (name varchar_pattern_ops, created_at DESC NULLS LAST) INCLUDE (id)",
            None,
            Some("lookup"),
        )
        .unwrap();
        assert!(idx.unique);
        assert_eq!(
            idx.columns,
            IndexColumns::Names(vec!["name".into(), "created_at".into()])
        );
        assert_eq!(
            idx.order,
            Some(PerColumnOption::PerColumn(BTreeMap::from([(
                "created_at".to_string(),
                "DESC NULLS LAST".to_string()
            )])))
        );
        assert_eq!(
            idx.opclass,
            Some(PerColumnOption::PerColumn(BTreeMap::from([(
                "name".to_string(),
                "varchar_pattern_ops".to_string()
            )])))
        );
        assert_eq!(idx.include, vec!["id".to_string()]);
        assert_eq!(idx.comment.as_deref(), Some("lookup"));
    }

    #[test]
    fn test_parse_quoted_and_expression_indexes() {
        let quoted = parse_index_definition(
            "t",
            "i",
            "CREATE INDEX i ON public.t USING btree (\"order\")",
            None,
            None,
        )
        .unwrap();
        assert_eq!(quoted.columns, IndexColumns::Names(vec!["order".into()]));

        let expr = parse_index_definition(
            "t",
            "i",
            "CREATE INDEX i ON public.t USING btree (lower((email)::text))",
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            expr.columns,
            IndexColumns::Expression("lower((email)::text)".into())
        );
        assert!(expr.columns.references("email"));
    }

    #[test]
    fn test_word_boundary_matching() {
        let cols = IndexColumns::Names(vec!["project_id".into(), "id".into()]);
        assert!(cols.references("id"));
        let only_project = IndexColumns::Names(vec!["project_id".into()]);
        assert!(!only_project.references("id"));
        assert_eq!(
            substitute_word("project_id > 0 AND id > 0", "id", "id_convert_to_bigint"),
            "project_id > 0 AND id_convert_to_bigint > 0"
        );
    }

    #[test]
    fn test_create_sql_renders_options() {
        let mut idx = IndexDefinition::new("users", "index_users_on_name", &["name"]);
        idx.unique = true;
        idx.using = Some("btree".into());
        idx.order = Some(PerColumnOption::Uniform("DESC".into()));
        idx.where_clause = Some("(name IS NOT NULL)".into());
        let sql = idx
            .create_sql(&QualifiedTable::parse("users"), true)
            .unwrap();
        assert_eq!(
            sql,
            "CREATE UNIQUE INDEX CONCURRENTLY \"index_users_on_name\" ON \"users\" USING btree (\"name\" DESC) WHERE (name IS NOT NULL)"
        );
    }

    #[test]
    fn test_per_column_option_rename() {
        let order = PerColumnOption::PerColumn(BTreeMap::from([("id".to_string(), "DESC".to_string())]));
        assert_eq!(
            order.rename_column("id", "id_convert_to_bigint"),
            PerColumnOption::PerColumn(BTreeMap::from([(
                "id_convert_to_bigint".to_string(),
                "DESC".to_string()
            )]))
        );
        let uniform = PerColumnOption::Uniform("ASC".into());
        assert_eq!(uniform.rename_column("id", "x"), uniform);
    }

    #[test]
    fn test_referential_action() {
        assert_eq!(referential_action("c"), "CASCADE");
        assert_eq!(referential_action("n"), "SET NULL");
        assert_eq!(referential_action("a"), "NO ACTION");
    }
}
