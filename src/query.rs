use crate::schema::TableDefinition;
use crate::value::Value;

/// A single comparison or boolean combinator. Kept deliberately small: the
/// translator's job is to turn this into SQL, not to be a general
/// expression evaluator.
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    fn to_sql(&self, out: &mut Vec<Value>) -> String {
        match self {
            Filter::Eq(c, v) => {
                out.push(v.clone());
                format!("\"{c}\" = ?")
            }
            Filter::Ne(c, v) => {
                out.push(v.clone());
                format!("\"{c}\" <> ?")
            }
            Filter::Gt(c, v) => {
                out.push(v.clone());
                format!("\"{c}\" > ?")
            }
            Filter::Gte(c, v) => {
                out.push(v.clone());
                format!("\"{c}\" >= ?")
            }
            Filter::Lt(c, v) => {
                out.push(v.clone());
                format!("\"{c}\" < ?")
            }
            Filter::Lte(c, v) => {
                out.push(v.clone());
                format!("\"{c}\" <= ?")
            }
            Filter::And(a, b) => format!("({}) AND ({})", a.to_sql(out), b.to_sql(out)),
            Filter::Or(a, b) => format!("({}) OR ({})", a.to_sql(out), b.to_sql(out)),
            Filter::Not(a) => format!("NOT ({})", a.to_sql(out)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        OrderBy { column: column.into(), descending: false }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        OrderBy { column: column.into(), descending: true }
    }
}

/// A structured query over one table: optional filter, ordering, paging and
/// projection, plus a flag asking for the total matching row count.
#[derive(Debug, Clone)]
pub struct Query {
    pub table: String,
    pub filter: Option<Filter>,
    pub order_by: Vec<OrderBy>,
    pub top: Option<i64>,
    pub skip: Option<i64>,
    pub selection: Option<Vec<String>>,
    pub include_total_count: bool,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Query {
            table: table.into(),
            filter: None,
            order_by: Vec::new(),
            top: None,
            skip: None,
            selection: None,
            include_total_count: false,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn top(mut self, n: i64) -> Self {
        self.top = Some(n);
        self
    }

    pub fn skip(mut self, n: i64) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn with_total_count(mut self) -> Self {
        self.include_total_count = true;
        self
    }

    /// Whether this query has no selection/filter narrowing beyond the
    /// table itself -- used by purge to decide whether cursor state scoped
    /// to the whole table should also be discarded.
    pub fn targets_whole_table(&self) -> bool {
        self.filter.is_none() && self.selection.is_none()
    }
}

/// One translated statement: SQL text plus its positional parameters.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub parameters: Vec<Value>,
}

/// Translate a structured [`Query`] into 1 or 2 statements: the data
/// statement, and -- when `include_total_count` is set -- a `COUNT(*)`
/// statement sharing the same filter. Pure and stateless; never touches the
/// store.
pub fn translate(query: &Query, table: &TableDefinition) -> Vec<Statement> {
    let columns = match &query.selection {
        Some(cols) if !cols.is_empty() => cols
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "*".to_string(),
    };

    let mut params = Vec::new();
    let where_clause = query
        .filter
        .as_ref()
        .map(|f| format!(" WHERE {}", f.to_sql(&mut params)));

    let mut sql = format!(
        "SELECT {columns} FROM \"{}\"{}",
        table.name,
        where_clause.clone().unwrap_or_default()
    );

    if !query.order_by.is_empty() {
        let order = query
            .order_by
            .iter()
            .map(|o| format!("\"{}\" {}", o.column, if o.descending { "DESC" } else { "ASC" }))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" ORDER BY {order}"));
    }
    if let Some(top) = query.top {
        sql.push_str(&format!(" LIMIT {top}"));
    }
    if let Some(skip) = query.skip {
        if query.top.is_none() {
            sql.push_str(" LIMIT -1");
        }
        sql.push_str(&format!(" OFFSET {skip}"));
    }

    let mut statements = vec![Statement { sql, parameters: params }];

    if query.include_total_count {
        let mut count_params = Vec::new();
        let count_where = query
            .filter
            .as_ref()
            .map(|f| format!(" WHERE {}", f.to_sql(&mut count_params)));
        statements.push(Statement {
            sql: format!(
                "SELECT COUNT(*) FROM \"{}\"{}",
                table.name,
                count_where.unwrap_or_default()
            ),
            parameters: count_params,
        });
    }

    statements
}

/// Translate a query ignoring any projection/selection and count request,
/// yielding only the `id` column -- used by `del(query)` and `purge` to
/// resolve a query down to the set of ids it targets.
pub fn translate_ids(query: &Query, table: &TableDefinition) -> Statement {
    let mut params = Vec::new();
    let where_clause = query
        .filter
        .as_ref()
        .map(|f| format!(" WHERE {}", f.to_sql(&mut params)));
    Statement {
        sql: format!("SELECT \"id\" FROM \"{}\"{}", table.name, where_clause.unwrap_or_default()),
        parameters: params,
    }
}
