//! Schema-aware SQL assembly.
//!
//! One user query produces one SELECT statement. Relations are aliased by
//! their index within the query (`t0` is the base); filter values are always
//! bound, never interpolated; sub-queries nest recursively with their own
//! alias namespace. Role policy predicates are ANDed onto the base relation.

use std::collections::HashSet;

use sqlx::postgres::PgArguments;
use sqlx::query::Query as SqlxQuery;
use sqlx::Postgres;
use uuid::Uuid;

use bp_domain::error::{Error, Result, SchemaEntity};
use bp_domain::schema::{
    operator_is_unary, Attribute, AttributeContent, FilterSideContent, Policy, Query, QueryFilter,
    QueryFilterSide, Relation, FILTER_OPERATORS,
};
use bp_schema::SchemaCache;
use bp_store::migrate::quote_ident;

use super::access;
use super::{DataExpression, DataGet, DataJoin, DataOrder};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bind values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A parameter bound into the assembled statement.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Uuid(Uuid),
    Null,
}

impl BindValue {
    pub fn from_json(value: &serde_json::Value) -> BindValue {
        match value {
            serde_json::Value::Null => BindValue::Null,
            serde_json::Value::Bool(b) => BindValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    BindValue::Int(i)
                } else {
                    BindValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => BindValue::Text(s.clone()),
            other => BindValue::Text(other.to_string()),
        }
    }
}

/// Attach collected binds to a prepared statement.
pub fn apply_binds<'q>(
    mut query: SqlxQuery<'q, Postgres, PgArguments>,
    binds: &'q [BindValue],
) -> SqlxQuery<'q, Postgres, PgArguments> {
    for bind in binds {
        query = match bind {
            BindValue::Int(v) => query.bind(*v),
            BindValue::Float(v) => query.bind(*v),
            BindValue::Text(v) => query.bind(v.as_str()),
            BindValue::Bool(v) => query.bind(*v),
            BindValue::Uuid(v) => query.bind(*v),
            BindValue::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

#[derive(Debug)]
pub struct BuiltQuery {
    pub sql: String,
    pub binds: Vec<BindValue>,
    /// Relation indexes in select order; their record ids lead the columns.
    pub record_indexes: Vec<i32>,
    pub expression_count: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lookup helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fully qualified, quoted table name of a relation.
pub fn table_name(schema: &SchemaCache, relation: &Relation) -> Result<String> {
    let module = schema
        .module(&relation.module_id)
        .ok_or(Error::SchemaUnknown(SchemaEntity::Module, relation.module_id))?;
    Ok(format!(
        "{}.{}",
        quote_ident(&module.name),
        quote_ident(&relation.name)
    ))
}

fn relation_of(schema: &SchemaCache, relation_id: &Uuid) -> Result<Relation> {
    schema
        .relation(relation_id)
        .ok_or(Error::SchemaUnknown(SchemaEntity::Relation, *relation_id))
}

fn attribute_of(schema: &SchemaCache, attribute_id: &Uuid) -> Result<Attribute> {
    schema
        .attribute(attribute_id)
        .ok_or(Error::SchemaUnknown(SchemaEntity::Attribute, *attribute_id))
}

fn aggregator_sql(name: &str) -> Result<&'static str> {
    Ok(match name {
        "array" => "ARRAY_AGG",
        "avg" => "AVG",
        "count" => "COUNT",
        "max" => "MAX",
        "min" => "MIN",
        "sum" => "SUM",
        other => {
            return Err(Error::Internal(format!("unknown aggregator '{other}'")));
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Select,
    Update,
    Delete,
}

fn policy_matches(policy: &Policy, action: PolicyAction) -> bool {
    match action {
        PolicyAction::Select => policy.action_select,
        PolicyAction::Update => policy.action_update,
        PolicyAction::Delete => policy.action_delete,
    }
}

fn policy_function(policy: &Policy, action: PolicyAction) -> Option<Uuid> {
    match action {
        PolicyAction::Select => policy.pg_function_id_select,
        PolicyAction::Update => policy.pg_function_id_update,
        PolicyAction::Delete => policy.pg_function_id_delete,
    }
}

/// Row-level policy predicate for the acting role set.
///
/// Policies are evaluated in position order; the first whose role is held
/// and whose action flag is set wins. A winning policy with a filter
/// function restricts to the ids that function returns; one without is
/// unrestricted. If the relation has policies but none matches, all rows
/// are denied.
pub fn policy_predicate(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    relation: &Relation,
    action: PolicyAction,
    alias: &str,
) -> Result<Option<String>> {
    let candidates: Vec<&Policy> = relation
        .policies
        .iter()
        .filter(|p| policy_matches(p, action))
        .collect();
    if candidates.is_empty() {
        return Ok(None);
    }

    for policy in candidates {
        if !roles.contains(&policy.role_id) {
            continue;
        }
        return match policy_function(policy, action) {
            None => Ok(None),
            Some(function_id) => {
                let function = schema.pg_function(&function_id).ok_or(Error::SchemaUnknown(
                    SchemaEntity::PgFunction,
                    function_id,
                ))?;
                let module = schema.module(&function.module_id).ok_or(Error::SchemaUnknown(
                    SchemaEntity::Module,
                    function.module_id,
                ))?;
                Ok(Some(format!(
                    "{}.\"id\" = ANY({}.{}())",
                    quote_ident(alias),
                    quote_ident(&module.name),
                    quote_ident(&function.name)
                )))
            }
        };
    }
    Ok(Some("FALSE".to_string()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SELECT assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Builder<'a> {
    schema: &'a SchemaCache,
    roles: &'a HashSet<Uuid>,
    login_id: i64,
    binds: Vec<BindValue>,
    sub_counter: usize,
}

impl<'a> Builder<'a> {
    fn push_bind(&mut self, value: BindValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }
}

/// Build the SELECT for a `data.get` request. Authorization on every touched
/// relation and attribute happens here, before any SQL is produced.
pub fn build_select(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    login_id: i64,
    get: &DataGet,
) -> Result<BuiltQuery> {
    let base = relation_of(schema, &get.relation_id)?;
    access::require_relation_read(schema, roles, &base.id)?;

    let mut builder = Builder {
        schema,
        roles,
        login_id,
        binds: Vec::new(),
        sub_counter: 0,
    };

    // FROM + JOINs; join targets are access-checked like the base.
    let mut from = format!("{} AS \"t0\"", table_name(schema, &base)?);
    let mut record_indexes = vec![0];
    for join in &get.joins {
        let joined = relation_of(schema, &join.relation_id)?;
        access::require_relation_read(schema, roles, &joined.id)?;
        from.push_str(&join_sql(schema, join, &joined)?);
        record_indexes.push(join.index);
    }

    // Record ids lead the select list, one per relation index.
    let mut select_parts: Vec<String> = record_indexes
        .iter()
        .map(|index| format!("\"t{index}\".\"id\""))
        .collect();

    for expression in &get.expressions {
        select_parts.push(expression_sql(schema, roles, expression)?);
    }

    let mut sql = format!("SELECT {} FROM {}", select_parts.join(", "), from);

    // WHERE: policy first, then the request filters.
    let mut where_parts: Vec<String> = Vec::new();
    if let Some(predicate) =
        policy_predicate(schema, roles, &base, PolicyAction::Select, "t0")?
    {
        where_parts.push(predicate);
    }
    let filter_sql = render_filters(&mut builder, &get.filters, "t")?;
    if !filter_sql.is_empty() {
        where_parts.push(filter_sql);
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }

    if !get.orders.is_empty() {
        sql.push_str(" ORDER BY ");
        let mut order_parts = Vec::with_capacity(get.orders.len());
        for order in &get.orders {
            order_parts.push(order_sql(schema, roles, order)?);
        }
        sql.push_str(&order_parts.join(", "));
    }

    if get.limit > 0 {
        sql.push_str(&format!(" LIMIT {}", get.limit));
    }
    if get.offset > 0 {
        sql.push_str(&format!(" OFFSET {}", get.offset));
    }

    Ok(BuiltQuery {
        sql,
        binds: builder.binds,
        record_indexes,
        expression_count: get.expressions.len(),
    })
}

fn join_sql(schema: &SchemaCache, join: &DataJoin, joined: &Relation) -> Result<String> {
    let attribute = attribute_of(schema, &join.attribute_id)?;
    if attribute.content == AttributeContent::RelNm {
        return Err(Error::Internal(
            "n:m attributes join through their own relation".into(),
        ));
    }

    // The relationship attribute sits on one of the two sides; the foreign
    // key always points at the other side's record id.
    let on = if attribute.relation_id == join.relation_id {
        format!(
            "\"t{}\".{} = \"t{}\".\"id\"",
            join.index,
            quote_ident(&attribute.name),
            join.index_from
        )
    } else {
        format!(
            "\"t{}\".{} = \"t{}\".\"id\"",
            join.index_from,
            quote_ident(&attribute.name),
            join.index
        )
    };

    Ok(format!(
        " {} {} AS \"t{}\" ON {}",
        join.connector.as_sql(),
        table_name(schema, joined)?,
        join.index,
        on
    ))
}

fn expression_sql(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    expression: &DataExpression,
) -> Result<String> {
    let attribute = attribute_of(schema, &expression.attribute_id)?;
    access::require_attribute_read(schema, roles, &attribute.id)?;

    let column = format!(
        "\"t{}\".{}",
        expression.index,
        quote_ident(&attribute.name)
    );
    let rendered = match &expression.aggregator {
        Some(aggregator) => {
            let distinct = if expression.distincted { "DISTINCT " } else { "" };
            format!("{}({}{})", aggregator_sql(aggregator)?, distinct, column)
        }
        None => column,
    };
    // Uniform JSON decoding on the way out.
    Ok(format!("TO_JSONB({rendered})"))
}

fn order_sql(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    order: &DataOrder,
) -> Result<String> {
    let attribute = attribute_of(schema, &order.attribute_id)?;
    access::require_attribute_read(schema, roles, &attribute.id)?;
    Ok(format!(
        "\"t{}\".{} {}",
        order.index,
        quote_ident(&attribute.name),
        if order.ascending { "ASC" } else { "DESC" }
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn render_filters(
    builder: &mut Builder<'_>,
    filters: &[QueryFilter],
    alias_prefix: &str,
) -> Result<String> {
    let mut sql = String::new();
    for (position, filter) in filters.iter().enumerate() {
        if !FILTER_OPERATORS.contains(&filter.operator.as_str()) {
            return Err(Error::Internal(format!(
                "unknown filter operator '{}'",
                filter.operator
            )));
        }

        if position > 0 {
            sql.push(' ');
            sql.push_str(filter.connector.as_sql());
            sql.push(' ');
        }
        for _ in 0..filter.side0.brackets {
            sql.push('(');
        }

        let side0 = render_side(builder, &filter.side0, alias_prefix)?;

        if operator_is_unary(&filter.operator) {
            sql.push_str(&format!("{side0} {}", filter.operator));
        } else {
            let rendered = render_comparison(builder, filter, &side0, alias_prefix)?;
            sql.push_str(&rendered);
        }

        for _ in 0..filter.side1.brackets {
            sql.push(')');
        }
    }
    Ok(sql)
}

fn render_comparison(
    builder: &mut Builder<'_>,
    filter: &QueryFilter,
    side0: &str,
    alias_prefix: &str,
) -> Result<String> {
    // Quantified comparisons against a sub-query collapse to IN / NOT IN;
    // against a literal list they bind per element.
    let quantified = matches!(filter.operator.as_str(), "= ANY" | "<> ALL");
    if quantified {
        if filter.side1.content == FilterSideContent::SubQuery {
            let sub = render_side(builder, &filter.side1, alias_prefix)?;
            let keyword = if filter.operator == "= ANY" { "IN" } else { "NOT IN" };
            return Ok(format!("{side0} {keyword} {sub}"));
        }
        if let Some(serde_json::Value::Array(items)) = &filter.side1.value {
            let placeholders: Vec<String> = items
                .iter()
                .map(|item| builder.push_bind(BindValue::from_json(item)))
                .collect();
            let op = if filter.operator == "= ANY" { "= ANY" } else { "<> ALL" };
            return Ok(format!("{side0} {op}(ARRAY[{}])", placeholders.join(", ")));
        }
        return Err(Error::Internal(
            "quantified comparison requires a list or sub-query".into(),
        ));
    }

    let side1 = render_side(builder, &filter.side1, alias_prefix)?;
    Ok(format!("{side0} {} {side1}", filter.operator))
}

fn render_side(
    builder: &mut Builder<'_>,
    side: &QueryFilterSide,
    alias_prefix: &str,
) -> Result<String> {
    match side.content {
        FilterSideContent::Attribute => {
            let attribute_id = side
                .attribute_id
                .ok_or_else(|| Error::Internal("attribute side misses id".into()))?;
            let attribute = attribute_of(builder.schema, &attribute_id)?;
            access::require_attribute_read(builder.schema, builder.roles, &attribute.id)?;
            Ok(format!(
                "\"{}{}\".{}",
                alias_prefix,
                side.attribute_index,
                quote_ident(&attribute.name)
            ))
        }
        FilterSideContent::Value => {
            let value = side.value.clone().unwrap_or(serde_json::Value::Null);
            Ok(builder.push_bind(BindValue::from_json(&value)))
        }
        FilterSideContent::LoginId => {
            let login_id = builder.login_id;
            Ok(builder.push_bind(BindValue::Int(login_id)))
        }
        FilterSideContent::RecordId => Ok(format!("\"{alias_prefix}0\".\"id\"")),
        FilterSideContent::Preset => {
            let preset_id = side
                .preset_id
                .ok_or_else(|| Error::Internal("preset side misses id".into()))?;
            let placeholder = builder.push_bind(BindValue::Uuid(preset_id));
            Ok(format!(
                "(SELECT record_id_wofk FROM instance.preset_record WHERE preset_id = {placeholder})"
            ))
        }
        FilterSideContent::SubQuery => {
            let query = side
                .query
                .as_ref()
                .ok_or_else(|| Error::Internal("sub-query side misses query".into()))?;
            render_sub_query(builder, query, side)
        }
        FilterSideContent::True => Ok("TRUE".to_string()),
    }
}

fn render_sub_query(
    builder: &mut Builder<'_>,
    query: &Query,
    side: &QueryFilterSide,
) -> Result<String> {
    let relation_id = query
        .relation_id
        .ok_or_else(|| Error::Internal("sub-query misses relation".into()))?;
    let relation = relation_of(builder.schema, &relation_id)?;
    access::require_relation_read(builder.schema, builder.roles, &relation.id)?;

    // Own alias namespace per nesting; the graph is a DAG so this recursion
    // terminates.
    builder.sub_counter += 1;
    let prefix = format!("s{}t", builder.sub_counter);

    let expression = match side.attribute_id {
        Some(attribute_id) => {
            let attribute = attribute_of(builder.schema, &attribute_id)?;
            access::require_attribute_read(builder.schema, builder.roles, &attribute.id)?;
            let column = format!(
                "\"{}{}\".{}",
                prefix,
                side.attribute_index,
                quote_ident(&attribute.name)
            );
            match &side.query_aggregator {
                Some(aggregator) => format!("{}({})", aggregator_sql(aggregator)?, column),
                None => column,
            }
        }
        None => format!("\"{prefix}0\".\"id\""),
    };

    let mut sql = format!(
        "(SELECT {expression} FROM {} AS \"{prefix}0\"",
        table_name(builder.schema, &relation)?
    );

    for join in &query.joins {
        let joined = relation_of(builder.schema, &join.relation_id)?;
        access::require_relation_read(builder.schema, builder.roles, &joined.id)?;
        let attribute_id = join
            .attribute_id
            .ok_or_else(|| Error::Internal("sub-query join misses attribute".into()))?;
        let attribute = attribute_of(builder.schema, &attribute_id)?;
        let on = if attribute.relation_id == join.relation_id {
            format!(
                "\"{prefix}{}\".{} = \"{prefix}{}\".\"id\"",
                join.index,
                quote_ident(&attribute.name),
                join.index_from
            )
        } else {
            format!(
                "\"{prefix}{}\".{} = \"{prefix}{}\".\"id\"",
                join.index_from,
                quote_ident(&attribute.name),
                join.index
            )
        };
        sql.push_str(&format!(
            " {} {} AS \"{prefix}{}\" ON {}",
            join.connector.as_sql(),
            table_name(builder.schema, &joined)?,
            join.index,
            on
        ));
    }

    let mut where_parts: Vec<String> = Vec::new();
    if let Some(predicate) = policy_predicate(
        builder.schema,
        builder.roles,
        &relation,
        PolicyAction::Select,
        &format!("{prefix}0"),
    )? {
        where_parts.push(predicate);
    }
    let filters = render_filters(builder, &query.filters, &prefix)?;
    if !filters.is_empty() {
        where_parts.push(filters);
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }

    if query.fixed_limit > 0 {
        sql.push_str(&format!(" LIMIT {}", query.fixed_limit));
    }
    sql.push(')');
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp_domain::schema::{
        AttributeContentUse, FilterConnector, JoinConnector, Module, Role, RoleContent,
        ACCESS_READ,
    };
    use std::collections::HashMap;

    struct Fixture {
        schema: SchemaCache,
        roles: HashSet<Uuid>,
        customer: Uuid,
        order: Uuid,
        customer_name: Uuid,
        order_total: Uuid,
        order_customer_fk: Uuid,
    }

    fn attribute(relation_id: Uuid, name: &str, content: AttributeContent) -> Attribute {
        Attribute {
            id: Uuid::new_v4(),
            relation_id,
            relationship_id: None,
            icon_id: None,
            name: name.into(),
            content,
            content_use: AttributeContentUse::Default,
            length: 0,
            nullable: true,
            encrypted: false,
            def: String::new(),
            on_update: None,
            on_delete: None,
        }
    }

    fn fixture() -> Fixture {
        let module_id = Uuid::new_v4();
        let customer_id = Uuid::new_v4();
        let order_id = Uuid::new_v4();

        let customer_name = attribute(customer_id, "name", AttributeContent::Text);
        let customer_id_attr = attribute(customer_id, "id", AttributeContent::Bigint);
        let order_total = attribute(order_id, "total", AttributeContent::Numeric);
        let order_id_attr = attribute(order_id, "id", AttributeContent::Bigint);
        let mut order_customer_fk = attribute(order_id, "customer", AttributeContent::RelN1);
        order_customer_fk.relationship_id = Some(customer_id);

        let mut role = Role {
            id: Uuid::new_v4(),
            module_id,
            name: "reader".into(),
            content: RoleContent::User,
            assignable: true,
            child_ids: vec![],
            access_relations: HashMap::new(),
            access_attributes: HashMap::new(),
            access_collections: HashMap::new(),
            access_menus: HashMap::new(),
            access_apis: HashMap::new(),
            access_client_events: HashMap::new(),
            access_search_bars: HashMap::new(),
            access_widgets: HashMap::new(),
        };
        role.access_relations.insert(customer_id, ACCESS_READ);
        role.access_relations.insert(order_id, ACCESS_READ);
        for attr in [
            &customer_name,
            &customer_id_attr,
            &order_total,
            &order_id_attr,
            &order_customer_fk,
        ] {
            role.access_attributes.insert(attr.id, ACCESS_READ);
        }
        let role_id = role.id;

        let relation = |id: Uuid, name: &str, attrs: Vec<Attribute>| Relation {
            id,
            module_id,
            name: name.into(),
            comment: None,
            encryption: false,
            retention_count: None,
            retention_days: None,
            attributes: attrs,
            indexes: vec![],
            presets: vec![],
            policies: vec![],
            triggers: vec![],
        };

        let module = Module {
            id: module_id,
            parent_id: None,
            form_id: None,
            icon_id: None,
            name: "shop".into(),
            name_display: None,
            color1: None,
            position: 0,
            language_main: "en_us".into(),
            release_build: 0,
            release_build_app: 0,
            release_date: 0,
            languages: vec![],
            dependencies: vec![],
            articles: vec![],
            relations: vec![
                relation(
                    customer_id,
                    "customer",
                    vec![customer_name.clone(), customer_id_attr],
                ),
                relation(
                    order_id,
                    "order",
                    vec![
                        order_total.clone(),
                        order_id_attr,
                        order_customer_fk.clone(),
                    ],
                ),
            ],
            forms: vec![],
            menu_tabs: vec![],
            icons: vec![],
            roles: vec![role],
            login_forms: vec![],
            pg_functions: vec![],
            js_functions: vec![],
            collections: vec![],
            apis: vec![],
            client_events: vec![],
            search_bars: vec![],
            variables: vec![],
            widgets: vec![],
        };

        let schema = SchemaCache::new();
        schema.publish_module(module);

        let mut roles = HashSet::new();
        roles.insert(role_id);

        Fixture {
            schema,
            roles,
            customer: customer_id,
            order: order_id,
            customer_name: customer_name.id,
            order_total: order_total.id,
            order_customer_fk: order_customer_fk.id,
        }
    }

    fn value_filter(attribute_id: Uuid, operator: &str, value: serde_json::Value) -> QueryFilter {
        QueryFilter {
            connector: FilterConnector::And,
            operator: operator.into(),
            side0: QueryFilterSide {
                content: FilterSideContent::Attribute,
                attribute_id: Some(attribute_id),
                attribute_index: 0,
                brackets: 0,
                preset_id: None,
                value: None,
                query: None,
                query_aggregator: None,
            },
            side1: QueryFilterSide::value_side(value),
        }
    }

    #[test]
    fn plain_select_with_filter_binds_values() {
        let f = fixture();
        let get = DataGet {
            relation_id: f.customer,
            joins: vec![],
            expressions: vec![DataExpression {
                attribute_id: f.customer_name,
                index: 0,
                aggregator: None,
                distincted: false,
            }],
            filters: vec![value_filter(
                f.customer_name,
                "ILIKE",
                serde_json::json!("%smith%"),
            )],
            orders: vec![DataOrder {
                attribute_id: f.customer_name,
                index: 0,
                ascending: true,
            }],
            limit: 50,
            offset: 10,
        };

        let built = build_select(&f.schema, &f.roles, 7, &get).unwrap();
        assert!(built.sql.starts_with("SELECT \"t0\".\"id\", TO_JSONB(\"t0\".\"name\")"));
        assert!(built.sql.contains("FROM \"shop\".\"customer\" AS \"t0\""));
        assert!(built.sql.contains("\"t0\".\"name\" ILIKE $1"));
        assert!(built.sql.contains("ORDER BY \"t0\".\"name\" ASC"));
        assert!(built.sql.ends_with("LIMIT 50 OFFSET 10"));
        assert_eq!(built.binds, vec![BindValue::Text("%smith%".into())]);
        assert_eq!(built.record_indexes, vec![0]);
    }

    #[test]
    fn join_direction_follows_fk_side() {
        let f = fixture();
        let get = DataGet {
            relation_id: f.customer,
            joins: vec![DataJoin {
                relation_id: f.order,
                attribute_id: f.order_customer_fk,
                index_from: 0,
                index: 1,
                connector: JoinConnector::Left,
                apply_create: false,
                apply_update: false,
                apply_delete: false,
            }],
            expressions: vec![DataExpression {
                attribute_id: f.order_total,
                index: 1,
                aggregator: None,
                distincted: false,
            }],
            filters: vec![],
            orders: vec![],
            limit: 0,
            offset: 0,
        };

        let built = build_select(&f.schema, &f.roles, 7, &get).unwrap();
        // The fk sits on the joined order relation, so it points at t0.
        assert!(built
            .sql
            .contains("LEFT JOIN \"shop\".\"order\" AS \"t1\" ON \"t1\".\"customer\" = \"t0\".\"id\""));
        assert_eq!(built.record_indexes, vec![0, 1]);
    }

    #[test]
    fn login_id_side_binds_current_login() {
        let f = fixture();
        let mut filter = value_filter(f.customer_name, "=", serde_json::Value::Null);
        filter.side1 = QueryFilterSide {
            content: FilterSideContent::LoginId,
            attribute_id: None,
            attribute_index: 0,
            brackets: 0,
            preset_id: None,
            value: None,
            query: None,
            query_aggregator: None,
        };
        let get = DataGet {
            relation_id: f.customer,
            joins: vec![],
            expressions: vec![],
            filters: vec![filter],
            orders: vec![],
            limit: 0,
            offset: 0,
        };

        let built = build_select(&f.schema, &f.roles, 99, &get).unwrap();
        assert_eq!(built.binds, vec![BindValue::Int(99)]);
    }

    #[test]
    fn sub_query_side_nests_with_own_aliases() {
        let f = fixture();
        let sub = Query {
            id: Uuid::new_v4(),
            relation_id: Some(f.order),
            fixed_limit: 0,
            joins: vec![],
            filters: vec![],
            orders: vec![],
        };
        let filter = QueryFilter {
            connector: FilterConnector::And,
            operator: "= ANY".into(),
            side0: QueryFilterSide {
                content: FilterSideContent::Attribute,
                attribute_id: Some(f.customer_name),
                attribute_index: 0,
                brackets: 0,
                preset_id: None,
                value: None,
                query: None,
                query_aggregator: None,
            },
            side1: QueryFilterSide {
                content: FilterSideContent::SubQuery,
                attribute_id: Some(f.order_total),
                attribute_index: 0,
                brackets: 0,
                preset_id: None,
                value: None,
                query: Some(Box::new(sub)),
                query_aggregator: None,
            },
        };
        let get = DataGet {
            relation_id: f.customer,
            joins: vec![],
            expressions: vec![],
            filters: vec![filter],
            orders: vec![],
            limit: 0,
            offset: 0,
        };

        let built = build_select(&f.schema, &f.roles, 7, &get).unwrap();
        assert!(built
            .sql
            .contains("IN (SELECT \"s1t0\".\"total\" FROM \"shop\".\"order\" AS \"s1t0\")"));
    }

    #[test]
    fn quantified_value_list_binds_per_element() {
        let f = fixture();
        let get = DataGet {
            relation_id: f.customer,
            joins: vec![],
            expressions: vec![],
            filters: vec![value_filter(
                f.customer_name,
                "= ANY",
                serde_json::json!(["a", "b", "c"]),
            )],
            orders: vec![],
            limit: 0,
            offset: 0,
        };

        let built = build_select(&f.schema, &f.roles, 7, &get).unwrap();
        assert!(built.sql.contains("= ANY(ARRAY[$1, $2, $3])"));
        assert_eq!(built.binds.len(), 3);
    }

    #[test]
    fn unauthorized_attribute_fails_before_sql() {
        let f = fixture();
        let get = DataGet {
            relation_id: f.customer,
            joins: vec![],
            expressions: vec![DataExpression {
                attribute_id: f.customer_name,
                index: 0,
                aggregator: None,
                distincted: false,
            }],
            filters: vec![],
            orders: vec![],
            limit: 0,
            offset: 0,
        };

        let empty = HashSet::new();
        assert!(matches!(
            build_select(&f.schema, &empty, 7, &get),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn policy_denies_when_no_role_matches() {
        let f = fixture();
        let mut relation = f.schema.relation(&f.customer).unwrap();
        relation.policies.push(Policy {
            relation_id: relation.id,
            position: 0,
            role_id: Uuid::new_v4(), // role the login does not hold
            pg_function_id_select: None,
            pg_function_id_update: None,
            pg_function_id_delete: None,
            action_select: true,
            action_update: false,
            action_delete: false,
        });

        let predicate =
            policy_predicate(&f.schema, &f.roles, &relation, PolicyAction::Select, "t0").unwrap();
        assert_eq!(predicate, Some("FALSE".into()));
    }

    #[test]
    fn policy_without_function_is_unrestricted() {
        let f = fixture();
        let role_id = *f.roles.iter().next().unwrap();
        let mut relation = f.schema.relation(&f.customer).unwrap();
        relation.policies.push(Policy {
            relation_id: relation.id,
            position: 0,
            role_id,
            pg_function_id_select: None,
            pg_function_id_update: None,
            pg_function_id_delete: None,
            action_select: true,
            action_update: false,
            action_delete: false,
        });

        let predicate =
            policy_predicate(&f.schema, &f.roles, &relation, PolicyAction::Select, "t0").unwrap();
        assert_eq!(predicate, None);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let f = fixture();
        let get = DataGet {
            relation_id: f.customer,
            joins: vec![],
            expressions: vec![],
            filters: vec![value_filter(
                f.customer_name,
                "; DROP TABLE",
                serde_json::json!(1),
            )],
            orders: vec![],
            limit: 0,
            offset: 0,
        };
        assert!(build_select(&f.schema, &f.roles, 7, &get).is_err());
    }
}
