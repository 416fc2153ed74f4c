//! Unit tests for rivven-mapper dialect module

use rivven_mapper::dialect::{BindStyle, Dialect, DialectRegistry, DEFAULT_DIALECT};
use rivven_mapper::render::{render, BoundParameters, StatementTemplate};
use rivven_mapper::types::Value;

fn three_params() -> BoundParameters {
    let registry = rivven_mapper::adapter::TypeAdapterRegistry::new();
    rivven_mapper::render::bind_parameters(
        "test",
        &registry,
        &vec![Value::Int64(1), Value::String("a".into()), Value::Bool(true)],
    )
    .unwrap()
}

#[test]
fn test_postgres_placeholder() {
    let dialect = Dialect::postgres();

    assert_eq!(dialect.placeholder(0, None), "$1");
    assert_eq!(dialect.placeholder(1, None), "$2");
    assert_eq!(dialect.placeholder(9, None), "$10");
    assert!(!dialect.binds_by_name());
}

#[test]
fn test_mysql_placeholder() {
    let dialect = Dialect::mysql();

    // MySQL uses ? for all placeholders
    assert_eq!(dialect.placeholder(0, None), "?");
    assert_eq!(dialect.placeholder(1, Some("id")), "?");
    assert_eq!(dialect.bind_name(0, None), None);
}

#[test]
fn test_sqlserver_placeholder() {
    let dialect = Dialect::sqlserver();

    assert_eq!(dialect.placeholder(0, None), "@p1");
    assert_eq!(dialect.placeholder(9, None), "@p10");
    assert_eq!(dialect.bind_name(1, None), Some("p2".to_string()));
}

#[test]
fn test_oracle_placeholder() {
    let dialect = Dialect::oracle();

    assert_eq!(dialect.placeholder(0, Some("dept")), ":p1");
    assert!(dialect.binds_by_name());
}

#[test]
fn test_named_dialect_with_declared_names() {
    let dialect = Dialect::new(
        "Custom",
        ":",
        BindStyle::Named {
            start_index: 1,
            declared_names: true,
        },
    );

    assert_eq!(dialect.placeholder(0, Some("dept_id")), ":dept_id");
    // not a plain identifier, falls back to the synthetic name
    assert_eq!(dialect.placeholder(1, Some("dept.id")), ":p2");
    assert_eq!(dialect.bind_name(0, Some("dept_id")), Some("dept_id".to_string()));
}

#[test]
fn test_markers_round_trip_for_every_dialect() {
    let template = StatementTemplate::new(
        "SELECT * FROM emp WHERE dept = ? AND name = ? AND note <> '?' /* ? */ AND active = ?",
    );
    let params = three_params();

    for dialect in [
        Dialect::default_positional(),
        Dialect::mysql(),
        Dialect::mariadb(),
        Dialect::h2(),
        Dialect::sqlite(),
        Dialect::postgres(),
        Dialect::oracle(),
        Dialect::sqlserver(),
    ] {
        let bound = render(&dialect, &template, &params).unwrap();
        let markers = dialect.find_markers(&bound.sql);
        let placeholders: Vec<String> = bound.bindings.iter().map(|b| b.placeholder.clone()).collect();

        assert_eq!(markers.len(), 3, "dialect {}", dialect.name());
        assert_eq!(markers, placeholders, "dialect {}", dialect.name());
        assert!(bound.sql.contains("'?'"), "literal rewritten by {}", dialect.name());
        assert!(bound.sql.contains("/* ? */"), "comment rewritten by {}", dialect.name());
    }
}

#[test]
fn test_registry_resolves_by_product_name() {
    let registry = DialectRegistry::new();

    assert_eq!(registry.resolve("PostgreSQL", None).unwrap().name(), "PostgreSQL");
    assert_eq!(
        registry.resolve("Microsoft SQL Server", None).unwrap().name(),
        "SQL Server"
    );
    assert_eq!(registry.resolve("MariaDB", None).unwrap().name(), "MariaDB");
    assert_eq!(registry.resolve("Oracle", None).unwrap().name(), "Oracle");
}

#[test]
fn test_registry_falls_back_to_positional() {
    let registry = DialectRegistry::new();

    let dialect = registry.resolve("SomeUnknownDb", None).unwrap();
    assert_eq!(dialect.name(), DEFAULT_DIALECT);
    assert_eq!(dialect.placeholder(3, None), "?");
}

#[test]
fn test_registry_override_wins() {
    let registry = DialectRegistry::new();

    let dialect = registry.resolve("PostgreSQL", Some("mysql")).unwrap();
    assert_eq!(dialect.name(), "MySQL");
    assert!(registry.resolve("PostgreSQL", Some("nope")).is_err());
}

#[test]
fn test_registering_replaces_same_name() {
    let registry = DialectRegistry::new();
    let before = registry.names().len();

    registry.register(Dialect::new("PostgreSQL", "?", BindStyle::Anonymous));

    assert_eq!(registry.names().len(), before);
    assert_eq!(registry.resolve("PostgreSQL", None).unwrap().placeholder(0, None), "?");
}

#[test]
fn test_custom_dialect_matches_product_fragments() {
    let registry = DialectRegistry::empty();
    registry.register(
        Dialect::new("Cockroach", "$", BindStyle::Indexed { start_index: 1 })
            .with_product_names(["cockroach"]),
    );

    assert_eq!(registry.resolve("CockroachDB CCL v23", None).unwrap().name(), "Cockroach");
    assert_eq!(registry.resolve("PostgreSQL", None).unwrap().name(), DEFAULT_DIALECT);
}
