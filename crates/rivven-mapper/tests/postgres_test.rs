//! PostgreSQL backend tests
//!
//! These tests require Docker to run a PostgreSQL container.
//! Run with: cargo test -p rivven-mapper --features postgres --test postgres_test -- --ignored

#![cfg(feature = "postgres")]

use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;

use rivven_mapper::config::MapperConfig;
use rivven_mapper::connection::ConnectionConfig;
use rivven_mapper::error::{ErrorCategory, Result};
use rivven_mapper::executor::SqlExecutor;
use rivven_mapper::mapping::ResultMap;
use rivven_mapper::postgres::PgConnectionFactory;
use rivven_mapper::render::StatementTemplate;
use rivven_mapper::statement::{Configuration, MappedStatement};

#[derive(Debug, Clone, PartialEq)]
struct Host {
    addr: String,
}

async fn start_postgres() -> (ContainerAsync<Postgres>, String) {
    let container = Postgres::default().start().await.unwrap();
    let host = container.get_host().await.unwrap().to_string();

    // Retry port retrieval to handle testcontainers race condition
    let mut port = None;
    for i in 0..10 {
        if let Ok(p) = container.get_host_port_ipv4(5432).await {
            port = Some(p);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100 * (i + 1))).await;
    }
    let url = format!(
        "postgres://postgres:postgres@{}:{}/postgres",
        host,
        port.expect("PostgreSQL port not exposed")
    );
    (container, url)
}

fn executor(url: &str, sql: &str) -> SqlExecutor {
    let configuration = Configuration::new(MapperConfig::default());
    configuration
        .add_statement(MappedStatement::select(
            "host.all",
            StatementTemplate::new(sql),
            ResultMap::builder("host", |row| {
                Ok(Host {
                    addr: row.get_required("addr")?,
                })
            })
            .key("addr")
            .build()
            .unwrap(),
        ))
        .unwrap();
    SqlExecutor::new(
        Arc::new(configuration),
        Arc::new(PgConnectionFactory::new(ConnectionConfig::new(url))),
    )
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_text_columns_are_mapped() {
    let (_container, url) = start_postgres().await;
    let executor = executor(&url, "SELECT 'db-1'::text AS addr UNION ALL SELECT 'db-2'");

    let hosts: Vec<Host> = executor
        .select_many::<Host, _>("host.all", &())
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();

    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0].addr, "db-1");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_undecodable_key_column_fails_instead_of_skipping() {
    let (_container, url) = start_postgres().await;
    // INET has no text decoding in the driver
    let executor = executor(&url, "SELECT '10.0.0.1'::inet AS addr");

    let results: Vec<Result<Host>> = executor
        .select_many::<Host, _>("host.all", &())
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    let err = results.into_iter().next().unwrap().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Execution);
    assert!(err.to_string().contains("'addr'"));
    assert!(err.to_string().contains("inet"));
}
