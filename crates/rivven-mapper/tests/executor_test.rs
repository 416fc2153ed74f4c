//! Integration tests for rivven-mapper statement execution

use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rivven_mapper::config::MapperConfig;
use rivven_mapper::error::{ErrorCategory, Result};
use rivven_mapper::executor::{ExecutionContext, SqlExecutor};
use rivven_mapper::listener::{ExecutionListener, ExecutionOutcome};
use rivven_mapper::mapping::ResultMap;
use rivven_mapper::render::StatementTemplate;
use rivven_mapper::statement::{Configuration, GeneratedKeys, MappedStatement, StatementKind};
use rivven_mapper::testing::{rows, MockConnectionFactory};
use rivven_mapper::types::Value;

#[derive(Debug, Clone, PartialEq)]
struct Employee {
    id: i64,
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Department {
    id: i64,
    employees: Vec<Employee>,
}

fn employee_map() -> ResultMap<Employee> {
    ResultMap::builder("employee", |row| {
        Ok(Employee {
            id: row.get_required("emp_id")?,
            name: row.get_required("emp_name")?,
        })
    })
    .key("emp_id")
    .build()
    .unwrap()
}

fn department_map(ordered: bool) -> ResultMap<Department> {
    ResultMap::builder("department", |row| {
        Ok(Department {
            id: row.get_required("dept_id")?,
            employees: Vec::new(),
        })
    })
    .key("dept_id")
    .ordered(ordered)
    .collection("employees", employee_map(), |d: &mut Department, e: Vec<Employee>| {
        d.employees = e
    })
    .build()
    .unwrap()
}

const DEPT_COLUMNS: &[(&str, &str)] = &[
    ("dept_id", "BIGINT"),
    ("emp_id", "BIGINT"),
    ("emp_name", "VARCHAR"),
];

/// Department rows: `sizes[i]` employees for department `i + 1`
fn department_data(sizes: &[usize]) -> Vec<Vec<Value>> {
    let mut data = Vec::new();
    for (d, size) in sizes.iter().enumerate() {
        for e in 0..*size {
            let emp_id = (d * 100 + e) as i64;
            data.push(vec![
                Value::Int64(d as i64 + 1),
                Value::Int64(emp_id),
                Value::String(format!("emp{}", emp_id)),
            ]);
        }
    }
    data
}

fn configuration(settings: MapperConfig) -> Arc<Configuration> {
    let configuration = Configuration::new(settings);
    configuration
        .add_statement(MappedStatement::select(
            "employee.byDept",
            StatementTemplate::new("SELECT emp_id, emp_name FROM emp WHERE dept_id = ?")
                .with_parameter("dept"),
            employee_map(),
        ))
        .unwrap();
    configuration
        .add_statement(MappedStatement::select(
            "department.all",
            StatementTemplate::new(
                "SELECT d.id AS dept_id, e.id AS emp_id, e.name AS emp_name \
                 FROM dept d JOIN emp e ON e.dept_id = d.id ORDER BY d.id",
            ),
            department_map(true),
        ))
        .unwrap();
    configuration
        .add_statement(MappedStatement::select(
            "department.unsorted",
            StatementTemplate::new(
                "SELECT d.id AS dept_id, e.id AS emp_id, e.name AS emp_name \
                 FROM dept d JOIN emp e ON e.dept_id = d.id",
            ),
            department_map(false),
        ))
        .unwrap();
    configuration
        .add_statement(MappedStatement::update(
            "employee.rename",
            StatementTemplate::new("UPDATE emp SET name = ? WHERE id = ?")
                .with_parameter("name")
                .with_parameter("id"),
        ))
        .unwrap();
    configuration
        .add_statement(
            MappedStatement::insert(
                "employee.insert",
                StatementTemplate::new("INSERT INTO emp (name) VALUES (?)").with_parameter("name"),
            )
            .with_generated_keys(GeneratedKeys::new(["id"]).with_columns(["emp_id"])),
        )
        .unwrap();
    Arc::new(configuration)
}

fn executor(factory: &Arc<MockConnectionFactory>) -> SqlExecutor {
    SqlExecutor::new(configuration(MapperConfig::default()), factory.clone())
}

fn employee_rows(count: usize) -> MockConnectionFactory {
    MockConnectionFactory::new("PostgreSQL").with_rows(
        &[("emp_id", "BIGINT"), ("emp_name", "VARCHAR")],
        (0..count)
            .map(|i| vec![Value::Int64(i as i64), Value::String(format!("emp{}", i))])
            .collect(),
    )
}

fn rename(name: &str, id: i64) -> HashMap<String, Value> {
    HashMap::from([
        ("name".to_string(), Value::String(name.into())),
        ("id".to_string(), Value::Int64(id)),
    ])
}

async fn wait_for_closes(factory: &MockConnectionFactory, count: u64) {
    tokio::time::timeout(Duration::from_secs(5), factory.wait_for_closes(count))
        .await
        .expect("connection was not released");
}

#[tokio::test]
async fn test_select_many_streams_and_releases() {
    let factory = Arc::new(employee_rows(3));
    let executor = executor(&factory);

    let employees: Vec<Employee> = executor
        .select_many::<Employee, _>("employee.byDept", &10_i64)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();

    assert_eq!(employees.len(), 3);
    assert_eq!(employees[2].name, "emp2");
    let stats = factory.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.rows_pulled, 3);

    let executed = factory.executed();
    assert_eq!(executed[0].sql, "SELECT emp_id, emp_name FROM emp WHERE dept_id = $1");
    assert_eq!(executed[0].values(), vec![Value::Int64(10)]);

    let snapshot = executor.configuration().stats().snapshot();
    assert_eq!(snapshot.queries, 1);
    assert_eq!(snapshot.rows_read, 3);
}

#[tokio::test]
async fn test_nothing_happens_until_polled() {
    let factory = Arc::new(employee_rows(3));
    let executor = executor(&factory);

    let stream = executor.select_many::<Employee, _>("employee.byDept", &1_i64);
    tokio::task::yield_now().await;
    assert_eq!(factory.stats().connects, 0);
    drop(stream);
    assert_eq!(factory.stats().connects, 0);
}

#[tokio::test]
async fn test_ordered_aggregation_pulls_one_row_past_each_parent() {
    let sizes = [2, 3, 1, 4];
    let factory = Arc::new(
        MockConnectionFactory::new("PostgreSQL").with_rows(DEPT_COLUMNS, department_data(&sizes)),
    );
    let executor = executor(&factory);

    for m in 1..sizes.len() {
        let before = factory.stats().rows_pulled;
        let departments: Vec<Department> = executor
            .select_many::<Department, _>("department.all", &())
            .take(m)
            .map(|d| d.unwrap())
            .collect()
            .await;

        assert_eq!(departments.len(), m);
        assert_eq!(departments[m - 1].employees.len(), sizes[m - 1]);
        let expected: usize = sizes[..m].iter().sum::<usize>() + 1;
        assert_eq!(factory.stats().rows_pulled - before, expected as u64);
    }

    // every abandoned stream still released its connection
    wait_for_closes(&factory, (sizes.len() - 1) as u64).await;
}

#[tokio::test]
async fn test_unordered_aggregation_reads_everything_for_the_first_parent() {
    let factory = Arc::new(MockConnectionFactory::new("PostgreSQL").with_rows(
        DEPT_COLUMNS,
        vec![
            vec![Value::Int64(1), Value::Int64(10), Value::String("a".into())],
            vec![Value::Int64(2), Value::Int64(20), Value::String("b".into())],
            vec![Value::Int64(1), Value::Int64(11), Value::String("c".into())],
            vec![Value::Int64(2), Value::Int64(21), Value::String("d".into())],
        ],
    ));
    let executor = executor(&factory);

    let departments: Vec<Department> = executor
        .select_many::<Department, _>("department.unsorted", &())
        .take(1)
        .map(|d| d.unwrap())
        .collect()
        .await;

    assert_eq!(departments.len(), 1);
    assert_eq!(departments[0].id, 1);
    let names: Vec<&str> = departments[0].employees.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);
    assert_eq!(factory.stats().rows_pulled, 4);

    wait_for_closes(&factory, 1).await;
    assert_eq!(factory.stats().closes, 1);
}

#[tokio::test]
async fn test_department_example() {
    let factory = Arc::new(MockConnectionFactory::new("H2").with_rows(
        DEPT_COLUMNS,
        vec![
            vec![Value::Int64(1), Value::Int64(10), Value::String("A".into())],
            vec![Value::Int64(1), Value::Int64(11), Value::String("B".into())],
            vec![Value::Int64(2), Value::Int64(20), Value::String("C".into())],
        ],
    ));
    let executor = executor(&factory);

    let departments: Vec<Department> = executor
        .select_many::<Department, _>("department.all", &())
        .map(|d| d.unwrap())
        .collect()
        .await;

    assert_eq!(departments.len(), 2);
    let names: Vec<&str> = departments[0].employees.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
    assert_eq!(departments[1].employees[0].name, "C");
    assert_eq!(factory.stats().closes, 1);
}

#[tokio::test]
async fn test_cancellation_releases_connection() {
    let factory = Arc::new(employee_rows(10));
    let executor = executor(&factory);

    let mut stream = executor.select_many::<Employee, _>("employee.byDept", &1_i64);
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.id, 0);
    assert_eq!(factory.stats().closes, 0);

    drop(stream);
    wait_for_closes(&factory, 1).await;
    assert_eq!(factory.stats().closes, 1);
    assert_eq!(factory.stats().rows_pulled, 1);
}

#[tokio::test]
async fn test_driver_error_releases_once() {
    let factory = Arc::new(employee_rows(5).fail_at_row(2));
    let executor = executor(&factory);

    let results: Vec<Result<Employee>> = executor
        .select_many("employee.byDept", &1_i64)
        .collect()
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok() && results[1].is_ok());
    assert_eq!(results[2].as_ref().unwrap_err().category(), ErrorCategory::Execution);
    assert_eq!(factory.stats().closes, 1);
    assert_eq!(executor.configuration().stats().snapshot().failures, 1);
}

#[tokio::test]
async fn test_query_failure_is_reported_with_sql() {
    let factory = Arc::new(employee_rows(1).fail_query("syntax error"));
    let executor = executor(&factory);

    let results: Vec<Result<Employee>> = executor
        .select_many("employee.byDept", &1_i64)
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    let err = results.into_iter().next().unwrap().unwrap_err();
    assert!(err.to_string().contains("syntax error"));
    assert_eq!(err.sql(), Some("SELECT emp_id, emp_name FROM emp WHERE dept_id = $1"));
    assert_eq!(factory.stats().closes, 1);
}

#[tokio::test]
async fn test_connect_failure_needs_no_release() {
    let factory = Arc::new(employee_rows(1).fail_connect("refused"));
    let executor = executor(&factory);

    let results: Vec<Result<Employee>> = executor
        .select_many("employee.byDept", &1_i64)
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap_err().category(), ErrorCategory::Connection);
    assert_eq!(factory.stats().closes, 0);
}

#[tokio::test]
async fn test_unknown_statement_and_wrong_kind() {
    let factory = Arc::new(employee_rows(1));
    let executor = executor(&factory);

    let err = executor
        .select_one::<Employee, _>("missing", &())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);

    let err = executor.update("employee.byDept", &1_i64).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);

    let err = executor
        .select_one::<Department, _>("employee.byDept", &1_i64)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("maps rows to"));
    assert_eq!(factory.stats().connects, 0);
}

#[tokio::test]
async fn test_select_one() {
    let factory = Arc::new(employee_rows(1));
    let one = executor(&factory)
        .select_one::<Employee, _>("employee.byDept", &1_i64)
        .await
        .unwrap();
    assert_eq!(one.map(|e| e.id), Some(0));

    let factory = Arc::new(employee_rows(0));
    let none = executor(&factory)
        .select_one::<Employee, _>("employee.byDept", &1_i64)
        .await
        .unwrap();
    assert_eq!(none, None);

    let factory = Arc::new(employee_rows(2));
    let err = executor(&factory)
        .select_one::<Employee, _>("employee.byDept", &1_i64)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Mapping);
    wait_for_closes(&factory, 1).await;
}

#[tokio::test]
async fn test_update_returns_affected_rows() {
    let factory = Arc::new(MockConnectionFactory::new("MySQL").with_rows_affected(2));
    let executor = executor(&factory);

    let affected = executor.update("employee.rename", &rename("Bob", 7)).await.unwrap();

    assert_eq!(affected, 2);
    let stats = factory.stats();
    assert_eq!((stats.executes, stats.begins, stats.commits, stats.closes), (1, 0, 0, 1));

    let executed = factory.executed();
    assert_eq!(executed[0].sql, "UPDATE emp SET name = ? WHERE id = ?");
    assert_eq!(
        executed[0].values(),
        vec![Value::String("Bob".into()), Value::Int64(7)]
    );
}

#[tokio::test]
async fn test_without_auto_commit_each_operation_is_a_transaction() {
    let factory = Arc::new(MockConnectionFactory::new("H2").with_rows_affected(1));
    let executor = SqlExecutor::new(
        configuration(MapperConfig::default().with_auto_commit(false)),
        factory.clone(),
    );

    executor.update("employee.rename", &rename("Bob", 7)).await.unwrap();
    let stats = factory.stats();
    assert_eq!((stats.begins, stats.commits, stats.rollbacks, stats.closes), (1, 1, 0, 1));

    let factory = Arc::new(MockConnectionFactory::new("H2").fail_execute("constraint violated"));
    let executor = SqlExecutor::new(
        configuration(MapperConfig::default().with_auto_commit(false)),
        factory.clone(),
    );
    assert!(executor.update("employee.rename", &rename("Bob", 7)).await.is_err());
    let stats = factory.stats();
    assert_eq!((stats.begins, stats.commits, stats.rollbacks, stats.closes), (1, 0, 1, 1));
}

#[tokio::test]
async fn test_generated_keys_are_applied() {
    let factory = Arc::new(
        MockConnectionFactory::new("PostgreSQL")
            .with_rows_affected(1)
            .with_generated_keys(rows(&[("emp_id", "BIGINT")], vec![vec![Value::Int64(42)]])),
    );
    let executor = executor(&factory);

    let mut employee = HashMap::from([("name".to_string(), Value::String("Ann".into()))]);
    let affected = executor
        .insert_returning("employee.insert", &mut employee)
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert_eq!(employee.get("id"), Some(&Value::Int64(42)));
    assert_eq!(
        factory.executed()[0].generated_keys,
        Some(vec!["emp_id".to_string()])
    );
}

#[tokio::test]
async fn test_generated_key_failures() {
    // driver reports no key rows
    let factory = Arc::new(MockConnectionFactory::new("PostgreSQL").with_rows_affected(1));
    let mut employee = HashMap::from([("name".to_string(), Value::String("Ann".into()))]);
    let err = executor(&factory)
        .insert_returning("employee.insert", &mut employee)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::GeneratedKey);

    // driver reports a different column
    let factory = Arc::new(
        MockConnectionFactory::new("PostgreSQL")
            .with_generated_keys(rows(&[("other", "BIGINT")], vec![vec![Value::Int64(1)]])),
    );
    let err = executor(&factory)
        .insert_returning("employee.insert", &mut employee)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::GeneratedKey);
    assert!(err.to_string().contains("emp_id"));
    assert_eq!(factory.stats().closes, 1);

    // statement never asked for keys
    let mut params = rename("Bob", 1);
    let err = executor(&factory)
        .insert_returning("employee.rename", &mut params)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[tokio::test]
async fn test_dialect_resolution_order() {
    let factory = Arc::new(employee_rows(0));
    let executor = executor(&factory);

    // product name
    executor.select_one::<Employee, _>("employee.byDept", &1_i64).await.unwrap();
    // context attribute beats product name
    executor
        .select_one_with::<Employee, _>(
            "employee.byDept",
            &1_i64,
            &ExecutionContext::new().with_dialect("SQL Server"),
        )
        .await
        .unwrap();

    let sql: Vec<String> = factory.executed().into_iter().map(|s| s.sql).collect();
    assert_eq!(sql[0], "SELECT emp_id, emp_name FROM emp WHERE dept_id = $1");
    assert_eq!(sql[1], "SELECT emp_id, emp_name FROM emp WHERE dept_id = @p1");

    // configured default beats product name
    let factory = Arc::new(employee_rows(0));
    let executor = SqlExecutor::new(
        configuration(MapperConfig::default().with_default_dialect("MySQL")),
        factory.clone(),
    );
    executor.select_one::<Employee, _>("employee.byDept", &1_i64).await.unwrap();
    assert_eq!(
        factory.executed()[0].sql,
        "SELECT emp_id, emp_name FROM emp WHERE dept_id = ?"
    );

    // unknown forced dialect fails before any SQL is sent
    let err = executor
        .select_one_with::<Employee, _>(
            "employee.byDept",
            &1_i64,
            &ExecutionContext::new().with_dialect("Nope"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert_eq!(factory.executed().len(), 1);
}

#[tokio::test]
async fn test_statement_dialect() {
    let configuration = configuration(MapperConfig::default());
    configuration
        .add_statement(
            MappedStatement::delete(
                "employee.purge",
                StatementTemplate::new("DELETE FROM emp WHERE id = ?"),
            )
            .with_dialect("Oracle"),
        )
        .unwrap();
    let factory = Arc::new(MockConnectionFactory::new("PostgreSQL"));
    let executor = SqlExecutor::new(configuration, factory.clone());

    executor.delete("employee.purge", &3_i64).await.unwrap();
    assert_eq!(factory.executed()[0].sql, "DELETE FROM emp WHERE id = :p1");
}

#[tokio::test]
async fn test_transaction_shares_one_connection() {
    let factory = Arc::new(employee_rows(2).with_rows_affected(1));
    let executor = executor(&factory);

    let tx = executor.begin().await.unwrap();
    tx.update("employee.rename", &rename("A", 1)).await.unwrap();
    tx.update("employee.rename", &rename("B", 2)).await.unwrap();
    let employees: Vec<Result<Employee>> = tx.select_many("employee.byDept", &1_i64).collect().await;
    assert_eq!(employees.len(), 2);
    assert!(tx.lease().is_dirty());

    tx.commit(false).await.unwrap();
    tx.close().await.unwrap();

    let stats = factory.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.begins, 1);
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 0);
    assert_eq!(stats.closes, 1);
}

#[tokio::test]
async fn test_transaction_commit_skipped_without_mutation() {
    let factory = Arc::new(employee_rows(1));
    let executor = executor(&factory);

    let tx = executor.begin().await.unwrap();
    tx.select_one::<Employee, _>("employee.byDept", &1_i64).await.unwrap();
    tx.commit(false).await.unwrap();
    assert_eq!(factory.stats().commits, 0);
    tx.commit(true).await.unwrap();
    assert_eq!(factory.stats().commits, 1);
    tx.close().await.unwrap();
    assert_eq!(factory.stats().closes, 1);
}

#[tokio::test]
async fn test_close_rolls_back_uncommitted_changes() {
    let factory = Arc::new(MockConnectionFactory::new("H2").with_rows_affected(1));
    let executor = executor(&factory);

    let tx = executor.begin().await.unwrap();
    tx.update("employee.rename", &rename("A", 1)).await.unwrap();
    tx.close().await.unwrap();

    let stats = factory.stats();
    assert_eq!((stats.commits, stats.rollbacks, stats.closes), (0, 1, 1));
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back_and_releases() {
    let factory = Arc::new(MockConnectionFactory::new("H2").with_rows_affected(1));
    let executor = executor(&factory);

    let tx = executor.begin().await.unwrap();
    tx.update("employee.rename", &rename("A", 1)).await.unwrap();
    drop(tx);

    wait_for_closes(&factory, 1).await;
    assert_eq!(factory.stats().rollbacks, 1);
}

#[tokio::test]
async fn test_nested_transactions_are_rejected() {
    let factory = Arc::new(MockConnectionFactory::new("H2"));
    let executor = executor(&factory);

    let tx = executor.begin().await.unwrap();
    let err = tx.executor().begin().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transaction);
    tx.close().await.unwrap();
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let factory = Arc::new(MockConnectionFactory::new("H2"));
    let executor = executor(&factory);

    let tx = executor.begin().await.unwrap();
    let scoped = tx.executor().clone();
    tx.close().await.unwrap();

    let err = scoped.update("employee.rename", &rename("A", 1)).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transaction);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl ExecutionListener for Recorder {
    fn on_prepared(&self, statement_id: &str, kind: StatementKind, _statement: &rivven_mapper::render::BoundStatement) {
        self.events.lock().push(format!("prepared {} {}", kind, statement_id));
    }

    fn on_completed(&self, statement_id: &str, outcome: ExecutionOutcome, _elapsed: Duration) {
        self.events.lock().push(format!("completed {} {:?}", statement_id, outcome));
    }
}

#[tokio::test]
async fn test_listeners_observe_statements() {
    let factory = Arc::new(employee_rows(2).with_rows_affected(1));
    let executor = executor(&factory);
    let recorder = Arc::new(Recorder::default());
    executor.configuration().add_listener(recorder.clone());

    let _: Vec<Result<Employee>> = executor.select_many("employee.byDept", &1_i64).collect().await;
    executor.update("employee.rename", &rename("A", 1)).await.unwrap();

    assert_eq!(
        *recorder.events.lock(),
        vec![
            "prepared select employee.byDept".to_string(),
            "completed employee.byDept Rows(2)".to_string(),
            "prepared update employee.rename".to_string(),
            "completed employee.rename Updates(1)".to_string(),
        ]
    );
}
