use std::ffi::OsStr;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn temp_db(prefix: &str) -> PathBuf {
    unique_temp_dir(prefix).join("compare.sqlite3")
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn run_ck<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ck"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ck binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ck(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ck command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(as_str(&value, "contract_version"), "cli.v1");
    value
}

fn ck(db: &Path, args: &[&str]) -> Value {
    let mut full = vec!["--db", path_str(db)];
    full.extend_from_slice(args);
    run_json(full)
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing bool field `{key}` in payload: {value}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn selection(value: &Value) -> Vec<String> {
    value
        .get("selection")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing selection in payload: {value}"))
        .iter()
        .map(|id| id.as_str().unwrap_or_else(|| panic!("non-string id in {value}")).to_string())
        .collect()
}

fn advisory_code(value: &Value) -> &str {
    value
        .get("advisory")
        .and_then(|advisory| advisory.get("code"))
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing advisory code in payload: {value}"))
}

/// Serve `GET /api/vehicles/{id}` from `records`; unknown ids answer 404.
fn spawn_record_store(records: Vec<(&'static str, &'static str)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .unwrap_or_else(|err| panic!("failed to bind record store: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("failed to read record store address: {err}"));

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let mut request_line = String::new();
            let Ok(reader) = stream.try_clone() else {
                continue;
            };
            let mut reader = BufReader::new(reader);
            if reader.read_line(&mut request_line).is_err() {
                continue;
            }
            loop {
                let mut header = String::new();
                match reader.read_line(&mut header) {
                    Ok(0) | Err(_) => break,
                    Ok(_) if header == "\r\n" => break,
                    Ok(_) => {}
                }
            }

            let path = request_line.split_whitespace().nth(1).unwrap_or_default();
            let id = path.strip_prefix("/api/vehicles/").unwrap_or_default();
            let (status, body) = records
                .iter()
                .find(|(known, _)| *known == id)
                .map_or(("404 Not Found", "{}"), |(_, body)| ("200 OK", *body));
            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(reply.as_bytes());
        }
    });

    format!("http://{addr}/api")
}

// Test IDs: TCLI-001
#[test]
fn add_remove_and_share_flow() {
    let db = temp_db("ck-share");

    ck(&db, &["add", "3"]);
    let added = ck(&db, &["add", "7"]);
    assert!(as_bool(&added, "accepted"));
    assert_eq!(as_str(&added, "address"), "?ids=3,7");
    assert_eq!(as_i64(&added, "count"), 2);

    let duplicate = ck(&db, &["add", "7"]);
    assert!(!as_bool(&duplicate, "accepted"));
    assert_eq!(advisory_code(&duplicate), "DUPLICATE_MEMBER");
    assert_eq!(selection(&duplicate), vec!["3", "7"]);

    let removed = ck(&db, &["remove", "3"]);
    assert_eq!(as_str(&removed, "address"), "?ids=7");
    assert_eq!(selection(&removed), vec!["7"]);

    let missing = ck(&db, &["remove", "3"]);
    assert!(as_bool(&missing, "accepted"));
    assert!(!as_bool(&missing, "changed"));
}

// Test IDs: TCLI-002
#[test]
fn fifth_vehicle_is_rejected_with_capacity_advisory() {
    let db = temp_db("ck-capacity");
    for id in ["1", "2", "3", "4"] {
        ck(&db, &["add", id]);
    }

    let rejected = ck(&db, &["add", "5"]);
    assert!(!as_bool(&rejected, "accepted"));
    assert_eq!(advisory_code(&rejected), "CAPACITY_EXCEEDED");

    let shown = ck(&db, &["show"]);
    assert_eq!(selection(&shown), vec!["1", "2", "3", "4"]);
}

// Test IDs: TCLI-003
#[test]
fn invalid_identifier_is_an_advisory() {
    let db = temp_db("ck-invalid");

    let rejected = ck(&db, &["add", "3,7"]);
    assert!(!as_bool(&rejected, "accepted"));
    assert_eq!(advisory_code(&rejected), "INVALID_IDENTIFIER");

    let contains = ck(&db, &["contains", "a b"]);
    assert!(!as_bool(&contains, "contains"));
    assert_eq!(advisory_code(&contains), "INVALID_IDENTIFIER");
}

// Test IDs: TCLI-004
#[test]
fn selection_survives_between_invocations() {
    let db = temp_db("ck-persist");
    ck(&db, &["add", "5"]);
    ck(&db, &["add", "2"]);

    let shown = ck(&db, &["show"]);
    assert_eq!(selection(&shown), vec!["5", "2"]);
    assert_eq!(as_str(&shown, "source"), "persisted");
    assert!(as_bool(&ck(&db, &["contains", "2"]), "contains"));
    assert!(!as_bool(&ck(&db, &["contains", "9"]), "contains"));

    let slot = ck(&db, &["db", "slot"]);
    let entry = slot.get("entry").unwrap_or_else(|| panic!("missing entry: {slot}"));
    assert_eq!(as_str(entry, "value"), r#"["5","2"]"#);
}

// Test IDs: TCLI-005
#[test]
fn opening_address_overrides_persisted_selection() {
    let db = temp_db("ck-startup");
    ck(&db, &["add", "1"]);
    ck(&db, &["add", "2"]);

    let opened = ck(&db, &["--address", "/compare?ids=5,6", "show"]);
    assert_eq!(as_str(&opened, "source"), "address");
    assert_eq!(selection(&opened), vec!["5", "6"]);
    assert_eq!(as_str(&opened, "address"), "/compare?ids=5,6");

    let later = ck(&db, &["show"]);
    assert_eq!(selection(&later), vec!["5", "6"]);

    let no_param = ck(&db, &["--address", "/compare?sort=price", "show"]);
    assert_eq!(as_str(&no_param, "source"), "persisted");
    assert_eq!(as_str(&no_param, "address"), "/compare?sort=price&ids=5,6");
}

// Test IDs: TCLI-006
#[test]
fn open_normalizes_and_reports_dropped() {
    let db = temp_db("ck-open");

    let opened = ck(&db, &["open", "/cars?ids=1,1,2,3,4,5&sort=year"]);
    assert_eq!(selection(&opened), vec!["1", "2", "3", "4"]);
    assert_eq!(as_str(&opened, "address"), "/cars?ids=1,2,3,4&sort=year");
    let dropped = opened
        .get("dropped")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing dropped list: {opened}"));
    assert_eq!(dropped, &vec![Value::from("1"), Value::from("5")]);
}

// Test IDs: TCLI-007
#[test]
fn clear_empties_selection_and_address() {
    let db = temp_db("ck-clear");
    ck(&db, &["add", "8"]);

    let cleared = ck(&db, &["clear"]);
    assert!(selection(&cleared).is_empty());
    assert_eq!(as_str(&cleared, "address"), "");
    assert!(selection(&ck(&db, &["show"])).is_empty());
}

// Test IDs: TCLI-008
#[test]
fn custom_parameter_and_base_address() {
    let db = temp_db("ck-param");
    let added = ck(&db, &["--param", "compare", "--base-address", "/cars?sort=km", "add", "3"]);
    assert_eq!(as_str(&added, "address"), "/cars?sort=km&compare=3");
}

// Test IDs: TCLI-009
#[test]
fn compare_marks_best_value_and_reports_failures() {
    let db = temp_db("ck-compare");
    let records_url = spawn_record_store(vec![
        ("10", r#"{"id":"10","pricing":{"one_time_price":25000.0},"display":{"title":"Clio"}}"#),
        ("12", r#"{"id":"12","pricing":{"one_time_price":21500.0},"display":{"title":"Polo"}}"#),
    ]);
    for id in ["10", "11", "12"] {
        ck(&db, &["add", id]);
    }

    let compared = ck(&db, &["--records-url", records_url.as_str(), "compare"]);
    assert!(as_bool(&compared, "accepted"));
    let resolved = compared
        .get("resolved")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing resolved list: {compared}"));
    let resolved_ids = resolved.iter().map(|record| as_str(record, "id")).collect::<Vec<_>>();
    assert_eq!(resolved_ids, vec!["10", "12"]);
    assert_eq!(compared.get("failed_ids"), Some(&serde_json::json!(["11"])));
    assert_eq!(as_i64(&compared, "best_value_index"), 1);
    let failure = compared
        .get("failures")
        .and_then(|failures| failures.get("11"))
        .unwrap_or_else(|| panic!("missing failure detail: {compared}"));
    assert_eq!(as_str(failure, "kind"), "not_found");
}

// Test IDs: TCLI-010
#[test]
fn compare_below_minimum_is_an_advisory() {
    let db = temp_db("ck-compare-min");
    let records_url = spawn_record_store(Vec::new());
    ck(&db, &["add", "10"]);

    let compared = ck(&db, &["--records-url", records_url.as_str(), "compare"]);
    assert!(!as_bool(&compared, "accepted"));
    assert_eq!(advisory_code(&compared), "INSUFFICIENT_MEMBERS");
}

// Test IDs: TCLI-011
#[test]
fn compare_without_record_store_fails() {
    let db = temp_db("ck-compare-offline");
    let output = run_ck(["--db", path_str(&db), "compare"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--records-url"), "unexpected stderr: {stderr}");
}

// Test IDs: TCLI-012
#[test]
fn db_commands_report_schema_and_integrity() {
    let db = temp_db("ck-db");

    let before = ck(&db, &["db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert!(!as_bool(&before, "up_to_date"));

    let dry_run = ck(&db, &["db", "migrate", "--dry-run"]);
    assert!(as_bool(&dry_run, "dry_run"));
    assert_eq!(dry_run.get("would_apply_versions"), Some(&serde_json::json!([1])));

    let migrated = ck(&db, &["db", "migrate"]);
    assert_eq!(as_i64(&migrated, "after_version"), 1);
    assert!(as_bool(&migrated, "up_to_date"));

    ck(&db, &["add", "4"]);
    let integrity = ck(&db, &["db", "integrity-check"]);
    assert!(as_bool(&integrity, "quick_check_ok"));
    assert_eq!(as_i64(&integrity, "slot_count"), 1);

    let dropped = ck(&db, &["db", "drop-slot"]);
    assert!(as_bool(&dropped, "deleted"));
    assert!(selection(&ck(&db, &["show"])).is_empty());
}
