use std::{fs, path::PathBuf};

use fedgeo_core::{load_addresses, load_queries, load_records, InputError, QueryKind, Record};

fn scratch(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fedgeo-core-{}", std::process::id()));
    fs::create_dir_all(&dir).expect("scratch dir");
    let path = dir.join(name);
    fs::write(&path, contents).expect("write scratch file");
    path
}

#[test]
fn loads_all_three_input_kinds_from_disk() {
    let records = scratch("records.txt", "2\n5 1.5 2.5\n6 -3 4\n");
    let queries = scratch("queries.txt", "1\nRangeCount 0 0 7\n");
    let addresses = scratch("silos.txt", "2\n127.0.0.1:50051\n127.0.0.1:50052\n");

    let records = load_records(&records).expect("records");
    assert_eq!(records, vec![Record::new(5, 1.5, 2.5), Record::new(6, -3.0, 4.0)]);

    let queries = load_queries(&queries).expect("queries");
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].kind, QueryKind::RangeCount);

    let addresses = load_addresses(&addresses).expect("addresses");
    assert_eq!(addresses, vec!["127.0.0.1:50051", "127.0.0.1:50052"]);
}

#[test]
fn missing_file_reports_path() {
    let missing = std::env::temp_dir().join("fedgeo-core-does-not-exist.txt");
    let err = load_records(&missing).unwrap_err();
    assert!(matches!(err, InputError::Io { ref path, .. } if path == &missing));
}

#[test]
fn malformed_query_reports_line_number() {
    let path = scratch("bad-queries.txt", "2\nRangeQuery 0 0 1\nKnn 0 0 1\n");
    let err = load_queries(&path).unwrap_err();
    assert!(matches!(err, InputError::Malformed { line: 3, .. }));
}

#[test]
fn record_file_with_repeated_id_is_rejected() {
    let path = scratch("dup-records.txt", "2\n5 0 0\n5 1 1\n");
    let err = load_records(&path).unwrap_err();
    assert!(matches!(err, InputError::Malformed { line: 3, .. }));
}

#[test]
fn record_file_with_infinite_coordinate_is_rejected() {
    let path = scratch("inf-records.txt", "2\n0 0 0\n1 inf 3\n");
    let err = load_records(&path).unwrap_err();
    assert!(matches!(err, InputError::Malformed { line: 3, .. }));
}
