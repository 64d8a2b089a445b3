//! `Config::from_env` against the real process environment

use relay_rs::{BusType, Config};
use serial_test::serial;

const KEYS: &[&str] = &[
    "DATABASE_URL",
    "BUS_TYPE",
    "PORT",
    "WEBHOOK_SUBJECTS",
    "OUTBOX_BATCH_LIMIT",
];

fn clear() {
    for key in KEYS {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_from_env_reads_process_environment() {
    clear();
    std::env::set_var("DATABASE_URL", "postgres://localhost/relay_test");
    std::env::set_var("BUS_TYPE", "noop");
    std::env::set_var("PORT", "9100");
    std::env::set_var("WEBHOOK_SUBJECTS", "");
    std::env::set_var("OUTBOX_BATCH_LIMIT", "25");

    let config = Config::from_env().unwrap();
    clear();

    assert_eq!(config.database_url, "postgres://localhost/relay_test");
    assert_eq!(config.bus_type, BusType::Noop);
    assert_eq!(config.port, 9100);
    assert_eq!(config.dispatcher.batch_limit, 25);
    // blank means unset, so the default applies
    assert_eq!(config.webhook_subjects, vec![">".to_string()]);
}

#[test]
#[serial]
fn test_from_env_fails_without_database_url() {
    clear();
    std::env::set_var("OUTBOX_BATCH_LIMIT", "0");

    let err = Config::from_env().unwrap_err();
    clear();

    let problems = err.problems();
    assert_eq!(problems.len(), 2);
    assert!(problems[0].contains("DATABASE_URL"));
    assert!(problems[1].contains("OUTBOX_BATCH_LIMIT"));
}
