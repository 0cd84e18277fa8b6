use tf_telemetry::logging::{self, LogFormat};

#[test]
fn repeated_init_is_harmless() {
    logging::init("tf-test", "debug", LogFormat::Pretty);
    logging::init("tf-test", "info", LogFormat::Json);
    logging::init_logging("tf-test", "warn");

    tracing::info!(task_id = "t-1", "log line after init");
}

#[test]
fn invalid_level_falls_back() {
    // must not panic on a directive EnvFilter rejects
    let _filter = logging::build_filter("[[not a directive");
    logging::init_logging_json("tf-test-json", "[[not a directive");
}

#[test]
fn format_serde_is_snake_case() {
    let json = serde_json::to_string(&LogFormat::Json).unwrap();
    assert_eq!(json, "\"json\"");
    let back: LogFormat = serde_json::from_str("\"pretty\"").unwrap();
    assert_eq!(back, LogFormat::Pretty);
}
