use super::*;
use tempfile::TempDir;

#[test]
fn test_parse_minimal_config() {
    let config: Config = serde_yaml::from_str("name: shop").unwrap();
    assert_eq!(config.default_schema, "main");
    assert_eq!(config.database.path, ":memory:");
    assert_eq!(config.threads, 1);
    assert_eq!(config.state.backend, StateBackend::Json);
    assert_eq!(config.strategy_mismatch, StrategyMismatchPolicy::Warn);

    let root = PathBuf::from("/tmp/shop");
    assert_eq!(
        config.state_path_absolute(&root),
        root.join("target").join("state.json")
    );
}

#[test]
fn test_parse_full_config() {
    let yaml = r#"
name: shop
default_schema: analytics
database:
  path: ./warehouse.duckdb
state:
  backend: duckdb
vars:
  region: "'eu'"
  min_id: 10
threads: 4
strategy_mismatch: error
node_timeout_secs: 300
aliases:
  src_orders: raw.orders
targets:
  prod:
    database:
      path: /data/prod.duckdb
    default_schema: prod
    vars:
      region: "'us'"
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.threads, 4);
    assert_eq!(config.state.backend, StateBackend::DuckDb);
    assert_eq!(config.strategy_mismatch, StrategyMismatchPolicy::Error);
    assert_eq!(config.node_timeout_secs, Some(300));

    assert_eq!(config.get_default_schema(None), "analytics");
    assert_eq!(config.get_default_schema(Some("prod")), "prod");
    assert_eq!(
        config.get_database_config(Some("prod")).unwrap().path,
        "/data/prod.duckdb"
    );

    let vars = config.template_vars(Some("prod")).unwrap();
    assert_eq!(vars["region"], "'us'");
    assert_eq!(vars["min_id"], "10");

    let resolver = config.resolver(None);
    assert_eq!(
        resolver.resolve("src_orders", None).id().unwrap().as_str(),
        "raw.orders"
    );
}

#[test]
fn test_unknown_target_is_an_error() {
    let config: Config = serde_yaml::from_str("name: shop").unwrap();
    let err = config.get_database_config(Some("staging")).unwrap_err();
    assert!(err.to_string().contains("Target 'staging' not found"));
}

#[test]
fn test_non_scalar_var_rejected() {
    let config: Config = serde_yaml::from_str("name: shop\nvars:\n  ids: [1, 2]\n").unwrap();
    assert!(config.template_vars(None).is_err());
}

#[test]
fn test_unknown_field_rejected() {
    let result: Result<Config, _> = serde_yaml::from_str("name: shop\nthread: 2\n");
    assert!(result.is_err());
}

#[test]
fn test_load_from_dir() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        Config::load_from_dir(dir.path()),
        Err(CoreError::ConfigNotFound { .. })
    ));

    std::fs::write(dir.path().join("sluice.yml"), "name: shop\nthreads: 0\n").unwrap();
    assert!(matches!(
        Config::load_from_dir(dir.path()),
        Err(CoreError::ConfigInvalid { .. })
    ));

    std::fs::write(dir.path().join("sluice.yml"), "name: shop\nthreads: 2\n").unwrap();
    assert_eq!(Config::load_from_dir(dir.path()).unwrap().threads, 2);
}

#[test]
fn test_malformed_yaml_is_parse_error() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("sluice.yml"), "name: [unclosed\n").unwrap();
    assert!(matches!(
        Config::load_from_dir(dir.path()),
        Err(CoreError::ConfigParseError { .. })
    ));
}
