use isg_core::config::{
    ConfigError, DEFAULT_BUILD_TIMEOUT_MS, DEFAULT_DATA_DIR, DEFAULT_DIAGNOSTICS_TIMEOUT_MS, DEFAULT_EMBED_PROVIDER,
    DEFAULT_MAX_ITEMS, DEFAULT_TOKEN_BUDGET, DEFAULT_WORKERS,
};
use isg_core::Config;
use tempfile::TempDir;

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.store.data_dir, DEFAULT_DATA_DIR);
    assert_eq!(config.retrieval.max_items, DEFAULT_MAX_ITEMS);
    assert_eq!(config.retrieval.default_token_budget, DEFAULT_TOKEN_BUDGET);
    assert_eq!(config.gate.workers, DEFAULT_WORKERS);
    assert_eq!(config.embedding.provider, DEFAULT_EMBED_PROVIDER);
}

#[test]
fn test_diagnostics_budget_covers_a_cargo_check() {
    let config = Config::default();
    assert_eq!(config.validator.diagnostics_timeout_ms, DEFAULT_DIAGNOSTICS_TIMEOUT_MS);
    // Phase (a) shells out to cargo just like the build phase.
    assert!(config.validator.diagnostics_timeout_ms >= config.validator.build_timeout_ms);
    assert!(DEFAULT_DIAGNOSTICS_TIMEOUT_MS >= DEFAULT_BUILD_TIMEOUT_MS);
}

#[test]
fn test_config_to_toml() {
    let toml_str = Config::default_config_string();
    for section in ["[store]", "[retrieval]", "[patterns]", "[validator]", "[gate]", "[embedding]", "[logging]"] {
        assert!(toml_str.contains(section), "missing {section}");
    }
    let parsed: Config = toml::from_str(&toml_str).unwrap();
    assert!(parsed.validate().is_ok());
}

#[test]
fn test_config_from_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("isg.toml");
    std::fs::write(
        &path,
        r#"
[store]
data_dir = ".custom-isg"
persist = false

[retrieval]
max_items = 12
weights = { level = 0.5, graph = 0.2, vector = 0.2, pattern = 0.1 }

[embedding]
provider = "hash"
dimension = 64
"#,
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.store.data_dir, ".custom-isg");
    assert!(!config.store.persist);
    assert_eq!(config.retrieval.max_items, 12);
    assert_eq!(config.retrieval.weights.level, 0.5);
    assert_eq!(config.embedding.dimension, 64);
    // Untouched sections keep their defaults.
    assert_eq!(config.retrieval.default_token_budget, DEFAULT_TOKEN_BUDGET);
    assert_eq!(config.store.db_path(), std::path::PathBuf::from(".custom-isg").join("graph.db"));
}

#[test]
fn test_invalid_values_are_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("isg.toml");

    for body in [
        "[gate]\nworkers = 0\n",
        "[validator]\nbuild_timeout_ms = 0\n",
        "[patterns]\nconfidence_alpha = 1.5\n",
        "[patterns]\nhigh_severity_threshold = 0.5\nmedium_severity_threshold = 0.3\n",
        "[retrieval]\nweights = { level = -1.0, graph = 0.3, vector = 0.3, pattern = 0.1 }\n",
    ] {
        std::fs::write(&path, body).unwrap();
        assert!(
            matches!(Config::from_file(&path), Err(ConfigError::Invalid(_))),
            "accepted {body}"
        );
    }

    std::fs::write(&path, "[gate\nworkers = ").unwrap();
    assert!(matches!(Config::from_file(&path), Err(ConfigError::ParseError(_))));
    assert!(matches!(
        Config::from_file(temp.path().join("missing.toml")),
        Err(ConfigError::ReadError(_))
    ));
}
