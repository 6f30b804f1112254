use parley_core::config::IntegrationAuth;
use parley_core::error::ParleyError;
use parley_test_utils::load_config;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
database = "/tmp/parley-test/parley.db"
history_limit = 10
collaborator_timeout_secs = 15
fallback_reply = "Probá de nuevo en un rato."
default_flow = "books"

[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test-key"
max_tokens = 512
temperature = 0.0

[model.retry]
max_retries = 2

[[fallback_models]]
provider = "groq"
model_id = "llama-3.1-8b-instant"

[gateway]
bind = "0.0.0.0:9999"
api_token = "test-token"
verify_token = "hub-secret"

[channels.whatsapp]
access_token = "EAAG-test"
phone_number_id = "1098765"

[integrations.shop]
base_url = "https://shop.example.com/wp-json/wc/v3"
auth = { type = "bearer", token = "shop-token" }
headers = { "X-Store" = "centro" }

[payments.mercadopago]
access_token = "TEST-123"
currency = "USD"
back_url = "https://bot.example.com/gracias"
"#;

    let (_dir, _path, config) = load_config(toml_content);
    let config = config.unwrap();

    assert_eq!(config.engine.history_limit, 10);
    assert_eq!(config.engine.collaborator_timeout_secs, 15);
    assert_eq!(config.engine.default_flow.as_deref(), Some("books"));
    assert_eq!(
        config.database_path().to_str(),
        Some("/tmp/parley-test/parley.db")
    );

    assert_eq!(config.model.model_id, "gpt-4o-mini");
    assert_eq!(config.model.max_tokens, 512);
    let retry = config.model.retry.as_ref().unwrap();
    assert_eq!(retry.max_retries, 2);
    assert_eq!(retry.initial_backoff_ms, 1000);
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].provider, "groq");

    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
    assert_eq!(config.gateway.api_token.as_deref(), Some("test-token"));
    assert_eq!(config.gateway.verify_token.as_deref(), Some("hub-secret"));

    let wa = config.channels.whatsapp.as_ref().unwrap();
    assert_eq!(wa.phone_number_id, "1098765");
    assert_eq!(wa.api_version, "v21.0");

    let shop = &config.integrations["shop"];
    assert_eq!(
        shop.auth,
        IntegrationAuth::Bearer {
            token: "shop-token".into()
        }
    );
    assert_eq!(shop.headers["X-Store"], "centro");

    let mp = config.payments.mercadopago.as_ref().unwrap();
    assert_eq!(mp.currency, "USD");
    assert_eq!(mp.back_url.as_deref(), Some("https://bot.example.com/gracias"));
}

#[test]
fn test_env_var_expansion() {
    std::env::set_var("PARLEY_TEST_WA_TOKEN", "EAAG-from-env");
    std::env::set_var("PARLEY_TEST_OPENAI_KEY", "sk-from-env");

    let (_dir, _path, config) = load_config(
        r#"
[model]
model_id = "gpt-4o-mini"
api_key = "${PARLEY_TEST_OPENAI_KEY}"

[channels.whatsapp]
access_token = "${PARLEY_TEST_WA_TOKEN}"
phone_number_id = "1"
"#,
    );
    let config = config.unwrap();
    assert_eq!(config.model.api_key.as_deref(), Some("sk-from-env"));
    assert_eq!(
        config.channels.whatsapp.unwrap().access_token,
        "EAAG-from-env"
    );

    std::env::remove_var("PARLEY_TEST_WA_TOKEN");
    std::env::remove_var("PARLEY_TEST_OPENAI_KEY");
}

#[test]
fn test_missing_model_section_is_a_config_error() {
    let (_dir, _path, config) = load_config("[gateway]\nbind = \"127.0.0.1:1\"\n");
    assert!(matches!(config.unwrap_err(), ParleyError::Config(_)));
}

#[test]
fn test_serialized_config_loads_again() {
    let (_dir, _path, config) = load_config(
        r#"
[model]
model_id = "gpt-4o-mini"

[integrations.shop]
base_url = "https://shop.example.com"
auth = { type = "basic", username = "ck", password = "cs" }
"#,
    );
    let config = config.unwrap();
    let printed = toml::to_string_pretty(&config).unwrap();

    let (_dir2, _path2, reloaded) = load_config(&printed);
    let reloaded = reloaded.unwrap();
    assert_eq!(reloaded.model.model_id, "gpt-4o-mini");
    assert_eq!(
        reloaded.integrations["shop"].auth,
        config.integrations["shop"].auth
    );
}
