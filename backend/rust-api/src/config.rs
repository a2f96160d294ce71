use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub node_binary: String,
    pub runner_timeout_ms: u64,
    pub ring_timeout_seconds: u64,
    pub quiz_total_questions: u32,
    pub quiz_max_attempts: u32,
    pub transport_api_key: Option<String>,
    pub transport_api_secret: Option<String>,
    pub listen_addr: String,
}

impl Default for Config {
    /// In-memory development setup with no external collaborators configured.
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            mongo_uri: "mongodb://localhost:27017".to_string(),
            redis_uri: "redis://127.0.0.1:6379/0".to_string(),
            mongo_database: "codetutor".to_string(),
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            node_binary: "node".to_string(),
            runner_timeout_ms: 5000,
            ring_timeout_seconds: 30,
            quiz_total_questions: 10,
            quiz_max_attempts: 3,
            transport_api_key: None,
            transport_api_secret: None,
            listen_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + APP__ overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let defaults = Self::default();
        let string = |key: &str, var: &str, fallback: &str| {
            settings
                .get_string(key)
                .or_else(|_| env::var(var))
                .unwrap_or_else(|_| fallback.to_string())
        };
        let optional = |key: &str, var: &str| {
            settings
                .get_string(key)
                .or_else(|_| env::var(var))
                .ok()
                .filter(|v| !v.trim().is_empty())
        };
        let number = |key: &str, var: &str, fallback: u64| -> Result<u64, config::ConfigError> {
            match settings.get_int(key) {
                Ok(v) => u64::try_from(v)
                    .map_err(|_| config::ConfigError::Message(format!("{} must be positive", key))),
                Err(_) => match env::var(var) {
                    Ok(raw) => raw
                        .parse()
                        .map_err(|_| config::ConfigError::Message(format!("{} is not a number", var))),
                    Err(_) => Ok(fallback),
                },
            }
        };

        let store_backend = match string("store.backend", "STORE_BACKEND", "mongo").as_str() {
            "memory" => StoreBackend::Memory,
            "mongo" => StoreBackend::Mongo,
            other => {
                return Err(config::ConfigError::Message(format!(
                    "unknown store backend: {}",
                    other
                )))
            }
        };

        let mongo_uri = string("database.mongo_uri", "MONGO_URI", &defaults.mongo_uri);
        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                match env::var("REDIS_PASSWORD") {
                    Ok(password) => format!("redis://:{}@{}:{}/0", password, host, port),
                    Err(_) => format!("redis://{}:{}/0", host, port),
                }
            });

        let gemini_api_key = optional("gemini.api_key", "GEMINI_API_KEY");

        Ok(Config {
            store_backend,
            mongo_uri,
            redis_uri,
            mongo_database: string(
                "database.mongo_database",
                "MONGO_DATABASE",
                &defaults.mongo_database,
            ),
            gemini_api_key,
            gemini_model: string("gemini.model", "GEMINI_MODEL", &defaults.gemini_model),
            gemini_base_url: string(
                "gemini.base_url",
                "GEMINI_BASE_URL",
                &defaults.gemini_base_url,
            ),
            node_binary: string("runner.node_binary", "NODE_BINARY", &defaults.node_binary),
            runner_timeout_ms: number(
                "runner.timeout_ms",
                "RUNNER_TIMEOUT_MS",
                defaults.runner_timeout_ms,
            )?,
            ring_timeout_seconds: number(
                "calls.ring_timeout_seconds",
                "RING_TIMEOUT_SECONDS",
                defaults.ring_timeout_seconds,
            )?,
            quiz_total_questions: number(
                "quiz.total_questions",
                "QUIZ_TOTAL_QUESTIONS",
                u64::from(defaults.quiz_total_questions),
            )? as u32,
            quiz_max_attempts: number(
                "quiz.max_attempts",
                "QUIZ_MAX_ATTEMPTS",
                u64::from(defaults.quiz_max_attempts),
            )? as u32,
            transport_api_key: optional("transport.api_key", "TRANSPORT_API_KEY"),
            transport_api_secret: optional("transport.api_secret", "TRANSPORT_API_SECRET"),
            listen_addr: string("server.listen_addr", "LISTEN_ADDR", &defaults.listen_addr),
        })
    }
}
