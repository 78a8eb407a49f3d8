mod parsing;
mod types;

use std::time::Duration;

use parsing::{
    env_optional, env_or_default, normalize_key_prefix, parse_bool, parse_environment, parse_u16,
    parse_u32, parse_u64,
};
pub use types::{
    AttemptSettings, CacheSettings, ConfigError, DatabaseSettings, Environment, RedisSettings,
    RuntimeSettings, Settings, TelemetrySettings,
};

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let environment = parse_environment(
            env_optional("ATTEMPTS_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("ATTEMPTS_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "attempts");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "attempts_db");
        let database_url = env_optional("DATABASE_URL");
        let max_connections = parse_u32(
            "DATABASE_MAX_CONNECTIONS",
            env_or_default("DATABASE_MAX_CONNECTIONS", "20"),
        )?;

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let entity_ttl_seconds = parse_u64(
            "CACHE_ENTITY_TTL_SECONDS",
            env_or_default("CACHE_ENTITY_TTL_SECONDS", "300"),
        )?;
        let list_ttl_seconds =
            parse_u64("CACHE_LIST_TTL_SECONDS", env_or_default("CACHE_LIST_TTL_SECONDS", "60"))?;
        let exists_ttl_seconds = parse_u64(
            "CACHE_EXISTS_TTL_SECONDS",
            env_or_default("CACHE_EXISTS_TTL_SECONDS", "30"),
        )?;
        let op_timeout_ms =
            parse_u64("CACHE_OP_TIMEOUT_MS", env_or_default("CACHE_OP_TIMEOUT_MS", "200"))?;
        let key_prefix = normalize_key_prefix(env_or_default("CACHE_KEY_PREFIX", "attempts"));

        let sweep_interval_seconds = parse_u64(
            "ATTEMPT_SWEEP_INTERVAL_SECONDS",
            env_or_default("ATTEMPT_SWEEP_INTERVAL_SECONDS", "60"),
        )?;
        let sweep_batch_size = parse_u32(
            "ATTEMPT_SWEEP_BATCH_SIZE",
            env_or_default("ATTEMPT_SWEEP_BATCH_SIZE", "500"),
        )?;
        let timeout_grace_seconds = parse_u64(
            "ATTEMPT_TIMEOUT_GRACE_SECONDS",
            env_or_default("ATTEMPT_TIMEOUT_GRACE_SECONDS", "30"),
        )?;

        let log_level = env_or_default("ATTEMPTS_LOG_LEVEL", "info");
        let json = env_optional("ATTEMPTS_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);
        let listen_addr = env_or_default("PROMETHEUS_LISTEN_ADDR", "0.0.0.0:9091");
        let prometheus_listen_addr = listen_addr.parse().map_err(|_| ConfigError::InvalidValue {
            field: "PROMETHEUS_LISTEN_ADDR",
            value: listen_addr.clone(),
        })?;

        let settings = Self {
            runtime: RuntimeSettings { environment, strict_config },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            cache: CacheSettings {
                entity_ttl_seconds,
                list_ttl_seconds,
                exists_ttl_seconds,
                op_timeout_ms,
                key_prefix,
            },
            attempts: AttemptSettings {
                sweep_interval_seconds,
                sweep_batch_size,
                timeout_grace_seconds,
            },
            telemetry: TelemetrySettings {
                log_level,
                json,
                prometheus_enabled,
                prometheus_listen_addr,
            },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub fn cache(&self) -> &CacheSettings {
        &self.cache
    }

    pub fn attempts(&self) -> &AttemptSettings {
        &self.attempts
    }

    pub fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let ttls = [
            ("CACHE_ENTITY_TTL_SECONDS", self.cache.entity_ttl_seconds),
            ("CACHE_LIST_TTL_SECONDS", self.cache.list_ttl_seconds),
            ("CACHE_EXISTS_TTL_SECONDS", self.cache.exists_ttl_seconds),
        ];
        for (field, value) in ttls {
            if value == 0 {
                return Err(ConfigError::InvalidValue { field, value: value.to_string() });
            }
        }

        if self.attempts.sweep_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ATTEMPT_SWEEP_BATCH_SIZE",
                value: String::from("0"),
            });
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "DATABASE_MAX_CONNECTIONS",
                value: String::from("0"),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        Ok(())
    }
}

impl DatabaseSettings {
    pub fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_server,
            self.postgres_port,
            self.postgres_db
        )
    }
}

impl RedisSettings {
    pub fn redis_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

impl CacheSettings {
    pub fn entity_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_seconds)
    }

    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_seconds)
    }

    pub fn exists_ttl(&self) -> Duration {
        Duration::from_secs(self.exists_ttl_seconds)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Invalidation fences outlive every entry they guard. An expired fence is
    /// replaced by a fresh token, which only ever turns entries into misses.
    pub fn fence_ttl(&self) -> Duration {
        let longest =
            self.entity_ttl_seconds.max(self.list_ttl_seconds).max(self.exists_ttl_seconds);
        Duration::from_secs(longest.saturating_mul(2))
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            entity_ttl_seconds: 300,
            list_ttl_seconds: 60,
            exists_ttl_seconds: 30,
            op_timeout_ms: 200,
            key_prefix: String::from("attempts"),
        }
    }
}
