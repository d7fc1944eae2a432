use std::path::PathBuf;
use std::str::FromStr;

/// Process configuration, read from `CHALET_*` environment variables.
/// Numbers that fail to parse fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Startup user name of anonymous sessions.
    pub service_user: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub outbox_capacity: usize,
    pub bcrypt_cost: u32,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub admin: Option<AdminSeed>,
}

/// Credentials for the administrator created at startup when none exists.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminSeed {
    pub name: String,
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for AdminSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSeed")
            .field("name", &self.name)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("CHALET_{name}"));
        let num = |name: &str| var(name).and_then(|s| s.parse().ok());

        let admin = match (var("ADMIN_EMAIL"), var("ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminSeed {
                name: var("ADMIN_NAME").unwrap_or_else(|| "Administrator".into()),
                email,
                password,
            }),
            _ => None,
        };

        Self {
            bind: var("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(var("PORT"), 5433),
            data_dir: PathBuf::from(var("DATA_DIR").unwrap_or_else(|| "./data".into())),
            service_user: var("SERVICE_USER").unwrap_or_else(|| "chalet".into()),
            password: var("PASSWORD").unwrap_or_else(|| "chalet".into()),
            max_connections: parse_or(var("MAX_CONNECTIONS"), 256),
            compact_threshold: parse_or(var("COMPACT_THRESHOLD"), 1000),
            outbox_capacity: parse_or(var("OUTBOX_CAPACITY"), 1024),
            bcrypt_cost: parse_or(var("BCRYPT_COST"), bcrypt::DEFAULT_COST),
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
            metrics_port: num("METRICS_PORT"),
            admin,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("chalet.wal")
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.parse().ok()).unwrap_or(default)
}
