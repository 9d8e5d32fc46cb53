//! Normalized connection descriptors and the parser that produces them

use crate::source::{Credentials, DiscreteVars, RawSource, DB_PORT, DEFAULT_PORT, DEFAULT_USERNAME};
use crate::{DataSourceError, Result};
use std::fmt;
use tracing::{debug, info, warn};
use url::Url;

/// Flags every JDBC URL must carry exactly once, appended in this order when missing
pub const REQUIRED_JDBC_FLAGS: [(&str, &str); 6] = [
    ("serverTimezone", "UTC"),
    ("useSSL", "true"),
    ("requireSSL", "false"),
    ("allowPublicKeyRetrieval", "true"),
    ("useUnicode", "true"),
    ("characterEncoding", "UTF-8"),
];

/// Flags attached to descriptors built from provider URLs and discrete variables
pub const DEFAULT_URL_FLAGS: [(&str, &str); 7] = [
    ("useSSL", "true"),
    ("requireSSL", "false"),
    ("allowPublicKeyRetrieval", "true"),
    ("serverTimezone", "UTC"),
    ("createDatabaseIfNotExist", "true"),
    ("useUnicode", "true"),
    ("characterEncoding", "UTF-8"),
];

/// JDBC vendors this crate can pool
const SUPPORTED_VENDORS: [&str; 2] = ["mysql", "mariadb"];

/// Parameters that would carry credentials; never copied out of a JDBC URL
const CREDENTIAL_PARAMS: [&str; 2] = ["user", "password"];

/// Normalized `{host, port, database, username, password}` plus URL flags.
///
/// Immutable once built: fields are private and the constructor enforces a
/// non-empty host and database and a non-zero port.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    host: String,
    port: u16,
    database: String,
    username: String,
    password: String,
    properties: Vec<(String, String)>,
}

impl ConnectionDescriptor {
    /// Build a descriptor, validating the invariants
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        properties: Vec<(String, String)>,
    ) -> Result<Self> {
        let host = host.into();
        let database = database.into();

        if host.trim().is_empty() {
            return Err(DataSourceError::validation_error(
                "Database host cannot be empty".to_string(),
                None,
            ));
        }
        if database.trim().is_empty() {
            return Err(DataSourceError::validation_error(
                "Database name cannot be empty".to_string(),
                None,
            ));
        }
        if port == 0 {
            return Err(DataSourceError::validation_error(
                "Database port cannot be 0".to_string(),
                Some("Use a port number between 1 and 65535".to_string()),
            ));
        }

        Ok(Self {
            host,
            port,
            database,
            username: username.into(),
            password: password.into(),
            properties,
        })
    }

    /// Descriptor of the local in-memory fallback store
    pub fn in_memory(database: &str) -> Self {
        Self {
            host: "mem".to_string(),
            port: DEFAULT_PORT,
            database: database.to_string(),
            username: "sa".to_string(),
            password: String::new(),
            properties: Vec::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// URL flags in their normalized order
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// Value of a single URL flag
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// JDBC form of this descriptor; credentials are never embedded
    pub fn jdbc_url(&self) -> String {
        let mut url = format!("jdbc:mysql://{}:{}/{}", self.host, self.port, self.database);
        if !self.properties.is_empty() {
            url.push('?');
            url.push_str(&render_params(&self.properties));
        }
        url
    }

    /// Provider-style URL with the password masked, safe for logs
    pub fn masked_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.username,
            crate::mask::MASK,
            self.host,
            self.port,
            self.database
        )
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &crate::mask::MASK)
            .field("properties", &self.properties)
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked_url())
    }
}

/// Turns a [`RawSource`] into a [`ConnectionDescriptor`]
#[derive(Debug, Clone, Default)]
pub struct DescriptorParser {
    /// Used when a coerced bare-host value cannot be parsed
    fallback: DiscreteVars,
}

impl DescriptorParser {
    pub fn new(fallback: DiscreteVars) -> Self {
        Self { fallback }
    }

    /// Parse any raw source
    pub fn parse(&self, source: &RawSource) -> Result<ConnectionDescriptor> {
        match source {
            RawSource::ProviderUrl { key, url } => {
                info!("Parsing {}: {}", key, crate::mask::mask_secrets(url));
                parse_provider_url(key, url)
            }
            RawSource::JdbcUrl {
                key,
                url,
                credentials,
            } => {
                info!("Parsing {}: {}", key, crate::mask::mask_secrets(url));
                self.parse_jdbc_or_coerce(key, url, credentials)
            }
            RawSource::DiscreteVars(vars) => from_discrete(vars),
        }
    }

    fn parse_jdbc_or_coerce(
        &self,
        key: &str,
        url: &str,
        credentials: &Credentials,
    ) -> Result<ConnectionDescriptor> {
        if has_prefix_ignore_case(url, "jdbc:") {
            return parse_jdbc_url(key, url, credentials);
        }

        let coerced = if url.contains("://") {
            format!("jdbc:{}", url)
        } else {
            format!("jdbc:mysql://{}", url)
        };
        warn!(
            "Unknown URL format in {}, treating as JDBC URL: {}",
            key,
            crate::mask::mask_secrets(&coerced)
        );

        match parse_jdbc_url(key, &coerced, credentials) {
            Ok(descriptor) => Ok(descriptor),
            Err(e) => {
                warn!(
                    "Coerced {} could not be parsed ({}), falling back to discrete variables",
                    key,
                    e.user_message()
                );
                from_discrete(&self.fallback)
            }
        }
    }
}

/// `scheme://[user[:password]@]host[:port]/database[?ignored]`
pub fn parse_provider_url(key: &str, url: &str) -> Result<ConnectionDescriptor> {
    let parsed = Url::parse(url)
        .map_err(|e| DataSourceError::malformed_source(key, format!("invalid URL: {}", e)))?;

    let (host, port, database) = authority_and_path(key, &parsed)?;

    let username = if parsed.username().is_empty() {
        DEFAULT_USERNAME.to_string()
    } else {
        decode_component(key, "username", parsed.username())?
    };
    let password = decode_component(key, "password", parsed.password().unwrap_or_default())?;

    let descriptor =
        ConnectionDescriptor::new(host, port, database, username, password, default_flags())
            .map_err(|e| DataSourceError::malformed_source(key, e.user_message()))?;

    debug!("Parsed provider URL from {} into {}", key, descriptor);
    Ok(descriptor)
}

/// `jdbc:<vendor>://host[:port]/database[?params]`, credentials supplied separately
pub fn parse_jdbc_url(key: &str, url: &str, credentials: &Credentials) -> Result<ConnectionDescriptor> {
    if !has_prefix_ignore_case(url, "jdbc:") {
        return Err(DataSourceError::malformed_source(key, "JDBC URL must start with 'jdbc:'"));
    }

    let parsed = Url::parse(&url[5..])
        .map_err(|e| DataSourceError::malformed_source(key, format!("invalid JDBC URL: {}", e)))?;

    if !SUPPORTED_VENDORS.contains(&parsed.scheme()) {
        return Err(DataSourceError::malformed_source(
            key,
            format!("unsupported JDBC vendor '{}'", parsed.scheme()),
        ));
    }

    let (host, port, database) = authority_and_path(key, &parsed)?;
    let properties = normalize_jdbc_params(parsed.query());

    let descriptor = ConnectionDescriptor::new(
        host,
        port,
        database,
        credentials.username.clone(),
        credentials.password.clone(),
        properties,
    )
    .map_err(|e| DataSourceError::malformed_source(key, e.user_message()))?;

    debug!("Parsed JDBC URL from {} into {}", key, descriptor.jdbc_url());
    Ok(descriptor)
}

/// Descriptor straight from discrete variables
pub fn from_discrete(vars: &DiscreteVars) -> Result<ConnectionDescriptor> {
    let port = vars.port.parse::<u16>().map_err(|_| {
        DataSourceError::malformed_source(
            DB_PORT,
            format!("'{}' is not a valid port number", vars.port),
        )
    })?;

    ConnectionDescriptor::new(
        vars.host.clone(),
        port,
        vars.database.clone(),
        vars.username.clone(),
        vars.password.clone(),
        default_flags(),
    )
    .map_err(|e| DataSourceError::malformed_source(crate::source::DISCRETE_VARS, e.user_message()))
}

/// Ensure each required flag is present exactly once.
///
/// Existing flags keep their position and value; duplicates of a required
/// flag are dropped after the first; missing ones are appended. Running it
/// over its own output changes nothing.
pub fn normalize_jdbc_params(query: Option<&str>) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = Vec::new();

    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name, value),
            None => (pair, ""),
        };

        if CREDENTIAL_PARAMS.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            debug!("Dropping credential parameter '{}' from JDBC URL", name);
            continue;
        }
        let is_required = REQUIRED_JDBC_FLAGS.iter().any(|(flag, _)| *flag == name);
        if is_required && params.iter().any(|(existing, _)| existing == name) {
            continue;
        }
        params.push((name.to_string(), value.to_string()));
    }

    for (flag, value) in REQUIRED_JDBC_FLAGS {
        if !params.iter().any(|(existing, _)| existing == flag) {
            params.push((flag.to_string(), value.to_string()));
        }
    }

    params
}

fn authority_and_path(key: &str, parsed: &Url) -> Result<(String, u16, String)> {
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DataSourceError::malformed_source(key, "missing host"))?
        .to_string();

    let port = parsed.port().unwrap_or(DEFAULT_PORT);

    let database = parsed
        .path()
        .strip_prefix('/')
        .filter(|db| !db.is_empty())
        .ok_or_else(|| DataSourceError::malformed_source(key, "missing database path"))?;
    let database = decode_component(key, "database", database)?;

    Ok((host, port, database))
}

/// `Url` hands back user-info and path still percent-encoded
fn decode_component(key: &str, component: &str, raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| {
            DataSourceError::malformed_source(key, format!("{} is not valid UTF-8 once decoded", component))
        })
}

fn default_flags() -> Vec<(String, String)> {
    DEFAULT_URL_FLAGS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn render_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{}={}", k, v) })
        .collect::<Vec<_>>()
        .join("&")
}

fn has_prefix_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
