use crate::config::ConfigError;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use super::BackendError;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;
const SCHEME: &str = "redis://";

///
/// ConnectionSpec
///
/// Normalized connection tuple. Two collaborators holding equal specs
/// must share one connection.
///

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db: 0,
            password: None,
            timeout_secs: None,
        }
    }
}

impl ConnectionSpec {
    /// Parse `redis://[:password@]host[:port][/db][?db=N&password=P&timeout=S]`.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidConnection {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid("expected a redis:// scheme"))?;
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (netloc, path) = match location.split_once('/') {
            Some((netloc, path)) => (netloc, Some(path)),
            None => (location, None),
        };
        let (credentials, hostport) = match netloc.rsplit_once('@') {
            Some((credentials, hostport)) => (Some(credentials), hostport),
            None => (None, netloc),
        };

        let mut spec = Self::default();

        if let Some(credentials) = credentials {
            let password = credentials
                .split_once(':')
                .map_or(credentials, |(_, password)| password);
            if !password.is_empty() {
                spec.password = Some(password.to_string());
            }
        }

        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (
                host,
                Some(port.parse::<u16>().map_err(|_| invalid("invalid port"))?),
            ),
            None => (hostport, None),
        };
        spec.host = normalize_host(host);
        spec.port = port.unwrap_or(DEFAULT_PORT);

        if let Some(path) = path.filter(|p| !p.is_empty()) {
            spec.db = path.parse().map_err(|_| invalid("invalid database index"))?;
        }

        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name {
                "db" => spec.db = value.parse().map_err(|_| invalid("invalid database index"))?,
                "password" => spec.password = Some(value.to_string()).filter(|p| !p.is_empty()),
                "timeout" | "socket_timeout" => {
                    spec.timeout_secs =
                        Some(value.parse().map_err(|_| invalid("invalid timeout"))?);
                }
                _ => return Err(invalid("unknown parameter")),
            }
        }

        Ok(spec)
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}?db={}", self.host, self.port, self.db)?;
        if let Some(timeout) = self.timeout_secs {
            write!(f, "&timeout={timeout}")?;
        }
        Ok(())
    }
}

fn normalize_host(host: &str) -> String {
    match host {
        "" | "localhost" => DEFAULT_HOST.to_string(),
        other => other.to_ascii_lowercase(),
    }
}

///
/// ConnectionRegistry
///
/// Explicit registry of shared connections keyed by [`ConnectionSpec`].
/// Owned by top-level wiring and injected where needed.
///

#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    connections: Mutex<HashMap<ConnectionSpec, Arc<C>>>,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> ConnectionRegistry<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ConnectionSpec, Arc<C>>>, BackendError> {
        self.connections
            .lock()
            .map_err(|_| BackendError::Connection("connection registry lock poisoned".to_string()))
    }

    /// Return the shared connection for `spec`, creating it on first use.
    pub fn get_or_connect<F>(&self, spec: &ConnectionSpec, connect: F) -> Result<Arc<C>, BackendError>
    where
        F: FnOnce(&ConnectionSpec) -> Result<C, BackendError>,
    {
        let mut connections = self.lock()?;
        if let Some(existing) = connections.get(spec) {
            return Ok(Arc::clone(existing));
        }

        let connection = Arc::new(connect(spec)?);
        connections.insert(spec.clone(), Arc::clone(&connection));
        tracing::debug!(%spec, "registered connection");

        Ok(connection)
    }

    pub fn get(&self, spec: &ConnectionSpec) -> Result<Option<Arc<C>>, BackendError> {
        Ok(self.lock()?.get(spec).cloned())
    }

    pub fn len(&self) -> Result<usize, BackendError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, BackendError> {
        Ok(self.lock()?.is_empty())
    }

    /// Drop the registry's handle; existing holders keep theirs.
    pub fn disconnect(&self, spec: &ConnectionSpec) -> Result<bool, BackendError> {
        Ok(self.lock()?.remove(spec).is_some())
    }
}
