//! JSON configuration for the proxy.
//!
//! Keys are PascalCase in the file. Addresses are normalized the same way
//! for the listener and the upstreams: a bare host gets `:53` appended, a
//! `:dns` suffix becomes `:53`, and a bare `:port` binds every interface.

use crate::errors::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::ToSocketAddrs;
use std::path::Path;

/// Configurations for the server.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    /// UDP bind address (host:port, host or :port).
    pub listen: String,

    /// Ordered list of upstream resolvers (host:port or host). Tried
    /// first-to-last for every query. May be empty, in which case every
    /// query is answered with SERVFAIL.
    pub name_servers: Vec<String>,

    /// Redis backends, keyed by a dense index "0".."N-1". A gap in the
    /// index set fails validation, so hashing a name modulo N always lands
    /// on a configured entry.
    pub backends: HashMap<usize, String>,

    /// Connection pool size per backend.
    pub pool_num: usize,

    /// Worker channels per backend. Must be strictly less than
    /// `PoolNum`, keeping pool headroom for burst recovery.
    pub chan_num: usize,

    /// Backend connect timeout, in milliseconds.
    pub connect_timeout: u64,

    /// Backend per-command timeout, in milliseconds.
    pub read_timeout: u64,

    /// TTL on logged names, in seconds (the SETEX expiry).
    pub expires_in: u64,

    /// Seconds between stats dumps.
    pub stats_period: u64,

    /// When set, the stats dump also overwrites this file each period.
    pub stats_file: Option<String>,

    /// Verbose per-query logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "127.0.0.1:53".to_string(),
            name_servers: Vec::default(),
            backends: HashMap::default(),
            pool_num: 10,
            chan_num: 5,
            connect_timeout: 1000,
            read_timeout: 100,
            expires_in: 120,
            stats_period: 60,
            stats_file: None,
            debug: false,
        }
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let raw = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&raw)?;
        config.validate()?;

        Ok(config)
    }

    /// Normalizes addresses and checks the cross-field rules. Fails on the
    /// first problem found; normalization is idempotent, so re-validating
    /// an already validated configuration is fine.
    pub fn validate(&mut self) -> Result<(), Error> {
        self.listen = normalize_addr(&self.listen);
        if let Err(e) = self.listen.to_socket_addrs() {
            return Err(Error::Config(format!(
                "Listen address '{}' is invalid: {}",
                self.listen, e
            )));
        }

        for server in self.name_servers.iter_mut() {
            let normalized = normalize_addr(server);

            // Resolve once, at startup. A name server that doesn't resolve
            // as a UDP address is a fatal configuration error.
            let addr = match normalized.to_socket_addrs() {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        return Err(Error::Config(format!(
                            "name server '{}' did not resolve to any address",
                            normalized
                        )))
                    }
                },
                Err(e) => {
                    return Err(Error::Config(format!(
                        "name server '{}' is invalid: {}",
                        normalized, e
                    )))
                }
            };

            *server = addr.to_string();
        }

        if self.backends.is_empty() {
            return Err(Error::Config(
                "at least one backend must be configured".to_string(),
            ));
        }

        // Ensure the index set has full coverage [0, len).
        for i in 0..self.backends.len() {
            if !self.backends.contains_key(&i) {
                return Err(Error::Config(format!(
                    "wrong backends hash set, index {} missing: indices must cover [0, {})",
                    i,
                    self.backends.len()
                )));
            }
        }

        if self.pool_num == 0 {
            return Err(Error::Config("PoolNum must be at least 1".to_string()));
        }

        if self.chan_num == 0 {
            return Err(Error::Config("ChanNum must be at least 1".to_string()));
        }

        // Workers of one backend share its pool; keep some of it free.
        if self.chan_num >= self.pool_num {
            return Err(Error::Config(format!(
                "ChanNum ({}) must be less than PoolNum ({})",
                self.chan_num, self.pool_num
            )));
        }

        if self.stats_period == 0 {
            return Err(Error::Config("StatsPeriod must be at least 1".to_string()));
        }

        Ok(())
    }

    /// The backend addresses as a flat list ordered by index.
    pub fn backend_addrs(&self) -> Vec<String> {
        (0..self.backends.len())
            .map(|i| self.backends[&i].clone())
            .collect()
    }
}

fn normalize_addr(addr: &str) -> String {
    let mut addr = addr.to_string();

    if !addr.contains(':') {
        addr += ":53";
    }
    if let Some(host) = addr.strip_suffix(":dns") {
        addr = format!("{}:53", host);
    }
    if addr.starts_with(':') {
        addr = format!("0.0.0.0{}", addr);
    }

    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> Config {
        Config {
            listen: "127.0.0.1:5300".to_string(),
            name_servers: vec!["127.0.0.1:5301".to_string()],
            backends: [(0, "127.0.0.1:6379".to_string())].into_iter().collect(),
            pool_num: 4,
            chan_num: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_addr() {
        let tests = vec![
            ("127.0.0.1", "127.0.0.1:53"),
            ("127.0.0.1:53", "127.0.0.1:53"),
            ("127.0.0.1:5353", "127.0.0.1:5353"),
            ("127.0.0.1:dns", "127.0.0.1:53"),
            (":5353", "0.0.0.0:5353"),
            (":dns", "0.0.0.0:53"),
        ];

        for (input, want) in tests {
            assert_eq!(normalize_addr(input), want, "normalize_addr({})", input);
        }
    }

    #[test]
    fn test_validate_normalizes_name_servers() {
        let mut config = valid();
        config.name_servers = vec!["127.0.0.1".to_string(), "192.0.2.53:5353".to_string()];

        config.validate().expect("validation failed");

        assert_eq!(
            config.name_servers,
            vec!["127.0.0.1:53".to_string(), "192.0.2.53:5353".to_string()]
        );
    }

    #[test]
    fn test_validate_rejects_sparse_backends() {
        let mut config = valid();
        config.backends = [
            (0, "127.0.0.1:6379".to_string()),
            (2, "127.0.0.1:6380".to_string()),
        ]
        .into_iter()
        .collect();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_backends() {
        let mut config = valid();
        config.backends.clear();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_chan_num_at_pool_num() {
        let mut config = valid();
        config.chan_num = config.pool_num;

        assert!(config.validate().is_err());

        config.chan_num = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_json() {
        let raw = r#"{
            "Listen": ":5353",
            "NameServers": ["127.0.0.1:5301", "127.0.0.2"],
            "Backends": {"0": "127.0.0.1:6379", "1": "127.0.0.1:6380"},
            "PoolNum": 8,
            "ChanNum": 4,
            "ExpiresIn": 60,
            "StatsPeriod": 5,
            "Debug": true
        }"#;

        let mut config: Config = serde_json::from_str(raw).expect("failed to parse");
        config.validate().expect("validation failed");

        assert_eq!(config.listen, "0.0.0.0:5353");
        assert_eq!(
            config.name_servers,
            vec!["127.0.0.1:5301".to_string(), "127.0.0.2:53".to_string()]
        );
        assert_eq!(
            config.backend_addrs(),
            vec!["127.0.0.1:6379".to_string(), "127.0.0.1:6380".to_string()]
        );
        assert_eq!(config.pool_num, 8);
        assert_eq!(config.chan_num, 4);
        assert_eq!(config.expires_in, 60);
        assert_eq!(config.stats_period, 5);
        assert!(config.debug);

        // Unset keys keep their defaults.
        assert_eq!(config.connect_timeout, 1000);
        assert_eq!(config.read_timeout, 100);
        assert_eq!(config.stats_file, None);
    }
}
