//! Bounded Redis connection pools, one per configured backend shard.
//!
//! The only command the proxy ever issues is a fixed-TTL upsert:
//! `SETEX <name> <ExpiresIn> <client_ip>`.

use crate::errors::Error;
use deadpool_redis::{Config as RedisConfig, Pool, PoolConfig, Runtime};
use log::debug;
use std::time::Duration;

/// A fixed-size connection pool for one backend address.
pub struct BackendPool {
    addr: String,
    pool: Pool,
    read_timeout: Duration,
}

impl BackendPool {
    /// Creates the pool. Connections are established lazily; `connect_timeout`
    /// bounds both dialing a new connection and waiting for a free slot,
    /// `read_timeout` bounds each command.
    pub fn new(
        addr: &str,
        pool_num: usize,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<BackendPool, Error> {
        debug!(
            "create redis pool for {} with connect_timeout: {:?}, read_timeout: {:?}",
            addr, connect_timeout, read_timeout
        );

        let mut config = RedisConfig::from_url(format!("redis://{}", addr));

        let mut pool_config = PoolConfig::new(pool_num);
        pool_config.timeouts.create = Some(connect_timeout);
        pool_config.timeouts.wait = Some(connect_timeout);
        config.pool = Some(pool_config);

        let pool = config.create_pool(Some(Runtime::Tokio1))?;

        Ok(BackendPool {
            addr: addr.to_string(),
            pool,
            read_timeout,
        })
    }

    /// The backend's `host:port`.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Issues `SETEX name expires_in client_ip` on a pooled connection.
    pub async fn setex(&self, name: &str, expires_in: u64, client_ip: &str) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;

        let mut cmd = redis::cmd("SETEX");
        cmd.arg(name).arg(expires_in).arg(client_ip);

        let op = cmd.query_async::<_, ()>(&mut conn);

        match tokio::time::timeout(self.read_timeout, op).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(Error::BackendTimeout),
        }
    }
}
