//! Redis counter store
//!
//! Two topologies share one driver:
//!
//! - **Standalone** (single node or replicated-master-with-sentinel behind
//!   one endpoint): multiplexed connections kept in a managed pool with a
//!   configurable on-empty behaviour.
//! - **Cluster**: a cluster-aware connection that routes each single-slot
//!   pipeline to the node owning that slot and recovers MOVED/ASK redirects
//!   by refreshing its topology view and retrying the pipeline. Redirect
//!   handling never surfaces to callers on success.

use async_trait::async_trait;
use deadpool::managed::{Metrics, Object, Pool, RecycleError, RecycleResult, Timeouts};
use deadpool::Runtime;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;

use crate::config::{PoolOnEmpty, StoreSettings};

use super::{slot, CounterOp, CounterStore, OpReply, Pipeline, StoreError, StoreResult};

/// Pool manager producing multiplexed connections to one endpoint
struct ConnectionManager {
    client: redis::Client,
}

#[async_trait]
impl deadpool::managed::Manager for ConnectionManager {
    type Type = MultiplexedConnection;
    type Error = redis::RedisError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _metrics: &Metrics,
    ) -> RecycleResult<Self::Error> {
        redis::cmd("PING")
            .query_async::<_, String>(conn)
            .await
            .map(|_| ())
            .map_err(RecycleError::Backend)
    }
}

/// A standalone connection, pooled or freshly opened
enum StandaloneConn {
    Pooled(Object<ConnectionManager>),
    Fresh(MultiplexedConnection),
}

impl StandaloneConn {
    fn as_mut(&mut self) -> &mut MultiplexedConnection {
        match self {
            Self::Pooled(object) => &mut **object,
            Self::Fresh(conn) => conn,
        }
    }
}

enum Backend {
    Standalone {
        pool: Pool<ConnectionManager>,
        client: redis::Client,
        on_empty: PoolOnEmpty,
        timeouts: Timeouts,
    },
    Cluster {
        conn: ClusterConnection,
    },
}

/// Redis-backed [`CounterStore`]
pub struct RedisCounterStore {
    backend: Backend,
}

impl RedisCounterStore {
    /// Connect according to the given settings
    pub async fn connect(settings: &StoreSettings) -> StoreResult<Self> {
        if settings.clustered {
            let client = ClusterClient::builder(settings.urls.clone())
                .build()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            let conn = client
                .get_async_connection()
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            return Ok(Self {
                backend: Backend::Cluster { conn },
            });
        }

        let url = settings
            .urls
            .first()
            .ok_or_else(|| StoreError::Connection("no store url configured".to_string()))?;
        if settings.urls.len() > 1 {
            tracing::warn!(
                "ignoring {} extra store urls on a non-clustered topology",
                settings.urls.len() - 1
            );
        }

        let client =
            redis::Client::open(url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;
        let timeouts = acquire_timeouts(settings);
        let pool = Pool::builder(ConnectionManager {
            client: client.clone(),
        })
        .max_size(settings.pool_size.max(1))
        .timeouts(timeouts)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| StoreError::Pool(e.to_string()))?;

        Ok(Self {
            backend: Backend::Standalone {
                pool,
                client,
                on_empty: settings.pool_on_empty,
                timeouts,
            },
        })
    }

    async fn acquire_standalone(
        pool: &Pool<ConnectionManager>,
        client: &redis::Client,
        on_empty: PoolOnEmpty,
        timeouts: &Timeouts,
    ) -> StoreResult<StandaloneConn> {
        match on_empty {
            PoolOnEmpty::Wait => pool
                .get()
                .await
                .map(StandaloneConn::Pooled)
                .map_err(|e| StoreError::Pool(e.to_string())),
            PoolOnEmpty::Error => pool
                .timeout_get(&no_wait(timeouts))
                .await
                .map(StandaloneConn::Pooled)
                .map_err(|e| StoreError::Pool(e.to_string())),
            PoolOnEmpty::Create => match pool.timeout_get(&no_wait(timeouts)).await {
                Ok(object) => Ok(StandaloneConn::Pooled(object)),
                // Pool exhausted: open an unpooled connection instead
                Err(_) => client
                    .get_multiplexed_async_connection()
                    .await
                    .map(StandaloneConn::Fresh)
                    .map_err(|e| StoreError::Connection(e.to_string())),
            },
        }
    }
}

/// Pool acquisition timeouts for the configured on-empty behaviour
fn acquire_timeouts(settings: &StoreSettings) -> Timeouts {
    Timeouts {
        wait: Some(settings.pool_on_empty_wait()),
        create: Some(settings.connect_timeout()),
        recycle: Some(settings.connect_timeout()),
    }
}

/// The same timeouts with waiting disabled
fn no_wait(timeouts: &Timeouts) -> Timeouts {
    Timeouts {
        wait: Some(std::time::Duration::ZERO),
        ..*timeouts
    }
}

/// Translate a pipeline into wire commands
fn build_pipe(pipeline: &Pipeline) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    for op in &pipeline.ops {
        match op {
            CounterOp::IncrBy { key, delta } => {
                pipe.cmd("INCRBY").arg(key).arg(*delta);
            }
            CounterOp::Expire { key, seconds } => {
                pipe.cmd("EXPIRE").arg(key).arg(*seconds);
            }
            CounterOp::Get { key } => {
                pipe.cmd("GET").arg(key);
            }
        }
    }
    pipe
}

/// Interpret one wire reply in the context of the operation that produced it
fn op_reply(op: &CounterOp, value: redis::Value) -> StoreResult<OpReply> {
    if matches!(op, CounterOp::Expire { .. }) {
        return Ok(OpReply::Done);
    }
    match value {
        redis::Value::Nil => Ok(OpReply::Missing),
        redis::Value::Int(v) => Ok(OpReply::Value(v)),
        redis::Value::Data(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(OpReply::Value)
            .ok_or_else(|| StoreError::Protocol("non-integer counter value".to_string())),
        other => Err(StoreError::Protocol(format!(
            "unexpected reply type: {other:?}"
        ))),
    }
}

fn zip_replies(pipeline: &Pipeline, values: Vec<redis::Value>) -> StoreResult<Vec<OpReply>> {
    if values.len() != pipeline.ops.len() {
        return Err(StoreError::Protocol(format!(
            "pipeline of {} ops got {} replies",
            pipeline.ops.len(),
            values.len()
        )));
    }
    pipeline
        .ops
        .iter()
        .zip(values)
        .map(|(op, value)| op_reply(op, value))
        .collect()
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn is_clustered(&self) -> bool {
        matches!(self.backend, Backend::Cluster { .. })
    }

    fn slot_of(&self, key: &str) -> u16 {
        match self.backend {
            Backend::Cluster { .. } => slot::key_slot(key),
            Backend::Standalone { .. } => 0,
        }
    }

    async fn execute_pipeline(&self, pipeline: &Pipeline) -> StoreResult<Vec<OpReply>> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<redis::Value> = match &self.backend {
            Backend::Standalone {
                pool,
                client,
                on_empty,
                timeouts,
            } => {
                let mut conn =
                    Self::acquire_standalone(pool, client, *on_empty, timeouts).await?;
                build_pipe(pipeline)
                    .query_async(conn.as_mut())
                    .await
                    .map_err(|e| StoreError::Pipeline(e.to_string()))?
            }
            Backend::Cluster { conn } => {
                let mut conn = conn.clone();
                build_pipe(pipeline)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Pipeline(e.to_string()))?
            }
        };
        zip_replies(pipeline, values)
    }
}
