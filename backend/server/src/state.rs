use std::sync::Arc;

use tracing::info;

use super::{
    clock::{Clock, SystemClock},
    codes::{CodeGenerator, CodeSource, OsCodeSource},
    config::{Config, StoreBackend},
    database::{RedisEventState, RedisStore, init_redis},
    error::ServerError,
    events::{EventState, EventStatus, MemoryEventState},
    lock::FingerprintLocks,
    rate_limit::{RateLimiter, SlidingWindow},
    secrets::Secrets,
    store::{MemoryStore, VoteStore},
};

pub struct AppState {
    pub config: Config,
    pub secrets: Secrets,
    pub store: Arc<dyn VoteStore>,
    pub events: Arc<dyn EventState>,
    pub clock: Arc<dyn Clock>,
    pub rate_limiter: RateLimiter,
    pub locks: FingerprintLocks,
    pub codes: CodeGenerator,
}

impl AppState {
    pub async fn new(config: Config, secrets: Secrets) -> Result<Arc<Self>, ServerError> {
        let (store, events): (Arc<dyn VoteStore>, Arc<dyn EventState>) = match &config.backend {
            StoreBackend::Memory => {
                let events = MemoryEventState::new();

                if let Some(event_id) = config.dev_event {
                    events.set(
                        event_id,
                        EventStatus {
                            is_active: true,
                            votes_closed: false,
                        },
                    )?;
                    info!(event_id, "Seeded development event");
                }

                (Arc::new(MemoryStore::new()), Arc::new(events))
            }
            StoreBackend::Redis(url) => {
                let connection = init_redis(url).await?;
                info!("Connected to Redis");

                (
                    Arc::new(RedisStore::new(connection.clone())),
                    Arc::new(RedisEventState::new(connection)),
                )
            }
        };

        Ok(Self::with_backends(
            config,
            secrets,
            store,
            events,
            Arc::new(SystemClock),
            Arc::new(OsCodeSource),
        ))
    }

    pub fn with_backends(
        config: Config,
        secrets: Secrets,
        store: Arc<dyn VoteStore>,
        events: Arc<dyn EventState>,
        clock: Arc<dyn Clock>,
        code_source: Arc<dyn CodeSource>,
    ) -> Arc<Self> {
        let rate_limiter = RateLimiter::new(
            SlidingWindow {
                limit: config.device_limit,
                window: config.device_window,
            },
            SlidingWindow {
                limit: config.ip_limit,
                window: config.ip_window,
            },
        );
        let locks = FingerprintLocks::new(Arc::clone(&store), config.lock_ttl, config.retention);
        let codes = CodeGenerator::new(code_source, config.code_digits, config.max_code_attempts);

        Arc::new(Self {
            config,
            secrets,
            store,
            events,
            clock,
            rate_limiter,
            locks,
            codes,
        })
    }
}
