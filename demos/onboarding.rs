//! Onboarding demo: one business operation behind the full middleware stack.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example onboarding
//!
//! Shape of a real integration: a GraphQL resolver (or HTTP route) is a thin
//! proxy that builds the request struct, picks a context, and calls
//! `execute`. Everything it knows about failure comes from the `Outcome`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use handlers::middleware::{Authorize, Instrument, Logging};
use handlers::{
    BoxedHandler, Chain, ClientError, Config, Context, Error, Handler, MetricSet, Outcome, Registry,
    ServerError, Sink, Source, execute,
};

// ── Collaborators ─────────────────────────────────────────────────────────────

/// Persistence for user records.
trait UserStore: Send + Sync {
    fn username_taken(&self, username: &str) -> bool;
}

/// Persistence for accounts. Fails like a real database would.
trait AccountStore: Send + Sync {
    fn open(&self, username: &str) -> Result<u64, std::io::Error>;
}

#[derive(Default)]
struct MemoryStore {
    accounts: Mutex<HashMap<String, u64>>,
}

impl UserStore for MemoryStore {
    fn username_taken(&self, username: &str) -> bool {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner).contains_key(username)
    }
}

impl AccountStore for MemoryStore {
    fn open(&self, username: &str) -> Result<u64, std::io::Error> {
        let mut accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        let id = accounts.len() as u64 + 1;
        accounts.insert(username.to_owned(), id);
        Ok(id)
    }
}

/// A store whose backend is unreachable.
struct DownStore;

impl AccountStore for DownStore {
    fn open(&self, _username: &str) -> Result<u64, std::io::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"))
    }
}

// ── Business handler ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct OnboardStartRequest {
    username: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OnboardStartResponse {
    account_id: u64,
}

const WRONG_USERNAME_ID: &str = "3c157e31-0a63-4f96-9c9c-19353024ce34";
const STORE_FAILURE_ID: &str = "8c24c633-1bba-4990-813c-b21d24d6e7f5";

/// Starts onboarding. Knows about its stores and nothing else.
struct OnboardStart {
    users: Arc<dyn UserStore>,
    accounts: Arc<dyn AccountStore>,
}

#[async_trait]
impl Handler for OnboardStart {
    async fn call(&self, ctx: Context, sink: &mut Sink, source: Source) -> Result<(), Error> {
        let req: OnboardStartRequest = source.decode()?;

        if req.username.trim().is_empty() || self.users.username_taken(&req.username) {
            return Err(ClientError::new(WRONG_USERNAME_ID, "wrong username").into());
        }

        ctx.check()?;
        let account_id = self.accounts.open(&req.username).map_err(|e| {
            ServerError::new(STORE_FAILURE_ID, "database connection failure").with_cause(e)
        })?;

        sink.encode(&OnboardStartResponse { account_id })
    }
}

// ── Composition root ──────────────────────────────────────────────────────────

/// Holds every resolver, each composed once at startup.
struct RootResolver {
    start: BoxedHandler,
}

impl RootResolver {
    fn new(
        config: &Config,
        users: Arc<dyn UserStore>,
        accounts: Arc<dyn AccountStore>,
        metrics: &MetricSet,
    ) -> Self {
        let start = Chain::new()
            .layer(Authorize::from_config(config))
            .layer(Logging::new("start"))
            .layer(Instrument::new("start", metrics))
            .around(OnboardStart { users, accounts });
        Self { start }
    }

    async fn run_start(&self, ctx: Context, username: &str) {
        let req = OnboardStartRequest { username: username.to_owned() };
        match execute(&self.start, ctx, &req).await {
            Outcome::Success(body) => println!("Onboarded: {}", String::from_utf8_lossy(&body)),
            Outcome::Rejected(e) => println!("Input Error: {}", e.message),
            Outcome::Failed(_) => println!("Internal Error"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = Config::from_env()?;
    if config.namespace.is_empty() {
        config.namespace = "example".into();
    }
    if config.subsystem.is_empty() {
        config.subsystem = "onboarding".into();
    }

    let registry = Registry::new();
    let metrics = MetricSet::from_config(&registry, &config)
        .unwrap_or_else(|e| panic!("metric registration failed: {e}"));

    let store = Arc::new(MemoryStore::default());
    let resolver = RootResolver::new(&config, store.clone(), store, &metrics);
    let key = config.authorization_key.clone();
    let admin = Context::background().with_value(key.clone(), true);

    resolver.run_start(admin.clone(), "alice").await;
    resolver.run_start(admin.clone(), "alice").await;
    resolver.run_start(Context::background().with_value(key, false), "bob").await;

    let users = Arc::new(MemoryStore::default());
    let degraded = RootResolver::new(&config, users, Arc::new(DownStore), &metrics);
    degraded.run_start(admin, "carol").await;

    print!("{}", registry.render());
    Ok(())
}
