//! # Wallet Facade
//!
//! [`Wallet`] owns the database connection and the two collaborators and
//! exposes the operations a UI or CLI drives. The operations themselves are
//! spread over [`crate::exchange`], [`crate::withdraw`], [`crate::pay`],
//! [`crate::refresh`] and [`crate::overview`], each adding an `impl Wallet`
//! block.
//!
//! ## Ground Rules
//!
//! - No HTTP round-trip and no crypto call happens inside a store
//!   transaction. Every operation reads what it needs, talks to the
//!   exchange, then re-reads and writes in one short read-write
//!   transaction.
//! - A record is processed by at most one task at a time. [`InFlight`]
//!   guards are keyed by record (`reserve:…`, `precoin:…`, `coin:…`) and
//!   a second caller gets [`WalletError::Busy`].
//! - Background work (reserve depletion after `confirm_reserve`) is spawned
//!   on the tokio runtime and can be awaited with
//!   [`Wallet::wait_for_background_tasks`].

use std::future::Future;
use std::sync::Arc;

use coffer_store::{Database, Factory};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::WalletConfig;
use crate::crypto::{CryptoApi, LocalCrypto};
use crate::db;
use crate::error::{WalletError, WalletResult};
use crate::http::{HttpClient, ReqwestHttpClient};

pub(crate) struct WalletInner {
    pub(crate) db: Database,
    pub(crate) crypto: Arc<dyn CryptoApi>,
    pub(crate) http: Arc<dyn HttpClient>,
    pub(crate) config: WalletConfig,
    in_flight: DashMap<String, ()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a wallet. Clones share the same state.
#[derive(Clone)]
pub struct Wallet {
    pub(crate) inner: Arc<WalletInner>,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("db", &self.inner.db)
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

/// Marks a record as being processed until dropped.
pub(crate) struct InFlight<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl<'a> InFlight<'a> {
    fn acquire(map: &'a DashMap<String, ()>, key: String) -> WalletResult<Self> {
        match map.entry(key.clone()) {
            Entry::Occupied(_) => Err(WalletError::Busy(key)),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Self { map, key })
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

impl Wallet {
    /// Open the wallet database through `factory` and wire up the
    /// collaborators.
    pub async fn open(
        factory: &Factory,
        crypto: Arc<dyn CryptoApi>,
        http: Arc<dyn HttpClient>,
        config: WalletConfig,
    ) -> WalletResult<Self> {
        let db = db::open(factory, &config.db_name).await?;
        info!(db = %config.db_name, kappa = config.kappa, "wallet opened");
        Ok(Self {
            inner: Arc::new(WalletInner {
                db,
                crypto,
                http,
                config,
                in_flight: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// [`LocalCrypto`], a `reqwest` client and the default configuration.
    pub async fn open_default(factory: &Factory) -> WalletResult<Self> {
        let http = ReqwestHttpClient::new()?;
        Self::open(
            factory,
            Arc::new(LocalCrypto::new()),
            Arc::new(http),
            WalletConfig::default(),
        )
        .await
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn config(&self) -> &WalletConfig {
        &self.inner.config
    }

    pub(crate) fn crypto(&self) -> &dyn CryptoApi {
        self.inner.crypto.as_ref()
    }

    pub(crate) fn http(&self) -> &dyn HttpClient {
        self.inner.http.as_ref()
    }

    pub(crate) fn begin(&self, kind: &str, id: &str) -> WalletResult<InFlight<'_>> {
        InFlight::acquire(&self.inner.in_flight, format!("{}:{}", kind, id))
    }

    /// Run `work` in the background. Failures are logged; the record it
    /// works on stays in the database for a later retry.
    pub(crate) fn spawn_background<F>(&self, what: String, work: F)
    where
        F: Future<Output = WalletResult<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            match work.await {
                Ok(()) => debug!(task = %what, "background task finished"),
                Err(e) => error!(task = %what, error = %e, "background task failed"),
            }
        });
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Wait until every background task, including ones spawned while
    /// waiting, has finished.
    pub async fn wait_for_background_tasks(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
            if pending.is_empty() {
                return;
            }
            for result in futures::future::join_all(pending).await {
                if let Err(e) = result {
                    error!(error = %e, "background task panicked or was cancelled");
                }
            }
        }
    }

    /// Stop accepting new database work. Background tasks that still hold
    /// the connection finish what they have queued.
    pub fn close(&self) {
        self.inner.db.close();
    }
}
