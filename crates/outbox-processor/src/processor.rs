//! Background delivery processor.
//!
//! Owns the polling loop: one task wakes on an interval, runs a delivery
//! pass, and winds down on shutdown without interrupting a message
//! mid-flight. Exactly one processor instance may run against a given
//! database; concurrent processors would race the eligibility query.

use crate::{process_pending, ProcessorConfig};
use outbox_database::StoreHandle;
use outbox_dispatch::DispatcherHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Polls the outbox on an interval and delivers eligible messages.
pub struct OutboxProcessor {
    config: ProcessorConfig,
    store: StoreHandle,
    dispatcher: DispatcherHandle,
    cancel: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OutboxProcessor {
    pub fn new(config: ProcessorConfig, store: StoreHandle, dispatcher: DispatcherHandle) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            dispatcher,
            cancel: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Start the polling loop.
    ///
    /// Panics if called twice.
    pub fn start(&self) {
        let mut handle = self.handle.lock().expect("lock poisoned");
        if handle.is_some() {
            panic!("OutboxProcessor already started");
        }

        let config = self.config.clone();
        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        let cancel = self.cancel.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            info!(
                poll_interval_ms = config.poll_interval.as_millis() as u64,
                batch_size = config.batch_size,
                "Outbox processor started"
            );
            let mut ticker = tokio::time::interval(config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Outbox processor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = chrono::Utc::now();
                        if let Err(e) = process_pending(
                            store.as_ref(),
                            dispatcher.as_ref(),
                            &config,
                            now,
                            &cancel,
                        ) {
                            // The pass aborted; the next tick starts fresh
                            warn!(error = %e, "Delivery pass failed");
                        }
                    }
                }
            }
        }));
    }

    /// Stop the polling loop and wait for the in-flight pass to wind down.
    pub async fn shutdown(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let handle = self.handle.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Outbox processor task panicked");
            }
        }
        info!("Outbox processor stopped");
    }
}
