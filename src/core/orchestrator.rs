//! Execution orchestrator — one end-to-end run of fetch → categorize →
//! dispatch, tracked by an execution record.
//!
//! State machine: `running → completed` or `running → failed`, nothing else.
//! A failed execution is never retried automatically; the caller triggers a
//! new one. Configuration is validated before the execution row is created,
//! so a misconfigured trigger leaves no trace in the history.
//!
//! Concurrent runs against the same storage are not prevented here; the
//! trigger surface is expected to serialize them (one daily firing plus the
//! occasional manual trigger).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::clients::{BillingProvider, Messenger};
use crate::config::Settings;
use crate::core::categorize::categorize_all;
use crate::core::dispatch::Dispatcher;
use crate::core::service_today;
use crate::error::{ConfigError, Error};
use crate::model::{
    Category, ClientData, Execution, ExecutionLog, ExecutionStatus, InvoiceStatus, LogOutcome,
};
use crate::store::Storage;

/// Snapshot name used when an invoice's customer is unknown locally.
const UNKNOWN_CUSTOMER: &str = "customer not found";

/// Everything a run needs, injected so tests can drive it with doubles.
pub struct Orchestrator {
    store: Arc<dyn Storage>,
    provider: Arc<dyn BillingProvider>,
    messenger: Arc<dyn Messenger>,
}

/// Counts produced by the inner run.
struct RunSummary {
    invoices_processed: i64,
    messages_sent: i64,
    errors: i64,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Storage>,
        provider: Arc<dyn BillingProvider>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            store,
            provider,
            messenger,
        }
    }

    /// Wire the real clients from the current settings.
    pub fn from_settings(store: Arc<dyn Storage>, settings: &Settings) -> Self {
        let provider = Arc::new(crate::clients::AsaasClient::new(
            &settings.provider_url,
            secrecy::SecretString::from(settings.provider_token.clone()),
        ));
        let messenger = Arc::new(crate::clients::EvolutionClient::new(
            &settings.messenger_url,
            secrecy::SecretString::from(settings.messenger_key.clone()),
            &settings.messenger_instance,
        ));
        Self::new(store, provider, messenger)
    }

    /// Run one execution end to end. Returns the terminal execution record.
    ///
    /// Fails fast — before any execution row exists — when required
    /// credentials are missing.
    pub async fn run(
        &self,
        progress: Option<&mpsc::UnboundedSender<ExecutionLog>>,
    ) -> Result<Execution, Error> {
        let settings = self
            .store
            .load_settings()
            .await
            .map_err(Error::Database)?
            .ok_or(Error::Config(ConfigError::NotConfigured))?;
        settings.validate_for_run().map_err(Error::Config)?;

        let execution = Execution::started();
        self.store
            .create_execution(&execution)
            .await
            .map_err(Error::Database)?;
        info!(execution = %execution.id, "Execution started");

        match self.run_inner(&execution, &settings, progress).await {
            Ok(summary) => {
                self.store
                    .finish_execution(
                        execution.id,
                        ExecutionStatus::Completed,
                        summary.invoices_processed,
                        summary.messages_sent,
                        0,
                        summary.errors,
                    )
                    .await
                    .map_err(Error::Database)?;
                info!(
                    execution = %execution.id,
                    processed = summary.invoices_processed,
                    sent = summary.messages_sent,
                    errors = summary.errors,
                    "Execution completed"
                );
                self.store
                    .get_execution(execution.id)
                    .await
                    .map_err(Error::Database)?
                    .ok_or_else(|| {
                        Error::Execution(crate::error::ExecutionError::NotFound { id: execution.id })
                    })
            }
            Err(e) => {
                error!(execution = %execution.id, error = %e, "Execution failed");
                if let Err(finish_err) = self
                    .store
                    .finish_execution(execution.id, ExecutionStatus::Failed, 0, 0, 0, 1)
                    .await
                {
                    error!(
                        execution = %execution.id,
                        error = %finish_err,
                        "Failed to mark execution as failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Steps 3–8: fetch, enrich, persist, categorize, dispatch, aggregate.
    async fn run_inner(
        &self,
        execution: &Execution,
        settings: &Settings,
        progress: Option<&mpsc::UnboundedSender<ExecutionLog>>,
    ) -> Result<RunSummary, Error> {
        let today = service_today();

        // Fetch customers first, then every unpaid invoice.
        let customers = self.provider.list_customers().await.map_err(Error::Provider)?;
        let mut invoices = self
            .provider
            .list_invoices_by_status(InvoiceStatus::Pending)
            .await
            .map_err(Error::Provider)?;
        invoices.extend(
            self.provider
                .list_invoices_by_status(InvoiceStatus::Overdue)
                .await
                .map_err(Error::Provider)?,
        );
        info!(
            customers = customers.len(),
            invoices = invoices.len(),
            "Provider data fetched"
        );

        // Sync customers into local storage (preferences survive upserts).
        for customer in &customers {
            let record = ClientData::new(
                &customer.id,
                &customer.name,
                customer.email.clone(),
                customer.contact_phone().map(String::from),
            );
            self.store.upsert_client(&record).await.map_err(Error::Database)?;
        }

        // Enrich invoices with the customer snapshot.
        let by_id: HashMap<&str, _> = customers.iter().map(|c| (c.id.as_str(), c)).collect();
        for invoice in invoices.iter_mut() {
            match by_id.get(invoice.customer_id.as_str()) {
                Some(customer) => {
                    invoice.customer_name = customer.name.clone();
                    invoice.customer_phone =
                        customer.contact_phone().unwrap_or_default().to_string();
                }
                None => {
                    invoice.customer_name = UNKNOWN_CUSTOMER.to_string();
                    invoice.customer_phone = String::new();
                }
            }
        }

        // Persist the enriched snapshot, then drop stale local records.
        for invoice in &invoices {
            self.store.upsert_invoice(invoice).await.map_err(Error::Database)?;
        }
        match self.provider.list_all_invoice_ids().await {
            Ok(known_ids) => {
                let removed = self
                    .store
                    .delete_invoices_not_in(&known_ids)
                    .await
                    .map_err(Error::Database)?;
                if removed > 0 {
                    info!(removed, "Stale invoices removed");
                }
            }
            Err(e) => {
                // Stale cleanup is housekeeping; a fetch hiccup here must
                // not fail the run.
                error!(error = %e, "Skipping stale-invoice cleanup");
            }
        }

        // Categorize and persist the tags.
        categorize_all(&mut invoices, settings.notice_days_ahead, today);
        for invoice in &invoices {
            if let Some(category) = invoice.category {
                self.store
                    .set_invoice_category(&invoice.id, category)
                    .await
                    .map_err(Error::Database)?;
            }
        }

        // Local preferences drive the throttle rules.
        let clients: HashMap<String, ClientData> = self
            .store
            .list_clients()
            .await
            .map_err(Error::Database)?
            .into_iter()
            .map(|c| (c.external_id.clone(), c))
            .collect();

        let dispatcher = Dispatcher::new(self.store.clone(), self.messenger.clone());
        let logs = dispatcher
            .process(execution.id, &invoices, settings, &clients, today, progress)
            .await;

        let invoices_processed = invoices
            .iter()
            .filter(|i| i.category_or_default() != Category::Processada)
            .count() as i64;
        let messages_sent = logs
            .iter()
            .filter(|l| l.outcome == LogOutcome::Success)
            .count() as i64;
        let errors = logs
            .iter()
            .filter(|l| l.outcome == LogOutcome::Error)
            .count() as i64;

        Ok(RunSummary {
            invoices_processed,
            messages_sent,
            errors,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
